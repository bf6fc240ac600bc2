//! Handshake-negotiated session identity.

use dashmap::DashMap;
use rpc_wire::HandshakeOptions;
use uuid::Uuid;

/// Identity and property bag of one connected channel
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    domain: String,
    service_name: String,
    options: HandshakeOptions,
    user: Option<String>,
    properties: DashMap<String, String>,
}

impl Session {
    /// Create a session from negotiated handshake values
    pub fn new(
        domain: impl Into<String>,
        service_name: impl Into<String>,
        options: HandshakeOptions,
        user: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain: domain.into(),
            service_name: service_name.into(),
            options,
            user,
            properties: DashMap::new(),
        }
    }

    /// Locally unique session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Domain presented by the client
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Service name the channel is bound to
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Negotiated options
    pub fn options(&self) -> HandshakeOptions {
        self.options
    }

    /// Authenticated user, when credentials were presented
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Read a property
    pub fn property(&self, key: &str) -> Option<String> {
        self.properties.get(key).map(|v| v.value().clone())
    }

    /// Set a property, returning the previous value
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.properties.insert(key.into(), value.into())
    }

    /// Remove a property
    pub fn remove_property(&self, key: &str) -> Option<String> {
        self.properties.remove(key).map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_bag() {
        let session = Session::new("prod", "quotes", HandshakeOptions::empty(), Some("ops".into()));
        assert_eq!(session.user(), Some("ops"));
        assert_eq!(session.set_property("region", "eu"), None);
        assert_eq!(session.set_property("region", "us"), Some("eu".to_string()));
        assert_eq!(session.property("region").as_deref(), Some("us"));
        assert_eq!(session.remove_property("region"), Some("us".to_string()));
        assert!(session.property("region").is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Session::new("d", "s", HandshakeOptions::empty(), None);
        let b = Session::new("d", "s", HandshakeOptions::empty(), None);
        assert_ne!(a.id(), b.id());
    }
}
