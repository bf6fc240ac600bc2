//! Echo service hosted by `serve` and the client exercise run by `call`.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use rpc_session::{
    unknown_method, CallContext, Channel, Fault, FaultCode, ServerStream, Service, StreamMode,
};
use std::time::{Duration, Instant};

/// Unary echo
pub const ECHO: u16 = 1;
/// One-way message, logged by the server
pub const LOG: u16 = 2;
/// Duplex stream echoing every item
pub const DUPLEX_ECHO: u16 = 3;
/// Server stream emitting `0..n`
pub const COUNT: u16 = 4;

/// Largest count a client may request
const MAX_COUNT: u32 = 100_000;

pub struct EchoService;

fn stream_fault(err: rpc_session::RpcError) -> Fault {
    err.to_fault()
}

#[async_trait]
impl Service for EchoService {
    async fn on_request(&self, _ctx: CallContext, method: u16, payload: Bytes) -> Result<Bytes, Fault> {
        match method {
            ECHO => Ok(payload),
            _ => Err(unknown_method(method)),
        }
    }

    async fn on_message(&self, ctx: CallContext, method: u16, payload: Bytes) {
        if method != LOG {
            tracing::debug!(method, "Unknown one-way message dropped");
            return;
        }
        match ctx.decode::<String>(&payload) {
            Ok(text) => component_info!("echo", session = %ctx.session().id(), "Client says: {}", text),
            Err(fault) => component_warn!("echo", "Undecodable log message: {}", fault.message),
        }
    }

    async fn on_stream(
        &self,
        ctx: CallContext,
        method: u16,
        payload: Bytes,
        stream: ServerStream,
    ) -> Result<Bytes, Fault> {
        let (reader, writer) = stream.into_parts();
        match (method, reader, writer) {
            (DUPLEX_ECHO, Some(mut reader), Some(writer)) => {
                let mut echoed = 0u64;
                while let Some(item) = reader.next().await.map_err(stream_fault)? {
                    writer.write(item).await.map_err(stream_fault)?;
                    echoed += 1;
                }
                ctx.encode(&echoed)
            }
            (COUNT, _, Some(writer)) => {
                let n: u32 = ctx.decode(&payload)?;
                if n > MAX_COUNT {
                    return Err(Fault::application(format!("count {} exceeds {}", n, MAX_COUNT), None));
                }
                for i in 0..n {
                    writer.send(&i).await.map_err(stream_fault)?;
                }
                ctx.encode(&n)
            }
            (DUPLEX_ECHO, _, _) | (COUNT, _, _) => Err(Fault::new(
                FaultCode::Unsupported,
                format!("method {} called with the wrong stream mode", method),
            )),
            _ => Err(unknown_method(method)),
        }
    }
}

/// What one client run observed
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub echoed: String,
    pub counted: Vec<u32>,
    pub duplex_items: Vec<String>,
    pub duplex_result: u64,
    pub elapsed: Duration,
}

/// Run an echo call, a one-way log, a counter stream and a duplex stream
pub async fn exercise(channel: &Channel, text: &str, count: u32) -> Result<Report> {
    let started = Instant::now();

    let echoed: String = channel.call(ECHO, &text.to_string()).await?;
    channel.send_message(LOG, &format!("echo of {} bytes done", echoed.len()))?;

    let mut counter = channel.open_stream_with(COUNT, StreamMode::ServerStreaming, &count)?;
    let mut counted = Vec::with_capacity(count as usize);
    if let Some(reader) = counter.reader() {
        while let Some(i) = reader.next_item::<u32>().await? {
            counted.push(i);
        }
    }
    let total: u32 = counter.finish_typed().await?;
    anyhow::ensure!(total == count, "server counted {} instead of {}", total, count);

    let mut duplex = channel.open_stream(DUPLEX_ECHO, StreamMode::Duplex, Bytes::new())?;
    let writer = duplex
        .take_writer()
        .ok_or_else(|| anyhow::anyhow!("duplex stream without writer"))?;
    let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
    let producer = tokio::spawn(async move {
        for word in words {
            writer.send(&word).await?;
        }
        writer.complete().await
    });

    let mut duplex_items = Vec::new();
    if let Some(reader) = duplex.reader() {
        while let Some(word) = reader.next_item::<String>().await? {
            duplex_items.push(word);
        }
    }
    producer.await??;
    let duplex_result: u64 = duplex.finish_typed().await?;

    Ok(Report {
        echoed,
        counted,
        duplex_items,
        duplex_result,
        elapsed: started.elapsed(),
    })
}
