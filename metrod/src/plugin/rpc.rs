//! Typed rpc channel to a running plugin.
//!
//! One TCP connection per instance, newline-delimited JSON frames,
//! strictly request/reply. The connection is serialized behind an async
//! mutex; instances are checked out of the pool exclusively, so there
//! is no in-connection pipelining to worry about.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::proto::{
    Metric, MetricRequest, PluginDescription, RpcRequest, RpcRequestBody, RpcResponse,
    RpcResponseBody,
};
use crate::catalog::policy::ConfigDataNode;
use crate::{Error, Result};

#[derive(Debug)]
struct Conn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Client side of the plugin rpc channel.
#[derive(Debug)]
pub struct PluginRpcClient {
    conn: Mutex<Conn>,
    next_id: AtomicU64,
    endpoint: String,
}

impl PluginRpcClient {
    /// Connect to a plugin endpoint and perform the hello exchange.
    ///
    /// The plugin must echo the session token; any mismatch is a failed
    /// handshake.
    pub async fn connect(endpoint: &str, token: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| Error::handshake(format!("connect to {endpoint} timed out")))??;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let client = Self {
            conn: Mutex::new(Conn {
                reader: BufReader::new(read),
                writer: write,
            }),
            next_id: AtomicU64::new(1),
            endpoint: endpoint.to_string(),
        };

        match client
            .call(
                RpcRequestBody::Hello {
                    token: token.to_string(),
                },
                timeout,
            )
            .await?
        {
            RpcResponseBody::Hello { token: echoed } if echoed == token => Ok(client),
            RpcResponseBody::Hello { .. } => {
                Err(Error::handshake("plugin echoed a mismatched session token"))
            }
            other => Err(Error::handshake(format!(
                "unexpected hello reply: {other:?}"
            ))),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Issue one request and wait for its reply, bounded by `deadline`.
    pub async fn call(&self, body: RpcRequestBody, deadline: Duration) -> Result<RpcResponseBody> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest { id, body };
        let mut frame = serde_json::to_string(&request)?;
        frame.push('\n');

        let mut conn = self.conn.lock().await;
        tokio::time::timeout(deadline, async {
            conn.writer.write_all(frame.as_bytes()).await?;
            conn.writer.flush().await?;

            let mut line = String::new();
            let n = conn.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(Error::rpc("plugin closed the rpc connection"));
            }
            let response: RpcResponse = serde_json::from_str(line.trim_end())?;
            if response.id != id {
                return Err(Error::rpc(format!(
                    "reply id {} does not match request id {id}",
                    response.id
                )));
            }
            match response.body {
                RpcResponseBody::Error { message } => Err(Error::Rpc(message)),
                body => Ok(body),
            }
        })
        .await
        .map_err(|_| Error::rpc(format!("rpc to {} timed out", self.endpoint)))?
    }

    /// Fetch the plugin's self-description.
    pub async fn describe(&self, deadline: Duration) -> Result<PluginDescription> {
        match self.call(RpcRequestBody::Describe, deadline).await? {
            RpcResponseBody::Description(description) => Ok(description),
            other => Err(Error::rpc(format!("unexpected describe reply: {other:?}"))),
        }
    }

    /// Liveness probe.
    pub async fn ping(&self, deadline: Duration) -> Result<()> {
        match self.call(RpcRequestBody::Ping, deadline).await? {
            RpcResponseBody::Pong => Ok(()),
            other => Err(Error::rpc(format!("unexpected ping reply: {other:?}"))),
        }
    }

    /// Collect the given metrics.
    pub async fn collect(
        &self,
        metrics: Vec<MetricRequest>,
        deadline: Duration,
    ) -> Result<Vec<Metric>> {
        match self
            .call(RpcRequestBody::Collect { metrics }, deadline)
            .await?
        {
            RpcResponseBody::Collected { metrics } => Ok(metrics),
            other => Err(Error::rpc(format!("unexpected collect reply: {other:?}"))),
        }
    }

    /// Transform a batch through a processor.
    pub async fn process(
        &self,
        batch: Vec<Metric>,
        config: ConfigDataNode,
        deadline: Duration,
    ) -> Result<Vec<Metric>> {
        match self
            .call(RpcRequestBody::Process { batch, config }, deadline)
            .await?
        {
            RpcResponseBody::Processed { batch } => Ok(batch),
            other => Err(Error::rpc(format!("unexpected process reply: {other:?}"))),
        }
    }

    /// Sink a batch into a publisher.
    pub async fn publish(
        &self,
        batch: Vec<Metric>,
        config: ConfigDataNode,
        deadline: Duration,
    ) -> Result<()> {
        match self
            .call(RpcRequestBody::Publish { batch, config }, deadline)
            .await?
        {
            RpcResponseBody::Published => Ok(()),
            other => Err(Error::rpc(format!("unexpected publish reply: {other:?}"))),
        }
    }

    /// Ask the plugin to exit. Errors are ignored by callers that are
    /// about to kill the process anyway.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        self.call(RpcRequestBody::Stop, deadline).await.map(|_| ())
    }
}
