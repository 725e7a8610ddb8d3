//! In-process stub plugin endpoint.
//!
//! Implements the plugin side of the rpc protocol on a local TCP
//! listener. Tests (and the seed scenarios) use it in place of a real
//! plugin binary; the discovery path additionally wraps it in a tiny
//! launcher script that prints the handshake line.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use super::proto::{
    Metric, MetricDeclaration, PluginDescription, PluginHandshake, RpcRequest, RpcRequestBody,
    RpcResponse, RpcResponseBody,
};
use super::PluginType;
use crate::catalog::policy::ConfigPolicy;

/// Builder for a stub plugin.
pub struct StubPlugin {
    plugin_type: PluginType,
    name: String,
    version: u32,
    token: String,
    metrics: Vec<MetricDeclaration>,
    policy: ConfigPolicy,
    reply_delay: Duration,
    /// Fail this many collect calls before succeeding.
    collect_failures: usize,
    /// When set, ping replies become errors.
    fail_pings: bool,
}

impl StubPlugin {
    pub fn new(plugin_type: PluginType, name: impl Into<String>, version: u32) -> Self {
        Self {
            plugin_type,
            name: name.into(),
            version,
            token: uuid::Uuid::new_v4().to_string(),
            metrics: Vec::new(),
            policy: ConfigPolicy::default(),
            reply_delay: Duration::ZERO,
            collect_failures: 0,
            fail_pings: false,
        }
    }

    pub fn collector(name: impl Into<String>, version: u32) -> Self {
        Self::new(PluginType::Collector, name, version)
    }

    pub fn processor(name: impl Into<String>, version: u32) -> Self {
        Self::new(PluginType::Processor, name, version)
    }

    pub fn publisher(name: impl Into<String>, version: u32) -> Self {
        Self::new(PluginType::Publisher, name, version)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_metric(mut self, namespace: impl Into<String>, version: u32) -> Self {
        self.metrics.push(MetricDeclaration {
            namespace: namespace.into(),
            version,
            data_type: "int64".to_string(),
            unit: None,
            description: None,
        });
        self
    }

    pub fn with_policy(mut self, policy: ConfigPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    pub fn with_collect_failures(mut self, count: usize) -> Self {
        self.collect_failures = count;
        self
    }

    pub fn with_failing_pings(mut self) -> Self {
        self.fail_pings = true;
        self
    }

    /// Bind a listener and start serving connections.
    pub async fn spawn(self) -> StubHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let endpoint = listener.local_addr().expect("stub addr").to_string();
        let shared = Arc::new(StubShared {
            plugin_type: self.plugin_type,
            name: self.name,
            version: self.version,
            token: self.token,
            metrics: self.metrics,
            policy: self.policy,
            reply_delay: self.reply_delay,
            collect_failures_left: AtomicUsize::new(self.collect_failures),
            fail_pings: AtomicBool::new(self.fail_pings),
            collect_count: AtomicUsize::new(0),
            published: Mutex::new(Vec::new()),
        });

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let conn_shared = accept_shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, conn_shared).await {
                        debug!("stub connection ended: {e}");
                    }
                });
            }
        });

        StubHandle { endpoint, shared }
    }
}

struct StubShared {
    plugin_type: PluginType,
    name: String,
    version: u32,
    token: String,
    metrics: Vec<MetricDeclaration>,
    policy: ConfigPolicy,
    reply_delay: Duration,
    collect_failures_left: AtomicUsize,
    fail_pings: AtomicBool,
    collect_count: AtomicUsize,
    published: Mutex<Vec<Metric>>,
}

/// Handle to a running stub.
pub struct StubHandle {
    endpoint: String,
    shared: Arc<StubShared>,
}

impl StubHandle {
    pub fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    pub fn token(&self) -> &str {
        &self.shared.token
    }

    /// The handshake line a launcher script would print on stdout.
    pub fn handshake_line(&self) -> String {
        let handshake = PluginHandshake {
            plugin_type: self.shared.plugin_type,
            name: self.shared.name.clone(),
            version: self.shared.version,
            rpc_endpoint: self.endpoint.clone(),
            plugin_token: self.shared.token.clone(),
        };
        serde_json::to_string(&handshake).expect("serialize handshake")
    }

    /// How many collect calls reached this stub.
    pub fn collect_count(&self) -> usize {
        self.shared.collect_count.load(Ordering::SeqCst)
    }

    /// Batches delivered to this stub's publish verb.
    pub fn published(&self) -> Vec<Metric> {
        self.shared.published.lock().clone()
    }

    /// Make every subsequent ping fail (drives health-check paths).
    pub fn break_pings(&self) {
        self.shared.fail_pings.store(true, Ordering::SeqCst);
    }
}

async fn serve(stream: TcpStream, shared: Arc<StubShared>) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let request: RpcRequest = match serde_json::from_str(line.trim_end()) {
            Ok(req) => req,
            Err(_) => return Ok(()),
        };
        if !shared.reply_delay.is_zero() {
            tokio::time::sleep(shared.reply_delay).await;
        }
        let body = respond(&shared, request.body);
        let stop = matches!(body, RpcResponseBody::Stopping);
        let mut frame = serde_json::to_string(&RpcResponse {
            id: request.id,
            body,
        })
        .expect("serialize response");
        frame.push('\n');
        write.write_all(frame.as_bytes()).await?;
        write.flush().await?;
        if stop {
            return Ok(());
        }
    }
}

fn respond(shared: &StubShared, body: RpcRequestBody) -> RpcResponseBody {
    match body {
        RpcRequestBody::Hello { .. } => RpcResponseBody::Hello {
            token: shared.token.clone(),
        },
        RpcRequestBody::Describe => RpcResponseBody::Description(PluginDescription {
            metrics: shared.metrics.clone(),
            policy: shared.policy.clone(),
        }),
        RpcRequestBody::Ping => {
            if shared.fail_pings.load(Ordering::SeqCst) {
                RpcResponseBody::Error {
                    message: "ping failed".to_string(),
                }
            } else {
                RpcResponseBody::Pong
            }
        }
        RpcRequestBody::Collect { metrics } => {
            if shared.plugin_type != PluginType::Collector {
                return unsupported("collect");
            }
            shared.collect_count.fetch_add(1, Ordering::SeqCst);
            if shared
                .collect_failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return RpcResponseBody::Error {
                    message: "injected collect failure".to_string(),
                };
            }
            let collected = metrics
                .into_iter()
                .map(|req| Metric {
                    namespace: req.namespace,
                    version: req.version,
                    data: serde_json::json!(42),
                    collected_at: Utc::now(),
                })
                .collect();
            RpcResponseBody::Collected { metrics: collected }
        }
        RpcRequestBody::Process { mut batch, .. } => {
            if shared.plugin_type != PluginType::Processor {
                return unsupported("process");
            }
            // Passthru with a marker so tests can see the hop.
            for metric in &mut batch {
                metric.data = serde_json::json!({ "processed": metric.data });
            }
            RpcResponseBody::Processed { batch }
        }
        RpcRequestBody::Publish { batch, .. } => {
            if shared.plugin_type != PluginType::Publisher {
                return unsupported("publish");
            }
            shared.published.lock().extend(batch);
            RpcResponseBody::Published
        }
        RpcRequestBody::Stop => RpcResponseBody::Stopping,
    }
}

fn unsupported(verb: &str) -> RpcResponseBody {
    RpcResponseBody::Error {
        message: format!("unsupported verb: {verb}"),
    }
}
