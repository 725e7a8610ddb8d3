//! Plugin wire protocol.
//!
//! Plugins are spawned with a single JSON argument blob and announce
//! themselves with one JSON handshake line on stdout. After the
//! handshake the control plane speaks newline-delimited JSON frames
//! over TCP to the endpoint the plugin chose.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PluginType;
use crate::catalog::policy::{ConfigDataNode, ConfigPolicy};

/// Argument blob passed to every spawned plugin as argv[1].
///
/// This is the fixed configuration block all plugins receive; the
/// session token must be echoed back during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginArgs {
    /// Path to the control-plane public key, when signatures are on.
    pub control_public_key: Option<String>,
    /// Where the plugin should write its own log.
    pub log_path: String,
    /// Per-process session token the plugin must echo back.
    pub session_token: String,
}

/// The single JSON line a plugin prints on stdout when spawned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginHandshake {
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    pub name: String,
    pub version: u32,
    /// TCP address of the plugin's rpc listener, e.g. `127.0.0.1:40123`.
    pub rpc_endpoint: String,
    /// Must equal the session token from [`PluginArgs`].
    pub plugin_token: String,
}

/// A collected metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub namespace: String,
    pub version: u32,
    pub data: serde_json::Value,
    pub collected_at: DateTime<Utc>,
}

/// A concrete metric requested from a collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRequest {
    pub namespace: String,
    pub version: u32,
    /// Effective configuration after policy application.
    #[serde(default)]
    pub config: ConfigDataNode,
}

/// A metric a collector declares during discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDeclaration {
    pub namespace: String,
    pub version: u32,
    /// Data type tag, e.g. `int64`, `float64`, `string`.
    pub data_type: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// The self-description a plugin returns to `Describe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescription {
    /// Declared metrics; empty for processors and publishers.
    #[serde(default)]
    pub metrics: Vec<MetricDeclaration>,
    /// Config policy applied to subscriptions against this plugin.
    #[serde(default)]
    pub policy: ConfigPolicy,
}

/// Request frame sent to a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    #[serde(flatten)]
    pub body: RpcRequestBody,
}

/// Request verbs.
///
/// Which verbs an instance answers depends on its role; an unsupported
/// verb comes back as an error reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "kebab-case")]
pub enum RpcRequestBody {
    /// First frame on every connection; carries the session token.
    Hello { token: String },
    Describe,
    Ping,
    Collect {
        metrics: Vec<MetricRequest>,
    },
    Process {
        batch: Vec<Metric>,
        #[serde(default)]
        config: ConfigDataNode,
    },
    Publish {
        batch: Vec<Metric>,
        #[serde(default)]
        config: ConfigDataNode,
    },
    Stop,
}

/// Response frame read back from a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(flatten)]
    pub body: RpcResponseBody,
}

/// Response bodies, one per verb plus a generic error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "kebab-case")]
pub enum RpcResponseBody {
    Hello { token: String },
    Description(PluginDescription),
    Pong,
    Collected { metrics: Vec<Metric> },
    Processed { batch: Vec<Metric> },
    Published,
    Stopping,
    Error { message: String },
}

/// Group metric requests by a key extractor, preserving request order
/// inside each group.
pub fn group_requests<K, F>(requests: Vec<MetricRequest>, key: F) -> BTreeMap<K, Vec<MetricRequest>>
where
    K: Ord,
    F: Fn(&MetricRequest) -> K,
{
    let mut groups: BTreeMap<K, Vec<MetricRequest>> = BTreeMap::new();
    for request in requests {
        groups.entry(key(&request)).or_default().push(request);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip() {
        let line = r#"{"type":"collector","name":"mock1","version":1,"rpc_endpoint":"127.0.0.1:40123","plugin_token":"tok"}"#;
        let hs: PluginHandshake = serde_json::from_str(line).unwrap();
        assert_eq!(hs.plugin_type, PluginType::Collector);
        assert_eq!(hs.name, "mock1");
        assert_eq!(hs.rpc_endpoint, "127.0.0.1:40123");
    }

    #[test]
    fn test_request_verb_tag() {
        let req = RpcRequest {
            id: 7,
            body: RpcRequestBody::Ping,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["verb"], "ping");
    }

    #[test]
    fn test_error_reply_parse() {
        let line = r#"{"id":3,"reply":"error","message":"unsupported verb"}"#;
        let resp: RpcResponse = serde_json::from_str(line).unwrap();
        assert!(matches!(
            resp.body,
            RpcResponseBody::Error { ref message } if message == "unsupported verb"
        ));
    }

    #[test]
    fn test_group_requests_preserves_order() {
        let reqs = vec![
            MetricRequest {
                namespace: "/a/one".into(),
                version: 1,
                config: ConfigDataNode::default(),
            },
            MetricRequest {
                namespace: "/b/one".into(),
                version: 1,
                config: ConfigDataNode::default(),
            },
            MetricRequest {
                namespace: "/a/two".into(),
                version: 1,
                config: ConfigDataNode::default(),
            },
        ];
        let groups = group_requests(reqs, |r| r.namespace.split('/').nth(1).unwrap().to_string());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["a"].len(), 2);
        assert_eq!(groups["a"][0].namespace, "/a/one");
        assert_eq!(groups["a"][1].namespace, "/a/two");
    }
}
