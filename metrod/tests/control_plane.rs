//! End-to-end control-plane scenarios.
//!
//! These tests run the whole stack: a real API server on an ephemeral
//! port, real plugin subprocesses (tiny launcher scripts that print the
//! handshake line), and in-process stub rpc endpoints behind them.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use metrod::api::ApiServer;
use metrod::config::ControlConfig;
use metrod::plugin::stub::{StubHandle, StubPlugin};
use metrod::services::ServiceContainer;

struct TestServer {
    base_url: String,
    container: Arc<ServiceContainer>,
    server: Arc<ApiServer>,
    client: reqwest::Client,
    dir: tempfile::TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = ControlConfig {
            plugin_dir: Some(dir.path().join("uploads")),
            heartbeat_interval_ms: 200,
            ..ControlConfig::default()
        };
        let container = Arc::new(ServiceContainer::new(config).unwrap());
        let server = Arc::new(ApiServer::new(container.clone()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serve = server.clone();
        tokio::spawn(async move {
            let _ = serve.serve(listener).await;
        });

        Self {
            base_url: format!("http://{addr}"),
            container,
            server,
            client: reqwest::Client::new(),
            dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Spawn a stub rpc endpoint and write a launcher script whose only
    /// job is to print the handshake line and stay alive.
    async fn stage_plugin(&self, builder: StubPlugin) -> (StubHandle, PathBuf) {
        let token = self.container.manager.plugin_args().session_token.clone();
        let stub = builder.with_token(token).spawn().await;
        let script = format!(
            "#!/bin/sh\necho '{}'\nexec sleep 60\n",
            stub.handshake_line()
        );
        let path = self
            .dir
            .path()
            .join(format!("plugin-{}", uuid_suffix(&stub)));
        std::fs::write(&path, script).unwrap();
        make_executable(&path);
        (stub, path)
    }

    async fn load_via_rest(&self, path: &PathBuf) -> reqwest::Response {
        let bytes = std::fs::read(path).unwrap();
        let filename = path.file_name().unwrap().to_string_lossy().to_string();
        let form = reqwest::multipart::Form::new().part(
            "plugin",
            reqwest::multipart::Part::bytes(bytes).file_name(filename),
        );
        self.client
            .post(self.url("/v1/plugins"))
            .multipart(form)
            .send()
            .await
            .unwrap()
    }

    async fn create_task(&self, manifest: serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url("/v1/tasks"))
            .json(&manifest)
            .send()
            .await
            .unwrap()
    }

    async fn shutdown(self) {
        self.server.shutdown();
        self.container.shutdown().await;
    }
}

fn uuid_suffix(stub: &StubHandle) -> String {
    stub.endpoint().replace([':', '.'], "-")
}

fn make_executable(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

fn simple_task_manifest(metric: &str, start: bool) -> serde_json::Value {
    serde_json::json!({
        "version": 1,
        "name": "scenario-task",
        "schedule": { "type": "simple", "interval": "100ms" },
        "workflow": { "collect": { "metrics": { metric: {} } } },
        "start": start,
    })
}

#[tokio::test]
async fn test_s1_empty_system() {
    let ts = TestServer::start().await;

    let response = ts.client.get(ts.url("/v1/plugins")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["loaded"], serde_json::json!([]));
    assert_eq!(body["available"], serde_json::json!([]));

    let response = ts.client.get(ts.url("/v1/metrics")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!([]));

    ts.shutdown().await;
}

#[tokio::test]
async fn test_s2_load_and_duplicate_conflict() {
    let ts = TestServer::start().await;
    let (_stub, path) = ts
        .stage_plugin(StubPlugin::collector("mock1", 1).with_metric("/metro/mock/foo", 1))
        .await;

    let response = ts.load_via_rest(&path).await;
    assert_eq!(response.status(), 201);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["name"], "mock1");
    assert_eq!(body["type"], "collector");
    assert_eq!(body["version"], 1);
    assert_eq!(body["status"], "loaded");

    // The declared metric is in the catalog.
    let response = ts
        .client
        .get(ts.url("/v1/metrics/metro/mock/foo"))
        .send()
        .await
        .unwrap();
    let metrics: serde_json::Value = response.json().await.unwrap();
    assert_eq!(metrics[0]["namespace"], "/metro/mock/foo");

    // Loading the same file again conflicts.
    let response = ts.load_via_rest(&path).await;
    assert_eq!(response.status(), 409);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["message"], "plugin is already loaded");

    ts.shutdown().await;
}

#[tokio::test]
async fn test_s3_missing_metric_task_not_persisted() {
    let ts = TestServer::start().await;
    let (_stub, path) = ts
        .stage_plugin(StubPlugin::collector("mock1", 1).with_metric("/metro/mock/foo", 1))
        .await;
    assert_eq!(ts.load_via_rest(&path).await.status(), 201);

    let response = ts
        .create_task(simple_task_manifest("/metro/mock/bar", true))
        .await;
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Metric not found: /metro/mock/bar"));

    let tasks: serde_json::Value = ts
        .client
        .get(ts.url("/v1/tasks"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tasks, serde_json::json!([]));

    ts.shutdown().await;
}

#[tokio::test]
async fn test_s4_start_stop_lifecycle() {
    let ts = TestServer::start().await;
    let (_stub, path) = ts
        .stage_plugin(StubPlugin::collector("mock1", 1).with_metric("/metro/mock/foo", 1))
        .await;
    assert_eq!(ts.load_via_rest(&path).await.status(), 201);

    let response = ts
        .create_task(simple_task_manifest("/metro/mock/foo", false))
        .await;
    assert_eq!(response.status(), 201);
    let task: serde_json::Value = response.json().await.unwrap();
    let id = task["id"].as_str().unwrap().to_string();
    assert_eq!(task["state"], "Stopped");

    let response = ts
        .client
        .put(ts.url(&format!("/v1/tasks/{id}/start")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let task: serde_json::Value = response.json().await.unwrap();
    assert_eq!(task["state"], "Running");

    let response = ts
        .client
        .put(ts.url(&format!("/v1/tasks/{id}/start")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["message"], "Task is already running.");

    let response = ts
        .client
        .put(ts.url(&format!("/v1/tasks/{id}/stop")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let task: serde_json::Value = response.json().await.unwrap();
    assert_eq!(task["state"], "Stopped");

    let response = ts
        .client
        .put(ts.url(&format!("/v1/tasks/{id}/stop")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["message"], "Task is already stopped.");

    ts.shutdown().await;
}

#[tokio::test]
async fn test_s5_remove_running_task_rejected() {
    let ts = TestServer::start().await;
    let (_stub, path) = ts
        .stage_plugin(StubPlugin::collector("mock1", 1).with_metric("/metro/mock/foo", 1))
        .await;
    assert_eq!(ts.load_via_rest(&path).await.status(), 201);

    let task: serde_json::Value = ts
        .create_task(simple_task_manifest("/metro/mock/foo", true))
        .await
        .json()
        .await
        .unwrap();
    let id = task["id"].as_str().unwrap().to_string();

    let response = ts
        .client
        .delete(ts.url(&format!("/v1/tasks/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("Task must be stopped"));

    ts.shutdown().await;
}

#[tokio::test]
async fn test_s6_watch_stream() {
    let ts = TestServer::start().await;
    let (_stub, path) = ts
        .stage_plugin(StubPlugin::collector("mock1", 1).with_metric("/metro/mock/foo", 1))
        .await;
    assert_eq!(ts.load_via_rest(&path).await.status(), 201);

    let task: serde_json::Value = ts
        .create_task(simple_task_manifest("/metro/mock/foo", false))
        .await
        .json()
        .await
        .unwrap();
    let id = task["id"].as_str().unwrap().to_string();

    // Attach the watcher before starting so task-started is observed.
    let watch_response = ts
        .client
        .get(ts.url(&format!("/v1/tasks/{id}/watch")))
        .send()
        .await
        .unwrap();
    assert_eq!(watch_response.status(), 200);

    ts.client
        .put(ts.url(&format!("/v1/tasks/{id}/start")))
        .send()
        .await
        .unwrap();

    use futures::StreamExt;
    let mut stream = watch_response.bytes_stream();
    let mut buffer = Vec::new();
    let mut events: Vec<serde_json::Value> = Vec::new();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while events.len() < 6 {
        let chunk = tokio::time::timeout_at(deadline, stream.next())
            .await
            .expect("watch stream stalled")
            .expect("watch stream closed early")
            .unwrap();
        buffer.extend_from_slice(&chunk);
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            events.push(serde_json::from_slice(&line[..line.len() - 1]).unwrap());
        }
    }

    assert_eq!(events[0]["event"], "task-started");
    for event in &events[1..6] {
        assert_eq!(event["event"], "metric-event");
        assert_eq!(event["metrics"][0]["namespace"], "/metro/mock/foo");
    }

    // Closing the watcher terminates cleanly.
    drop(stream);
    ts.client
        .put(ts.url(&format!("/v1/tasks/{id}/stop")))
        .send()
        .await
        .unwrap();

    ts.shutdown().await;
}

#[tokio::test]
async fn test_s7_unload_in_use() {
    let ts = TestServer::start().await;
    let (_collector_stub, collector_path) = ts
        .stage_plugin(StubPlugin::collector("mock1", 1).with_metric("/metro/mock/foo", 1))
        .await;
    let (publisher_stub, publisher_path) =
        ts.stage_plugin(StubPlugin::publisher("file", 1)).await;
    assert_eq!(ts.load_via_rest(&collector_path).await.status(), 201);
    assert_eq!(ts.load_via_rest(&publisher_path).await.status(), 201);

    let manifest = serde_json::json!({
        "version": 1,
        "name": "pipeline-task",
        "schedule": { "type": "simple", "interval": "100ms" },
        "workflow": {
            "collect": {
                "metrics": { "/metro/mock/foo": {} },
                "publish": [ { "plugin_name": "file" } ],
            }
        },
        "start": true,
    });
    let response = ts.create_task(manifest).await;
    assert_eq!(response.status(), 201);
    let task: serde_json::Value = response.json().await.unwrap();
    let id = task["id"].as_str().unwrap().to_string();

    // The publisher eventually receives batches.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while publisher_stub.published().is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "publisher never received a batch"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Unloading the collector while the task holds subscriptions fails.
    let response = ts
        .client
        .delete(ts.url("/v1/plugins/collector/mock1/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);

    // Stop and remove the task, then unload succeeds.
    ts.client
        .put(ts.url(&format!("/v1/tasks/{id}/stop")))
        .send()
        .await
        .unwrap();
    let response = ts
        .client
        .delete(ts.url(&format!("/v1/tasks/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = ts
        .client
        .delete(ts.url("/v1/plugins/collector/mock1/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    ts.shutdown().await;
}

#[tokio::test]
async fn test_unload_path_validation() {
    let ts = TestServer::start().await;

    // Non-integer version is a client error.
    let response = ts
        .client
        .delete(ts.url("/v1/plugins/collector/mock1/one"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Unknown plugin is absent.
    let response = ts
        .client
        .delete(ts.url("/v1/plugins/collector/ghost/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    ts.shutdown().await;
}

#[tokio::test]
async fn test_task_manifest_export_roundtrip() {
    let ts = TestServer::start().await;
    let (_stub, path) = ts
        .stage_plugin(StubPlugin::collector("mock1", 1).with_metric("/metro/mock/foo", 1))
        .await;
    assert_eq!(ts.load_via_rest(&path).await.status(), 201);

    let task: serde_json::Value = ts
        .create_task(simple_task_manifest("/metro/mock/foo", false))
        .await
        .json()
        .await
        .unwrap();
    let id = task["id"].as_str().unwrap().to_string();

    let exported: serde_json::Value = ts
        .client
        .get(ts.url(&format!("/v1/tasks/{id}/export")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(exported["version"], 1);

    // Re-import the exported manifest.
    let response = ts.create_task(exported.clone()).await;
    assert_eq!(response.status(), 201);
    let reimported: serde_json::Value = response.json().await.unwrap();
    assert_eq!(reimported["name"], exported["name"]);
    assert_eq!(reimported["schedule"], exported["schedule"]);
    assert_eq!(reimported["workflow"], exported["workflow"]);

    ts.shutdown().await;
}

#[tokio::test]
async fn test_download_artifact_gzipped() {
    let ts = TestServer::start().await;
    let (_stub, path) = ts
        .stage_plugin(StubPlugin::collector("mock1", 1).with_metric("/metro/mock/foo", 1))
        .await;
    assert_eq!(ts.load_via_rest(&path).await.status(), 201);

    let response = ts
        .client
        .get(ts.url("/v1/plugins/collector/mock1/1?download=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    // reqwest transparently decompresses gzip when enabled; check the
    // payload looks like our launcher script either way.
    let bytes = response.bytes().await.unwrap();
    let text = if bytes.starts_with(&[0x1f, 0x8b]) {
        use std::io::Read;
        let mut decoder = flate2_read(&bytes);
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        out
    } else {
        String::from_utf8_lossy(&bytes).to_string()
    };
    assert!(text.starts_with("#!/bin/sh"));

    ts.shutdown().await;
}

fn flate2_read(bytes: &[u8]) -> impl std::io::Read + '_ {
    flate2::read::GzDecoder::new(bytes)
}

#[tokio::test]
async fn test_multipart_part_rules() {
    let ts = TestServer::start().await;

    // First part must not be a signature file.
    let form = reqwest::multipart::Form::new().part(
        "plugin",
        reqwest::multipart::Part::bytes(b"sig".to_vec()).file_name("mock1.asc"),
    );
    let response = ts
        .client
        .post(ts.url("/v1/plugins"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);

    // More than two parts is a client error.
    let form = reqwest::multipart::Form::new()
        .part(
            "plugin",
            reqwest::multipart::Part::bytes(b"bin".to_vec()).file_name("mock1"),
        )
        .part(
            "signature",
            reqwest::multipart::Part::bytes(b"sig".to_vec()).file_name("mock1.asc"),
        )
        .part(
            "extra",
            reqwest::multipart::Part::bytes(b"extra".to_vec()).file_name("extra"),
        );
    let response = ts
        .client
        .post(ts.url("/v1/plugins"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    ts.shutdown().await;
}

#[tokio::test]
async fn test_signature_hook() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("control.pub");
    std::fs::write(&key_path, b"test public key").unwrap();

    let config = ControlConfig {
        plugin_dir: Some(dir.path().join("uploads")),
        public_key_path: Some(key_path),
        ..ControlConfig::default()
    };
    let container = Arc::new(ServiceContainer::new(config).unwrap());
    let server = Arc::new(ApiServer::new(container.clone()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve = server.clone();
    tokio::spawn(async move {
        let _ = serve.serve(listener).await;
    });
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    // Stage a plugin script by hand against this container's token.
    let token = container.manager.plugin_args().session_token.clone();
    let stub = StubPlugin::collector("signed1", 1)
        .with_metric("/metro/signed/foo", 1)
        .with_token(token)
        .spawn()
        .await;
    let script = format!("#!/bin/sh\necho '{}'\nexec sleep 60\n", stub.handshake_line());
    let bytes = script.into_bytes();

    // Unsigned upload is refused.
    let form = reqwest::multipart::Form::new().part(
        "plugin",
        reqwest::multipart::Part::bytes(bytes.clone()).file_name("signed1"),
    );
    let response = client
        .post(format!("{base}/v1/plugins"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("signature"));

    // Upload with a matching detached signature loads.
    let digest = metrod::plugin::requested::hash_bytes(&bytes);
    let signature: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    let form = reqwest::multipart::Form::new()
        .part(
            "plugin",
            reqwest::multipart::Part::bytes(bytes).file_name("signed1"),
        )
        .part(
            "signature",
            reqwest::multipart::Part::bytes(signature.into_bytes()).file_name("signed1.asc"),
        );
    let response = client
        .post(format!("{base}/v1/plugins"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["signed"], true);

    server.shutdown();
    container.shutdown().await;
}

#[tokio::test]
async fn test_swap_rolls_back_when_outgoing_in_use() {
    let ts = TestServer::start().await;
    let (_v1_stub, v1_path) = ts
        .stage_plugin(StubPlugin::collector("mock1", 1).with_metric("/metro/mock/foo", 1))
        .await;
    assert_eq!(ts.load_via_rest(&v1_path).await.status(), 201);

    // A task keeps v1's metric subscribed.
    let response = ts
        .create_task(simple_task_manifest("/metro/mock/foo", false))
        .await;
    assert_eq!(response.status(), 201);

    // Swapping in v2 must fail on the in-use unload and roll the new
    // version back out.
    let (_v2_stub, v2_path) = ts
        .stage_plugin(StubPlugin::collector("mock1", 2).with_metric("/metro/mock/foo", 2))
        .await;
    let incoming = metrod::plugin::RequestedPlugin::from_path(&v2_path).unwrap();
    let outgoing = metrod::plugin::PluginId::new(
        metrod::plugin::PluginType::Collector,
        "mock1",
        1,
    );
    let err = ts
        .container
        .manager
        .swap(incoming, &outgoing)
        .await
        .unwrap_err();
    assert!(matches!(err, metrod::Error::PluginInUse(_)));

    // v1 is still loaded, v2 rolled back out.
    let plugins = ts.container.manager.loaded_plugins();
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0].id.version, 1);
    assert!(ts.container.catalog.get("/metro/mock/foo", 2).is_err());
    assert!(ts.container.catalog.get("/metro/mock/foo", 1).is_ok());

    ts.shutdown().await;
}

#[tokio::test]
async fn test_swap_replaces_idle_plugin() {
    let ts = TestServer::start().await;
    let (_v1_stub, v1_path) = ts
        .stage_plugin(StubPlugin::collector("mock1", 1).with_metric("/metro/mock/foo", 1))
        .await;
    assert_eq!(ts.load_via_rest(&v1_path).await.status(), 201);

    let (_v2_stub, v2_path) = ts
        .stage_plugin(StubPlugin::collector("mock1", 2).with_metric("/metro/mock/foo", 2))
        .await;
    let incoming = metrod::plugin::RequestedPlugin::from_path(&v2_path).unwrap();
    let outgoing = metrod::plugin::PluginId::new(
        metrod::plugin::PluginType::Collector,
        "mock1",
        1,
    );
    let (loaded, unloaded) = ts.container.manager.swap(incoming, &outgoing).await.unwrap();
    assert_eq!(loaded.id.version, 2);
    assert_eq!(unloaded.id.version, 1);

    let plugins = ts.container.manager.loaded_plugins();
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0].id.version, 2);

    ts.shutdown().await;
}
