//! Retry and reconnect behavior of the remote tool-service mesh.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use hearth::config::{DispatchConfig, ServiceEndpoint};
use hearth::dispatch::mesh::{
    CallError, RemoteToolSpec, ServiceChannel, ServiceConnector, ServiceMesh, ServiceStatus,
};
use hearth::error::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn config() -> DispatchConfig {
    DispatchConfig {
        services: vec![ServiceEndpoint {
            name: "search".into(),
            url: "ws://test.invalid/search".into(),
        }],
        reconnect_backoff_secs: 0,
        call_attempts: 3,
        call_timeout_secs: 1,
        // Long enough for a forced reconnect to finish before the next
        // attempt grabs the channel.
        offline_wait_secs: 1,
    }
}

/// Channel whose first `failures` calls fail with a connection error.
struct FlakyChannel {
    calls: Arc<AtomicU32>,
    failures: u32,
    hang: bool,
}

#[async_trait]
impl ServiceChannel for FlakyChannel {
    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>> {
        Ok(vec![RemoteToolSpec {
            name: "web_search".into(),
            description: "search".into(),
            schema: serde_json::json!({}),
        }])
    }

    async fn call_tool(
        &self,
        _name: &str,
        _arguments: &serde_json::Value,
    ) -> std::result::Result<String, CallError> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(CallError::Connection("socket reset".into()))
        } else {
            Ok("42 Grad? Eher 18.".to_owned())
        }
    }

    async fn closed(&self) {
        std::future::pending::<()>().await;
    }
}

struct FlakyConnector {
    calls: Arc<AtomicU32>,
    failures: u32,
    hang: bool,
    connects: Arc<AtomicU32>,
}

#[async_trait]
impl ServiceConnector for FlakyConnector {
    async fn connect(&self, _endpoint: &ServiceEndpoint) -> Result<Arc<dyn ServiceChannel>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FlakyChannel {
            calls: Arc::clone(&self.calls),
            failures: self.failures,
            hang: self.hang,
        }))
    }
}

async fn wait_until_known(mesh: &ServiceMesh, tool: &str) {
    for _ in 0..100 {
        if mesh.knows(tool) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{tool} never appeared in the mesh index");
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_twice_then_online_succeeds_on_third_attempt() {
    let calls = Arc::new(AtomicU32::new(0));
    let connects = Arc::new(AtomicU32::new(0));
    let connector = Arc::new(FlakyConnector {
        calls: Arc::clone(&calls),
        failures: 2,
        hang: false,
        connects: Arc::clone(&connects),
    });
    let mesh = ServiceMesh::start(config(), connector);
    wait_until_known(&mesh, "web_search").await;

    let result = mesh
        .call("web_search", &serde_json::json!({ "q": "wetter" }))
        .await;
    assert_eq!(result, "42 Grad? Eher 18.");
    assert_eq!(calls.load(Ordering::SeqCst), 3, "exactly three attempts");
    assert!(
        connects.load(Ordering::SeqCst) >= 2,
        "connection errors forced reconnects"
    );
    mesh.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_on_all_attempts_yields_text_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let connector = Arc::new(FlakyConnector {
        calls: Arc::clone(&calls),
        failures: u32::MAX,
        hang: false,
        connects: Arc::new(AtomicU32::new(0)),
    });
    let mesh = ServiceMesh::start(config(), connector);
    wait_until_known(&mesh, "web_search").await;

    let result = mesh.call("web_search", &serde_json::json!({})).await;
    assert!(result.starts_with("Fehler"), "text error, never a panic: {result}");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    mesh.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn call_timeouts_retry_then_degrade_to_text() {
    let connector = Arc::new(FlakyConnector {
        calls: Arc::new(AtomicU32::new(0)),
        failures: 0,
        hang: true,
        connects: Arc::new(AtomicU32::new(0)),
    });
    let mut cfg = config();
    cfg.call_attempts = 2;
    let mesh = ServiceMesh::start(cfg, connector);
    wait_until_known(&mesh, "web_search").await;

    let result = mesh.call("web_search", &serde_json::json!({})).await;
    assert!(result.contains("Zeitlimit"), "timeout text: {result}");
    mesh.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn tool_reported_errors_are_not_retried() {
    struct ErrChannel;

    #[async_trait]
    impl ServiceChannel for ErrChannel {
        async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>> {
            Ok(vec![RemoteToolSpec {
                name: "web_search".into(),
                description: String::new(),
                schema: serde_json::json!({}),
            }])
        }
        async fn call_tool(
            &self,
            _name: &str,
            _arguments: &serde_json::Value,
        ) -> std::result::Result<String, CallError> {
            Err(CallError::Failed("ungültige Anfrage".into()))
        }
        async fn closed(&self) {
            std::future::pending::<()>().await;
        }
    }

    struct ErrConnector;

    #[async_trait]
    impl ServiceConnector for ErrConnector {
        async fn connect(&self, _endpoint: &ServiceEndpoint) -> Result<Arc<dyn ServiceChannel>> {
            Ok(Arc::new(ErrChannel))
        }
    }

    let mesh = ServiceMesh::start(config(), Arc::new(ErrConnector));
    wait_until_known(&mesh, "web_search").await;

    let result = mesh.call("web_search", &serde_json::json!({})).await;
    assert_eq!(result, "Tool Fehler: ungültige Anfrage");
    mesh.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn never_connecting_service_reports_backoff_state() {
    struct DeadConnector;

    #[async_trait]
    impl ServiceConnector for DeadConnector {
        async fn connect(&self, _endpoint: &ServiceEndpoint) -> Result<Arc<dyn ServiceChannel>> {
            Err(hearth::error::HearthError::Mesh("connection refused".into()))
        }
    }

    let mut cfg = config();
    cfg.reconnect_backoff_secs = 60;
    let mesh = ServiceMesh::start(cfg, Arc::new(DeadConnector));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(mesh.status("search"), Some(ServiceStatus::FailedBackoff));
    assert!(!mesh.knows("web_search"));
    // Unknown tools degrade to text.
    let result = mesh.call("web_search", &serde_json::json!({})).await;
    assert!(result.contains("nicht verfügbar"));
    mesh.shutdown();
}
