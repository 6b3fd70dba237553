// Read-only JSON reporting over HTTP

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::inventory::{ChecksFile, HandlersFile, HostsFile};
use crate::monitor::Fleet;
use crate::output::errors::MonitorError;
use crate::output::status::HostStatus;

pub fn build_router(fleet: Arc<Fleet>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(get_status))
        .route("/hosts", get(get_hosts))
        .route("/checks", get(get_checks))
        .route("/handlers", get(get_handlers))
        .with_state(fleet)
}

async fn get_status(State(fleet): State<Arc<Fleet>>) -> Json<Vec<HostStatus>> {
    Json(fleet.status())
}

async fn get_hosts(State(fleet): State<Arc<Fleet>>) -> Json<HostsFile> {
    Json(fleet.inventory().hosts.clone())
}

async fn get_checks(State(fleet): State<Arc<Fleet>>) -> Json<ChecksFile> {
    Json(fleet.inventory().checks.clone())
}

async fn get_handlers(State(fleet): State<Arc<Fleet>>) -> Json<HandlersFile> {
    Json(fleet.inventory().handlers.clone())
}

pub async fn bind(listen: &str) -> Result<TcpListener, MonitorError> {
    TcpListener::bind(listen)
        .await
        .map_err(|e| MonitorError::Http {
            message: format!("Failed to bind {}: {}", listen, e),
        })
}

/// Serve until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    fleet: Arc<Fleet>,
    shutdown: CancellationToken,
) -> Result<(), MonitorError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Status API listening");
    }

    axum::serve(listener, build_router(fleet))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| MonitorError::Http {
            message: format!("Server error: {}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{RecordingNotifier, ScriptedConnector};
    use crate::executor::Connector;
    use crate::inventory::{CheckConfig, HandlerConfig, HostConfig, Inventory, MonitorSettings};
    use crate::monitor::ConnectorFactory;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn fleet() -> Arc<Fleet> {
        slow_fleet(Duration::ZERO)
    }

    /// Every dial takes `delay`
    fn slow_fleet(delay: Duration) -> Arc<Fleet> {
        let inventory = Inventory {
            hosts: HostsFile {
                hosts: vec![HostConfig::new("10.0.0.5").with_subscriptions(&["web"])],
            },
            checks: ChecksFile {
                checks: vec![CheckConfig::new("http", "http.sh").with_subscribers(&["web"])],
            },
            handlers: HandlersFile {
                handlers: vec![HandlerConfig::new("mail", "/usr/local/bin/mail-ops")],
            },
        };
        let factory: ConnectorFactory = Arc::new(
            move |_: &HostConfig, _: &MonitorSettings| -> Result<Arc<dyn Connector>, MonitorError> {
                let connector = ScriptedConnector::with_exits(&[2]);
                connector.set_dial_delay(delay);
                Ok(connector)
            },
        );
        Arc::new(Fleet::with_parts(
            inventory,
            MonitorSettings::default(),
            factory,
            RecordingNotifier::new(),
        ))
    }

    #[tokio::test]
    async fn test_status_reports_started_hosts() {
        let fleet = fleet();
        fleet.start().await;

        let Json(status) = get_status(State(fleet.clone())).await;
        assert_eq!(status.len(), 1);
        assert!(status[0].connected);

        let json = serde_json::to_value(&status).unwrap();
        let http = &json[0]["checks"][0];
        assert_eq!(http["name"], "http");
        assert_eq!(http["exit_status"], 2);
        assert_eq!(http["status"], "FAILURE");
        assert_eq!(http["failures"], 1);
        assert_eq!(http["ssh_failures"], 0);

        fleet.stop().await;
    }

    #[tokio::test]
    async fn test_configuration_endpoints_echo_inventory() {
        let fleet = fleet();

        let Json(hosts) = get_hosts(State(fleet.clone())).await;
        assert_eq!(hosts.hosts[0].address, "10.0.0.5");

        let Json(checks) = get_checks(State(fleet.clone())).await;
        assert_eq!(checks.checks[0].interval, 60);

        let Json(handlers) = get_handlers(State(fleet.clone())).await;
        let json = serde_json::to_value(&handlers).unwrap();
        assert_eq!(json["handlers"][0]["name"], "mail");
    }

    async fn get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serve_until_cancelled() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, fleet(), shutdown.clone()));

        let response = get(addr, "/checks").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("\"name\":\"http\""));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_status_answers_while_hosts_start() {
        let fleet = slow_fleet(Duration::from_millis(300));
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, fleet.clone(), shutdown.clone()));

        let starting = {
            let fleet = fleet.clone();
            tokio::spawn(async move { fleet.start().await })
        };

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200 OK"));
        let status = get(addr, "/status").await;
        assert!(status.starts_with("HTTP/1.1 200 OK"));
        assert!(status.ends_with("[]"));
        assert!(!starting.is_finished());

        starting.await.unwrap();
        let status = get(addr, "/status").await;
        assert!(status.contains("\"host\":\"10.0.0.5\""));

        fleet.stop().await;
        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_http_error() {
        let taken = bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let err = bind(&addr).await.unwrap_err();
        assert!(matches!(err, MonitorError::Http { .. }));
    }
}
