// Per-host connection manager: one shared session, one reconnect at a time

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{Connection, Connector, ScriptUpload};
use crate::output::errors::MonitorError;

/// Owns the single session every check on a host runs through.
///
/// `connecting` is claimed with a compare-and-set, so the "is someone already
/// dialing?" test and taking ownership of the dial are one step. Losers get
/// [`MonitorError::Busy`] immediately instead of queueing behind the winner.
pub struct HostConnection {
    host: String,
    connector: Arc<dyn Connector>,
    handle: RwLock<Option<Arc<dyn Connection>>>,
    connecting: AtomicBool,
    connected: AtomicBool,
    reconnects: AtomicU64,
}

enum Replace {
    Always,
    /// Only when the current session is missing, dead, or the given one
    IfCurrent(Option<Arc<dyn Connection>>),
}

fn same_session(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Releases the `connecting` claim however the dial ends
struct ConnectingClaim<'a>(&'a AtomicBool);

impl Drop for ConnectingClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl HostConnection {
    pub fn new(host: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        HostConnection {
            host: host.into(),
            connector,
            handle: RwLock::new(None),
            connecting: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
        }
    }

    /// Dial a fresh session, replacing (and closing) any existing one
    pub async fn connect(&self) -> Result<(), MonitorError> {
        self.dial(Replace::Always).await
    }

    async fn dial(&self, replace: Replace) -> Result<(), MonitorError> {
        if self
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(host = %self.host, "Connect already in flight");
            return Err(MonitorError::Busy {
                host: self.host.clone(),
            });
        }
        let _claim = ConnectingClaim(&self.connecting);

        let previous = {
            let mut handle = self.handle.write();
            if let (Replace::IfCurrent(failed), Some(current)) = (&replace, handle.as_ref()) {
                let superseded = failed
                    .as_ref()
                    .map_or(true, |failed| !same_session(current, failed));
                if superseded && current.is_alive() {
                    debug!(host = %self.host, "Session already replaced, skipping reconnect");
                    return Ok(());
                }
            }
            self.connected.store(false, Ordering::Release);
            handle.take()
        };
        if let Some(previous) = previous {
            previous.close();
            let count = self.reconnects.fetch_add(1, Ordering::AcqRel) + 1;
            info!(host = %self.host, reconnects = count, "Reconnecting");
        }

        match self.connector.connect().await {
            Ok(conn) => {
                let mut handle = self.handle.write();
                *handle = Some(conn);
                self.connected.store(true, Ordering::Release);
                info!(host = %self.host, "Connected");
                Ok(())
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "Unable to connect");
                Err(e)
            }
        }
    }

    /// Ask for a reconnect without waiting for it.
    ///
    /// `failed` is the session the caller saw break, or `None` if there was no
    /// usable session. Nothing is dialed when a live session other than `failed`
    /// is already in place, so failures on a superseded session cannot tear down
    /// its replacement.
    pub fn request_reconnect(self: &Arc<Self>, failed: Option<Arc<dyn Connection>>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.dial(Replace::IfCurrent(failed)).await {
                Ok(()) => {}
                Err(e) if e.is_busy() => {}
                Err(e) => debug!(host = %this.host, error = %e, "Reconnect attempt failed"),
            }
        });
    }

    /// Cheap check; may read false while a concurrent reconnect is settling
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
            && self
                .handle
                .read()
                .as_ref()
                .map(|conn| conn.is_alive())
                .unwrap_or(false)
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Acquire)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Borrow the live session for one execution
    pub fn session(&self) -> Result<Arc<dyn Connection>, MonitorError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(MonitorError::NotConnected {
                host: self.host.clone(),
            });
        }
        self.handle
            .read()
            .as_ref()
            .filter(|conn| conn.is_alive())
            .cloned()
            .ok_or_else(|| MonitorError::NotConnected {
                host: self.host.clone(),
            })
    }

    pub async fn push_scripts(&self, scripts: &[ScriptUpload]) -> Result<(), MonitorError> {
        self.connector.push_scripts(scripts).await
    }

    /// Terminate the session. Idempotent.
    pub fn close(&self) {
        let previous = {
            let mut handle = self.handle.write();
            self.connected.store(false, Ordering::Release);
            handle.take()
        };
        if let Some(conn) = previous {
            conn.close();
            debug!(host = %self.host, "Connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{wait_for, ScriptedConnector};
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_and_close() {
        let connector = ScriptedConnector::new();
        let conn = HostConnection::new("web-1", connector.clone());

        assert!(!conn.is_connected());
        assert!(conn.session().is_err());

        conn.connect().await.unwrap();
        assert!(conn.is_connected());
        assert!(conn.session().is_ok());
        assert_eq!(conn.reconnects(), 0);

        conn.close();
        conn.close();
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.session().err().unwrap(),
            MonitorError::NotConnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_reconnect_counts_replaced_sessions() {
        let connector = ScriptedConnector::new();
        let conn = HostConnection::new("web-1", connector.clone());

        conn.connect().await.unwrap();
        conn.connect().await.unwrap();
        conn.connect().await.unwrap();

        assert_eq!(conn.reconnects(), 2);
        assert_eq!(connector.dial_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_dial_is_returned_unchanged() {
        let connector = ScriptedConnector::new();
        connector.plan_dials(&[false]);
        let conn = HostConnection::new("web-1", connector.clone());

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, MonitorError::Ssh { ref message, .. } if message.contains("refused")));
        assert!(!conn.is_connected());
        assert!(!conn.is_connecting());

        // A failed dial leaves nothing to replace
        conn.connect().await.unwrap();
        assert_eq!(conn.reconnects(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_connects_collapse_into_one_dial() {
        let connector = ScriptedConnector::new();
        connector.set_dial_delay(Duration::from_millis(100));
        let conn = Arc::new(HostConnection::new("web-1", connector.clone()));

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.connect().await })
            })
            .collect();

        let mut ok = 0;
        let mut busy = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(()) => ok += 1,
                Err(e) if e.is_busy() => busy += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(ok, 1);
        assert_eq!(busy, 7);
        assert_eq!(connector.dial_count(), 1);
        assert!(conn.is_connected());
        assert!(!conn.is_connecting());
    }

    #[tokio::test]
    async fn test_request_reconnect_runs_in_background() {
        let connector = ScriptedConnector::new();
        connector.plan_dials(&[false]);
        let conn = Arc::new(HostConnection::new("web-1", connector.clone()));

        assert!(conn.connect().await.is_err());
        conn.request_reconnect(None);

        wait_for(|| conn.is_connected()).await;
        assert_eq!(connector.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_failure_on_replaced_session_does_not_redial() {
        let connector = ScriptedConnector::new();
        let conn = Arc::new(HostConnection::new("web-1", connector.clone()));
        conn.connect().await.unwrap();

        let first = conn.session().unwrap();
        conn.request_reconnect(Some(first.clone()));
        wait_for(|| connector.dial_count() == 2 && conn.is_connected()).await;
        assert_eq!(conn.reconnects(), 1);
        assert!(!first.is_alive());

        // Late failures reported against the old session, or with no session at all
        conn.request_reconnect(Some(first.clone()));
        conn.request_reconnect(None);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(connector.dial_count(), 2);
        assert_eq!(conn.reconnects(), 1);
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_failure_on_current_session_redials() {
        let connector = ScriptedConnector::new();
        let conn = Arc::new(HostConnection::new("web-1", connector.clone()));
        conn.connect().await.unwrap();

        let current = conn.session().unwrap();
        conn.request_reconnect(Some(current));
        wait_for(|| connector.dial_count() == 2 && conn.is_connected()).await;
        assert_eq!(conn.reconnects(), 1);
    }
}
