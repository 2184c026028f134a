//! Connectivity monitor.
//!
//! Tracks the current online/offline state and notifies subscribers of
//! transitions. The host environment supplies the signal via `set_online`;
//! `probe_health` is a lightweight authenticated check against the remote
//! health endpoint for hosts without a native signal.
//!
//! The sync engine subscribes here: an offline→online transition triggers an
//! immediate drain; online→offline suppresses new batches without cancelling
//! requests already dispatched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

use crate::api;
use crate::events::{EventBus, Subscription};

/// Timeout used for the lightweight health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

/// Current online/offline state plus ordered transition notifications.
pub struct ConnectivityMonitor {
    online: AtomicBool,
    events: EventBus<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        Self {
            online: AtomicBool::new(initially_online),
            events: EventBus::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record the host-reported state. Subscribers are notified on
    /// transitions only; repeating the current state is a no-op.
    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return;
        }
        if online {
            info!("Network restored; notifying subscribers");
            self.events.emit(&ConnectivityEvent::Online);
        } else {
            info!("Network offline; deferring remote sync and keeping queue pending");
            self.events.emit(&ConnectivityEvent::Offline);
        }
    }

    pub fn subscribe(&self) -> Subscription<ConnectivityEvent> {
        self.events.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.events.unsubscribe(id)
    }
}

/// Probe the remote health endpoint. Returns false on any transport error,
/// non-success status, or client construction failure.
pub async fn probe_health(base_url: &str, api_key: &str) -> bool {
    let base = api::normalize_remote_url(base_url);
    let health_url = format!("{base}/api/health");

    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(c) => c,
        Err(_) => return false,
    };

    match client
        .head(&health_url)
        .header(api::API_KEY_HEADER, api_key)
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_notifies_subscribers_once() {
        let monitor = ConnectivityMonitor::new(false);
        let mut sub = monitor.subscribe();

        monitor.set_online(true);
        assert!(monitor.is_online());
        assert_eq!(sub.try_recv(), Some(ConnectivityEvent::Online));
        assert_eq!(sub.try_recv(), None);

        monitor.set_online(false);
        assert_eq!(sub.try_recv(), Some(ConnectivityEvent::Offline));
    }

    #[test]
    fn test_repeated_state_is_silent() {
        let monitor = ConnectivityMonitor::new(true);
        let mut sub = monitor.subscribe();

        monitor.set_online(true);
        monitor.set_online(true);
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_unsubscribe_detaches() {
        let monitor = ConnectivityMonitor::new(true);
        let mut sub = monitor.subscribe();
        assert!(monitor.unsubscribe(sub.id()));

        monitor.set_online(false);
        assert_eq!(sub.try_recv(), None);
    }
}
