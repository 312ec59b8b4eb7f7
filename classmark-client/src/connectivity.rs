//! Connectivity monitor.
//!
//! Turns platform reachability signals into a boolean plus edge
//! notifications. Writes never wait on it; only the sync engines consult it.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use classmark_core::TransportError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

/// Platform reachability signal.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> Result<bool, TransportError>;
}

struct Inner {
    tx: watch::Sender<bool>,
    listeners: Mutex<Vec<Listener>>,
}

/// Tracks whether the device is online.
///
/// Clones share state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ConnectivityMonitor {
    pub fn new(initially_connected: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_connected);
        Self {
            inner: Arc::new(Inner {
                tx,
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.tx.borrow()
    }

    /// Publish an observation. Returns true if it was a transition.
    ///
    /// Repeated observations of the same state are swallowed, so listeners
    /// fire on edges only.
    pub fn set_connected(&self, connected: bool) -> bool {
        let changed = self.inner.tx.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        });
        if changed {
            info!(connected, "Connectivity changed");
            // Called outside the lock so a listener may register another.
            let listeners: Vec<Listener> = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(|err| err.into_inner())
                .clone();
            for listener in listeners {
                listener(connected);
            }
        }
        changed
    }

    /// Register a callback fired on every transition.
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(Arc::new(listener));
    }

    /// Receiver that observes transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.tx.subscribe()
    }

    /// Resolves once the device is online.
    pub async fn wait_until_connected(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|connected| *connected).await;
    }

    /// Run the probe once and publish its answer.
    ///
    /// A probe fault says nothing about the network, so it is treated as
    /// connected and the next sync attempt decides.
    pub async fn poll_once(&self, probe: &dyn ReachabilityProbe) -> bool {
        let connected = match probe.probe().await {
            Ok(connected) => connected,
            Err(err) => {
                warn!(error = %err, "Reachability probe failed, assuming connected");
                true
            }
        };
        self.set_connected(connected);
        connected
    }

    /// Poll the probe on an interval until `shutdown` is cancelled.
    pub fn spawn_polling(
        &self,
        probe: Arc<dyn ReachabilityProbe>,
        interval: Duration,
        shutdown: CancelToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.poll_once(probe.as_ref()).await;
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Connectivity polling stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProbe(Result<bool, TransportError>);

    #[async_trait]
    impl ReachabilityProbe for FixedProbe {
        async fn probe(&self) -> Result<bool, TransportError> {
            self.0.clone()
        }
    }

    #[test]
    fn test_listeners_fire_on_edges_only() {
        let monitor = ConnectivityMonitor::new(false);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        monitor.on_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!monitor.set_connected(false));
        assert!(monitor.set_connected(true));
        assert!(!monitor.set_connected(true));
        assert!(monitor.set_connected(false));

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_may_register_another() {
        let monitor = ConnectivityMonitor::new(false);
        let fired = Arc::new(AtomicUsize::new(0));
        let registrar = monitor.clone();
        let counter = Arc::clone(&fired);
        monitor.on_change(move |_| {
            let counter = Arc::clone(&counter);
            registrar.on_change(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        monitor.set_connected(true);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        monitor.set_connected(false);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscriber_sees_transition() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();

        monitor.set_connected(true);

        rx.changed().await.expect("sender alive");
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_probe_fault_assumes_connected() {
        let monitor = ConnectivityMonitor::new(false);
        let probe = FixedProbe(Err(TransportError::Decode("boom".into())));

        assert!(monitor.poll_once(&probe).await);
        assert!(monitor.is_connected());

        assert!(!monitor.poll_once(&FixedProbe(Ok(false))).await);
        assert!(!monitor.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_stops_on_shutdown() {
        let monitor = ConnectivityMonitor::new(false);
        let shutdown = CancelToken::new();
        let handle = monitor.spawn_polling(
            Arc::new(FixedProbe(Ok(true))),
            Duration::from_secs(5),
            shutdown.clone(),
        );

        monitor.wait_until_connected().await;
        shutdown.cancel();
        handle.await.expect("polling task should exit cleanly");
        assert!(monitor.is_connected());
    }
}
