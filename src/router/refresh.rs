//! Background ring-cache refresh
//!
//! One task per distributed router. After an initial delay it runs the
//! staleness check on a fixed interval, and immediately whenever a server
//! change event from another instance arrives. Events are only a hint: a
//! dropped or lagged event is covered by the next tick.

use crate::router::distributed::RouterCore;
use crate::store::ServerChangeEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to a running refresh task.
pub struct RefreshTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RefreshTask {
    /// Signal shutdown and wait up to `grace`; abort if the task is still
    /// running. Returns true on a clean stop.
    pub async fn stop(mut self, grace: Duration) -> bool {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!("Refresh task did not stop within {:?}, aborting", grace);
                self.handle.abort();
                false
            }
        }
    }

    /// Stop without waiting.
    pub fn abort(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

/// Next change event, or pending forever once the channel is gone.
async fn next_event(
    events: &mut Option<broadcast::Receiver<String>>,
) -> Result<String, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub(crate) fn spawn_refresh_task(
    core: Arc<RouterCore>,
    initial_delay: Duration,
    interval: Duration,
    mut events: Option<broadcast::Receiver<String>>,
) -> RefreshTask {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(initial_delay) => {}
            _ = shutdown_rx.changed() => return,
        }

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tick.tick() => {
                    core.refresh_if_needed("timer").await;
                }
                event = next_event(&mut events) => match event {
                    Ok(payload) => match ServerChangeEvent::from_json(&payload) {
                        Ok(event) if event.origin.as_deref() == Some(core.instance_id()) => {}
                        Ok(event) => {
                            tracing::debug!("Server change {} {} observed", event.action, event.server);
                            core.refresh_if_needed("change event").await;
                        }
                        Err(e) => {
                            tracing::warn!("Ignoring malformed server change event: {}", e);
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Missed {} server change events", skipped);
                        core.refresh_if_needed("lagged events").await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events = None;
                    }
                },
            }
        }

        tracing::debug!("Refresh task for {} stopped", core.instance_id());
    });

    RefreshTask {
        shutdown_tx,
        handle,
    }
}
