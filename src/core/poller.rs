//! Periodic register polling
//!
//! Reads a configured register set on a fixed cadence and publishes the
//! readings through the client's event stream. Individual failures are
//! logged and counted; the cycle keeps running until the poller is stopped
//! or the connection closes.

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::{BmsClient, LinkError};
use crate::config::PollerConfig;

/// Handle to a running polling task
pub struct Poller {
    task: JoinHandle<()>,
}

impl Poller {
    /// Start polling on the given client
    ///
    /// Keys missing from the catalog are dropped with a warning before the
    /// first cycle.
    pub fn start(client: BmsClient, config: PollerConfig) -> Self {
        let keys: Vec<String> = config
            .registers
            .iter()
            .filter(|key| {
                let known = crate::core::registers::by_key(key).is_some();
                if !known {
                    warn!(key = %key, "dropping unknown register from poll set");
                }
                known
            })
            .cloned()
            .collect();
        let interval = config.interval();

        info!(
            count = keys.len(),
            interval_ms = interval.as_millis() as u64,
            "starting register poller"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                for key in &keys {
                    match client.read_key(key).await {
                        Ok(reading) => {
                            debug!(key = %key, value = reading.value, "poll reading");
                        }
                        Err(LinkError::ConnectionClosed) => {
                            info!("connection closed, stopping poller");
                            return;
                        }
                        Err(err) => {
                            // Transient failures leave the cycle running;
                            // the counters record them.
                            debug!(key = %key, error = %err, "poll read failed");
                        }
                    }
                }
            }
        });

        Self { task }
    }

    /// Stop the polling task
    pub fn stop(self) {
        self.task.abort();
    }

    /// Whether the polling task is still running
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
