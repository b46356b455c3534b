use ants_core::config::AntConfig;
use ants_core::error::AntError;
use ants_core::queue::MessageQueue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Publishes this ant's registration on the registration topic every
/// `registration_interval_secs`, carrying its current load.
pub struct AntHeartbeat {
    config: Arc<AntConfig>,
    queue: Arc<dyn MessageQueue>,
    current_load: AtomicI32,
    total_executed: AtomicI32,
}

impl AntHeartbeat {
    pub fn new(config: Arc<AntConfig>, queue: Arc<dyn MessageQueue>) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue,
            current_load: AtomicI32::new(0),
            total_executed: AtomicI32::new(0),
        })
    }

    /// Load reported by the next heartbeat.
    pub fn set_load(&self, current_load: i32, total_executed: i32) {
        self.current_load.store(current_load, Ordering::Relaxed);
        self.total_executed.store(total_executed, Ordering::Relaxed);
    }

    pub async fn send(&self) -> Result<(), AntError> {
        let mut registration = self.config.new_registration();
        registration.current_load = self.current_load.load(Ordering::Relaxed);
        registration.total_executed = self.total_executed.load(Ordering::Relaxed);
        let payload = registration.marshal()?;
        self.queue
            .publish(&self.config.registration_topic, payload, HashMap::new())
            .await?;
        debug!("Sent registration {}", registration);
        Ok(())
    }

    /// Sends the first heartbeat right away, then one per interval until
    /// `token` is cancelled.
    pub fn start(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let heartbeat = self.clone();
        let period = self.config.registration_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = heartbeat.send().await {
                            error!(
                                "Failed to send registration of ant {} to {}: {}",
                                heartbeat.config.id, heartbeat.config.registration_topic, err
                            );
                        }
                    }
                }
            }
            info!("Exiting registration loop of ant {}", heartbeat.config.id);
        })
    }
}
