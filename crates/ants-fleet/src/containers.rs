use crate::providers::ProviderRegistry;
use ants_core::config::AntConfig;
use ants_core::error::AntError;
use ants_core::events::{lifecycle_key, AntRegistration, ContainerLifecycleEvent};
use ants_core::metrics::{MetricsRegistry, CONTAINER_ENDED_TOTAL, CONTAINER_STARTED_TOTAL};
use ants_core::queue::{MessageCallback, MessageQueue, QueueMessage};
use ants_core::types::{RequestState, TaskMethod, ANT_ID, ORGANIZATION_ID, USER_ID};
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Answer to "is this container already running somewhere in the fleet".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    NonExistent,
    /// Started by an ant that has not restarted since; it will respond.
    ExistsWithGoodAnt,
    /// The owning ant vanished or restarted after starting the container.
    OrphanContainer,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerStatus::NonExistent => "NON_EXISTENT",
            ContainerStatus::ExistsWithGoodAnt => "EXISTS_WITH_GOOD_ANT",
            ContainerStatus::OrphanContainer => "ORPHAN_CONTAINER",
        };
        write!(f, "{}", s)
    }
}

#[derive(Default)]
struct Tracked {
    registrations: HashMap<String, AntRegistration>,
    events: HashMap<String, ContainerLifecycleEvent>,
}

/// Fleet-wide view of ant heartbeats and container lifecycle events.
///
/// Both maps sit behind one lock. Events are replaced by the newest one for
/// their `method:name` key and dropped once the container reaches a
/// terminal state.
pub struct ContainersRegistry {
    id: String,
    config: Arc<AntConfig>,
    queue: Arc<dyn MessageQueue>,
    metrics: Arc<MetricsRegistry>,
    tracked: RwLock<Tracked>,
    subscriptions: Mutex<Vec<(String, String)>>,
}

impl ContainersRegistry {
    pub fn new(
        config: Arc<AntConfig>,
        queue: Arc<dyn MessageQueue>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: format!("{}-container-registry", config.id),
            config,
            queue,
            metrics,
            tracked: RwLock::new(Tracked::default()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Subscribes to heartbeats and lifecycle events, then seeds the event
    /// map from containers that are already running.
    pub async fn start(
        self: &Arc<Self>,
        token: &CancellationToken,
        providers: &ProviderRegistry,
    ) -> Result<(), AntError> {
        let registration_topic = self.config.registration_topic.clone();
        let id = self
            .queue
            .subscribe(&registration_topic, false, self.registration_callback())
            .await?;
        self.subscriptions.lock().await.push((registration_topic, id));

        let lifecycle_topic = self.config.container_lifecycle_topic.clone();
        match self
            .queue
            .subscribe(&lifecycle_topic, false, self.lifecycle_callback())
            .await
        {
            Ok(id) => self.subscriptions.lock().await.push((lifecycle_topic, id)),
            Err(err) => {
                let _ = self.stop().await;
                return Err(err);
            }
        }

        self.register_already_running(token, providers).await;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), AntError> {
        let mut errors = Vec::new();
        for (topic, id) in self.subscriptions.lock().await.drain(..) {
            if let Err(err) = self.queue.unsubscribe(&topic, &id).await {
                errors.push(err);
            }
        }
        AntError::aggregate(errors)
    }

    fn registration_callback(self: &Arc<Self>) -> MessageCallback {
        let registry: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |msg: QueueMessage| -> BoxFuture<'static, Result<(), AntError>> {
            let registry = registry.clone();
            Box::pin(async move {
                let Some(registry) = registry.upgrade() else {
                    return Ok(());
                };
                let registration = AntRegistration::unmarshal(&msg.payload).map_err(|err| {
                    error!(
                        "{} failed to unmarshal registration from {}: {}",
                        registry.id, msg.topic, err
                    );
                    err
                })?;
                registry.register_ant(registration).await;
                Ok::<(), AntError>(())
            })
        })
    }

    fn lifecycle_callback(self: &Arc<Self>) -> MessageCallback {
        let registry: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |msg: QueueMessage| -> BoxFuture<'static, Result<(), AntError>> {
            let registry = registry.clone();
            Box::pin(async move {
                let Some(registry) = registry.upgrade() else {
                    return Ok(());
                };
                let event = ContainerLifecycleEvent::unmarshal(&msg.payload).map_err(|err| {
                    error!(
                        "{} failed to unmarshal lifecycle event from {}: {}",
                        registry.id, msg.topic, err
                    );
                    err
                })?;
                if let Err(err) = registry.update_container(event).await {
                    warn!("{} ignored lifecycle event: {}", registry.id, err);
                }
                Ok::<(), AntError>(())
            })
        })
    }

    /// Records the latest heartbeat of an ant.
    pub async fn register_ant(&self, mut registration: AntRegistration) {
        registration.received_at = Some(Utc::now());
        debug!("Received ant registration {}", registration);
        self.tracked
            .write()
            .await
            .registrations
            .insert(registration.ant_id.clone(), registration);
    }

    /// Stores a started container and forgets one that reached a terminal
    /// state.
    pub async fn update_container(&self, event: ContainerLifecycleEvent) -> Result<(), AntError> {
        debug!("Received container lifecycle {}", event);
        let org = event
            .labels
            .get(ORGANIZATION_ID)
            .cloned()
            .unwrap_or_default();
        let mut tracked = self.tracked.write().await;
        match event.container_state {
            RequestState::Started | RequestState::Executing => {
                self.metrics
                    .incr(CONTAINER_STARTED_TOTAL, &[("ORG", org.as_str())]);
                tracked.events.insert(event.key(), event);
                Ok(())
            }
            state if state.is_terminal() => {
                self.metrics.incr(CONTAINER_ENDED_TOTAL, &[("ORG", org.as_str())]);
                tracked.events.remove(&event.key());
                Ok(())
            }
            _ => Err(AntError::Validation(format!(
                "unsupported container event {}",
                event
            ))),
        }
    }

    pub async fn get_container_event(
        &self,
        method: TaskMethod,
        container_name: &str,
    ) -> Option<ContainerLifecycleEvent> {
        self.tracked
            .read()
            .await
            .events
            .get(&lifecycle_key(method, container_name))
            .cloned()
    }

    /// Snapshot of all tracked events, newest first.
    pub async fn container_events(&self) -> Vec<ContainerLifecycleEvent> {
        let mut all: Vec<ContainerLifecycleEvent> =
            self.tracked.read().await.events.values().cloned().collect();
        all.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        all
    }

    pub async fn registration(&self, ant_id: &str) -> Option<AntRegistration> {
        self.tracked.read().await.registrations.get(ant_id).cloned()
    }

    /// Classifies a container by comparing the owning ant's start time with
    /// the event's creation time. An ant counts as good only when it started
    /// more than `clock_skew_tolerance_secs` before the event.
    pub async fn check_if_already_running(
        &self,
        method: TaskMethod,
        container_name: &str,
    ) -> ContainerStatus {
        let tracked = self.tracked.read().await;
        let Some(event) = tracked.events.get(&lifecycle_key(method, container_name)) else {
            return ContainerStatus::NonExistent;
        };
        let Some(registration) = tracked.registrations.get(&event.ant_id) else {
            debug!(
                "method {} container {} is already running but ant {} no longer listening, last status {} at {}",
                method, container_name, event.ant_id, event.container_state, event.created_at()
            );
            return ContainerStatus::OrphanContainer;
        };
        let tolerance = ChronoDuration::seconds(self.config.clock_skew_tolerance_secs as i64);
        if registration.ant_started_at + tolerance < event.created_at() {
            debug!(
                "method {} container {} is already running by the ant {} so it should respond, last status {} at {}",
                method, container_name, event.ant_id, event.container_state, event.created_at()
            );
            return ContainerStatus::ExistsWithGoodAnt;
        }
        debug!(
            "method {} container {} is already running by the ant {} but it was restarted, last status {} at {}",
            method, container_name, event.ant_id, event.container_state, event.created_at()
        );
        ContainerStatus::OrphanContainer
    }

    /// Seeds events from containers left by this or a previous ant process.
    /// Containers without an ant label are not ours and are skipped.
    pub async fn register_already_running(
        &self,
        token: &CancellationToken,
        providers: &ProviderRegistry,
    ) -> usize {
        let containers = providers.all_running_containers(token).await;
        let mut added = 0;
        for (method, infos) in &containers {
            for info in infos {
                let Some(ant_id) = info.labels.get(ANT_ID).filter(|id| !id.is_empty()) else {
                    continue;
                };
                let state = if info.state.done() {
                    RequestState::Completed
                } else {
                    if !info.state.ready_or_running() {
                        warn!("Unknown state {} of container {}", info.state, info.name);
                    }
                    RequestState::Started
                };
                let container_id = if info.id.is_empty() { &info.name } else { &info.id };
                let event = ContainerLifecycleEvent::new(
                    "ContainersRegistry",
                    info.labels.get(USER_ID).map(String::as_str).unwrap_or_default(),
                    ant_id,
                    *method,
                    &info.name,
                    container_id,
                    state,
                    info.labels.clone(),
                    info.started_at,
                    info.ended_at,
                );
                let _ = self.update_container(event).await;
                added += 1;
            }
        }
        if added > 0 {
            info!(
                "Added already running containers methods={} events={} added={}",
                containers.len(),
                self.tracked.read().await.events.len(),
                added
            );
        }
        added
    }
}
