use crate::providers::ProviderRegistry;
use ants_core::config::AntConfig;
use ants_core::error::AntError;
use ants_core::events::{ContainerLifecycleEvent, RecentlyCompletedJobsEvent};
use ants_core::executor::ExecutorInfo;
use ants_core::metrics::{MetricsRegistry, CONTAINER_REAPED_FAILED_TOTAL, CONTAINER_REAPED_TOTAL};
use ants_core::queue::{MessageCallback, MessageQueue, QueueMessage};
use ants_core::types::{RequestState, TaskMethod, REQUEST_ID, USER_ID};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Bounded set of job ids, evicting the least recently added.
#[derive(Debug)]
pub struct RecentJobs {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl RecentJobs {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    pub fn add(&mut self, id: &str) {
        if self.ids.contains(id) {
            self.order.retain(|existing| existing != id);
        } else {
            self.ids.insert(id.to_string());
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Why a container was picked by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapReason {
    TimedOut { elapsed_secs: i64 },
    JobCompleted { job_id: String },
}

/// Counts of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    pub total: usize,
    pub reaped: usize,
    pub failed: usize,
}

/// Job id of a container: the `RequestID` label, or the first name segment
/// after the fleet prefix (`ants-42-build` gives `42`).
pub fn job_id_of(info: &ExecutorInfo, prefix: &str) -> Option<String> {
    if let Some(id) = info.labels.get(REQUEST_ID).filter(|id| !id.is_empty()) {
        return Some(id.clone());
    }
    let start = info.name.find(prefix)? + prefix.len();
    let id = info.name[start..].split('-').next()?;
    (!id.is_empty()).then(|| id.to_string())
}

/// Periodically stops containers that ran past the job timeout or whose job
/// already finished.
pub struct ContainersReaper {
    config: Arc<AntConfig>,
    providers: Arc<ProviderRegistry>,
    queue: Arc<dyn MessageQueue>,
    metrics: Arc<MetricsRegistry>,
    recent: Mutex<RecentJobs>,
    subscription: tokio::sync::Mutex<Option<String>>,
}

impl ContainersReaper {
    pub fn new(
        config: Arc<AntConfig>,
        providers: Arc<ProviderRegistry>,
        queue: Arc<dyn MessageQueue>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        let recent = RecentJobs::new(config.recently_completed_jobs_capacity);
        Arc::new(Self {
            config,
            providers,
            queue,
            metrics,
            recent: Mutex::new(recent),
            subscription: tokio::sync::Mutex::new(None),
        })
    }

    /// Subscribes to completed jobs and sweeps on every reaper interval
    /// until `token` is cancelled.
    pub async fn start(self: &Arc<Self>, token: CancellationToken) -> Result<JoinHandle<()>, AntError> {
        let id = self
            .queue
            .subscribe(
                &self.config.recently_completed_jobs_topic,
                false,
                self.completed_jobs_callback(),
            )
            .await?;
        *self.subscription.lock().await = Some(id);

        let reaper = self.clone();
        let period = Duration::from_secs(self.config.container_reaper_interval_secs.max(1));
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        reaper.reap(&token).await;
                    }
                }
            }
            if let Err(err) = reaper.stop().await {
                warn!("Failed to unsubscribe containers reaper: {}", err);
            }
        }))
    }

    pub async fn stop(&self) -> Result<(), AntError> {
        match self.subscription.lock().await.take() {
            Some(id) => {
                self.queue
                    .unsubscribe(&self.config.recently_completed_jobs_topic, &id)
                    .await
            }
            None => Ok(()),
        }
    }

    fn completed_jobs_callback(self: &Arc<Self>) -> MessageCallback {
        let reaper: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |msg: QueueMessage| -> BoxFuture<'static, Result<(), AntError>> {
            let reaper = reaper.clone();
            Box::pin(async move {
                let Some(reaper) = reaper.upgrade() else {
                    return Ok(());
                };
                let event = RecentlyCompletedJobsEvent::unmarshal(&msg.payload).map_err(|err| {
                    error!("Failed to unmarshal recently completed jobs: {}", err);
                    err
                })?;
                reaper.add_completed_jobs(&event.job_ids);
                Ok::<(), AntError>(())
            })
        })
    }

    pub fn add_completed_jobs(&self, job_ids: &[String]) {
        let mut recent = self.recent();
        for id in job_ids {
            recent.add(id);
        }
        debug!("Recently completed jobs size={}", recent.len());
    }

    pub fn is_recently_completed(&self, job_id: &str) -> bool {
        self.recent().contains(job_id)
    }

    fn recent(&self) -> std::sync::MutexGuard<'_, RecentJobs> {
        match self.recent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Decides whether a running container should be stopped.
    pub fn should_reap(&self, info: &ExecutorInfo) -> Option<ReapReason> {
        let prefix = &self.config.container_prefix;
        if !info.name.contains(prefix.as_str()) {
            return None;
        }
        let elapsed_secs = info.elapsed_secs();
        if elapsed_secs > self.config.max_job_timeout_secs as i64 {
            return Some(ReapReason::TimedOut { elapsed_secs });
        }
        let job_id = job_id_of(info, prefix)?;
        self.is_recently_completed(&job_id)
            .then_some(ReapReason::JobCompleted { job_id })
    }

    /// One sweep over every running container. Failures are counted and
    /// logged, never retried here.
    pub async fn reap(&self, token: &CancellationToken) -> ReapSummary {
        let containers = self.providers.all_running_containers(token).await;
        let mut summary = ReapSummary::default();
        for (method, infos) in &containers {
            for info in infos {
                summary.total += 1;
                let Some(reason) = self.should_reap(info) else {
                    continue;
                };
                let labels = [("Method", method.as_str())];
                match self.providers.stop_container(token, *method, &info.name).await {
                    Ok(()) => {
                        warn!(
                            "Reaped container {} started={} elapsed={}s reason={:?}",
                            info.name,
                            info.started_at,
                            info.elapsed_secs(),
                            reason
                        );
                        summary.reaped += 1;
                        self.metrics.incr(CONTAINER_REAPED_TOTAL, &labels);
                        self.publish_cancelled(*method, info).await;
                    }
                    Err(err) => {
                        error!(
                            "Failed to reap container {} started={} elapsed={}s: {}",
                            info.name,
                            info.started_at,
                            info.elapsed_secs(),
                            err
                        );
                        summary.failed += 1;
                        self.metrics.incr(CONTAINER_REAPED_FAILED_TOTAL, &labels);
                    }
                }
            }
        }
        if summary.total > 0 {
            debug!(
                "Checked stale containers total={} reaped={} failed={}",
                summary.total, summary.reaped, summary.failed
            );
        }
        summary
    }

    async fn publish_cancelled(&self, method: TaskMethod, info: &ExecutorInfo) {
        let container_id = if info.id.is_empty() { &info.name } else { &info.id };
        let event = ContainerLifecycleEvent::new(
            "ContainersReaper",
            info.labels.get(USER_ID).map(String::as_str).unwrap_or_default(),
            &self.config.id,
            method,
            &info.name,
            container_id,
            RequestState::Cancelled,
            info.labels.clone(),
            info.started_at,
            info.ended_at,
        );
        let published = match event.marshal() {
            Ok(payload) => {
                self.queue
                    .publish(
                        &self.config.container_lifecycle_topic,
                        payload,
                        HashMap::new(),
                    )
                    .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = published {
            warn!(
                "Failed to send lifecycle event for container {}: {}",
                info.name, err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ants_core::state::State;
    use chrono::Utc;

    fn info(name: &str, labels: &[(&str, &str)]) -> ExecutorInfo {
        ExecutorInfo {
            id: String::new(),
            name: name.to_string(),
            method: TaskMethod::Docker,
            state: State::Running,
            started_at: Utc::now(),
            ended_at: None,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            annotations: HashMap::new(),
            host: String::new(),
            container_ip: String::new(),
        }
    }

    #[test]
    fn test_recent_jobs_evicts_oldest() {
        let mut recent = RecentJobs::new(2);
        recent.add("1");
        recent.add("2");
        recent.add("1");
        recent.add("3");
        assert!(recent.contains("1"));
        assert!(!recent.contains("2"));
        assert!(recent.contains("3"));
        assert_eq!(recent.len(), 2);
        assert!(RecentJobs::new(0).is_empty());
    }

    #[test]
    fn test_job_id_from_name_and_label() {
        assert_eq!(job_id_of(&info("ants-42-build", &[]), "ants-"), Some("42".into()));
        assert_eq!(
            job_id_of(&info("ants-42-build", &[(REQUEST_ID, "7")]), "ants-"),
            Some("7".into())
        );
        assert_eq!(job_id_of(&info("other", &[]), "ants-"), None);
        assert_eq!(job_id_of(&info("ants-", &[]), "ants-"), None);
    }
}
