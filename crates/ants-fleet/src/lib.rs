//! Fleet coordination for ants: provider dispatch by task method, the
//! periodic ant heartbeat, the container lifecycle registry that rejects
//! duplicate runs and the reaper that stops containers escaping normal
//! teardown.

pub mod containers;
pub mod heartbeat;
pub mod providers;
pub mod reaper;

pub use containers::{ContainerStatus, ContainersRegistry};
pub use heartbeat::AntHeartbeat;
pub use providers::{ProviderRegistry, CONTAINER_METHODS};
pub use reaper::{job_id_of, ContainersReaper, ReapReason, ReapSummary, RecentJobs};
