pub mod base;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod future;
pub mod metrics;
pub mod options;
pub mod queue;
pub mod state;
pub mod trace;
pub mod types;

pub use base::{BaseExecutor, ExecutorMap, RunnerBase};
pub use config::AntConfig;
pub use error::AntError;
pub use events::{AntRegistration, ContainerLifecycleEvent, RecentlyCompletedJobsEvent};
pub use executor::{CommandOutput, CommandRunner, Executor, ExecutorInfo, ExecutorProvider};
pub use metrics::MetricsRegistry;
pub use options::ExecutorOptions;
pub use queue::{ChannelQueue, MessageQueue};
pub use state::State;
pub use trace::{BufferedTrace, JobTrace, TraceTag};
pub use types::{RequestState, TaskMethod};
