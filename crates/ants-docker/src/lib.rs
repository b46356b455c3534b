//! Runs task commands inside Docker containers through the Engine API.

pub mod adapter;
pub mod bollard_adapter;
pub mod executor;
pub mod provider;
pub mod runner;

pub use adapter::{DockerAdapter, ExecHandle, ExecStatus, ExecStream};
pub use bollard_adapter::BollardAdapter;
pub use executor::DockerExecutor;
pub use provider::DockerProvider;
pub use runner::DockerCommandRunner;
