//! Runs task commands as local `/bin/sh` processes.

pub mod executor;
pub mod provider;
pub mod runner;

pub use executor::ShellExecutor;
pub use provider::ShellProvider;
pub use runner::ShellCommandRunner;
