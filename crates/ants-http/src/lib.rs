//! Runs HTTP task methods by requesting the command URL.

pub mod client;
pub mod executor;
pub mod provider;
pub mod runner;

pub use client::{HttpClient, HttpRequest, HttpResponse};
pub use executor::HttpExecutor;
pub use provider::HttpProvider;
pub use runner::HttpCommandRunner;
