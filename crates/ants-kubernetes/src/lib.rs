//! Runs task commands in Kubernetes pods. One pod per task holds the main
//! container, an optional helper and any service sidecars.

pub mod adapter;
pub mod executor;
pub mod kube_adapter;
pub mod pod;
pub mod pods;
pub mod provider;
pub mod resources;
pub mod runner;

pub use adapter::{ExecOutcome, KubernetesAdapter};
pub use executor::KubernetesExecutor;
pub use kube_adapter::KubeAdapter;
pub use pod::{build_pod, PodBuild, POD_LABEL};
pub use pods::{PodClient, PodPhase};
pub use provider::KubernetesProvider;
pub use runner::KubernetesCommandRunner;
