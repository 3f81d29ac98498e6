//! cloudscale-provider: the controller's view of the outside world.
//!
//! Every external collaborator sits behind an object-safe trait so the
//! controller can be wired with real adapters in the daemon and with
//! fakes in tests.
//!
//! # Architecture
//!
//! ```text
//! ComputeClient      ── GcloudCompute   (gcloud compute ... --format=json)
//! RemoteExecutor     ── GcloudSsh       (gcloud compute ssh --command)
//! ContainerRuntime   ── DockerCli       (docker restart)
//! ```
//!
//! All adapters shell out through [`exec::run`], which captures output and
//! maps failures to [`ProviderError`].

pub mod client;
pub mod docker;
pub mod error;
pub mod exec;
pub mod gcloud;
pub mod types;

pub use client::{ComputeClient, ContainerRuntime, RemoteExecutor};
pub use docker::DockerCli;
pub use error::{ProviderError, ProviderResult};
pub use gcloud::{GcloudCompute, GcloudSsh};
pub use types::*;
