//! cloudscale-autoscale: load-driven scaling of a single overflow instance.
//!
//! Samples local CPU and memory, compares against a threshold, and adds or
//! removes one managed cloud instance behind the local load balancer.
//!
//! # Scaling Algorithm
//!
//! ```text
//! overloaded = cpu >= threshold || mem >= threshold
//! exists     = provider reports the managed instance
//!
//! overloaded && !exists:
//!     provision → wait for operation → resolve address → open ingress
//!     → wait until reachable → deploy container → rewrite backend file
//!
//! !overloaded && exists:
//!     delete → wait for operation (once per transition)
//!
//! overloaded && exists:
//!     report current address
//! ```
//!
//! Cooldown windows (`scale_up_cooldown`, `scale_down_cooldown`) keep the
//! controller from oscillating when load hovers near the threshold.

pub mod backend;
pub mod controller;
pub mod deploy;
pub mod error;
pub mod load;

pub use backend::{BackendRecord, LoadBalancer};
pub use controller::{Controller, ControllerDeps, NO_EXTERNAL_IP, Phase, TickOutcome};
pub use error::{ControllerError, ControllerResult};
pub use load::{LoadSample, LoadSampler, SystemLoadSampler};
