//! cloudscale-config: controller configuration.
//!
//! Settings come from three layers, later layers winning:
//!
//! ```text
//! built-in defaults
//!   └── cloudscale.toml  ([target], [app], [load_balancer], [policy])
//!         └── environment (PROJECT_ID, ZONE, VM_NAME, ..., CLOUDSCALE_*)
//! ```
//!
//! A `.env` file in the working directory is loaded into the process
//! environment before the environment layer is read. The overload threshold
//! has no default and must be set explicitly.

pub mod config;
pub mod error;

pub use config::{
    AppConfig, ConfigFile, ControllerConfig, FallbackBackend, LoadBalancerConfig, PolicyConfig,
    TargetConfig,
};
pub use error::{ConfigError, ConfigResult};
