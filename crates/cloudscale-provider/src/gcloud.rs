//! Adapters backed by the `gcloud` CLI.
//!
//! Commands always request `--format=json` so responses can be parsed
//! into the typed structs in [`crate::types`]. Argument construction is
//! kept in plain functions so it can be checked without running gcloud.

pub mod compute;
pub mod ssh;

pub use compute::GcloudCompute;
pub use ssh::GcloudSsh;

pub(crate) const DEFAULT_PROGRAM: &str = "gcloud";
