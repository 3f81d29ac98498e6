//! `RemoteExecutor` over `gcloud compute ssh`.

use async_trait::async_trait;
use tracing::debug;

use crate::client::RemoteExecutor;
use crate::error::ProviderResult;
use crate::exec;
use crate::types::{ExecOutput, InstanceRef};

/// Runs scripts on instances through `gcloud compute ssh --command`.
#[derive(Debug, Clone)]
pub struct GcloudSsh {
    program: String,
}

impl Default for GcloudSsh {
    fn default() -> Self {
        Self::new()
    }
}

impl GcloudSsh {
    pub fn new() -> Self {
        Self {
            program: super::DEFAULT_PROGRAM.to_string(),
        }
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl RemoteExecutor for GcloudSsh {
    async fn run_script(&self, instance: &InstanceRef, script: &str) -> ProviderResult<ExecOutput> {
        let output = exec::run(&self.program, &ssh_args(instance, script)).await?;
        debug!(
            instance = %instance.name,
            code = ?output.code,
            "remote script finished"
        );
        Ok(output)
    }
}

fn ssh_args(instance: &InstanceRef, script: &str) -> Vec<String> {
    vec![
        "compute".into(),
        "ssh".into(),
        instance.name.clone(),
        format!("--zone={}", instance.zone),
        format!("--project={}", instance.project),
        "--quiet".into(),
        "--strict-host-key-checking=no".into(),
        format!("--command={script}"),
    ]
}
