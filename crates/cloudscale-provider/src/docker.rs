//! `ContainerRuntime` over the `docker` CLI.

use async_trait::async_trait;
use tracing::info;

use crate::client::ContainerRuntime;
use crate::error::ProviderResult;
use crate::exec;

#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn restart(&self, container: &str) -> ProviderResult<()> {
        let args = vec!["restart".to_string(), container.to_string()];
        exec::run_checked(&self.program, &args, &format!("container {container}")).await?;
        info!(%container, "container restarted");
        Ok(())
    }
}
