//! Load balancer backend file management.
//!
//! The load balancer reads a single `server <address>:<port>;` line from
//! its backend file. Updates replace the whole file and restart the load
//! balancer container so the new backend is picked up.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use cloudscale_config::LoadBalancerConfig;
use cloudscale_provider::ContainerRuntime;

use crate::error::ControllerResult;

/// One backend line for the load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRecord {
    pub address: String,
    pub port: u16,
}

impl BackendRecord {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Exact file contents, including the trailing newline.
    pub fn to_file_contents(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for BackendRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server {}:{};", self.address, self.port)
    }
}

/// Writes the backend file and reloads the load balancer container.
pub struct LoadBalancer {
    backend_file: PathBuf,
    container: String,
    runtime: Arc<dyn ContainerRuntime>,
}

impl LoadBalancer {
    pub fn new(
        backend_file: impl Into<PathBuf>,
        container: impl Into<String>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            backend_file: backend_file.into(),
            container: container.into(),
            runtime,
        }
    }

    pub fn from_config(config: &LoadBalancerConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self::new(&config.backend_file, &config.container, runtime)
    }

    pub fn backend_file(&self) -> &Path {
        &self.backend_file
    }

    /// Replace the backend file with `record`.
    ///
    /// Written to a sibling temp file first and renamed into place, so the
    /// load balancer never reads a half-written line. The previous contents
    /// are not kept.
    pub async fn write_backend(&self, record: &BackendRecord) -> ControllerResult<()> {
        if let Some(parent) = self.backend_file.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = temp_path(&self.backend_file);
        tokio::fs::write(&tmp, record.to_file_contents()).await?;
        tokio::fs::rename(&tmp, &self.backend_file).await?;
        Ok(())
    }

    /// Rewrite the backend file and restart the load balancer container.
    pub async fn update_backend(&self, record: &BackendRecord) -> ControllerResult<()> {
        info!(
            backend = %record,
            file = %self.backend_file.display(),
            "updating load balancer backend"
        );
        self.write_backend(record).await?;
        self.runtime.restart(&self.container).await?;
        info!(container = %self.container, "load balancer reloaded");
        Ok(())
    }

    /// Current backend file contents.
    pub async fn read_backend(&self) -> ControllerResult<String> {
        Ok(tokio::fs::read_to_string(&self.backend_file).await?)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "backend".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use cloudscale_provider::{ProviderError, ProviderResult};

    #[derive(Default)]
    struct CountingRuntime {
        restarts: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl ContainerRuntime for CountingRuntime {
        async fn restart(&self, container: &str) -> ProviderResult<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::NotFound(format!("container {container}")));
            }
            Ok(())
        }
    }

    #[test]
    fn record_format() {
        let record = BackendRecord::new("10.0.0.5", 5000);
        assert_eq!(record.to_file_contents(), "server 10.0.0.5:5000;\n");
    }

    #[tokio::test]
    async fn update_overwrites_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nginx").join("backend_servers.conf");
        let runtime = Arc::new(CountingRuntime::default());
        let lb = LoadBalancer::new(&path, "nginx-lb", runtime.clone());

        lb.update_backend(&BackendRecord::new("10.0.0.5", 5000)).await.unwrap();
        lb.update_backend(&BackendRecord::new("34.1.2.3", 8080)).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "server 34.1.2.3:8080;\n"
        );
        assert_eq!(runtime.restarts.load(Ordering::SeqCst), 2);
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn restart_failure_is_reported_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend_servers.conf");
        let runtime = Arc::new(CountingRuntime { fail: true, ..Default::default() });
        let lb = LoadBalancer::new(&path, "nginx-lb", runtime);

        let result = lb.update_backend(&BackendRecord::new("10.0.0.5", 5000)).await;

        assert!(result.is_err());
        assert_eq!(lb.read_backend().await.unwrap(), "server 10.0.0.5:5000;\n");
    }
}
