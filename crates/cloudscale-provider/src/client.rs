//! Client traits for the controller's external collaborators.

use async_trait::async_trait;

use crate::error::ProviderResult;
use crate::types::{ExecOutput, FirewallRule, Instance, InstanceRef, InstanceSpec, Operation};

/// Instance, firewall, and operation lifecycle on the cloud provider.
#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// Fetch an instance. Returns [`ProviderError::NotFound`] when absent.
    ///
    /// [`ProviderError::NotFound`]: crate::ProviderError::NotFound
    async fn get_instance(&self, instance: &InstanceRef) -> ProviderResult<Instance>;

    /// Request instance creation. Returns without waiting for completion.
    async fn insert_instance(&self, spec: &InstanceSpec) -> ProviderResult<Operation>;

    /// Request instance deletion. Returns without waiting for completion.
    async fn delete_instance(&self, instance: &InstanceRef) -> ProviderResult<Operation>;

    /// Re-read the current state of an operation.
    async fn get_operation(&self, operation: &Operation) -> ProviderResult<Operation>;

    async fn firewall_rule_exists(&self, project: &str, name: &str) -> ProviderResult<bool>;

    async fn insert_firewall_rule(&self, rule: &FirewallRule) -> ProviderResult<Operation>;
}

/// Runs a shell script on a remote instance.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `script` on the instance. A non-zero exit is reported through
    /// [`ExecOutput::code`], not as an error.
    async fn run_script(&self, instance: &InstanceRef, script: &str) -> ProviderResult<ExecOutput>;
}

/// Local container runtime hosting the load balancer.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn restart(&self, container: &str) -> ProviderResult<()>;
}
