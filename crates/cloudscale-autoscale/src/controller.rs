//! Autoscale controller for one overflow instance driven by local load.
//!
//! Each tick samples load, asks the provider whether the managed instance
//! exists, and provisions, decommissions, or reports accordingly. Every
//! external failure is logged and the loop keeps going.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use cloudscale_config::ControllerConfig;
use cloudscale_provider::{
    ComputeClient, ContainerRuntime, FirewallRule, InstanceRef, InstanceSpec, Operation,
    OperationStatus, RemoteExecutor,
};

use crate::backend::{BackendRecord, LoadBalancer};
use crate::deploy::{self, READY_PROBE};
use crate::error::{ControllerError, ControllerResult};
use crate::load::{LoadSample, LoadSampler};

/// Returned in place of an address when the instance has none.
pub const NO_EXTERNAL_IP: &str = "No external IP found.";

/// External collaborators the controller is wired with.
pub struct ControllerDeps {
    pub compute: Arc<dyn ComputeClient>,
    pub remote: Arc<dyn RemoteExecutor>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub sampler: Arc<dyn LoadSampler>,
}

/// What the controller believes about the managed instance. The provider
/// stays authoritative; this only tracks transition edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NoInstance,
    /// A create outlived its wait and the instance has not appeared yet.
    Provisioning,
    InstanceRunning,
    /// A delete has been issued and the instance has not disappeared yet.
    Decommissioning,
}

/// Result of a single control loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Instance provisioned and deployed.
    ScaledUp { address: String },
    /// Instance deleted.
    ScaledDown,
    /// Overloaded, instance already serving at `address`.
    Steady { address: String },
    /// Load normal, no instance.
    Idle,
    /// A scaling action was due but its cooldown has not elapsed.
    CoolingDown,
    /// A create is in flight; not issuing another.
    AwaitingCreation,
    /// A delete is in flight; not issuing another.
    AwaitingDeletion,
    /// A step failed; details were logged.
    Failed,
}

/// Why a delete was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteReason {
    ScaleDown,
    /// Removal of an instance left over from a previous run. Does not start
    /// the scale-up cooldown.
    Cleanup,
}

#[derive(Debug, Clone)]
struct PendingDelete {
    op: Operation,
    reason: DeleteReason,
}

pub struct Controller {
    config: ControllerConfig,
    instance: InstanceRef,
    compute: Arc<dyn ComputeClient>,
    remote: Arc<dyn RemoteExecutor>,
    sampler: Arc<dyn LoadSampler>,
    load_balancer: LoadBalancer,
    phase: Phase,
    /// Create operation that outlived `operation_timeout`.
    pending_create: Option<Operation>,
    /// Delete operation issued on the current scale-down transition.
    pending_delete: Option<PendingDelete>,
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
    consecutive_failures: u32,
    tick_failed: bool,
}

impl Controller {
    pub fn new(config: ControllerConfig, deps: ControllerDeps) -> Self {
        let instance = InstanceRef::new(
            &config.target.project,
            &config.target.zone,
            &config.target.instance,
        );
        let load_balancer = LoadBalancer::from_config(&config.load_balancer, deps.runtime);
        Self {
            config,
            instance,
            compute: deps.compute,
            remote: deps.remote,
            sampler: deps.sampler,
            load_balancer,
            phase: Phase::NoInstance,
            pending_create: None,
            pending_delete: None,
            last_scale_up: None,
            last_scale_down: None,
            consecutive_failures: 0,
            tick_failed: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn instance(&self) -> &InstanceRef {
        &self.instance
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.load_balancer
    }

    /// Number of consecutive ticks in which at least one step failed.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    // ── Observation ────────────────────────────────────────────

    /// Take one utilization sample.
    pub async fn sample_load(&self) -> ControllerResult<LoadSample> {
        let sample = self.sampler.sample().await?;
        info!(
            cpu_percent = sample.cpu_percent,
            mem_percent = sample.mem_percent,
            threshold = self.config.policy.threshold,
            "load sampled"
        );
        Ok(sample)
    }

    /// Whether the provider reports the managed instance. Any lookup
    /// failure counts as absent.
    pub async fn instance_exists(&self) -> bool {
        match self.compute.get_instance(&self.instance).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                warn!(
                    instance = %self.instance,
                    error = %e,
                    "instance lookup failed, treating as absent"
                );
                false
            }
        }
    }

    /// External address of the managed instance, or [`NO_EXTERNAL_IP`].
    pub async fn external_address(&self) -> String {
        match self.compute.get_instance(&self.instance).await {
            Ok(instance) => match instance.external_address() {
                Some(addr) => addr.to_string(),
                None => {
                    warn!(instance = %self.instance, "instance has no external address");
                    NO_EXTERNAL_IP.to_string()
                }
            },
            Err(e) => {
                warn!(instance = %self.instance, error = %e, "address lookup failed");
                NO_EXTERNAL_IP.to_string()
            }
        }
    }

    // ── Actions ────────────────────────────────────────────────

    /// Create the managed instance and wait for the create operation.
    ///
    /// A create that outlives `operation_timeout` leaves the controller in
    /// [`Phase::Provisioning`]; the scale-up is completed on the tick that
    /// first observes the instance.
    pub async fn provision(&mut self) -> ControllerResult<()> {
        info!(
            instance = %self.instance,
            machine_type = %self.config.target.machine_type,
            image = %self.config.target.source_image(),
            "creating instance"
        );
        let op = self.compute.insert_instance(&self.instance_spec()).await?;
        self.phase = Phase::Provisioning;
        self.pending_create = Some(op.clone());

        match self.wait_for_operation(op).await {
            Ok(_) => {
                info!(instance = %self.instance, "instance created");
                self.phase = Phase::InstanceRunning;
                self.pending_create = None;
                Ok(())
            }
            Err(e @ ControllerError::OperationFailed { .. }) => {
                self.phase = Phase::NoInstance;
                self.pending_create = None;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Make sure the ingress rule for the app port exists. Failures are
    /// logged and not retried.
    pub async fn open_ingress(&self) {
        let rule = self.firewall_rule();
        match self.compute.firewall_rule_exists(&rule.project, &rule.name).await {
            Ok(true) => debug!(rule = %rule.name, "firewall rule already present"),
            Ok(false) => match self.compute.insert_firewall_rule(&rule).await {
                Ok(op) => {
                    if let Err(e) = self.wait_for_operation(op).await {
                        error!(rule = %rule.name, error = %e, "firewall rule creation failed");
                    } else {
                        info!(rule = %rule.name, port = rule.port, "firewall rule created");
                    }
                }
                Err(e) => error!(rule = %rule.name, error = %e, "firewall rule creation failed"),
            },
            Err(e) => warn!(rule = %rule.name, error = %e, "firewall rule check failed"),
        }
    }

    /// Poll the instance with a no-op remote command until it answers or
    /// `ready_timeout` passes. Returns whether it became reachable.
    pub async fn wait_until_reachable(&self) -> bool {
        let deadline = self.config.policy.ready_timeout;
        let interval = self.config.policy.ready_poll_interval;

        let probe = async {
            loop {
                match self.remote.run_script(&self.instance, READY_PROBE).await {
                    Ok(out) if out.success() => return,
                    Ok(out) => debug!(code = ?out.code, "instance not reachable yet"),
                    Err(e) => debug!(error = %e, "reachability probe failed"),
                }
                tokio::time::sleep(interval).await;
            }
        };

        match tokio::time::timeout(deadline, probe).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    instance = %self.instance,
                    waited = ?deadline,
                    "instance not reachable, deploying anyway"
                );
                false
            }
        }
    }

    /// Run the deploy script on the managed instance.
    pub async fn deploy(&self, address: &str) -> ControllerResult<()> {
        info!(
            instance = %self.instance,
            %address,
            image = %self.config.app.image_ref(),
            "deploying application"
        );
        let script = deploy::deploy_script(&self.config.app);
        let output = self.remote.run_script(&self.instance, &script).await?;
        if !output.success() {
            return Err(ControllerError::RemoteScriptFailed {
                code: output.code,
                stderr: tail(&output.stderr, 20),
            });
        }
        info!(instance = %self.instance, "application deployed");
        Ok(())
    }

    /// Point the load balancer at `address:port`.
    pub async fn update_backend(&self, address: &str, port: u16) -> ControllerResult<()> {
        self.load_balancer
            .update_backend(&BackendRecord::new(address, port))
            .await
    }

    /// Delete the managed instance and wait for the delete operation.
    ///
    /// Once the delete has been issued the controller stays in
    /// [`Phase::Decommissioning`] until the instance is gone, so a slow
    /// delete is never issued twice.
    pub async fn decommission(&mut self) -> ControllerResult<()> {
        self.delete_instance(DeleteReason::ScaleDown).await
    }

    async fn delete_instance(&mut self, reason: DeleteReason) -> ControllerResult<()> {
        info!(instance = %self.instance, ?reason, "deleting instance");
        let op = self.compute.delete_instance(&self.instance).await?;
        self.phase = Phase::Decommissioning;
        self.pending_delete = Some(PendingDelete {
            op: op.clone(),
            reason,
        });

        match self.wait_for_operation(op).await {
            Ok(_) => {
                self.finish_decommission().await;
                Ok(())
            }
            Err(e @ ControllerError::OperationFailed { .. }) => {
                self.phase = Phase::InstanceRunning;
                self.pending_delete = None;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// The instance is gone: reset the phase, start the scale-up cooldown
    /// for scale-downs, and restore the fallback backend.
    async fn finish_decommission(&mut self) {
        let reason = self
            .pending_delete
            .take()
            .map_or(DeleteReason::ScaleDown, |p| p.reason);
        info!(instance = %self.instance, ?reason, "instance deleted");
        self.phase = Phase::NoInstance;
        if reason == DeleteReason::ScaleDown {
            self.last_scale_down = Some(Instant::now());
        }
        self.restore_fallback_backend().await;
    }

    /// Poll `op` until it is done, fails, or `operation_timeout` passes.
    pub async fn wait_for_operation(&self, op: Operation) -> ControllerResult<Operation> {
        let timeout = self.config.policy.operation_timeout;
        let interval = self.config.policy.operation_poll_interval;
        let name = op.name.clone();

        let poll = async {
            let mut current = op;
            loop {
                if current.is_done() {
                    return match current.error.take() {
                        Some(message) => Err(ControllerError::OperationFailed {
                            name: current.name.clone(),
                            message,
                        }),
                        None => Ok(current),
                    };
                }
                tokio::time::sleep(interval).await;
                match self.compute.get_operation(&current).await {
                    Ok(next) => current = next,
                    Err(e) => warn!(operation = %current.name, error = %e, "operation poll failed"),
                }
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(ControllerError::OperationTimeout {
                name,
                waited: timeout,
            }),
        }
    }

    /// Delete a managed instance left over from a previous run.
    pub async fn cleanup_on_start(&mut self) {
        if !self.config.policy.cleanup_on_start || !self.instance_exists().await {
            return;
        }
        info!(instance = %self.instance, "deleting pre-existing instance");
        if let Err(e) = self.delete_instance(DeleteReason::Cleanup).await {
            error!(instance = %self.instance, error = %e, "startup cleanup failed");
        }
    }

    // ── Loop ───────────────────────────────────────────────────

    /// Run one iteration of the control loop.
    pub async fn tick(&mut self) -> TickOutcome {
        self.tick_failed = false;
        let outcome = self.step().await;
        if !self.tick_failed {
            self.consecutive_failures = 0;
        }
        outcome
    }

    async fn step(&mut self) -> TickOutcome {
        let sample = match self.sample_load().await {
            Ok(s) => s,
            Err(e) => {
                self.record_failure("sample", &e);
                return TickOutcome::Failed;
            }
        };
        let overloaded = sample.is_overloaded(self.config.policy.threshold);
        let exists = self.instance_exists().await;
        self.observe(exists);

        match self.phase {
            Phase::Provisioning if exists => {
                info!(instance = %self.instance, "slow create finished, completing scale-up");
                return self.complete_scale_up().await;
            }
            Phase::Provisioning => return self.check_pending_create().await,
            Phase::Decommissioning if exists => {
                self.check_pending_delete().await;
                return TickOutcome::AwaitingDeletion;
            }
            Phase::Decommissioning => self.finish_decommission().await,
            Phase::NoInstance | Phase::InstanceRunning => {}
        }

        match (overloaded, exists) {
            (true, false) => self.scale_up().await,
            (false, true) => self.scale_down().await,
            (true, true) => {
                let address = self.external_address().await;
                info!(
                    %address,
                    url = %format!("http://{address}:{}", self.config.app.port),
                    "load high, managed instance already serving"
                );
                TickOutcome::Steady { address }
            }
            (false, false) => {
                debug!("load normal, no managed instance");
                TickOutcome::Idle
            }
        }
    }

    /// Reconcile the tracked phase with what the provider reports. Phases
    /// with an operation in flight are settled in `step`.
    fn observe(&mut self, exists: bool) {
        match (self.phase, exists) {
            (Phase::NoInstance, true) => self.phase = Phase::InstanceRunning,
            (Phase::InstanceRunning, false) => self.phase = Phase::NoInstance,
            _ => {}
        }
    }

    /// Re-read a create that outlived its wait. A create that finished with
    /// an error re-arms the scale-up transition.
    async fn check_pending_create(&mut self) -> TickOutcome {
        let Some(op) = self.pending_create.clone() else {
            self.phase = Phase::NoInstance;
            return TickOutcome::Idle;
        };
        match self.compute.get_operation(&op).await {
            Ok(Operation {
                name,
                status: OperationStatus::Done,
                error: Some(message),
                ..
            }) => {
                self.phase = Phase::NoInstance;
                self.pending_create = None;
                let err = ControllerError::OperationFailed { name, message };
                self.record_failure("provision", &err);
                TickOutcome::Failed
            }
            Ok(op) => {
                debug!(operation = %op.name, status = ?op.status, "creation still in progress");
                self.pending_create = Some(op);
                TickOutcome::AwaitingCreation
            }
            Err(e) => {
                warn!(error = %e, "creation poll failed");
                TickOutcome::AwaitingCreation
            }
        }
    }

    /// Re-read a delete that outlived its wait. A delete that finished with
    /// an error re-arms the scale-down transition.
    async fn check_pending_delete(&mut self) {
        let Some(pending) = self.pending_delete.clone() else {
            return;
        };
        match self.compute.get_operation(&pending.op).await {
            Ok(op) if op.is_done() && op.error.is_some() => {
                warn!(
                    operation = %op.name,
                    error = op.error.as_deref().unwrap_or_default(),
                    "instance deletion failed"
                );
                self.phase = Phase::InstanceRunning;
                self.pending_delete = None;
            }
            Ok(op) => {
                debug!(operation = %op.name, status = ?op.status, "deletion still in progress");
                self.pending_delete = Some(PendingDelete { op, ..pending });
            }
            Err(e) => warn!(error = %e, "deletion poll failed"),
        }
    }

    async fn scale_up(&mut self) -> TickOutcome {
        if let Some(at) = self.last_scale_down
            && at.elapsed() < self.config.policy.scale_up_cooldown
        {
            debug!(
                since = ?at.elapsed(),
                cooldown = ?self.config.policy.scale_up_cooldown,
                "scale-up suppressed by cooldown"
            );
            return TickOutcome::CoolingDown;
        }

        info!(instance = %self.instance, "load above threshold, scaling up");
        if let Err(e) = self.provision().await {
            self.record_failure("provision", &e);
            return TickOutcome::Failed;
        }
        self.complete_scale_up().await
    }

    /// Expose, deploy to, and route traffic to a freshly created instance.
    async fn complete_scale_up(&mut self) -> TickOutcome {
        self.phase = Phase::InstanceRunning;
        self.pending_create = None;
        self.last_scale_up = Some(Instant::now());

        let address = self.external_address().await;
        self.open_ingress().await;
        self.wait_until_reachable().await;

        if let Err(e) = self.deploy(&address).await {
            self.record_failure("deploy", &e);
        }

        let port = self.config.app.port;
        if address == NO_EXTERNAL_IP {
            warn!("no external address, leaving load balancer backend unchanged");
        } else if let Err(e) = self.update_backend(&address, port).await {
            self.record_failure("update backend", &e);
        }

        info!(
            url = %format!("http://{address}:{port}"),
            "application running on managed instance"
        );
        TickOutcome::ScaledUp { address }
    }

    async fn scale_down(&mut self) -> TickOutcome {
        if let Some(at) = self.last_scale_up
            && at.elapsed() < self.config.policy.scale_down_cooldown
        {
            debug!(
                since = ?at.elapsed(),
                cooldown = ?self.config.policy.scale_down_cooldown,
                "scale-down suppressed by cooldown"
            );
            return TickOutcome::CoolingDown;
        }

        info!(instance = %self.instance, "load below threshold, scaling down");
        match self.decommission().await {
            Ok(()) => TickOutcome::ScaledDown,
            Err(e) => {
                self.record_failure("decommission", &e);
                TickOutcome::Failed
            }
        }
    }

    async fn restore_fallback_backend(&self) {
        let Some(fallback) = &self.config.load_balancer.fallback_backend else {
            return;
        };
        if let Err(e) = self.update_backend(&fallback.address, fallback.port).await {
            error!(error = %e, "failed to restore fallback backend");
        }
    }

    /// Run the control loop until `shutdown` fires.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.policy.poll_interval;
        info!(
            instance = %self.instance,
            threshold = self.config.policy.threshold,
            interval = ?interval,
            "controller started"
        );

        self.cleanup_on_start().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let outcome = self.tick().await;
            debug!(?outcome, "tick complete");

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("controller shutting down");
    }

    // ── Helpers ────────────────────────────────────────────────

    fn record_failure(&mut self, step: &str, err: &ControllerError) {
        if !self.tick_failed {
            self.tick_failed = true;
            self.consecutive_failures += 1;
        }
        error!(
            step,
            error = %err,
            consecutive_failures = self.consecutive_failures,
            "controller step failed"
        );
    }

    fn instance_spec(&self) -> InstanceSpec {
        let t = &self.config.target;
        InstanceSpec {
            instance: self.instance.clone(),
            machine_type: t.machine_type.clone(),
            image_family: t.image_family.clone(),
            image_project: t.image_project.clone(),
            network: t.network.clone(),
            subnet: t.subnet.clone(),
            tags: t.tags.clone(),
            boot_disk_size_gb: t.boot_disk_size_gb,
            boot_disk_type: t.boot_disk_type.clone(),
        }
    }

    fn firewall_rule(&self) -> FirewallRule {
        FirewallRule {
            name: self.config.app.firewall_rule.clone(),
            project: self.config.target.project.clone(),
            network: self.config.target.network.clone(),
            port: self.config.app.port,
            priority: 1000,
            source_ranges: vec!["0.0.0.0/0".to_string()],
            target_tags: self.config.target.tags.clone(),
        }
    }
}

/// Last `lines` lines of `s`.
fn tail(s: &str, lines: usize) -> String {
    let all: Vec<&str> = s.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail("only", 5), "only");
        assert_eq!(tail("", 3), "");
    }
}
