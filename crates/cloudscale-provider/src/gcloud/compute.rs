//! `ComputeClient` over `gcloud compute`.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::client::ComputeClient;
use crate::error::{ProviderError, ProviderResult};
use crate::exec;
use crate::types::{
    FirewallRule, Instance, InstanceRef, InstanceSpec, Operation, OperationScope, OperationStatus,
};

/// Compute client that shells out to `gcloud compute`.
#[derive(Debug, Clone)]
pub struct GcloudCompute {
    program: String,
}

impl Default for GcloudCompute {
    fn default() -> Self {
        Self::new()
    }
}

impl GcloudCompute {
    pub fn new() -> Self {
        Self {
            program: super::DEFAULT_PROGRAM.to_string(),
        }
    }

    /// Use a specific gcloud binary instead of the one on `$PATH`.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ComputeClient for GcloudCompute {
    async fn get_instance(&self, instance: &InstanceRef) -> ProviderResult<Instance> {
        let what = format!("instance {}", instance.name);
        let stdout = exec::run_checked(&self.program, &describe_instance_args(instance), &what).await?;
        Ok(serde_json::from_str(&stdout)?)
    }

    async fn insert_instance(&self, spec: &InstanceSpec) -> ProviderResult<Operation> {
        let what = format!("instance {}", spec.instance.name);
        let stdout = exec::run_checked(&self.program, &create_instance_args(spec), &what).await?;
        let op = parse_operation(
            &stdout,
            &spec.instance.project,
            OperationScope::Zone(spec.instance.zone.clone()),
        )?;
        info!(operation = %op.name, instance = %spec.instance.name, "instance creation requested");
        Ok(op)
    }

    async fn delete_instance(&self, instance: &InstanceRef) -> ProviderResult<Operation> {
        let what = format!("instance {}", instance.name);
        let stdout = exec::run_checked(&self.program, &delete_instance_args(instance), &what).await?;
        let op = parse_operation(
            &stdout,
            &instance.project,
            OperationScope::Zone(instance.zone.clone()),
        )?;
        info!(operation = %op.name, instance = %instance.name, "instance deletion requested");
        Ok(op)
    }

    async fn get_operation(&self, operation: &Operation) -> ProviderResult<Operation> {
        let what = format!("operation {}", operation.name);
        let stdout =
            exec::run_checked(&self.program, &describe_operation_args(operation), &what).await?;
        let op = parse_operation(&stdout, &operation.project, operation.scope.clone())?;
        debug!(operation = %op.name, status = ?op.status, "operation polled");
        Ok(op)
    }

    async fn firewall_rule_exists(&self, project: &str, name: &str) -> ProviderResult<bool> {
        let what = format!("firewall rule {name}");
        match exec::run_checked(&self.program, &describe_firewall_args(project, name), &what).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn insert_firewall_rule(&self, rule: &FirewallRule) -> ProviderResult<Operation> {
        let what = format!("firewall rule {}", rule.name);
        exec::run_checked(&self.program, &create_firewall_args(rule), &what).await?;
        info!(rule = %rule.name, port = rule.port, "firewall rule created");
        Ok(Operation::done(&rule.name, &rule.project, OperationScope::Global))
    }
}

// ── Argument construction ──────────────────────────────────────

fn describe_instance_args(instance: &InstanceRef) -> Vec<String> {
    vec![
        "compute".into(),
        "instances".into(),
        "describe".into(),
        instance.name.clone(),
        format!("--project={}", instance.project),
        format!("--zone={}", instance.zone),
        "--format=json".into(),
    ]
}

fn create_instance_args(spec: &InstanceSpec) -> Vec<String> {
    let i = &spec.instance;
    let mut args = vec![
        "compute".into(),
        "instances".into(),
        "create".into(),
        i.name.clone(),
        format!("--project={}", i.project),
        format!("--zone={}", i.zone),
        format!("--machine-type={}", spec.machine_type),
        format!("--image-family={}", spec.image_family),
        format!("--image-project={}", spec.image_project),
        format!("--network={}", spec.network),
        format!("--subnet={}", spec.subnet),
    ];
    if !spec.tags.is_empty() {
        args.push(format!("--tags={}", spec.tags.join(",")));
    }
    args.extend([
        format!("--boot-disk-size={}GB", spec.boot_disk_size_gb),
        format!("--boot-disk-type={}", spec.boot_disk_type),
        "--async".into(),
        "--format=json".into(),
    ]);
    args
}

fn delete_instance_args(instance: &InstanceRef) -> Vec<String> {
    vec![
        "compute".into(),
        "instances".into(),
        "delete".into(),
        instance.name.clone(),
        format!("--project={}", instance.project),
        format!("--zone={}", instance.zone),
        "--quiet".into(),
        "--async".into(),
        "--format=json".into(),
    ]
}

fn describe_operation_args(operation: &Operation) -> Vec<String> {
    let scope = match &operation.scope {
        OperationScope::Zone(zone) => format!("--zone={zone}"),
        OperationScope::Global => "--global".to_string(),
    };
    vec![
        "compute".into(),
        "operations".into(),
        "describe".into(),
        operation.name.clone(),
        format!("--project={}", operation.project),
        scope,
        "--format=json".into(),
    ]
}

fn describe_firewall_args(project: &str, name: &str) -> Vec<String> {
    vec![
        "compute".into(),
        "firewall-rules".into(),
        "describe".into(),
        name.to_string(),
        format!("--project={project}"),
        "--format=json".into(),
    ]
}

fn create_firewall_args(rule: &FirewallRule) -> Vec<String> {
    let mut args = vec![
        "compute".into(),
        "firewall-rules".into(),
        "create".into(),
        rule.name.clone(),
        format!("--project={}", rule.project),
        "--direction=INGRESS".into(),
        format!("--priority={}", rule.priority),
        format!("--network={}", rule.network),
        "--action=ALLOW".into(),
        format!("--rules=tcp:{}", rule.port),
        format!("--source-ranges={}", rule.source_ranges.join(",")),
    ];
    if !rule.target_tags.is_empty() {
        args.push(format!("--target-tags={}", rule.target_tags.join(",")));
    }
    args.push("--format=json".into());
    args
}

// ── Response parsing ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OperationWire {
    name: String,
    #[serde(default)]
    status: Option<OperationStatus>,
    /// Full zone URL for zonal operations, absent for global ones.
    #[serde(default)]
    zone: Option<String>,
    #[serde(default)]
    error: Option<OperationErrorWire>,
}

#[derive(Debug, Deserialize)]
struct OperationErrorWire {
    #[serde(default)]
    errors: Vec<OperationErrorItem>,
}

#[derive(Debug, Deserialize)]
struct OperationErrorItem {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Parse an operation resource. `--async` prints a one-element list;
/// `operations describe` prints a bare object.
fn parse_operation(stdout: &str, project: &str, fallback: OperationScope) -> ProviderResult<Operation> {
    let value: serde_json::Value = serde_json::from_str(stdout)?;
    let value = match value {
        serde_json::Value::Array(mut items) => {
            if items.is_empty() {
                return Err(ProviderError::UnexpectedResponse(
                    "empty operation list".to_string(),
                ));
            }
            items.swap_remove(0)
        }
        other => other,
    };
    let wire: OperationWire = serde_json::from_value(value)?;

    let scope = wire
        .zone
        .as_deref()
        .and_then(|z| z.rsplit('/').next())
        .filter(|z| !z.is_empty())
        .map(|z| OperationScope::Zone(z.to_string()))
        .unwrap_or(fallback);

    let error = wire.error.map(|e| {
        let messages: Vec<String> = e
            .errors
            .into_iter()
            .filter_map(|item| item.message.or(item.code))
            .collect();
        if messages.is_empty() {
            "operation reported an error".to_string()
        } else {
            messages.join("; ")
        }
    });

    Ok(Operation {
        name: wire.name,
        project: project.to_string(),
        scope,
        status: wire.status.unwrap_or(OperationStatus::Unknown),
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> InstanceSpec {
        InstanceSpec {
            instance: InstanceRef::new("demo", "us-central1-a", "overflow-vm"),
            machine_type: "e2-medium".into(),
            image_family: "debian-12".into(),
            image_project: "debian-cloud".into(),
            network: "default".into(),
            subnet: "default".into(),
            tags: vec!["http-server".into(), "https-server".into()],
            boot_disk_size_gb: 10,
            boot_disk_type: "pd-standard".into(),
        }
    }

    #[test]
    fn create_args_carry_creation_inputs() {
        let args = create_instance_args(&spec());

        assert_eq!(&args[..4], ["compute", "instances", "create", "overflow-vm"]);
        for expected in [
            "--project=demo",
            "--zone=us-central1-a",
            "--machine-type=e2-medium",
            "--image-family=debian-12",
            "--image-project=debian-cloud",
            "--network=default",
            "--subnet=default",
            "--tags=http-server,https-server",
            "--boot-disk-size=10GB",
            "--boot-disk-type=pd-standard",
            "--async",
            "--format=json",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {expected}");
        }
    }

    #[test]
    fn create_args_skip_empty_tags() {
        let mut s = spec();
        s.tags.clear();
        let args = create_instance_args(&s);
        assert!(!args.iter().any(|a| a.starts_with("--tags")));
    }

    #[test]
    fn delete_args_are_non_interactive() {
        let args = delete_instance_args(&spec().instance);
        assert!(args.contains(&"--quiet".to_string()));
        assert!(args.contains(&"--async".to_string()));
    }

    #[test]
    fn operation_args_follow_scope() {
        let mut op = Operation::done("op-1", "demo", OperationScope::Zone("us-central1-a".into()));
        assert!(describe_operation_args(&op).contains(&"--zone=us-central1-a".to_string()));

        op.scope = OperationScope::Global;
        assert!(describe_operation_args(&op).contains(&"--global".to_string()));
    }

    #[test]
    fn firewall_args_open_port() {
        let rule = FirewallRule {
            name: "allow-port-5000".into(),
            project: "demo".into(),
            network: "default".into(),
            port: 5000,
            priority: 1000,
            source_ranges: vec!["0.0.0.0/0".into()],
            target_tags: vec!["http-server".into(), "https-server".into()],
        };
        let args = create_firewall_args(&rule);
        for expected in [
            "--direction=INGRESS",
            "--priority=1000",
            "--action=ALLOW",
            "--rules=tcp:5000",
            "--source-ranges=0.0.0.0/0",
            "--target-tags=http-server,https-server",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {expected}");
        }
    }

    #[test]
    fn parse_async_operation_list() {
        let stdout = r#"[{
            "name": "operation-1700000000000-abc",
            "status": "RUNNING",
            "zone": "https://www.googleapis.com/compute/v1/projects/demo/zones/us-central1-a"
        }]"#;
        let op = parse_operation(stdout, "demo", OperationScope::Global).unwrap();

        assert_eq!(op.name, "operation-1700000000000-abc");
        assert_eq!(op.status, OperationStatus::Running);
        assert_eq!(op.scope, OperationScope::Zone("us-central1-a".into()));
        assert!(op.error.is_none());
    }

    #[test]
    fn parse_failed_operation() {
        let stdout = r#"{
            "name": "operation-2",
            "status": "DONE",
            "error": {"errors": [{"code": "QUOTA_EXCEEDED", "message": "Quota 'CPUS' exceeded"}]}
        }"#;
        let op = parse_operation(stdout, "demo", OperationScope::Zone("z".into())).unwrap();

        assert!(op.is_done());
        assert_eq!(op.scope, OperationScope::Zone("z".into()));
        assert_eq!(op.error.as_deref(), Some("Quota 'CPUS' exceeded"));
    }

    #[test]
    fn parse_empty_list_is_unexpected() {
        let err = parse_operation("[]", "demo", OperationScope::Global).unwrap_err();
        assert!(matches!(err, ProviderError::UnexpectedResponse(_)));
    }
}
