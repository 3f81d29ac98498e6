//! Remote deployment script.
//!
//! The deploy is one shell script run over SSH: install the container
//! runtime, pull the application image, run it, list containers. Steps are
//! chained with `&&`, so the first failing step ends the script.

use cloudscale_config::AppConfig;

/// Remote command used to check that the instance accepts SSH sessions.
pub const READY_PROBE: &str = "true";

/// One step of the deploy script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployStep {
    /// Progress line echoed before the command runs.
    pub label: &'static str,
    pub command: String,
}

/// Ordered deploy steps for `app`.
pub fn deploy_steps(app: &AppConfig) -> Vec<DeployStep> {
    let image = shell_quote(&app.image_ref());
    let env_flags: String = app
        .env
        .iter()
        .map(|(k, v)| format!(" -e {}", shell_quote(&format!("{k}={v}"))))
        .collect();

    vec![
        DeployStep {
            label: "Updating the system...",
            command: "sudo apt-get update -y".to_string(),
        },
        DeployStep {
            label: "Installing Docker...",
            command: "sudo apt-get install -y docker.io".to_string(),
        },
        DeployStep {
            label: "Starting Docker...",
            command: "sudo systemctl start docker && sudo systemctl enable docker".to_string(),
        },
        DeployStep {
            label: "Pulling Docker image...",
            command: format!("sudo docker pull {image}"),
        },
        DeployStep {
            label: "Running Docker container...",
            command: format!(
                "sudo docker run -d -p {port}:{port}{env_flags} {image}",
                port = app.port
            ),
        },
        DeployStep {
            label: "Listing Docker containers...",
            command: "sudo docker ps".to_string(),
        },
    ]
}

/// Render steps into a single `&&`-chained script.
pub fn render_script(steps: &[DeployStep]) -> String {
    steps
        .iter()
        .map(|s| format!("echo {} && {}", shell_quote(s.label), s.command))
        .collect::<Vec<_>>()
        .join(" && ")
}

pub fn deploy_script(app: &AppConfig) -> String {
    render_script(&deploy_steps(app))
}

/// Quote `s` for a POSIX shell unless it is made only of safe characters.
fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
