use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use serde_json::Value;
use tracing::info;

use crate::{
    command::{CommandError, run_command},
    config::Config,
    topology::ClusterState,
};

pub type ProvisionFuture = Pin<Box<dyn Future<Output = Result<Value, ProvisionError>> + Send>>;

/// Brings infrastructure to a target size and reports the resulting addresses.
///
/// Implementations must be safe to call repeatedly with the same target.
/// The returned JSON is parsed by the reconciler into a `ProvisionOutput`.
pub trait Provisioner: Send + Sync {
    fn provision(&self, target: ClusterState) -> ProvisionFuture;
    fn name(&self) -> &'static str;
}

#[derive(Debug)]
pub enum ProvisionError {
    ImageMissing { image: String, source: CommandError },
    Step { step: &'static str, source: CommandError },
    InvalidJson(serde_json::Error),
    Other(String),
}

impl std::fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ImageMissing { image, source } => {
                write!(f, "terraform image {image} unavailable: {source}")
            }
            Self::Step { step, source } => write!(f, "terraform {step} failed: {source}"),
            Self::InvalidJson(e) => write!(f, "terraform output is not json: {e}"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ProvisionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ImageMissing { source, .. } | Self::Step { source, .. } => Some(source),
            Self::InvalidJson(e) => Some(e),
            Self::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TerraformOptions {
    pub docker_bin: String,
    pub image: String,
    pub workspace_volume: String,
    pub secrets_path: String,
    pub master_plan: String,
    pub servant_plan: String,
    pub timeout: Duration,
}

impl TerraformOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            docker_bin: config.docker_bin.clone(),
            image: config.terraform_image.clone(),
            workspace_volume: config.terraform_workspace_volume.clone(),
            secrets_path: config.secrets_path.clone(),
            master_plan: config.master_plan.clone(),
            servant_plan: config.servant_plan.clone(),
            timeout: Duration::from_secs(config.tool_timeout_secs),
        }
    }

    fn environment(&self, target: ClusterState) -> [(&'static str, String); 4] {
        [
            ("TF_VAR_MASTER_COUNT", target.master_count.to_string()),
            ("TF_VAR_MASTER_PLAN", self.master_plan.clone()),
            ("TF_VAR_SERVANT_COUNT", target.servant_count.to_string()),
            ("TF_VAR_SERVANT_PLAN", self.servant_plan.clone()),
        ]
    }

    /// `docker run` arguments for one terraform invocation inside the tool image.
    pub fn run_args(&self, target: ClusterState, terraform_args: &[&str]) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        for (name, value) in self.environment(target) {
            args.push("-e".to_string());
            args.push(format!("{name}={value}"));
        }
        args.push("-v".to_string());
        args.push(format!("{}:/app:rw", self.workspace_volume));
        args.push("-v".to_string());
        args.push(format!("{}:/var/run/secrets:rw", self.secrets_path));
        args.push(self.image.clone());
        args.push("terraform".to_string());
        args.extend(terraform_args.iter().map(|s| s.to_string()));
        args
    }
}

/// Runs terraform in its container image through the docker CLI.
#[derive(Debug, Clone)]
pub struct TerraformProvisioner {
    opts: Arc<TerraformOptions>,
}

impl TerraformProvisioner {
    pub fn new(opts: TerraformOptions) -> Self {
        Self {
            opts: Arc::new(opts),
        }
    }
}

impl Provisioner for TerraformProvisioner {
    fn provision(&self, target: ClusterState) -> ProvisionFuture {
        let opts = self.opts.clone();
        Box::pin(async move { terraform_scale(&opts, target).await })
    }

    fn name(&self) -> &'static str {
        "terraform"
    }
}

async fn terraform_scale(
    opts: &TerraformOptions,
    target: ClusterState,
) -> Result<Value, ProvisionError> {
    let inspect = [
        "image".to_string(),
        "inspect".to_string(),
        "--format".to_string(),
        "{{.Id}}".to_string(),
        opts.image.clone(),
    ];
    run_command(&opts.docker_bin, &inspect, opts.timeout)
        .await
        .map_err(|source| ProvisionError::ImageMissing {
            image: opts.image.clone(),
            source,
        })?;

    for (step, tf_args) in [
        ("init", &["init", "-input=false"][..]),
        ("apply", &["apply", "-auto-approve", "-input=false"][..]),
    ] {
        info!(step, %target, "running terraform");
        run_command(&opts.docker_bin, &opts.run_args(target, tf_args), opts.timeout)
            .await
            .map_err(|source| ProvisionError::Step { step, source })?;
    }

    let stdout = run_command(
        &opts.docker_bin,
        &opts.run_args(target, &["output", "-json"]),
        opts.timeout,
    )
    .await
    .map_err(|source| ProvisionError::Step {
        step: "output",
        source,
    })?;

    serde_json::from_str(&stdout).map_err(ProvisionError::InvalidJson)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn opts(docker_bin: &str) -> TerraformOptions {
        TerraformOptions {
            docker_bin: docker_bin.to_string(),
            image: "cloud-manager-terraform".to_string(),
            workspace_volume: "tf-workspace".to_string(),
            secrets_path: "/srv/secrets".to_string(),
            master_plan: "starter".to_string(),
            servant_plan: "large".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn run_args_carry_counts_plans_and_volumes() {
        let args = opts("docker").run_args(ClusterState::new(1, 2), &["apply", "-auto-approve"]);
        assert_eq!(
            args,
            vec![
                "run",
                "--rm",
                "-e",
                "TF_VAR_MASTER_COUNT=1",
                "-e",
                "TF_VAR_MASTER_PLAN=starter",
                "-e",
                "TF_VAR_SERVANT_COUNT=2",
                "-e",
                "TF_VAR_SERVANT_PLAN=large",
                "-v",
                "tf-workspace:/app:rw",
                "-v",
                "/srv/secrets:/var/run/secrets:rw",
                "cloud-manager-terraform",
                "terraform",
                "apply",
                "-auto-approve",
            ]
        );
    }

    #[tokio::test]
    async fn missing_image_fails_before_any_terraform_step() {
        let tmp = tempfile::tempdir().unwrap();
        let fake_docker = tmp.path().join("docker");
        std::fs::write(&fake_docker, "#!/bin/sh\nexit 1\n").unwrap();
        make_executable(&fake_docker);

        let provisioner = TerraformProvisioner::new(opts(fake_docker.to_str().unwrap()));
        let err = provisioner
            .provision(ClusterState::new(0, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ImageMissing { .. }));
    }

    #[tokio::test]
    async fn returns_parsed_output_json() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("calls.log");
        let fake_docker = tmp.path().join("docker");
        let script = format!(
            "#!/bin/sh\necho \"$@\" >> {log}\ncase \"$*\" in\n  *output*) echo '{{\"servant_ip_addresses\":{{\"value\":[]}}}}' ;;\nesac\n",
            log = log.display()
        );
        std::fs::write(&fake_docker, script).unwrap();
        make_executable(&fake_docker);

        let provisioner = TerraformProvisioner::new(opts(fake_docker.to_str().unwrap()));
        let out = provisioner
            .provision(ClusterState::new(0, 0))
            .await
            .unwrap();
        assert_eq!(out["servant_ip_addresses"]["value"], serde_json::json!([]));

        let calls = std::fs::read_to_string(&log).unwrap();
        let steps = calls
            .lines()
            .map(|l| l.split_whitespace().skip_while(|w| *w != "terraform").nth(1))
            .collect::<Vec<_>>();
        assert_eq!(steps, vec![None, Some("init"), Some("apply"), Some("output")]);
    }

    fn make_executable(path: &std::path::Path) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}
