use std::{
    collections::BTreeMap, future::Future, path::PathBuf, pin::Pin, sync::Arc, time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    command::{CommandError, run_command},
    config::Config,
    topology::{ClusterState, NodeAddr, NodeRole, ProvisionOutput},
};

pub type ConfigureFuture = Pin<Box<dyn Future<Output = Result<(), ConfigureError>> + Send>>;
pub type VerifyFuture = Pin<Box<dyn Future<Output = Result<bool, ConfigureError>> + Send>>;

/// Pushes configuration to a provisioned fleet and checks the resulting cluster.
pub trait Configurator: Send + Sync {
    fn configure(&self, output: ProvisionOutput) -> ConfigureFuture;

    /// True iff the live cluster has exactly the expected members. With no
    /// master the local host counts as a member, and unreachable members are
    /// pruned before counting.
    fn verify(&self, target: ClusterState) -> VerifyFuture;

    fn name(&self) -> &'static str;
}

#[derive(Debug)]
pub enum ConfigureError {
    RosterWrite {
        path: PathBuf,
        source: std::io::Error,
    },
    RosterEncode(serde_yaml::Error),
    PillarEncode(serde_json::Error),
    Command {
        step: &'static str,
        source: CommandError,
    },
    Other(String),
}

impl std::fmt::Display for ConfigureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RosterWrite { path, source } => {
                write!(f, "write roster {}: {source}", path.display())
            }
            Self::RosterEncode(e) => write!(f, "encode roster: {e}"),
            Self::PillarEncode(e) => write!(f, "encode pillar: {e}"),
            Self::Command { step, source } => write!(f, "{step}: {source}"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ConfigureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::RosterWrite { source, .. } => Some(source),
            Self::RosterEncode(e) => Some(e),
            Self::PillarEncode(e) => Some(e),
            Self::Command { source, .. } => Some(source),
            Self::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub host: String,
    pub user: String,
}

pub fn render_roster(output: &ProvisionOutput, ssh_user: &str) -> Result<String, ConfigureError> {
    let roster = output
        .hosts()
        .map(|(name, _role, addr)| {
            (
                name,
                RosterEntry {
                    host: addr.public.clone(),
                    user: ssh_user.to_string(),
                },
            )
        })
        .collect::<BTreeMap<_, _>>();
    serde_yaml::to_string(&roster).map_err(ConfigureError::RosterEncode)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pillar {
    pub master_privatenetwork: Vec<NodeAddr>,
    pub servant_privatenetwork: Vec<NodeAddr>,
}

impl Pillar {
    pub fn from_output(output: &ProvisionOutput) -> Self {
        Self {
            master_privatenetwork: output.masters.clone(),
            servant_privatenetwork: output.servants.clone(),
        }
    }
}

/// One line of `docker node ls --format '{{json .}}'`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SwarmNode {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Hostname", default)]
    pub hostname: String,
    #[serde(rename = "Status", default)]
    pub status: String,
}

impl SwarmNode {
    pub fn is_down(&self) -> bool {
        self.status.eq_ignore_ascii_case("down")
    }
}

/// Parses node listing output, ignoring anything that is not a JSON node line
/// (salt-ssh prefixes its output with the target name).
pub fn parse_swarm_nodes(stdout: &str) -> Vec<SwarmNode> {
    stdout
        .lines()
        .map(|line| line.trim().trim_matches('\''))
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<SwarmNode>(line).ok())
        .collect()
}

pub fn expected_members(target: ClusterState) -> u64 {
    if target.local_is_primary() {
        u64::from(target.servant_count) + 1
    } else {
        target.total_count()
    }
}

const SHARE_MOUNT: &str = "/cloud-manager-share";
const SECRETS_MOUNT: &str = "/var/run/secrets";
const NODE_LS_FORMAT: &str = "{{json .}}";

#[derive(Debug, Clone)]
pub struct SaltOptions {
    pub docker_bin: String,
    pub image: String,
    pub share_volume: String,
    pub secrets_path: String,
    pub roster_path: PathBuf,
    pub ssh_user: String,
    pub timeout: Duration,
}

impl SaltOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            docker_bin: config.docker_bin.clone(),
            image: config.salt_image.clone(),
            share_volume: config.share_volume.clone(),
            secrets_path: config.secrets_path.clone(),
            roster_path: config.roster_path.clone(),
            ssh_user: config.ssh_user.clone(),
            timeout: Duration::from_secs(config.tool_timeout_secs),
        }
    }

    /// `docker run` arguments for one salt-ssh invocation inside the tool image.
    pub fn salt_ssh_args(&self, salt_args: &[String]) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:{SHARE_MOUNT}:rw", self.share_volume),
            "-v".to_string(),
            format!("{}:{SECRETS_MOUNT}:rw", self.secrets_path),
            self.image.clone(),
            "salt-ssh".to_string(),
            "-i".to_string(),
        ];
        args.extend(salt_args.iter().cloned());
        args
    }
}

/// Configures nodes with salt-ssh and inspects the docker swarm they form.
#[derive(Debug, Clone)]
pub struct SaltConfigurator {
    opts: Arc<SaltOptions>,
}

impl SaltConfigurator {
    pub fn new(opts: SaltOptions) -> Self {
        Self {
            opts: Arc::new(opts),
        }
    }
}

impl Configurator for SaltConfigurator {
    fn configure(&self, output: ProvisionOutput) -> ConfigureFuture {
        let opts = self.opts.clone();
        Box::pin(async move { salt_apply(&opts, &output).await })
    }

    fn verify(&self, target: ClusterState) -> VerifyFuture {
        let opts = self.opts.clone();
        Box::pin(async move {
            let members = if target.local_is_primary() {
                local_swarm_members(&opts).await?
            } else {
                remote_swarm_members(&opts).await?
            };
            let expected = expected_members(target);
            if members != expected {
                warn!(members, expected, %target, "swarm size mismatch");
            }
            Ok(members == expected)
        })
    }

    fn name(&self) -> &'static str {
        "salt"
    }
}

async fn salt_apply(opts: &SaltOptions, output: &ProvisionOutput) -> Result<(), ConfigureError> {
    let roster = render_roster(output, &opts.ssh_user)?;
    if let Some(parent) = opts.roster_path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ConfigureError::RosterWrite {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    tokio::fs::write(&opts.roster_path, roster)
        .await
        .map_err(|source| ConfigureError::RosterWrite {
            path: opts.roster_path.clone(),
            source,
        })?;

    let pillar =
        serde_json::to_string(&Pillar::from_output(output)).map_err(ConfigureError::PillarEncode)?;
    let args = opts.salt_ssh_args(&[
        "*".to_string(),
        "state.apply".to_string(),
        format!("pillar={pillar}"),
    ]);

    info!(
        masters = output.masters.len(),
        servants = output.servants.len(),
        "applying salt states"
    );
    run_command(&opts.docker_bin, &args, opts.timeout)
        .await
        .map_err(|source| ConfigureError::Command {
            step: "salt-ssh state.apply",
            source,
        })?;
    Ok(())
}

async fn local_swarm_members(opts: &SaltOptions) -> Result<u64, ConfigureError> {
    let ls = [
        "node".to_string(),
        "ls".to_string(),
        "--format".to_string(),
        NODE_LS_FORMAT.to_string(),
    ];
    let stdout = run_command(&opts.docker_bin, &ls, opts.timeout)
        .await
        .map_err(|source| ConfigureError::Command {
            step: "docker node ls",
            source,
        })?;
    let nodes = parse_swarm_nodes(&stdout);

    let (down, alive): (Vec<_>, Vec<_>) = nodes.into_iter().partition(SwarmNode::is_down);
    if !down.is_empty() {
        let ids = down.iter().map(|n| n.id.clone()).collect::<Vec<_>>();
        info!(?ids, "removing down swarm nodes");
        let mut rm = vec!["node".to_string(), "rm".to_string()];
        rm.extend(ids);
        run_command(&opts.docker_bin, &rm, opts.timeout)
            .await
            .map_err(|source| ConfigureError::Command {
                step: "docker node rm",
                source,
            })?;
    }

    Ok(alive.len() as u64)
}

async fn remote_swarm_members(opts: &SaltOptions) -> Result<u64, ConfigureError> {
    let args = opts.salt_ssh_args(&[
        NodeRole::Master.host_name(0),
        "cmd.run".to_string(),
        format!("docker node ls --format '{NODE_LS_FORMAT}'"),
    ]);
    let stdout = run_command(&opts.docker_bin, &args, opts.timeout)
        .await
        .map_err(|source| ConfigureError::Command {
            step: "salt-ssh docker node ls",
            source,
        })?;
    Ok(parse_swarm_nodes(&stdout).len() as u64)
}
