use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "cloudscale",
    about = "Keeps a docker swarm sized to the largest live scale request",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the scheduler and the HTTP API (default).
    Run,

    /// Run one convergence cycle for the given size and exit.
    Converge(ConvergeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ConvergeArgs {
    #[arg(
        long,
        value_name = "N",
        default_value_t = 0,
        value_parser = clap::value_parser!(u32).range(0..=1)
    )]
    pub master_count: u32,

    #[arg(long, value_name = "N", default_value_t = 0)]
    pub servant_count: u32,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "CLOUDSCALE_BIND",
        value_name = "ADDR",
        default_value = "0.0.0.0:5000"
    )]
    pub bind: SocketAddr,

    #[arg(
        long = "check-interval-secs",
        global = true,
        env = "CLOUDSCALE_CHECK_INTERVAL_SECS",
        value_name = "SECS",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(10..=86400)
    )]
    pub check_interval_secs: u64,

    #[arg(
        long = "request-ttl-hours",
        global = true,
        env = "CLOUDSCALE_REQUEST_TTL_HOURS",
        value_name = "HOURS",
        default_value_t = 24,
        value_parser = clap::value_parser!(u64).range(1..=168)
    )]
    pub request_ttl_hours: u64,

    #[arg(
        long = "docker-bin",
        global = true,
        env = "CLOUDSCALE_DOCKER_BIN",
        value_name = "PATH",
        default_value = "docker"
    )]
    pub docker_bin: String,

    #[arg(
        long = "terraform-image",
        global = true,
        env = "CLOUDSCALE_TERRAFORM_IMAGE",
        value_name = "IMAGE",
        default_value = "cloud-manager-terraform"
    )]
    pub terraform_image: String,

    #[arg(
        long = "terraform-workspace-volume",
        global = true,
        env = "CLOUDSCALE_TERRAFORM_WORKSPACE_VOLUME",
        value_name = "VOLUME",
        default_value = "tf-workspace"
    )]
    pub terraform_workspace_volume: String,

    #[arg(
        long = "master-plan",
        global = true,
        env = "TF_VAR_MASTER_PLAN",
        value_name = "PLAN",
        default_value = "starter"
    )]
    pub master_plan: String,

    #[arg(
        long = "servant-plan",
        global = true,
        env = "TF_VAR_SERVANT_PLAN",
        value_name = "PLAN",
        default_value = "starter"
    )]
    pub servant_plan: String,

    #[arg(
        long = "secrets-path",
        global = true,
        env = "CLOUDSCALE_SECRETS_PATH",
        value_name = "PATH",
        default_value = "./secrets"
    )]
    pub secrets_path: String,

    #[arg(
        long = "salt-image",
        global = true,
        env = "CLOUDSCALE_SALT_IMAGE",
        value_name = "IMAGE",
        default_value = "cloud-manager-salt"
    )]
    pub salt_image: String,

    #[arg(
        long = "share-volume",
        global = true,
        env = "CLOUDSCALE_SHARE_VOLUME",
        value_name = "VOLUME",
        default_value = "cloudmanager_cloud-manager-share"
    )]
    pub share_volume: String,

    #[arg(
        long = "roster-path",
        global = true,
        env = "CLOUDSCALE_ROSTER_PATH",
        value_name = "PATH",
        default_value = "/cloud-manager-share/roster"
    )]
    pub roster_path: PathBuf,

    #[arg(
        long = "ssh-user",
        global = true,
        env = "CLOUDSCALE_SSH_USER",
        value_name = "USER",
        default_value = "root"
    )]
    pub ssh_user: String,

    #[arg(
        long = "tool-timeout-secs",
        global = true,
        env = "CLOUDSCALE_TOOL_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 1800,
        value_parser = clap::value_parser!(u64).range(10..=7200)
    )]
    pub tool_timeout_secs: u64,
}

impl Config {
    pub fn check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.check_interval_secs)
    }

    pub fn request_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.request_ttl_hours as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_apply_when_flags_absent() {
        let cli = Cli::try_parse_from(["cloudscale"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config.bind, "0.0.0.0:5000".parse().unwrap());
        assert_eq!(cli.config.check_interval_secs, 300);
        assert_eq!(cli.config.request_ttl_hours, 24);
        assert_eq!(cli.config.request_ttl(), chrono::Duration::hours(24));
        assert_eq!(cli.config.terraform_image, "cloud-manager-terraform");
        assert_eq!(cli.config.terraform_workspace_volume, "tf-workspace");
        assert_eq!(cli.config.salt_image, "cloud-manager-salt");
        assert_eq!(
            cli.config.roster_path,
            PathBuf::from("/cloud-manager-share/roster")
        );
        assert_eq!(cli.config.tool_timeout_secs, 1800);
    }

    #[test]
    fn rejects_invalid_check_interval_secs() {
        let err = Cli::try_parse_from(["cloudscale", "--check-interval-secs", "1"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--check-interval-secs"));
        assert!(msg.contains("10..=86400"));
    }

    #[test]
    fn rejects_invalid_request_ttl_hours() {
        let err = Cli::try_parse_from(["cloudscale", "--request-ttl-hours", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--request-ttl-hours"));
        assert!(msg.contains("1..=168"));
    }

    #[test]
    fn converge_command_limits_master_count() {
        let cli = Cli::try_parse_from([
            "cloudscale",
            "converge",
            "--master-count",
            "1",
            "--servant-count",
            "3",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Converge(args)) => {
                assert_eq!(args.master_count, 1);
                assert_eq!(args.servant_count, 3);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let err = Cli::try_parse_from(["cloudscale", "converge", "--master-count", "2"])
            .unwrap_err();
        assert!(err.to_string().contains("--master-count"));
    }

    #[test]
    fn global_flags_are_accepted_after_subcommand() {
        let cli =
            Cli::try_parse_from(["cloudscale", "run", "--docker-bin", "/usr/bin/podman"]).unwrap();
        assert_eq!(cli.config.docker_bin, "/usr/bin/podman");
    }
}
