use anyhow::Result;
use std::sync::Arc;

use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use tokio::sync::Mutex;

use cloudscale::{
    clock::SystemClock,
    config::{Cli, Command, Config, ConvergeArgs},
    configure::{SaltConfigurator, SaltOptions},
    ledger::RequestLedger,
    provision::{TerraformOptions, TerraformProvisioner},
    reconcile::Reconciler,
    scheduler::{Scheduler, SubmitOutcome},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_server(cli.config).await,
        Command::Converge(args) => converge_once(cli.config, args).await,
    }
}

fn build_scheduler(config: &Config) -> Arc<Scheduler> {
    let ledger = RequestLedger::with_ttl(Arc::new(SystemClock), config.request_ttl());
    let provisioner = TerraformProvisioner::new(TerraformOptions::from_config(config));
    let configurator = SaltConfigurator::new(SaltOptions::from_config(config));
    let reconciler = Reconciler::new(
        Arc::new(Mutex::new(ledger)),
        Arc::new(provisioner),
        Arc::new(configurator),
    );
    Arc::new(Scheduler::new(Arc::new(reconciler), config.check_interval()))
}

async fn run_server(config: Config) -> Result<()> {
    let scheduler = build_scheduler(&config);
    scheduler.start();

    let app = cloudscale::http::build_router(scheduler.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!(
        bind = %config.bind,
        check_interval_secs = config.check_interval_secs,
        request_ttl_hours = config.request_ttl_hours,
        "starting cloudscale"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    // Stop the scheduler as soon as the signal fires so waiting `/scale` calls
    // answer before axum drains their connections.
    axum::serve(listener, app)
        .with_graceful_shutdown(scheduler.clone().stop_on(shutdown_signal()))
        .await?;

    scheduler.stop().await;
    Ok(())
}

async fn converge_once(config: Config, args: ConvergeArgs) -> Result<()> {
    let scheduler = build_scheduler(&config);
    let outcome = scheduler
        .submit(Some("cli".to_string()), args.master_count, args.servant_count)
        .await;
    scheduler.stop().await;

    match outcome? {
        SubmitOutcome::Satisfied { primary, .. } => {
            info!(
                master_count = args.master_count,
                servant_count = args.servant_count,
                master_ip = primary.address().unwrap_or("local"),
                "cluster converged"
            );
            Ok(())
        }
        SubmitOutcome::Pending { error, .. } => {
            error!(code = error.code(), %error, "convergence failed");
            Err(error.into())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
