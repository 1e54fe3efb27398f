use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args as ClapArgs, Parser, Subcommand};
use cluster_provisioner::config::DeploymentConfig;
use cluster_provisioner::controller::{
    teardown, ClusterConnector, Deployment, KubeConnector, OutputFormat,
};
use cluster_provisioner::provider::{CloudProvider, HttpProvider, SimulatedProvider};
use cluster_provisioner::telemetry::{self, LogFormat};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision a cluster, authorize the execution identity and report the read
    Deploy(DeployArgs),
    /// Remove everything a deployment created
    Teardown(TargetArgs),
    /// Check a configuration file without contacting the provider
    Validate(ConfigArgs),
    /// Show version and build information
    Version,
}

#[derive(ClapArgs, Debug)]
struct ConfigArgs {
    /// Deployment configuration (.toml, .yaml or .yml)
    #[arg(short, long, env = "PROVISIONER_CONFIG")]
    config: PathBuf,

    /// Override the target account
    #[arg(long, env = "PROVISIONER_ACCOUNT")]
    account: Option<String>,

    /// Override the target region
    #[arg(long, env = "PROVISIONER_REGION")]
    region: Option<String>,
}

#[derive(ClapArgs, Debug)]
struct TargetArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Run against the in-process simulated provider
    #[arg(long, env = "PROVISIONER_SIMULATE")]
    simulate: bool,

    /// Bearer token for the control-plane gateway
    #[arg(long, env = "PROVISIONER_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[derive(ClapArgs, Debug)]
struct DeployArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Override the stack output format
    #[arg(long, value_enum)]
    output_format: Option<OutputFormat>,

    /// Write the deployment record as JSON to this path
    #[arg(long)]
    record: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("cluster-provisioner v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Validate(config_args) => {
            telemetry::init(args.log_format);
            let config = load_config(&config_args)?;
            println!("{} is valid", config_args.config.display());
            info!(cluster = %config.cluster.name, "Configuration valid");
            Ok(())
        }
        Commands::Deploy(deploy_args) => {
            telemetry::init(args.log_format);
            run_deploy(deploy_args).await
        }
        Commands::Teardown(target_args) => {
            telemetry::init(args.log_format);
            run_teardown(target_args).await
        }
    }
}

fn load_config(args: &ConfigArgs) -> anyhow::Result<DeploymentConfig> {
    let config = DeploymentConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?
        .with_overrides(args.account.clone(), args.region.clone());

    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("  {}: {}", e.field, e.message);
        }
        bail!(
            "{} has {} invalid field(s)",
            args.config.display(),
            errors.len()
        );
    }
    Ok(config)
}

/// Pick the provider and the in-cluster connector for this run
fn backends(
    args: &TargetArgs,
    config: &DeploymentConfig,
) -> anyhow::Result<(Arc<dyn CloudProvider>, Arc<dyn ClusterConnector>)> {
    if args.simulate {
        warn!("Using the simulated provider; nothing is created outside this process");
        let sim = SimulatedProvider::new().with_identity(&config.account, &config.region);
        let connector = sim.cluster_connector();
        return Ok((Arc::new(sim), Arc::new(connector)));
    }

    let endpoint = config.provider.endpoint.as_deref().context(
        "provider.endpoint must be set in the configuration unless --simulate is given",
    )?;
    let mut provider = HttpProvider::new(endpoint, config.provider_timeout())
        .context("failed to build the provider client")?;
    if let Some(token) = &args.token {
        provider = provider.with_auth_token(token);
    }
    Ok((Arc::new(provider), Arc::new(KubeConnector)))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            token.cancel();
        }
    });
    cancel
}

async fn run_deploy(args: DeployArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.target.config)?;
    if let Some(format) = args.output_format {
        config.output.format = format;
    }
    let (provider, connector) = backends(&args.target, &config)?;

    info!(
        cluster = %config.cluster.name,
        account = %config.account,
        region = %config.region,
        "Starting cluster-provisioner v{}",
        env!("CARGO_PKG_VERSION")
    );

    let cancel = cancel_on_ctrl_c();
    let mut deployment = Deployment::new(config, provider, connector, std::io::stdout())?;
    let outcome = deployment.run(&cancel).await;

    if let Some(path) = &args.record {
        let json = serde_json::to_string_pretty(deployment.record())?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write record to {}", path.display()))?;
    }

    outcome.context("deployment failed")?;
    Ok(())
}

async fn run_teardown(args: TargetArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let (provider, _) = backends(&args, &config)?;

    let summary = teardown(&config, provider)
        .await
        .context("teardown failed")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
