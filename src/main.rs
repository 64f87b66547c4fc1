use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kcp_sim::broker::{Broker, InstanceFilter};
use kcp_sim::clock::{Clock, SystemClock};
use kcp_sim::config::SimConfig;
use kcp_sim::controller::{
    self, ApplyCrdInstaller, ClusterResolver, ControllerState, CredentialController,
    CredentialIssuer, DefaultShootBuilder, GardenCredentialIssuer, KubeconfigClusterResolver,
    ModuleSyncLoopFactory, RuntimeOrchestrator, SimulatedClusterResolver,
    SimulatedCredentialIssuer, TenantManagerRegistry, TenantSupervisor,
};
use kcp_sim::store::{KubeStore, Store};
use kcp_sim::telemetry;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control-plane controllers
    Run(RunArgs),
    /// List simulated instances
    Info(InfoArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Simulator configuration file (YAML)
    #[arg(long, env = "KCP_SIM_CONFIG")]
    config: Option<PathBuf>,

    /// Kubeconfig of the Garden cluster; defaults to the KCP cluster
    #[arg(long, env = "GARDEN_KUBECONFIG")]
    garden_kubeconfig: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Fabricate kubeconfigs and serve tenant clusters from memory
    #[arg(long, env = "SIMULATED_CREDENTIALS")]
    simulated_credentials: bool,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Simulator configuration file (YAML)
    #[arg(long, env = "KCP_SIM_CONFIG")]
    config: Option<PathBuf>,

    /// Only instances with this alias
    #[arg(long)]
    alias: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("kcp-sim v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_simulator(run_args).await,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Arc<SimConfig>> {
    let config = SimConfig::load(path)?;
    config.validate()?;
    Ok(Arc::new(config))
}

async fn run_info(args: InfoArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let client = Client::try_default()
        .await
        .context("connecting to the KCP cluster")?;
    let broker = Broker::new(Store::new(Arc::new(KubeStore::new(client))), config);

    let filter = InstanceFilter {
        alias: args.alias,
        ..Default::default()
    };
    let instances = broker.list_instances(&filter).await?;
    println!("Instances: {}", instances.len());
    for instance in instances {
        println!("{instance}");
    }
    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = if json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    // Only enable OTEL if an endpoint is provided
    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let otel_layer = telemetry::init_telemetry(&registry)?;
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
    Ok(())
}

async fn client_from_kubeconfig(path: &Path) -> anyhow::Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("reading kubeconfig {}", path.display()))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .with_context(|| format!("loading kubeconfig {}", path.display()))?;
    Ok(Client::try_from(config)?)
}

async fn run_simulator(args: RunArgs) -> anyhow::Result<()> {
    init_tracing(args.log_json)?;
    let config = load_config(args.config.as_deref())?;

    info!("Starting kcp-sim v{}", env!("CARGO_PKG_VERSION"));

    let kcp_client = Client::try_default()
        .await
        .context("connecting to the KCP cluster")?;
    let garden_client = match &args.garden_kubeconfig {
        Some(path) => client_from_kubeconfig(path).await?,
        None => kcp_client.clone(),
    };
    info!("Connected to KCP and Garden clusters");

    let kcp = Store::new(Arc::new(KubeStore::new(kcp_client.clone())));
    let garden = Store::new(Arc::new(KubeStore::new(garden_client.clone())));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (issuer, resolver): (Arc<dyn CredentialIssuer>, Arc<dyn ClusterResolver>) =
        if args.simulated_credentials {
            info!("Using simulated credentials and in-memory tenant clusters");
            (
                Arc::new(SimulatedCredentialIssuer::new()),
                Arc::new(SimulatedClusterResolver::new(
                    kcp.clone(),
                    config.clone(),
                    clock.clone(),
                )),
            )
        } else {
            (
                Arc::new(GardenCredentialIssuer::new(
                    garden_client,
                    &config.garden_namespace,
                )),
                Arc::new(KubeconfigClusterResolver::new(
                    kcp.clone(),
                    config.clone(),
                    clock.clone(),
                )),
            )
        };

    let state = Arc::new(ControllerState {
        client: kcp_client,
        config: config.clone(),
        runtimes: RuntimeOrchestrator::new(
            kcp.clone(),
            garden,
            Arc::new(DefaultShootBuilder::new(config.clone())),
            clock.clone(),
            config.clone(),
        ),
        credentials: CredentialController::new(
            kcp.clone(),
            issuer,
            clock.clone(),
            config.clone(),
        ),
        tenants: TenantSupervisor::new(
            kcp.clone(),
            resolver,
            Arc::new(ApplyCrdInstaller),
            Arc::new(ModuleSyncLoopFactory::new(kcp, config.clone(), clock.clone())),
            Arc::new(TenantManagerRegistry::new()),
            clock,
            config,
        ),
    });

    let result = controller::run_controllers(state).await;
    telemetry::shutdown_telemetry();
    result?;
    info!("kcp-sim stopped");
    Ok(())
}
