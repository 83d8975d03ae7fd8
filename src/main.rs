//! trellis - sample operator reconciling ConfigBundle resources

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kube::runtime::watcher;
use kube::{Api, Client, CustomResourceExt};
use tracing::{error, info};

use trellis::config::OperatorConfig;
use trellis::controller::{Controller, KubeStore};
use trellis::crd::ConfigBundle;
use trellis::dependent::{DependentResourceManager, DependentResourceSpec, FIELD_MANAGER};
use trellis::event::{watch_primary, EventSourceContext};
use trellis::retry::{retry_with_backoff, RetryConfig};
use trellis::sample::{self, BundleReconciler};
use trellis::telemetry::{init_logging, LogFormat};

/// trellis - dependent-resource orchestration for Kubernetes controllers
#[derive(Parser, Debug)]
#[command(name = "trellis", version, about, long_about = None)]
struct Cli {
    /// Print the ConfigBundle CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Path to the controller configuration file
    #[arg(short = 'c', long = "config", env = "TRELLIS_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace to watch, overrides the configuration file
    #[arg(short = 'n', long, env = "TRELLIS_NAMESPACE")]
    namespace: Option<String>,

    /// Log output format
    #[arg(long, value_enum, env = "TRELLIS_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    /// Install or update the CRD on startup
    #[arg(long, env = "TRELLIS_INSTALL_CRD")]
    install_crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ConfigBundle::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_logging(cli.log_format)?;

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid controller configuration, refusing to start");
            std::process::exit(2);
        }
    };

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let version = retry_with_backoff(
        &RetryConfig::with_max_attempts(10),
        "apiserver_version",
        || async { client.apiserver_version().await },
    )
    .await
    .map_err(|e| anyhow::anyhow!("API server unreachable: {}", e))?;
    info!(version = %version.git_version, "connected to API server");

    if cli.install_crd {
        ensure_crd_installed(&client).await?;
    }

    run_controller(client, config).await
}

/// Read the configuration file, falling back to both sample dependents
fn load_config(cli: &Cli) -> trellis::Result<OperatorConfig> {
    let mut config = match &cli.config {
        Some(path) => OperatorConfig::from_file(path)?,
        None => OperatorConfig::default(),
    };
    if cli.namespace.is_some() {
        config.namespace = cli.namespace.clone();
    }
    if config.dependents.is_empty() {
        config.dependents = vec![
            DependentResourceSpec::new(sample::CONFIGMAP_KIND),
            DependentResourceSpec::new(sample::SERVICE_ACCOUNT_KIND),
        ];
    }
    Ok(config)
}

async fn run_controller(client: Client, config: OperatorConfig) -> anyhow::Result<()> {
    let esctx = EventSourceContext::new(client.clone(), config.name.clone())
        .with_namespace(config.namespace.clone());

    let (manager, mut sources) =
        match DependentResourceManager::initialize(&config.dependents, &sample::registry(), &esctx)
        {
            Ok(initialized) => initialized,
            Err(e) => {
                error!(error = %e, "failed to initialize dependent resources, refusing to start");
                std::process::exit(2);
            }
        };

    let bundles: Api<ConfigBundle> = esctx.api();
    sources.push(watch_primary(bundles, watcher::Config::default()));

    let controller = Controller::new(
        config.name.clone(),
        Arc::new(BundleReconciler),
        Arc::new(KubeStore::<ConfigBundle>::new(client)),
        manager,
    )
    .with_finalizer(config.finalizer_for::<ConfigBundle>())
    .with_conflict_attempts(config.conflict_attempts);

    tokio::select! {
        _ = controller.run(config.scheduler(), sources) => {
            info!("all event sources ended");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }
    Ok(())
}

/// Install or update the ConfigBundle CRD with server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    crds.patch(
        "configbundles.trellis.dev",
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&ConfigBundle::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install ConfigBundle CRD: {}", e))?;

    info!("ConfigBundle CRD installed/updated");
    Ok(())
}
