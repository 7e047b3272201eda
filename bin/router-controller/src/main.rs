use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use router_core::{ChangeNotifier, Generator, GeneratorConfig, ReferenceReconciler};
use router_kube::KubeStore;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod ingress_rule_controller;
mod router_instance_controller;
mod template_source_watcher;

use ingress_rule_controller::IngressRuleController;
use router_instance_controller::RouterInstanceController;
use template_source_watcher::TemplateSourceWatcher;

#[derive(Parser, Debug)]
#[command(
    name = "router-controller",
    version,
    about = "Generates SIP router configuration from RouterInstance and IngressRule resources"
)]
struct Cli {
    /// Quiet period before a burst of changes is reconciled, in milliseconds
    #[arg(long, env = "ROUTER_DEBOUNCE_MS", default_value_t = 5000, global = true)]
    debounce_ms: u64,

    /// Attempts of one generator pass before it is abandoned
    #[arg(long, env = "ROUTER_MAX_ATTEMPTS", default_value_t = 5, global = true)]
    max_attempts: u32,

    /// Delay before a resource that failed to reconcile is retried, in seconds
    #[arg(long, env = "ROUTER_REQUEUE_SECS", default_value_t = 60, global = true)]
    requeue_secs: u64,

    /// Container image of the SIP router run by each RouterInstance
    #[arg(long, env = "ROUTER_IMAGE", default_value = "kamailio/kamailio:5.7", global = true)]
    router_image: String,

    #[arg(long, env = "ROUTER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Watch resources and keep generated configuration up to date (default)
    Run,
    /// Run one generator pass and exit
    Generate,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

impl Cli {
    fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            max_attempts: self.max_attempts,
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let store = Arc::new(
        KubeStore::connect()
            .await
            .context("unable to connect to Kubernetes")?,
    );
    let generator = Arc::new(Generator::new(store.clone(), cli.generator_config()));

    match cli.command.unwrap_or(Command::Run) {
        Command::Generate => {
            info!("Running a single generator pass");
            let report = generator.reconcile().await?;
            info!(
                instances = report.instances,
                routing_data_written = report.routing_data_written.len(),
                configs_written = report.configs_written.len(),
                "Generation complete"
            );
            Ok(())
        }
        Command::Run => {
            let requeue = Duration::from_secs(cli.requeue_secs);
            run(store, generator, cli.router_image, requeue).await
        }
    }
}

async fn run(
    store: Arc<KubeStore>,
    generator: Arc<Generator<KubeStore>>,
    router_image: String,
    requeue: Duration,
) -> Result<()> {
    info!("Starting router-controller...");

    let notifier: Arc<dyn ChangeNotifier> = generator.clone();
    let client = store.client();
    let references = Arc::new(ReferenceReconciler::new(store.clone(), notifier.clone()));

    let ingress_rules = IngressRuleController::new(client.clone(), references, requeue);
    tokio::spawn(async move {
        if let Err(e) = ingress_rules.run().await {
            error!("IngressRule controller error: {}", e);
        }
    });

    let router_instances =
        RouterInstanceController::new(store, notifier.clone(), router_image, requeue);
    tokio::spawn(async move {
        if let Err(e) = router_instances.run().await {
            error!("RouterInstance controller error: {}", e);
        }
    });

    let templates = TemplateSourceWatcher::new(client, notifier.clone());
    tokio::spawn(async move {
        if let Err(e) = templates.run().await {
            error!("Template source watcher error: {}", e);
        }
    });

    // Start from a full pass so artifacts deleted while stopped come back.
    notifier.notify_changed();

    generator
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Unable to listen for shutdown signal: {}", e);
            }
        })
        .await;
    info!("Shutdown signal received, exiting...");

    Ok(())
}
