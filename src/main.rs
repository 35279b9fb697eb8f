mod billing;
mod config;
mod error;
mod models;
mod plugin;
mod service;

use billing::cost_explorer::{CostExplorerClient, DEFAULT_ENDPOINT};
use chrono::Utc;
use clap::Parser;
use config::{
    load_credentials, parse_endpoint, resolve_prefix, resolve_tempfile, CredentialFlags,
    PluginConfig, DEFAULT_PREFIX,
};
use error::AppError;
use models::MetricKind;
use plugin::{billing_graphs, meta_requested, MackerelPlugin};
use service::{BillingCollector, CollectorOptions};
use std::io::IsTerminal;
use std::process::ExitCode;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mackerel-plugin-aws-ce")]
#[command(about = "Mackerel plugin reporting AWS Cost Explorer month-to-date billing")]
struct Cli {
    /// Metric key prefix.
    #[arg(long, default_value = DEFAULT_PREFIX)]
    metric_key_prefix: String,

    #[arg(long, value_enum, default_value_t = MetricKind::UnblendedCost)]
    metrics: MetricKind,

    /// Report account IDs instead of account names.
    #[arg(long)]
    disable_name: bool,

    /// Also report a linear month-end forecast.
    #[arg(long)]
    enable_forecast: bool,

    #[arg(long)]
    access_key_id: Option<String>,

    #[arg(long)]
    secret_access_key: Option<String>,

    /// AWS profile for the default credential chain (defaults to $AWS_PROFILE).
    #[arg(long)]
    profile: Option<String>,

    /// Temp file name.
    #[arg(long)]
    tempfile: Option<String>,

    #[arg(long, env = "AWS_ENDPOINT_URL_CE", default_value = DEFAULT_ENDPOINT)]
    endpoint_url: String,

    #[arg(short, long)]
    verbose: bool,
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    // stdout belongs to the agent protocol.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .init();
}

fn resolve_config(
    cli: &Cli,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<PluginConfig, AppError> {
    let prefix = resolve_prefix(Some(&cli.metric_key_prefix));
    let tempfile = resolve_tempfile(cli.tempfile.as_deref(), &prefix, lookup);

    Ok(PluginConfig {
        prefix,
        metric: cli.metrics,
        resolve_names: !cli.disable_name,
        forecast: cli.enable_forecast,
        tempfile,
        endpoint: parse_endpoint(&cli.endpoint_url)?,
    })
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let cfg = resolve_config(&cli, env_lookup)?;
    let plugin = MackerelPlugin::new(cfg.prefix.clone(), billing_graphs(), cfg.tempfile.clone());
    let stdout = std::io::stdout();

    if meta_requested(env_lookup) {
        return plugin.print_definitions(&mut stdout.lock());
    }

    let credentials = load_credentials(&CredentialFlags {
        access_key_id: cli.access_key_id,
        secret_access_key: cli.secret_access_key,
        profile: cli.profile,
    })
    .await?;
    let api = CostExplorerClient::new(credentials, cfg.endpoint.clone())?;
    let collector = BillingCollector::new(
        api,
        CollectorOptions {
            metric: cfg.metric,
            resolve_names: cfg.resolve_names,
            forecast: cfg.forecast,
        },
    );

    let metrics = collector.fetch().await?;
    let now = Utc::now();
    let emitted = plugin.output_values(&mut stdout.lock(), &metrics, now)?;

    if let Err(err) = plugin.save_values(&emitted, now) {
        warn!(error = %err, path = %plugin.tempfile().display(), "could not persist plugin values");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "aws-ce plugin failed");
            ExitCode::FAILURE
        }
    }
}
