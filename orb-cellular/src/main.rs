use clap::Parser;
use color_eyre::eyre::{Result, WrapErr as _};
use orb_cellular::{
    activation::ActivationPolicy,
    capability::Technology,
    config::CellularConfig,
    modem::cli::ModemManagerCli,
    provider::ProviderDatabase,
    storage::FilePersistence,
    telemetry,
};
use std::{path::PathBuf, time::Duration};
use tokio::signal::unix::{self, SignalKind};
use tracing::{info, warn};

const SYSLOG_IDENTIFIER: &str = "worldcoin-cellulard";

/// Cellular modem control daemon.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[arg(long, env = "ORB_CELLULAR_TECHNOLOGY", value_enum, default_value_t = Technology::Universal3gpp)]
    technology: Technology,

    /// Seconds between two modem polls.
    #[arg(long, env = "ORB_CELLULAR_MODEM_POLL_INTERVAL", default_value_t = 10)]
    modem_poll_interval: u64,

    /// Seconds a lost registration is hidden for in case it comes back.
    #[arg(long, env = "ORB_CELLULAR_REGISTRATION_DEBOUNCE", default_value_t = 15)]
    registration_debounce: u64,

    #[arg(long, env = "ORB_CELLULAR_ACTIVATION_CONFIRM_TIMEOUT", default_value_t = 120)]
    activation_confirm_timeout: u64,

    #[arg(long, env = "ORB_CELLULAR_ACTIVATION_RETRY_DELAY", default_value_t = 5)]
    activation_retry_delay: u64,

    #[arg(long, env = "ORB_CELLULAR_MAX_ACTIVATION_RETRIES", default_value_t = 5)]
    max_activation_retries: u32,

    #[arg(long, env = "ORB_CELLULAR_MAX_ACTIVATION_TIMEOUTS", default_value_t = 2)]
    max_activation_timeouts: u32,

    #[arg(long, env = "ORB_CELLULAR_RPC_TIMEOUT", default_value_t = 30)]
    rpc_timeout: u64,

    #[arg(long, env = "ORB_CELLULAR_ENABLE_TIMEOUT", default_value_t = 45)]
    enable_timeout: u64,

    #[arg(long, env = "ORB_CELLULAR_STORAGE_DIR", default_value = "/usr/persistent/cellular")]
    storage_dir: PathBuf,

    /// JSON carrier database, keyed by MCC+MNC.
    #[arg(long, env = "ORB_CELLULAR_PROVIDER_DB")]
    provider_db: Option<PathBuf>,

    #[arg(long, env = "ORB_CELLULAR_ALLOW_ROAMING")]
    allow_roaming: bool,
}

impl From<&Args> for CellularConfig {
    fn from(args: &Args) -> Self {
        CellularConfig::builder()
            .technology(args.technology)
            .rpc_timeout(Duration::from_secs(args.rpc_timeout))
            .enable_timeout(Duration::from_secs(args.enable_timeout))
            .modem_poll_interval(Duration::from_secs(args.modem_poll_interval))
            .registration_debounce(Duration::from_secs(args.registration_debounce))
            .activation(
                ActivationPolicy::builder()
                    .confirm_timeout(Duration::from_secs(args.activation_confirm_timeout))
                    .retry_delay(Duration::from_secs(args.activation_retry_delay))
                    .max_retries(args.max_activation_retries)
                    .max_timeouts(args.max_activation_timeouts)
                    .build(),
            )
            .allow_roaming(args.allow_roaming)
            .build()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    telemetry::init(SYSLOG_IDENTIFIER)?;

    let args = Args::parse();

    let providers = match &args.provider_db {
        Some(path) => ProviderDatabase::load(path)
            .await
            .wrap_err("failed to load provider database")?,
        None => ProviderDatabase::empty(),
    };

    let tasks = orb_cellular::program()
        .config(CellularConfig::from(&args))
        .modem_manager(ModemManagerCli::new())
        .storage(FilePersistence::new(&args.storage_dir))
        .providers(providers)
        .run()
        .await?;

    let mut sigterm = unix::signal(SignalKind::terminate())?;
    let mut sigint = unix::signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => warn!("received SIGTERM"),
        _ = sigint.recv()  => warn!("received SIGINT"),
    }

    info!("aborting tasks and exiting gracefully");

    for handle in tasks {
        handle.abort();
    }

    Ok(())
}
