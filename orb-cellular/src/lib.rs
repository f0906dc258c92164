use crate::{
    cellular::Cellular, config::CellularConfig, modem::cli::ModemManagerCli,
    provider::ProviderDatabase, storage::Persistence,
};
use color_eyre::eyre::Result;
use std::time::Duration;
use tokio::{
    task::{self, JoinHandle},
    time,
};
use tracing::{error, info};

pub mod activation;
pub mod capability;
pub mod cellular;
pub mod chain;
pub mod config;
pub mod connection;
pub mod error;
pub mod modem;
pub mod provider;
pub mod registration;
pub mod storage;
pub mod telemetry;
pub mod timer;

mod utils;

pub use cellular::DeviceState;
pub use error::{CellularError, RpcError};

const START_RETRY_DELAY: Duration = Duration::from_secs(10);

#[bon::builder(finish_fn = run)]
pub async fn program(
    config: CellularConfig,
    modem_manager: ModemManagerCli,
    storage: impl Persistence,
    #[builder(default)] providers: ProviderDatabase,
) -> Result<Tasks> {
    info!(
        "cellulard starting for a {} modem with {} known providers",
        config.technology,
        providers.len()
    );

    let (monitor, signals) =
        modem::monitor::spawn(modem_manager.clone(), config.modem_poll_interval);

    let cellular = Cellular::builder()
        .config(config)
        .transport(modem_manager)
        .storage(storage)
        .providers(providers)
        .build()
        .await;

    let events = cellular.spawn(signals);

    let starter = task::spawn(async move {
        while let Err(e) = cellular.start_modem().await {
            error!("failed to enable modem: {e}. trying again in {START_RETRY_DELAY:?}");
            time::sleep(START_RETRY_DELAY).await;
        }

        Ok(())
    });

    Ok(vec![monitor, events, starter])
}

pub type Tasks = Vec<JoinHandle<Result<()>>>;
