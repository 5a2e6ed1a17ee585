use std::{process::ExitCode, sync::Arc};

use cashcore::{
    config::{CoreConfig, Properties},
    events::EventBus,
    funds::{FundsError, FundsMovement},
    replay::{ReplayError, Replayer},
    storage::BlockStore,
};
use csv::{ReaderBuilder, Trim};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// The size of the channel feeding rows to the replayer.
const CHANNEL_SIZE: usize = 100;

/// Optional TOML file with configuration properties.
const CONFIG_ENV: &str = "CASHCORE_CONFIG";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cashcore=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = std::env::args().collect::<Vec<_>>();
    if !(2..=3).contains(&args.len()) {
        eprintln!("Usage: {} <movements.csv> [state-file]", args[0]);
        return ExitCode::from(1);
    }

    match run(&args[1], args.get(2).map(String::as_str)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "replay failed");
            ExitCode::from(2)
        }
    }
}

fn open_store(state_file: Option<&str>) -> Result<BlockStore, FundsError> {
    Ok(match state_file {
        Some(path) => BlockStore::open(path)?,
        None => BlockStore::in_memory(),
    })
}

fn load_config() -> Result<CoreConfig, FundsError> {
    let properties = match std::env::var(CONFIG_ENV) {
        Ok(path) => Properties::load(path)?,
        Err(_) => Properties::new(),
    };
    Ok(CoreConfig::from_properties(&properties)?)
}

async fn run(input_file: &str, state_file: Option<&str>) -> Result<(), ReplayError> {
    let config = load_config()?;
    let store = open_store(state_file)?;
    let funds = FundsMovement::start(&store, &config, Arc::new(EventBus::new()))?;
    if let Some(outstanding) = funds.coordinator().last_outstanding() {
        tracing::warn!(?outstanding, "transaction was outstanding at last shutdown");
    }

    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_path(input_file)?;

    let (sender, receiver) = mpsc::channel(CHANNEL_SIZE);
    let mut replayer = Replayer::new(funds, receiver);
    let handle = tokio::spawn(async move {
        replayer.run().await;
        replayer
    });

    for row in reader.deserialize() {
        match row {
            Ok(row) => {
                if let Err(err) = sender.send(row).await {
                    tracing::error!(error = %err, "replayer stopped early");
                    break;
                }
            }
            Err(err) => tracing::warn!(error = %err, "skipping unreadable row"),
        }
    }

    drop(sender);
    let replayer = handle.await?;

    let summary = replayer.summary();
    tracing::info!(
        completed = summary.completed,
        declined = summary.declined,
        failed = summary.failed,
        "replay finished"
    );

    let mut writer = csv::Writer::from_writer(std::io::stdout());
    for balance in replayer.balances() {
        writer.serialize(balance)?;
    }
    writer.flush().map_err(csv::Error::from)?;
    drop(writer);

    let mut writer = csv::Writer::from_writer(std::io::stdout());
    for meter in replayer.funds().meters().snapshot() {
        writer.serialize(meter)?;
    }
    writer.flush().map_err(csv::Error::from)?;
    Ok(())
}
