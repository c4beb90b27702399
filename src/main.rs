use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use tokio::sync::broadcast;
use tokio::{runtime, signal};
use tracing::{info, warn};

use relaymq::{
    setup_tracing, spawn_synthetic_feeder, AppResult, BoundedDispatcher, ChannelSource,
    DeadLetterQueue, HttpDownstream, OffsetTracker, Pipeline, RelayConfig, RetryPolicy,
    GLOBAL_CONFIG,
};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    let _tracing_guard = setup_tracing();

    // setup config
    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let relay_config = RelayConfig::set_up_config(config_path)?;
    if let Some(Command::PrintConfig) = commandline.command {
        println!("{relay_config:#?}");
        return Ok(());
    }
    GLOBAL_CONFIG
        .set(relay_config)
        .expect("set relay config failed");

    rt.block_on(run_pipeline())
}

async fn run_pipeline() -> AppResult<()> {
    let config = relaymq::global_config();

    let (source, records_tx) = ChannelSource::new(config.source.channel_capacity);
    let committed = source.committed();
    // stand-in for the broker; a real deployment plugs its own RecordSource
    // in at this seam
    spawn_synthetic_feeder(records_tx, config.source.synthetic.clone());

    let client = HttpDownstream::new(
        config.downstream.endpoint.clone(),
        Duration::from_millis(config.downstream.timeout_ms),
    )?;

    let tracker = Arc::new(OffsetTracker::new());
    let (dead_letters, dead_letter_rx) = DeadLetterQueue::bounded(config.dispatcher.dead_letter_capacity);
    let (notify_shutdown, _) = broadcast::channel(1);
    let dispatcher = Arc::new(BoundedDispatcher::new(
        &config.dispatcher,
        client,
        RetryPolicy::new(&config.retry),
        tracker.clone(),
        dead_letters,
        notify_shutdown.clone(),
    ));
    let (pipeline, handle) = Pipeline::new(
        config.pipeline.clone(),
        source,
        dispatcher,
        tracker,
        notify_shutdown,
    );

    // dead-letter consumer: this deployment just reports them
    tokio::spawn(async move {
        while let Ok(letter) = dead_letter_rx.recv().await {
            warn!(
                "dead letter: record {} ({} attempts): {}",
                letter.record, letter.attempts, letter.reason
            );
        }
    });

    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("ctrl-c received, draining pipeline");
        handle.shutdown().await;
    });

    info!(
        "relaying topic {} (group {}, brokers {}) to {}",
        config.source.topic,
        config.source.group_id,
        config.source.bootstrap_servers,
        config.downstream.endpoint
    );
    let result = pipeline.run().await;

    for entry in committed.iter() {
        info!(
            "final committed offset for partition {}: {}",
            entry.key(),
            entry.value()
        );
    }
    result
}
