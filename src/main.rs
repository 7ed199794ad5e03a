use std::io::{stderr, stdout, BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer};

use ledger_settlement::config::LedgerConfig;
use ledger_settlement::pipeline::{read_records, AccountRecord, LedgerPipeline, TransferRecord};
use ledger_settlement::storage::LedgerStore;

/// Replays a set of transfers through the settlement pipeline and prints the
/// resulting account balances as CSV.
#[derive(Debug, Parser)]
#[command(name = "ledger-settlement", version)]
struct Cli {
    /// CSV of accounts to open: user_name,user_email,document,initial_balance
    accounts: PathBuf,

    /// CSV of transfers to request: sender,receiver,amount[,idempotency_key]
    transfers: PathBuf,

    /// Optional TOML file overriding the default tunables
    #[arg(long)]
    config: Option<PathBuf>,

    /// One of error, warn, info, debug, trace
    #[arg(long, default_value = "error")]
    log_level: String,

    /// How long to wait for the pipeline to drain, in seconds
    #[arg(long, default_value_t = 60)]
    settle_timeout: u64
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(parse_log_level(&cli.log_level));

    let config = LedgerConfig::load(cli.config.as_deref())?;
    let mut pipeline = LedgerPipeline::new(config);

    let accounts = read_records::<AccountRecord>(&cli.accounts)?;
    let opened = pipeline.open_accounts(accounts).await?;
    info!("Opened {} accounts", opened.len());

    let timer = Instant::now();
    pipeline.start().await?;

    let mut accepted = 0;

    for record in read_records::<TransferRecord>(&cli.transfers)? {
        let request = record.into_request();

        //NOTE: A rejected request is the caller's problem, the rest of the file still gets replayed
        match pipeline.enqueue(&request).await {
            Ok(()) => accepted += 1,
            Err(error) => warn!(idempotency_key = %request.idempotency_key, "Transfer rejected: {error}")
        }
    }

    info!("Accepted {accepted} transfers");

    let shutdown = pipeline.shutdown_signal();
    let settled = tokio::select! {
        settled = pipeline.wait_until_settled(Duration::from_secs(cli.settle_timeout)) => settled?,
        _ = shutdown.wait_for_os_signal() => false
    };

    if !pipeline.shutdown().await {
        warn!("Pipeline did not shut down cleanly");
    }

    if !settled {
        error!("Pipeline did not settle every transfer");
        bail!("pipeline did not settle within {} seconds", cli.settle_timeout)
    }

    info!("Settled transfers in: {:?}", timer.elapsed());

    write_results_to_stdout(&pipeline).await?;

    Ok(())
}

fn parse_log_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => {
            eprintln!("Invalid log level '{}', defaulting to 'error'", level);
            LevelFilter::ERROR
        }
    }
}

fn setup_logging(level: LevelFilter) {
    //NOTE: stdout carries the CSV report, so logs go to stderr
    let terminal_log = fmt::layer()
        .with_target(false)
        .with_writer(stderr)
        .with_filter(level);

    tracing_subscriber::registry()
        .with(terminal_log)
        .init();
}

async fn write_results_to_stdout(pipeline: &LedgerPipeline) -> Result<()> {
    let accounts = pipeline.database().list_accounts().await?;
    let mut output = BufWriter::new(stdout().lock());

    writeln!(output, "account,user,balance,status,version")?;

    for account in accounts {
        writeln!(
            output,
            "{},{},{},{},{}",
            account.id,
            account.user_id,
            account.balance(),
            account.status,
            account.version
        )?;
    }

    output.flush()?;

    Ok(())
}
