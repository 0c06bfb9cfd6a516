//! Tablestore command-line harness
//!
//! Drives the decorated storage chain against the in-process transport so the
//! resilience behavior can be observed without a live service.
//!
//! # Examples
//!
//! ```bash
//! # Insert, read and query through logging, retry and reconnect
//! tablestore smoke --faults 2
//!
//! # Race 32 writers on one conditional create
//! tablestore contend --writers 32
//!
//! # Print the effective configuration
//! tablestore --config tablestore.toml show-config
//! ```

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tablestore::error::Error;
use tablestore::factory::TableStorageFactory;
use tablestore::transport::{MemoryTransport, TransportCall};
use tablestore::{EntityDescriptor, StorageConfig, TableEntity, TableStorage};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOCAL_CONNECTION: &str = "memory://local";

#[derive(Parser, Debug)]
#[command(name = "tablestore")]
#[command(version = tablestore::VERSION)]
#[command(about = "Resilient table storage client harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML, JSON or YAML)
    #[arg(long, global = true, env = "TABLESTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "TABLESTORE_LOG_DIR")]
    log_dir: PathBuf,

    /// Log filter (trace, debug, info, warn, error or a directive list)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Emit console logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Insert, read, merge, query and delete through the full chain
    Smoke(SmokeArgs),

    /// Race concurrent conditional creates on one row
    Contend(ContendArgs),

    /// Print the effective configuration
    ShowConfig,
}

#[derive(Args, Debug)]
struct SmokeArgs {
    /// Rows to insert
    #[arg(long, default_value = "25", value_parser = clap::value_parser!(u64).range(1..))]
    rows: u64,

    /// Transient faults injected ahead of the batch insert
    #[arg(long, default_value = "0")]
    faults: usize,

    /// Serve reads from the write-through cache
    #[arg(long)]
    cache: bool,
}

#[derive(Args, Debug)]
struct ContendArgs {
    /// Concurrent writers
    #[arg(long, default_value = "16")]
    writers: usize,

    /// Simulated round-trip latency in milliseconds
    #[arg(long, default_value = "5")]
    latency_ms: u64,
}

/// Demo entity used by the harness
#[derive(Debug, Clone, Default, PartialEq)]
struct Order {
    customer: String,
    number: String,
    amount: f64,
    status: String,
}

impl TableEntity for Order {
    fn describe(d: &mut EntityDescriptor<Self>) {
        d.partition_key("Customer", |o: &Self| &o.customer, |o: &mut Self, v| o.customer = v)
            .row_key("Number", |o: &Self| &o.number, |o: &mut Self, v| o.number = v)
            .property("Amount", |o: &Self| &o.amount, |o: &mut Self, v| o.amount = v)
            .property("Status", |o: &Self| &o.status, |o: &mut Self, v| o.status = v);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Smoke(args) => smoke_command(config, args).await,
        Commands::Contend(args) => contend_command(config, args).await,
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Console plus rolling file logging
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)
        .with_context(|| format!("creating log directory {}", cli.log_dir.display()))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "tablestore.log");

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(cli.json_logs.then(|| fmt::layer().json().with_writer(std::io::stdout)))
        .with((!cli.json_logs).then(|| fmt::layer().with_writer(std::io::stdout)))
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(filter)
        .init();

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<StorageConfig> {
    let mut config = StorageConfig::load(path).context("loading configuration")?;
    if config.connection_string.is_none() {
        config.connection_string = Some(LOCAL_CONNECTION.to_string());
    }
    Ok(config)
}

fn order(customer: &str, index: usize) -> Order {
    Order {
        customer: customer.to_string(),
        number: format!("{:06}", index),
        amount: 10.0 * index as f64,
        status: "open".to_string(),
    }
}

async fn smoke_command(config: StorageConfig, args: SmokeArgs) -> anyhow::Result<()> {
    let transport = MemoryTransport::new();
    let factory = TableStorageFactory::from_config(config)?;
    let storage: Arc<dyn TableStorage<Order>> = if args.cache {
        factory.create_with_cache(Arc::new(transport.clone())).await?
    } else {
        factory.create(Arc::new(transport.clone())).await?
    };
    info!(table = storage.name(), rows = args.rows, "Running smoke scenario");

    for _ in 0..args.faults {
        transport.inject(TransportCall::Batch, Error::Transient("injected fault".into()));
    }
    let orders: Vec<Order> = (0..args.rows as usize).map(|i| order("acme", i)).collect();
    storage.insert_batch(&orders).await?;

    let first = storage
        .get("acme", &order("acme", 0).number)
        .await?
        .context("first order missing after insert")?;
    if first != orders[0] {
        bail!("first order read back as {:?}", first);
    }

    let shipped = storage
        .merge(
            "acme",
            &first.number,
            &|mut o: Order| {
                o.status = "shipped".to_string();
                Some(o)
            },
        )
        .await?;
    info!(shipped = shipped.is_some(), "Merged first order");

    let partition = storage.get_partition("acme", None).await?;
    if partition.len() != orders.len() {
        bail!("expected {} orders, found {}", args.rows, partition.len());
    }

    let removed = storage.delete_if_exists("acme", &first.number).await?;
    let remaining = storage.get_partition("acme", None).await?.len();

    println!("rows inserted:    {}", args.rows);
    println!("faults injected:  {}", args.faults);
    println!("execute calls:    {}", transport.calls(TransportCall::Execute));
    println!("batch calls:      {}", transport.calls(TransportCall::Batch));
    println!("query calls:      {}", transport.calls(TransportCall::Query));
    println!("deleted first:    {}", removed);
    println!("remaining rows:   {}", remaining);
    Ok(())
}

async fn contend_command(config: StorageConfig, args: ContendArgs) -> anyhow::Result<()> {
    if args.writers == 0 {
        bail!("--writers must be at least 1");
    }

    let transport = MemoryTransport::new();
    transport.set_latency(Some(std::time::Duration::from_millis(args.latency_ms)));
    let factory = TableStorageFactory::from_config(config)?;
    let storage: Arc<dyn TableStorage<Order>> = factory.create(Arc::new(transport.clone())).await?;
    info!(writers = args.writers, "Racing conditional creates");

    let mut tasks = Vec::with_capacity(args.writers);
    for writer in 0..args.writers {
        let storage = storage.clone();
        tasks.push(tokio::spawn(async move {
            let mut candidate = order("contended", 0);
            candidate.status = format!("writer-{}", writer);
            storage.create_if_not_exists(&candidate).await
        }));
    }

    let mut created = 0usize;
    let mut failed = 0usize;
    for task in tasks {
        match task.await? {
            Ok(true) => created += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "Writer failed");
                failed += 1;
            }
        }
    }

    let winner = storage
        .get("contended", &order("contended", 0).number)
        .await?
        .map(|o| o.status)
        .unwrap_or_default();
    println!("writers:  {}", args.writers);
    println!("created:  {}", created);
    println!("failed:   {}", failed);
    println!("winner:   {}", winner);

    if created != 1 {
        bail!("expected exactly one creation, saw {}", created);
    }
    Ok(())
}
