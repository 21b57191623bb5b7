//! torfleet - CLI entry point

// Use mimalloc as global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use torfleet::config::{default_config_path, EndpointStore, YamlStore};
use torfleet::fleet::{RunLock, Scheduler};
use torfleet::{Fleet, VERSION};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "torfleet")]
#[command(author = "Tsang")]
#[command(version = VERSION)]
#[command(about = "Run a fleet of Tor instances pinned to exit countries")]
struct Args {
    /// Path to configuration file (default ~/.torfleet/config.yaml)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restart every instance, keep the fastest circuit in its country
    Start {
        /// Keep running and re-test on the configured schedule
        #[arg(long)]
        schedule: bool,
    },
    /// Re-test running instances without restarting them
    Test,
    /// List instances and their last results
    List,
    /// Register a new instance
    Add {
        name: String,
        /// Two-letter exit country, e.g. US
        country: String,
        port: u16,
    },
    /// Stop and unregister an instance
    Remove {
        name: String,
        /// Also delete its data directory
        #[arg(long)]
        delete_data: bool,
    },
    /// Load bridge lines from a file, or clear them
    Bridges {
        #[arg(long, conflicts_with = "clear", required_unless_present = "clear")]
        file: Option<PathBuf>,
        #[arg(long)]
        clear: bool,
    },
    /// Set probe attempts per instance (1-10)
    SetAttempts { attempts: u32 },
    /// Set the re-test interval in hours
    Schedule { hours: f64 },
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .enable_all()
        .thread_name("torfleet-worker")
        .build()?;

    runtime.block_on(async_main())
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    // RUST_LOG wins over the configured level
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("warn").add_directive(format!("torfleet={}", level).parse()?),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    Ok(())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let path = args.config.clone().unwrap_or_else(default_config_path);
    let store = Arc::new(YamlStore::new(&path));
    let config = store
        .load()
        .await
        .with_context(|| format!("failed to load {}", path.display()))?;

    init_logging(&config.log_level, args.json)?;
    info!("torfleet v{}", VERSION);
    info!("Configuration: {}", path.display());

    let mut fleet = Fleet::from_config(config, store)?;

    match args.command {
        Command::Start { schedule } => {
            let cancel = fleet.cancellation_token();
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, finishing the current attempt");
                    interrupt.cancel();
                }
            });

            let lock = RunLock::new();
            {
                let _guard = lock.acquire().await;
                let ranking = fleet.start_all().await?;
                println!("{}", ranking);
            }

            if schedule {
                let Some(interval) = fleet.config().schedule_interval() else {
                    anyhow::bail!("no schedule configured; set one with `torfleet schedule <hours>`");
                };
                let fleet = Arc::new(tokio::sync::Mutex::new(fleet));
                let scheduler = Scheduler::new(interval, lock, cancel);
                scheduler
                    .run(|| {
                        let fleet = fleet.clone();
                        async move {
                            match fleet.lock().await.test_running().await {
                                Ok(ranking) => println!("{}", ranking),
                                Err(e) => error!("Scheduled re-test failed: {}", e),
                            }
                        }
                    })
                    .await;
            }
        }
        Command::Test => {
            let ranking = fleet.test_running().await?;
            println!("{}", ranking);
        }
        Command::List => {
            let statuses = fleet.status().await;
            if statuses.is_empty() {
                println!("No instances configured");
            }
            for status in statuses {
                let state = if status.running { "ACTIVE" } else { "STOPPED" };
                let observed = fleet
                    .registry()
                    .get(&status.name)
                    .filter(|e| e.has_observation())
                    .map(|e| {
                        format!(
                            " | IP: {} | Speed: {} Mbps",
                            e.ip.map(|ip| ip.to_string()).unwrap_or_default(),
                            e.throughput_mbps.unwrap_or(0.0)
                        )
                    })
                    .unwrap_or_default();
                println!(
                    "{} ({}) port {} [{}]{}",
                    status.name, status.country, status.port, state, observed
                );
            }
        }
        Command::Add {
            name,
            country,
            port,
        } => {
            fleet.add_endpoint(&name, &country, port).await?;
            println!("Added {}", name);
        }
        Command::Remove { name, delete_data } => {
            fleet.remove_endpoint(&name, delete_data).await?;
            println!("Removed {}", name);
        }
        Command::Bridges { file, clear } => {
            if clear {
                fleet.clear_bridges().await?;
                println!("Bridges cleared");
            } else if let Some(file) = file {
                let text = tokio::fs::read_to_string(&file)
                    .await
                    .with_context(|| format!("failed to read {}", file.display()))?;
                match fleet.set_bridges(&text).await? {
                    Some(bridge_type) => println!("Loaded {} bridges", bridge_type),
                    None => println!("No bridge lines found, bridges cleared"),
                }
            }
        }
        Command::SetAttempts { attempts } => {
            fleet.set_attempts(attempts).await?;
            println!("Attempts per instance: {}", attempts);
        }
        Command::Schedule { hours } => {
            fleet.set_schedule(hours).await?;
            println!("Re-test interval: {} hours", hours);
        }
    }

    Ok(())
}
