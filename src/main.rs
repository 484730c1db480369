//! Runloop Bridge demo
//!
//! Runs a host loop on the main thread, feeds it from several producer
//! threads, and prints the queue's statistics once everything has drained.

use anyhow::{bail, Context};
use clap::Parser;
use rand::Rng;
use runloop_bridge::config::{QueueConfig, QueueEnv};
use runloop_bridge::event_loop::RunLoop;
use runloop_bridge::registry::{QueueKey, RunloopRegistry};
use runloop_bridge::{TaskControl, TaskQueue, VERSION};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "runloop-bridge")]
#[command(author, version, about = "Cross-thread task queue demo", long_about = None)]
struct Cli {
    /// Queue configuration file (JSON)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of producer threads
    #[arg(short, long, default_value_t = 4)]
    producers: usize,

    /// Tasks added by each producer
    #[arg(short, long, default_value_t = 100)]
    tasks: usize,

    /// Heartbeat period in milliseconds
    #[arg(long, default_value_t = 10)]
    period: u64,

    /// Heartbeats before the periodic task stops
    #[arg(long, default_value_t = 5)]
    beats: u32,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn setup_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<QueueConfig> {
    match path {
        Some(path) => QueueConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(QueueConfig::default()),
    }
}

/// Add `count` tasks from a producer thread; every tenth one is waited on
fn produce(queue: TaskQueue, id: usize, count: usize, ran: Arc<AtomicU64>) -> anyhow::Result<u64> {
    let mut rng = rand::thread_rng();
    let mut waited = 0;
    for n in 0..count {
        thread::sleep(Duration::from_micros(rng.gen_range(0..200)));
        if n % 10 == 9 {
            let value = queue
                .add_waitable_task(move || (id * 1000 + n) as u64)
                .wait()
                .with_context(|| format!("producer {} lost waitable task {}", id, n))?;
            tracing::debug!(producer = id, value, "waitable task returned");
            waited += 1;
        } else {
            let ran = Arc::clone(&ran);
            queue
                .add_task(move || {
                    ran.fetch_add(1, Ordering::Relaxed);
                })
                .with_context(|| format!("producer {} could not add task {}", id, n))?;
        }
    }
    Ok(waited)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = load_config(cli.config.as_ref())?;
    config.validate()?;
    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }
    tracing::info!(version = VERSION, producers = cli.producers, tasks = cli.tasks, "starting");

    let run_loop = RunLoop::new();
    let registry = Arc::new(RunloopRegistry::new());
    let queue = registry.get_or_create(QueueKey::SCRIPT_RUNTIME, QueueEnv::new(run_loop.handle()), config)?;
    if !queue.acquire() {
        bail!("could not acquire the script runtime queue");
    }

    let beats = Arc::new(AtomicUsize::new(0));
    let b = Arc::clone(&beats);
    let limit = cli.beats as usize;
    queue.add_task_with_delay(
        move || {
            let n = b.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::info!(beat = n, "heartbeat");
            TaskControl::from(n < limit)
        },
        Duration::from_millis(cli.period),
    )?;

    if cli.producers == 0 {
        queue.release();
    }

    let ran = Arc::new(AtomicU64::new(0));
    let remaining = Arc::new(AtomicUsize::new(cli.producers));
    let producers: Vec<_> = (0..cli.producers)
        .map(|id| {
            let queue = queue.clone();
            let ran = Arc::clone(&ran);
            let remaining = Arc::clone(&remaining);
            let count = cli.tasks;
            thread::spawn(move || {
                let result = produce(queue.clone(), id, count, ran);
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    // The gate may only move on the owning thread.
                    let owner = queue.clone();
                    if let Err(e) = queue.add_task(move || {
                        owner.release();
                    }) {
                        tracing::error!(error = %e, "could not schedule the final release");
                    }
                }
                result
            })
        })
        .collect();

    let started = Instant::now();
    run_loop.run()?;
    let elapsed = started.elapsed();

    let mut waited = 0;
    for producer in producers {
        match producer.join() {
            Ok(result) => waited += result?,
            Err(_) => bail!("producer thread panicked"),
        }
    }

    let stats = queue.stats();
    if !registry.deinit(&QueueKey::SCRIPT_RUNTIME) {
        bail!("queue still in use after the run loop finished: {:?}", queue.phase());
    }

    tracing::info!(
        elapsed_ms = elapsed.as_millis() as u64,
        fire_and_forget = ran.load(Ordering::Relaxed),
        waited,
        heartbeats = beats.load(Ordering::Relaxed),
        "run loop finished"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
