//! Backup Engine - Main entry point
//!
//! Each `run` is one bounded invocation, meant to be started again by cron or
//! a systemd timer until the job finishes.

use anyhow::{Context, Result};
use backup_engine::archive::{self, reader::is_gzipped};
use backup_engine::config::Config;
use backup_engine::destination::LocalDestination;
use backup_engine::queue::{JobPayload, Queue};
use backup_engine::tasks::{self, RunOutcome};
use backup_engine::utils;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one invocation of a job (the oldest unfinished one by default)
    Run {
        #[arg(long)]
        job: Option<String>,

        /// Keep invoking until the job finishes or waits for confirmation
        #[arg(long = "loop")]
        repeat: bool,
    },
    /// Queue a job described by a JSON payload file
    Enqueue { payload: PathBuf },
    /// Show one job, or all of them
    Status { id: Option<String> },
    Abort { id: String },
    StartOver { id: String },
    /// Confirm a restore waiting for an operator
    Confirm { id: String },
    /// List the entries of a local archive
    List { archive: PathBuf },
    /// Extract a local archive in one go
    Extract { archive: PathBuf, target: PathBuf },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());

    match args.command {
        Command::Run { job, repeat } => run(&config, &log_level, job, repeat),
        Command::Enqueue { payload } => {
            utils::logger::init(&log_level, None)?;
            let payload: JobPayload = serde_json::from_slice(&std::fs::read(&payload)?)
                .with_context(|| format!("parsing {}", payload.display()))?;
            let item = open_queue(&config)?.add(payload)?;
            println!("{}", item.id);
            Ok(())
        }
        Command::Status { id } => {
            let queue = open_queue(&config)?;
            let items = match id {
                Some(id) => vec![queue.get(&id)?],
                None => queue.list()?,
            };
            for item in items {
                println!(
                    "{}  {:<18} {:<20} {:>5.1}%  errors={}  {}",
                    item.id,
                    format!("{:?}", item.job_type),
                    item.status,
                    item.progress.percent_complete(),
                    item.errors,
                    item.message.as_deref().unwrap_or(&item.progress.message)
                );
            }
            Ok(())
        }
        Command::Abort { id } => {
            let item = open_queue(&config)?.abort(&id)?;
            println!("{} {}", item.id, item.status);
            Ok(())
        }
        Command::StartOver { id } => {
            let item = open_queue(&config)?.start_over(&id)?;
            println!("{} {}", item.id, item.status);
            Ok(())
        }
        Command::Confirm { id } => {
            let item = open_queue(&config)?.confirm(&id)?;
            println!("{} confirmed", item.id);
            Ok(())
        }
        Command::List { archive } => {
            for line in archive::dump_headers(&archive)? {
                println!("{}", line);
            }
            Ok(())
        }
        Command::Extract { archive, target } => {
            utils::logger::init(&log_level, None)?;
            if is_gzipped(&archive) {
                anyhow::bail!("{} is compressed; queue an extract job instead", archive.display());
            }
            let stats = archive::extract(&archive, &target)?;
            println!(
                "{} entries, {} skipped, {} failed, {} bytes",
                stats.entries, stats.skipped, stats.failed, stats.bytes
            );
            Ok(())
        }
    }
}

fn open_queue(config: &Config) -> Result<Queue> {
    Queue::open(&config.engine.data_dir)
        .with_context(|| format!("opening queue in {}", config.engine.data_dir.display()))
}

fn run(config: &Config, log_level: &str, job: Option<String>, repeat: bool) -> Result<()> {
    let queue = open_queue(config)?;
    let item = match job {
        Some(id) => queue.get(&id)?,
        None => match queue.next_pending()? {
            Some(item) => item,
            None => {
                utils::logger::init(log_level, None)?;
                tracing::info!("No pending jobs");
                return Ok(());
            }
        },
    };
    utils::logger::init(log_level, Some(&item.log_file))?;

    tracing::info!(
        "Starting backup-engine v{} (instance: {})",
        env!("CARGO_PKG_VERSION"),
        config.engine.id
    );

    let mut destination = LocalDestination::new(&config.destination.root);
    loop {
        match tasks::run_job(&queue, &mut destination, config, &item.id)? {
            RunOutcome::Finished(status) => {
                println!("{} {}", item.id, status);
                return Ok(());
            }
            RunOutcome::Suspended => {
                let current = queue.get(&item.id)?;
                if !repeat || current.status == backup_engine::queue::Status::WaitingForExternal {
                    println!("{} {} (suspended)", current.id, current.status);
                    return Ok(());
                }
            }
        }
    }
}
