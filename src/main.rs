mod cache;
mod clients;
mod config;
mod lifecycle;
mod net;
mod routes;
mod server;
mod sync;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::{CacheStorage, MemoryStorage, SqliteStorage};
use config::Config;
use net::{HttpNetwork, Request};
use worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "offgrid")]
#[command(about = "An offline-first caching proxy for a personal web application")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offgrid/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the current generation and run the proxy
  Serve {
    /// Address to listen on (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Keep the cache in memory instead of on disk
    #[arg(long)]
    ephemeral: bool,
  },
  /// Pre-warm the current generation (activating it unless configured to wait), then exit
  Install,
  /// Fetch one URL or origin path through the cache
  Fetch {
    /// Absolute URL, or a path resolved against the origin
    target: String,
  },
  /// List the generations in the cache store
  Generations,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Keep the guard alive so buffered file logs are flushed on exit
  let _guard = init_tracing(config.log_dir.as_deref());

  match args.command {
    Command::Serve { listen, ephemeral } => {
      let config = match listen {
        Some(listen) => Config { listen, ..config },
        None => config,
      };
      if ephemeral {
        serve(&config, MemoryStorage::new()).await
      } else {
        serve(&config, SqliteStorage::open(&config.cache_path()?)?).await
      }
    }
    Command::Install => install(&config).await,
    Command::Fetch { target } => fetch(&config, &target).await,
    Command::Generations => generations(&config),
  }
}

/// Log to stderr, and to a daily rolling file when a log directory is set.
/// Use RUST_LOG to control the level (e.g., RUST_LOG=offgrid=debug).
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("offgrid=info"));

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "offgrid.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .with(filter)
    .init();

  guard
}

async fn serve<S: CacheStorage + 'static>(config: &Config, storage: S) -> Result<()> {
  let addr: SocketAddr = config
    .listen
    .parse()
    .map_err(|e| eyre!("Invalid listen address {}: {}", config.listen, e))?;
  let origin = config.origin_url()?;

  let worker = Worker::new(config, storage, HttpNetwork::new()?)?;
  server::serve(worker, origin, addr).await
}

async fn install(config: &Config) -> Result<()> {
  let storage = SqliteStorage::open(&config.cache_path()?)?;
  let worker = Worker::new(config, storage, HttpNetwork::new()?)?;

  worker.lifecycle.install().await?;
  println!("{}: {:?}", worker.lifecycle.generation(), worker.lifecycle.state());
  Ok(())
}

async fn fetch(config: &Config, target: &str) -> Result<()> {
  let url = config
    .origin_url()?
    .join(target)
    .map_err(|e| eyre!("Invalid target {}: {}", target, e))?;

  let storage = SqliteStorage::open(&config.cache_path()?)?;
  let worker = Worker::new(config, storage, HttpNetwork::new()?)?;

  let result = worker.interceptor.handle(Request::get(url)).await?;
  match result.cached_at {
    Some(cached_at) => println!(
      "{} ({}, cached {})",
      result.data.status,
      result.source.as_str(),
      cached_at.to_rfc3339()
    ),
    None => println!("{} ({})", result.data.status, result.source.as_str()),
  }
  println!("{}", String::from_utf8_lossy(&result.data.body));

  // Let a background refresh land in the cache before exiting
  worker.interceptor.settle().await;
  Ok(())
}

fn generations(config: &Config) -> Result<()> {
  let storage = SqliteStorage::open(&config.cache_path()?)?;
  let active = storage.active_generation()?;

  for name in storage.generations()? {
    let marker = if active.as_deref() == Some(name.as_str()) { "*" } else { " " };
    println!("{} {}", marker, name);
  }
  Ok(())
}
