use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use watch_resource::cache::{AtomicStore, MemoryStore, SqliteStore};
use watch_resource::{
  CacheEngine, EngineConfig, HttpTransport, RequestOptions, Resource, ResourceId, Variables,
};

#[derive(Parser, Debug)]
#[command(name = "wres")]
#[command(about = "Fetch REST resources through a normalizing cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/wres/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Path template, e.g. /users/:id
  path: String,

  /// Resource type the entities are normalized under
  #[arg(short = 't', long = "type")]
  resource_type: String,

  /// Path variable binding, NAME=VALUE (repeatable)
  #[arg(long = "var", value_parser = parse_binding)]
  vars: Vec<(String, String)>,

  /// Fetch one entity, identified by the id-key variable
  #[arg(long, conflicts_with = "ids")]
  one: bool,

  /// Fetch a collection of ids (comma separated)
  #[arg(long, value_delimiter = ',')]
  ids: Vec<String>,

  /// Re-fetch every N milliseconds and print each result
  #[arg(long)]
  interval: Option<u64>,

  /// Persist the atomic store in sqlite under the data directory
  #[arg(long)]
  persist: bool,

  /// Write logs to this directory instead of stderr
  #[arg(long)]
  log_dir: Option<PathBuf>,
}

fn parse_binding(raw: &str) -> std::result::Result<(String, String), String> {
  raw
    .split_once('=')
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", raw))
}

/// Numbers bind as numbers, everything else as strings.
fn binding_value(raw: &str) -> Value {
  raw
    .parse::<i64>()
    .map(Value::from)
    .unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn init_logging(log_dir: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "wres.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
      None
    }
  }
}

fn print(record: &Resource) -> Result<()> {
  let snapshot = serde_json::to_string_pretty(&record.snapshot())
    .map_err(|e| eyre!("Failed to serialize record: {}", e))?;
  println!("{}", snapshot);
  Ok(())
}

/// Poll `record` and print every settled state until polling ends or the
/// user interrupts. Returns immediately when no job could be started.
async fn follow(record: &Resource, interval: u64) -> Result<()> {
  if !record.start_polling(interval) {
    return Ok(());
  }

  let mut changes = record.watch();
  changes.borrow_and_update();

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      changed = changes.changed() => {
        if changed.is_err() {
          break;
        }
        if record.status().is_settled() {
          print(record)?;
        }
        if !record.is_polling() {
          break;
        }
      }
    }
  }

  record.stop();
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.log_dir.as_ref());

  let config = EngineConfig::load(args.config.as_deref())?;
  let engine = if args.persist {
    let transport =
      HttpTransport::new(std::time::Duration::from_millis(config.request_timeout_ms))?;
    let atomic = AtomicStore::new(SqliteStore::open()?);
    CacheEngine::with_stores(config, transport, atomic, MemoryStore::<Resource>::new())
  } else {
    CacheEngine::http(config)?
  };

  let variables = args
    .vars
    .iter()
    .fold(Variables::new(), |vars, (name, value)| {
      vars.with(name.clone(), binding_value(value))
    });
  let service = engine.resource(&args.path, variables);

  let options = RequestOptions::new().silent();
  let record = if args.one {
    service.one(&args.resource_type, options)?
  } else if !args.ids.is_empty() {
    let ids: Vec<ResourceId> = args
      .ids
      .iter()
      .map(|raw| ResourceId::from_value(&binding_value(raw)))
      .collect::<Option<_>>()
      .ok_or_else(|| eyre!("Invalid id in --ids"))?;
    service.collection(&args.resource_type, ids, None, options)?
  } else {
    service.all(&args.resource_type, options)?
  };

  let _ = record.fetch(Default::default()).await;
  print(&record)?;

  if let Some(interval) = args.interval {
    follow(&record, interval).await?;
  }

  if record.is_error() {
    let reason = record.message().map(|e| e.to_string()).unwrap_or_default();
    return Err(eyre!("Fetch failed: {}", reason));
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn test_follow_returns_without_polling_job() {
    let engine = CacheEngine::http(EngineConfig::default()).unwrap();
    let record = engine
      .resource("/news", Variables::new())
      .all("news", RequestOptions::new().silent())
      .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), follow(&record, 0)).await;
    assert!(result.is_ok());
    assert!(!record.is_polling());
  }

  #[test]
  fn test_binding_value() {
    assert_eq!(binding_value("712"), Value::from(712));
    assert_eq!(binding_value("henry"), Value::String("henry".to_string()));
    assert!(parse_binding("id").is_err());
  }
}
