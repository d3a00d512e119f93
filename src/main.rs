mod api;
mod cache;
mod commands;
mod config;
mod connectivity;
mod outbox;
mod service;
mod store;
mod sync;
#[cfg(test)]
mod testutil;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use api::types::Plant;
use api::ApiClient;
use cache::CacheLayer;
use commands::{ActionKind, Cli, Command, LocationsCommand, DEFAULT_LOCATION, MONTHS};
use config::Config;
use connectivity::ConnectivityMonitor;
use outbox::Outbox;
use service::{Applied, PlantService};
use store::LocalStore;
use sync::SyncEngine;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let cli = Cli::parse();

  let mut config = Config::load(cli.config.as_deref())?;
  if let Some(server) = cli.server {
    config.server.url = server;
  }

  let data_dir = config.data_dir()?;
  let _log_guard = init_tracing(&data_dir)?;

  let base = Url::parse(&config.server.url)
    .map_err(|e| eyre!("Invalid server URL {}: {}", config.server.url, e))?;
  let http = reqwest::Client::builder().build()?;

  let image_max_age_secs = config.cache.image_max_age_days * 24 * 60 * 60;
  let backend = store::open_backend(&data_dir.join("store.db"));
  let store = LocalStore::new(backend)
    .with_image_bounds(config.cache.image_max_entries, image_max_age_secs);

  let monitor = Arc::new(ConnectivityMonitor::new(
    http.clone(),
    &base,
    config.probe_timeout(),
    config.server.probe_failure_threshold,
  )?);

  let response_store = cache::open_response_store(&data_dir.join("http-cache.db"));
  let cache_layer = CacheLayer::new(http.clone(), response_store, config.request_timeout())
    .with_image_bounds(config.cache.image_max_entries, image_max_age_secs);

  let outbox = Arc::new(Outbox::new(store.clone()));
  let api = ApiClient::new(
    base,
    http,
    cache_layer,
    monitor.clone(),
    Some(outbox.clone()),
    config.request_timeout(),
  );
  let engine = Arc::new(SyncEngine::new(api.clone(), store.clone(), outbox.clone()));
  let service = PlantService::new(api, store, outbox.clone(), monitor.clone());

  // Settle the unknown state before the command runs
  monitor.probe().await;

  run(cli.command, &service, &engine, &monitor, &outbox, &config).await
}

async fn run(
  command: Command,
  service: &PlantService,
  engine: &Arc<SyncEngine>,
  monitor: &Arc<ConnectivityMonitor>,
  outbox: &Arc<Outbox>,
  config: &Config,
) -> Result<()> {
  match command {
    Command::List { location } => {
      let mut plants = service.plants().await?;
      if let Some(location) = &location {
        plants.retain(|p| p.location.as_deref().unwrap_or(DEFAULT_LOCATION) == location);
      }
      if plants.is_empty() {
        println!("No plants.");
        return Ok(());
      }

      let times = service.times().await.unwrap_or_default();
      println!("{:<24} {:<16} {}", "NAME", "LOCATION", "LAST WATERED");
      for plant in &plants {
        let watered = times
          .get(&format!("water:{}", plant.name))
          .map(|t| short_time(t))
          .unwrap_or_else(|| "never".to_string());
        println!(
          "{:<24} {:<16} {}",
          plant.name,
          plant.location.as_deref().unwrap_or(DEFAULT_LOCATION),
          watered
        );
      }
    }

    Command::Show { name, image_out } => {
      let plant = service.plant(&name).await?;
      println!("{}", plant.name);
      if !plant.description.is_empty() {
        println!("  {}", plant.description);
      }
      println!(
        "  location: {}",
        plant.location.as_deref().unwrap_or(DEFAULT_LOCATION)
      );
      if plant.archived {
        println!("  archived");
      }
      println!("  {:>12} {}", "", MONTHS.join("  "));
      print_band("watering min", &plant.watering_min);
      print_band("watering max", &plant.watering_max);
      print_band("feeding min", &plant.feeding_min);
      print_band("feeding max", &plant.feeding_max);

      let times = service.times().await.unwrap_or_default();
      for kind in ["water", "feed"] {
        if let Some(time) = times.get(&format!("{}:{}", kind, plant.name)) {
          println!("  last {}: {}", kind, short_time(time));
        }
      }

      if let Some(out) = image_out {
        match service.image(&plant).await? {
          Some(bytes) => {
            std::fs::write(&out, bytes)?;
            println!("  image written to {}", out.display());
          }
          None => println!("  no image available"),
        }
      }
    }

    Command::Add { name, opts } => {
      let mut plant = Plant::new(name);
      opts.apply_to(&mut plant)?;
      let outcome = service.create_plant(plant).await?;
      report_mutation(&format!("Created {}", outcome.value.name), &outcome);
    }

    Command::Set { name, opts } => {
      let patch = opts.to_patch()?;
      if patch.as_object().map(|o| o.is_empty()).unwrap_or(true) {
        return Err(eyre!("Nothing to change; pass at least one field flag"));
      }
      let outcome = service.update_plant(&name, patch).await?;
      report_mutation(&format!("Updated {}", outcome.value.name), &outcome);
    }

    Command::Archive { name } => {
      let outcome = service.archive_plant(&name).await?;
      report_mutation(&format!("Archived {}", name), &outcome);
    }

    Command::Delete { name } => {
      let outcome = service.delete_plant(&name).await?;
      report_mutation(&format!("Deleted {}", name), &outcome);
    }

    Command::Water { name } => {
      let outcome = service.water(&name).await?;
      report_mutation(&format!("Watered {}", name), &outcome);
    }

    Command::Feed { name } => {
      let outcome = service.feed(&name).await?;
      report_mutation(&format!("Fed {}", name), &outcome);
    }

    Command::Undo { kind, name, to } => {
      let outcome = match kind {
        ActionKind::Water => service.undo_water(&name, to).await?,
        ActionKind::Feed => service.undo_feed(&name, to).await?,
      };
      let restored = match &outcome.value {
        Some(time) => format!("Restored {} to {}", name, short_time(time)),
        None => format!("Cleared history for {}", name),
      };
      report_mutation(&restored, &outcome);
    }

    Command::Locations { action } => match action {
      None => {
        let locations = service.locations().await?;
        if locations.is_empty() {
          println!("{} (default)", DEFAULT_LOCATION);
        } else {
          for location in locations {
            println!("{}", location);
          }
        }
      }
      Some(LocationsCommand::Add { name }) => {
        let outcome = service.add_location(&name).await?;
        report_mutation(&format!("Added location {}", name), &outcome);
      }
      Some(LocationsCommand::Remove { name }) => {
        let outcome = service.remove_location(&name).await?;
        report_mutation(&format!("Removed location {}", name), &outcome);
      }
    },

    Command::Sync { watch } => {
      if watch {
        return watch_loop(engine, monitor, config).await;
      }
      let report = engine.sync().await?;
      println!(
        "Synced: {} ops replayed, {} upserts, {} deletions (rev {})",
        report.flushed, report.upserts, report.deletions, report.server_rev
      );
    }

    Command::Status => {
      let status = service.status()?;
      println!("connectivity: {}", status.state);
      println!("pending ops:  {}", status.pending_ops);
      match status.last_sync_at {
        Some(ms) => println!("last sync:    {}", format_ms(ms)),
        None => println!("last sync:    never"),
      }
      println!("store:        {}", status.backend);
    }

    Command::Outbox { clear } => {
      if clear {
        let dropped = outbox.clear()?;
        println!("Discarded {} queued ops.", dropped);
        return Ok(());
      }
      if outbox.is_empty()? {
        println!("Outbox is empty.");
        return Ok(());
      }
      for op in outbox.ops()? {
        println!("{:<6} {:<24} queued {}", op.method.to_string(), op.url, format_ms(op.timestamp));
      }
    }
  }

  Ok(())
}

/// Run until Ctrl-C: probe on a cadence, sync on reconnect and on the
/// configured interval.
async fn watch_loop(
  engine: &Arc<SyncEngine>,
  monitor: &Arc<ConnectivityMonitor>,
  config: &Config,
) -> Result<()> {
  engine.spawn_on_reconnect(monitor);
  engine.spawn_interval(
    monitor.clone(),
    Duration::from_secs(config.sync.interval_secs),
  );

  if !monitor.is_offline() {
    if let Err(err) = engine.sync().await {
      tracing::warn!(error = %err, "initial sync failed");
    }
  }

  println!("Watching ({}); Ctrl-C to stop.", monitor.state());
  let probe_every = Duration::from_secs(config.server.probe_interval_secs);
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      _ = tokio::time::sleep(probe_every) => {
        monitor.probe().await;
      }
    }
  }
  Ok(())
}

fn report_mutation<T>(message: &str, outcome: &Applied<T>) {
  if outcome.queued {
    println!("{} (pending; will sync when back online)", message);
  } else {
    println!("{}", message);
  }
}

fn print_band(label: &str, band: &[Option<u32>]) {
  let cells: Vec<String> = (0..12)
    .map(|i| match band.get(i).copied().flatten() {
      Some(days) => format!("{:>3}", days),
      None => format!("{:>3}", "-"),
    })
    .collect();
  println!("  {:>12} {}", label, cells.join("  "));
}

fn short_time(iso: &str) -> String {
  chrono::DateTime::parse_from_rfc3339(iso)
    .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
    .unwrap_or_else(|_| iso.to_string())
}

fn format_ms(ms: i64) -> String {
  chrono::DateTime::from_timestamp_millis(ms)
    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
    .unwrap_or_else(|| ms.to_string())
}

fn init_tracing(data_dir: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = data_dir.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "verdant.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  // Logs go to a file so they never mix with command output
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_env("VERDANT_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
