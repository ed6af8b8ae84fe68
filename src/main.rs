use std::{net::SocketAddr, time::Duration};

use axum::Router;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod app;
mod config;
mod download;
mod error;
mod extractor;
mod info;
mod progress;
mod quality;
mod registry;
mod util;
mod video;
mod ytdlp;

pub use error::{Error, Result};

use crate::{app::AppState, config::Config, registry::RegistryRef};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .init();

  let config = Config::from_env();
  let state = AppState::new(&config);
  let registry = state.registry.clone();
  let app = app::router(state);
  let addr = config.listen_addr;
  let sweep_interval = config.sweep_interval;

  Toplevel::new(move |s| async move {
    s.start(SubsystemBuilder::new("http", move |h| serve(h, addr, app)));
    s.start(SubsystemBuilder::new("sweeper", move |h| {
      sweep_downloads(h, registry, sweep_interval)
    }));
  })
  .catch_signals()
  .handle_shutdown_requests(SHUTDOWN_TIMEOUT)
  .await
  .map_err(|e| Error::Server(e.to_string()))
}

async fn serve(
  subsys: SubsystemHandle,
  addr: SocketAddr,
  app: Router,
) -> Result<()> {
  let server =
    axum::Server::try_bind(&addr).map_err(|e| Error::Server(e.to_string()))?;
  info!("listening on http://{addr}");

  server
    .serve(app.into_make_service())
    .with_graceful_shutdown(subsys.on_shutdown_requested())
    .await
    .map_err(|e| Error::Server(e.to_string()))
}

// evicts abandoned downloads, and stops the live ones on shutdown
async fn sweep_downloads(
  subsys: SubsystemHandle,
  registry: RegistryRef,
  every: Duration,
) -> Result<()> {
  let mut interval = tokio::time::interval(every);
  // the first tick fires immediately
  interval.tick().await;

  loop {
    tokio::select! {
      _ = subsys.on_shutdown_requested() => break,
      _ = interval.tick() => match registry.sweep().await {
        Ok(0) => {}
        Ok(removed) => info!(removed, "swept stale downloads"),
        Err(e) => warn!("download sweep failed: {e}"),
      },
    }
  }

  let cancelled = registry.cancel_all("Server is shutting down").await?;
  if cancelled > 0 {
    info!(cancelled, "cancelled active downloads");
  }
  Ok(())
}
