use std::sync::Arc;

use axum::{
  headers::ContentType,
  response::IntoResponse,
  routing::{get, post},
  Router, TypedHeader,
};

use crate::{
  config::Config,
  download,
  info::{self, InfoCache},
  registry::{DownloadRegistry, RegistryRef},
  video,
  ytdlp::Ytdlp,
};

pub const HOMEPAGE_HTML: &str = include_str!("../html/index.html");

#[derive(Clone)]
pub struct AppState {
  pub ytdlp: Arc<Ytdlp>,
  pub registry: RegistryRef,
  pub info_cache: Arc<InfoCache>,
  pub http: reqwest::Client,
}

impl AppState {
  /// Spawns the download registry, so this must run inside the runtime.
  pub fn new(config: &Config) -> Self {
    let registry =
      DownloadRegistry::new(config.retention, config.stale_after).spawn();

    Self {
      ytdlp: Arc::new(Ytdlp::from_config(config)),
      registry,
      info_cache: Arc::new(InfoCache::new(config.info_cache_ttl)),
      http: reqwest::Client::new(),
    }
  }
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/", get(homepage))
    .route("/health", get(health))
    .route("/api/info", post(info::video_info))
    .route("/api/formats", get(info::list_formats))
    .route(
      "/api/download",
      get(download::get_download)
        .post(download::stream_untracked)
        .delete(download::cancel_download),
    )
    .route("/api/download/video", post(video::download_direct))
    .with_state(state)
}

async fn homepage() -> impl IntoResponse {
  (
    TypedHeader::<ContentType>(ContentType::html()),
    HOMEPAGE_HTML,
  )
}

async fn health() -> impl IntoResponse {
  "ok".to_owned()
}
