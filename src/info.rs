use std::{
  sync::{Mutex, PoisonError},
  time::Duration,
};

use axum::{
  extract::{Query, State},
  headers::ContentType,
  response::IntoResponse,
  Json, TypedHeader,
};
use lru_time_cache::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
  app::AppState, quality::QualityOptions, util::validate_url,
  ytdlp::VideoMetadata, Result,
};

const INFO_CACHE_CAPACITY: usize = 128;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
  pub url: String,
  pub title: String,
  pub format: String,
  pub direct_download_url: String,
  pub quality_options: QualityOptions,
}

impl VideoInfo {
  fn new(url: &str, metadata: VideoMetadata) -> Self {
    Self {
      url: url.to_string(),
      title: metadata.title,
      format: metadata.ext,
      direct_download_url: url.to_string(),
      quality_options: QualityOptions::all(),
    }
  }
}

/// Recently looked up video metadata, keyed by url.
pub struct InfoCache {
  entries: Mutex<LruCache<String, VideoInfo>>,
}

impl InfoCache {
  pub fn new(ttl: Duration) -> Self {
    let entries =
      LruCache::with_expiry_duration_and_capacity(ttl, INFO_CACHE_CAPACITY);
    Self {
      entries: Mutex::new(entries),
    }
  }

  fn get(&self, url: &str) -> Option<VideoInfo> {
    let mut entries =
      self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    entries.get(url).cloned()
  }

  fn insert(&self, url: String, info: VideoInfo) {
    let mut entries =
      self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    entries.insert(url, info);
  }
}

#[derive(Deserialize)]
pub struct UrlParam {
  url: Option<String>,
}

pub async fn video_info(
  State(state): State<AppState>,
  Json(param): Json<UrlParam>,
) -> Result<Json<VideoInfo>> {
  let url = validate_url(param.url.as_deref())?;
  let url = url.as_str();

  if let Some(info) = state.info_cache.get(url) {
    debug!(%url, "video info served from cache");
    return Ok(Json(info));
  }

  let metadata = state.ytdlp.metadata(url).await?;
  info!(%url, title = %metadata.title, "fetched video info");

  let info = VideoInfo::new(url, metadata);
  state.info_cache.insert(url.to_string(), info.clone());
  Ok(Json(info))
}

pub async fn list_formats(
  State(state): State<AppState>,
  Query(param): Query<UrlParam>,
) -> Result<impl IntoResponse> {
  let url = validate_url(param.url.as_deref())?;
  let listing = state.ytdlp.list_formats(url.as_str()).await?;
  Ok((TypedHeader(ContentType::text()), listing))
}
