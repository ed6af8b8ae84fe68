use std::{collections::HashMap, convert::Infallible};

use async_trait::async_trait;
use axum::{
  extract::{FromRequestParts, Query, State},
  http::HeaderValue,
  response::{IntoResponse, Response},
  Json,
};
use itertools::Itertools;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::{
  app::AppState,
  extractor::{Extractor, Tracker, YtdlpStream},
  quality::Quality,
  registry::Snapshot,
  util::{sanitize_filename, validate_url},
  Error, Result,
};

const REQUEST_TYPE_HEADER: &str = "x-request-type";
const DOWNLOAD_ID_HEADER: &str = "x-download-id";

/// Whether a `GET /api/download` only registers the download
/// (`X-Request-Type: init`) or starts streaming it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
  Init,
  Start,
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestKind
where
  S: Send + Sync,
{
  type Rejection = Infallible;

  async fn from_request_parts(
    parts: &mut http::request::Parts,
    _state: &S,
  ) -> Result<Self, Self::Rejection> {
    let is_init = parts
      .headers
      .get(REQUEST_TYPE_HEADER)
      .and_then(|v| v.to_str().ok())
      .is_some_and(|v| v.trim().eq_ignore_ascii_case("init"));

    Ok(if is_init {
      RequestKind::Init
    } else {
      RequestKind::Start
    })
  }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadQuery {
  url: Option<String>,
  quality: Option<String>,
  download_id: Option<String>,
  filename: Option<String>,
  progress_id: Option<String>,
}

pub async fn get_download(
  State(state): State<AppState>,
  kind: RequestKind,
  Query(query): Query<DownloadQuery>,
) -> Result<Response> {
  if let Some(ids) = query.progress_id.as_deref() {
    return Ok(poll(&state, ids).await?.into_response());
  }

  match kind {
    RequestKind::Init => Ok(init(&state, query).await?.into_response()),
    RequestKind::Start => start(&state, query).await,
  }
}

async fn poll(
  state: &AppState,
  ids: &str,
) -> Result<Json<HashMap<String, Snapshot>>> {
  let ids: Vec<String> = ids
    .split(',')
    .map(str::trim)
    .filter(|id| !id.is_empty())
    .unique()
    .map(str::to_string)
    .collect();

  if ids.is_empty() {
    return Err(Error::MissingParam("progressId"));
  }

  Ok(Json(state.registry.snapshot(ids).await?))
}

async fn init(state: &AppState, query: DownloadQuery) -> Result<Json<Value>> {
  let url = validate_url(query.url.as_deref())?;
  let quality = Quality::from_label(query.quality.as_deref());
  let filename = query
    .filename
    .as_deref()
    .map(|name| sanitize_filename(Some(name)));

  let id = state
    .registry
    .create(url.to_string(), quality, filename)
    .await?;

  Ok(Json(json!({ "downloadId": id })))
}

async fn start(state: &AppState, query: DownloadQuery) -> Result<Response> {
  let url = validate_url(query.url.as_deref())?;
  let quality = Quality::from_label(query.quality.as_deref());
  let filename = sanitize_filename(query.filename.as_deref());

  let download_id = query.download_id.filter(|id| !id.trim().is_empty());
  let id = match download_id {
    Some(id) => {
      let id = id.trim().to_string();
      state
        .registry
        .prepare(id.clone(), url.to_string(), quality, Some(filename.clone()))
        .await?;
      id
    }
    // started without init: register on the fly so it can still be polled
    None => {
      state
        .registry
        .create(url.to_string(), quality, Some(filename.clone()))
        .await?
    }
  };
  info!(%id, %url, %quality, %filename, "download started");

  let tracker = Tracker::new(id.clone(), state.registry.clone());
  let extraction = YtdlpStream::new(state.ytdlp.clone(), quality)
    .tracked(tracker)
    .extract(url.as_str())
    .await?;

  let mut resp = extraction.respond(&state.http, &filename).await?;
  if let Ok(value) = HeaderValue::from_str(&id) {
    resp.headers_mut().insert(DOWNLOAD_ID_HEADER, value);
  }
  Ok(resp)
}

#[derive(Deserialize)]
pub struct StreamRequest {
  url: Option<String>,
  quality: Option<String>,
}

/// Streams a download without registering it. Kept for clients that
/// predate progress tracking.
pub async fn stream_untracked(
  State(state): State<AppState>,
  Json(req): Json<StreamRequest>,
) -> Result<Response> {
  let url = validate_url(req.url.as_deref())?;
  let quality = Quality::from_label(req.quality.as_deref());
  info!(%url, %quality, "untracked download started");

  let extraction = YtdlpStream::new(state.ytdlp.clone(), quality)
    .extract(url.as_str())
    .await?;
  extraction.respond(&state.http, "video.mp4").await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelQuery {
  download_id: Option<String>,
}

pub async fn cancel_download(
  State(state): State<AppState>,
  Query(query): Query<CancelQuery>,
) -> Result<Json<Value>> {
  let id = query
    .download_id
    .map(|id| id.trim().to_string())
    .filter(|id| !id.is_empty())
    .ok_or(Error::MissingParam("downloadId"))?;

  state.registry.cancel(id.clone()).await?;

  Ok(Json(json!({
    "downloadId": id,
    "message": "Download cancelled.",
  })))
}
