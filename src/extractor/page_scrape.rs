use async_trait::async_trait;
use http_types::Url;
use reqwest::header;
use tracing::debug;

use crate::{Error, Result};

use super::{Extraction, Extractor};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";
const PAGE_ACCEPT: &str =
  "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const MEDIA_ACCEPT: &str = "video/webm,video/mp4,video/*;q=0.9,*/*;q=0.8";

const VIDEO_EXTENSIONS: [&str; 4] = [".mp4", ".webm", ".mov", ".m4v"];

// in order of preference
const META_KEYS: [&str; 4] = [
  "og:video:secure_url",
  "og:video:url",
  "og:video",
  "twitter:player:stream",
];

// resolve a playable media url from an arbitrary web page.
pub struct PageScrape {
  client: reqwest::Client,
}

impl PageScrape {
  pub fn new(client: reqwest::Client) -> Self {
    Self { client }
  }
}

#[async_trait]
impl Extractor for PageScrape {
  async fn extract(&self, url: &str) -> Result<Extraction> {
    let page = Url::parse(url)
      .map_err(|_| Error::UnsupportedURL(url.to_string(), "invalid url"))?;

    if is_direct_video(&page) {
      return Ok(Extraction::Proxy {
        url: page.to_string(),
        headers: media_headers(None),
      });
    }

    let resp = self
      .client
      .get(page.as_str())
      .header(header::USER_AGENT, USER_AGENT)
      .header(header::ACCEPT, PAGE_ACCEPT)
      .send()
      .await?;
    if !resp.status().is_success() {
      return Err(Error::Upstream(resp.status()));
    }
    let body = resp.text().await?;

    let media = find_video_url(&body, &page)?.ok_or(Error::VideoNotFound)?;
    debug!(%url, %media, "found video in page");

    Ok(Extraction::Proxy {
      url: media,
      headers: media_headers(Some(&page)),
    })
  }
}

fn media_headers(referer: Option<&Url>) -> Vec<(String, String)> {
  let mut headers = vec![
    (header::USER_AGENT.to_string(), USER_AGENT.to_string()),
    (header::ACCEPT.to_string(), MEDIA_ACCEPT.to_string()),
  ];
  if let Some(referer) = referer {
    headers.push((header::REFERER.to_string(), referer.to_string()));
  }
  headers
}

pub fn is_direct_video(url: &Url) -> bool {
  let path = url.path().to_ascii_lowercase();
  VIDEO_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Looks for a video url in the page: open graph and twitter meta tags
/// first, then `<video>` elements. Relative urls resolve against `base`.
pub fn find_video_url(html: &str, base: &Url) -> Result<Option<String>> {
  let dom = tl::parse(html, tl::ParserOptions::default())
    .map_err(|e| Error::InvalidHTML(format!("{e:?}")))?;

  // tl can't match attribute values containing ':', so collect every meta
  // tag and pick by key ourselves.
  let metas = attr_pairs(&dom, "meta[content]", "content");
  for wanted in META_KEYS {
    let found = metas
      .iter()
      .filter(|(key, _)| key.as_deref() == Some(wanted))
      .find_map(|(_, value)| resolve(base, value));
    if found.is_some() {
      return Ok(found);
    }
  }

  let videos = attr_pairs(&dom, "video[src]", "src")
    .into_iter()
    .chain(attr_pairs(&dom, "source[src]", "src"));
  for (kind, src) in videos {
    // skip <source> tags declaring a non-video type
    if matches!(&kind, Some(t) if !t.starts_with("video/")) {
      continue;
    }
    if let Some(found) = resolve(base, &src) {
      return Ok(Some(found));
    }
  }

  Ok(None)
}

// (key, value) for each node matching selector. the key is the `property`
// or `name` attribute for meta tags and the `type` attribute otherwise.
fn attr_pairs(
  dom: &tl::VDom<'_>,
  selector: &str,
  attr: &str,
) -> Vec<(Option<String>, String)> {
  let Some(nodes) = dom.query_selector(selector) else {
    return Vec::new();
  };

  let mut pairs = Vec::new();
  for node in nodes {
    let Some(tag) = node.get(dom.parser()).and_then(|n| n.as_tag()) else {
      continue;
    };
    let attrs = tag.attributes();
    let Some(Some(value)) = attrs.get(attr) else {
      continue;
    };

    let key = ["property", "name", "type"]
      .into_iter()
      .find_map(|k| attrs.get(k).flatten())
      .map(|k| k.as_utf8_str().trim().to_ascii_lowercase());

    pairs.push((key, value.as_utf8_str().trim().to_string()));
  }
  pairs
}

fn resolve(base: &Url, value: &str) -> Option<String> {
  if value.is_empty() {
    return None;
  }
  let url = base.join(value).ok()?;
  matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn base() -> Url {
    Url::parse("https://example.com/posts/1").unwrap()
  }

  #[test]
  fn test_direct_video_urls() {
    let direct = Url::parse("https://cdn.example.com/a/clip.MP4?x=1").unwrap();
    assert!(is_direct_video(&direct));
    assert!(!is_direct_video(&base()));
  }

  #[test]
  fn test_prefers_secure_og_video() {
    let html = r#"<html><head>
      <meta property="og:video" content="http://example.com/plain.mp4">
      <meta property="og:video:secure_url" content="https://example.com/secure.mp4">
      </head><body></body></html>"#;
    assert_eq!(
      find_video_url(html, &base()).unwrap().as_deref(),
      Some("https://example.com/secure.mp4")
    );
  }

  #[test]
  fn test_twitter_stream_meta() {
    let html = r#"<meta name="twitter:player:stream" content="/media/t.mp4">"#;
    assert_eq!(
      find_video_url(html, &base()).unwrap().as_deref(),
      Some("https://example.com/media/t.mp4")
    );
  }

  #[test]
  fn test_falls_back_to_video_elements() {
    let html = r#"<body>
      <audio><source src="/a.mp3" type="audio/mpeg"></audio>
      <video controls><source src="clip.webm" type="video/webm"></video>
      </body>"#;
    assert_eq!(
      find_video_url(html, &base()).unwrap().as_deref(),
      Some("https://example.com/posts/clip.webm")
    );

    let html = r#"<video src="//cdn.example.com/v.mp4"></video>"#;
    assert_eq!(
      find_video_url(html, &base()).unwrap().as_deref(),
      Some("https://cdn.example.com/v.mp4")
    );
  }

  #[test]
  fn test_no_video() {
    let html = r#"<meta property="og:image" content="/cover.jpg">"#;
    assert_eq!(find_video_url(html, &base()).unwrap(), None);
    assert_eq!(find_video_url("", &base()).unwrap(), None);
  }

  #[tokio::test]
  async fn test_direct_url_skips_fetch() {
    let scraper = PageScrape::new(reqwest::Client::new());
    let extraction = scraper
      .extract("https://cdn.example.com/clip.mp4")
      .await
      .unwrap();
    let Extraction::Proxy { url, headers } = extraction else {
      panic!("expected proxy extraction");
    };
    assert_eq!(url, "https://cdn.example.com/clip.mp4");
    assert!(headers.iter().all(|(k, _)| k != "referer"));
  }
}
