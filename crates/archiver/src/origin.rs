//! Origin client: paged listing and payload fetch.

use crate::error::{OriginError, OriginResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use hoard_core::config::OriginConfig;
use hoard_core::{ContentHash, SourceRef};
use reqwest::Url;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use std::pin::Pin;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;

/// A stream of payload chunks.
pub type PayloadStream = Pin<Box<dyn Stream<Item = OriginResult<Bytes>> + Send>>;

/// One item of an origin listing page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OriginItem {
    pub source_ref: String,
    /// Fetch location, when it differs from `source_ref`.
    #[serde(default)]
    pub url: Option<String>,
    /// Advertised SHA-256 of the payload, hex.
    #[serde(default)]
    pub sha256: Option<String>,
    /// Advertised payload size in bytes.
    #[serde(default)]
    pub size: Option<u64>,
}

impl OriginItem {
    pub fn new(source_ref: impl Into<String>) -> Self {
        Self {
            source_ref: source_ref.into(),
            url: None,
            sha256: None,
            size: None,
        }
    }

    /// The reference recorded in the manifest and used to fetch the item.
    pub fn locator(&self) -> &str {
        self.url.as_deref().unwrap_or(&self.source_ref)
    }

    /// Manifest source reference for this item.
    ///
    /// An advertised hash that does not parse is dropped: the payload will be
    /// hashed after download either way.
    pub fn to_source_ref(&self) -> SourceRef {
        let source = SourceRef::new(self.locator());
        match self.sha256.as_deref().map(ContentHash::from_hex) {
            Some(Ok(hash)) => source.with_advertised(hash),
            _ => source,
        }
    }
}

/// One page of the origin listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OriginPage {
    pub items: Vec<OriginItem>,
    /// Cursor for the next page; None on the last page.
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Remote content origin.
#[async_trait]
pub trait Origin: Send + Sync {
    /// Fetch one listing page. `None` starts from the beginning.
    async fn list_page(&self, cursor: Option<&str>) -> OriginResult<OriginPage>;

    /// Stream the payload behind a source reference.
    async fn fetch(&self, source_ref: &str) -> OriginResult<PayloadStream>;
}

/// HTTP origin.
#[derive(Clone)]
pub struct HttpOrigin {
    http: reqwest::Client,
    base_url: Url,
    listing_url: Url,
    token: Option<String>,
}

impl HttpOrigin {
    pub fn new(config: &OriginConfig) -> OriginResult<Self> {
        // Join relative to the base as a directory.
        let base = format!("{}/", config.base_url.trim_end_matches('/'));
        let base_url = Url::parse(&base)
            .map_err(|e| OriginError::Config(format!("invalid origin base URL: {e}")))?;
        let listing_url = base_url
            .join(config.listing_path.trim_start_matches('/'))
            .map_err(|e| OriginError::Config(format!("invalid listing path: {e}")))?;

        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .read_timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| OriginError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            listing_url,
            token: config.token.clone(),
        })
    }

    /// Absolute URL for a source reference.
    pub fn resolve(&self, source_ref: &str) -> OriginResult<Url> {
        let parsed = if source_ref.starts_with("http://") || source_ref.starts_with("https://") {
            Url::parse(source_ref)
        } else {
            self.base_url.join(source_ref.trim_start_matches('/'))
        };
        parsed.map_err(|e| OriginError::Permanent(format!("invalid source ref {source_ref:?}: {e}")))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> OriginResult<reqwest::Response> {
        let req = match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        let response = req.send().await.map_err(OriginError::from_reqwest)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = parse_retry_after(response.headers(), OffsetDateTime::now_utc());
        let url = response.url().clone();
        let body = response.text().await.unwrap_or_default();
        let body = body.chars().take(200).collect::<String>();
        Err(OriginError::from_status(
            status,
            retry_after,
            format!("{status} from {url}: {body}"),
        ))
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn list_page(&self, cursor: Option<&str>) -> OriginResult<OriginPage> {
        let mut req = self.http.get(self.listing_url.clone());
        if let Some(cursor) = cursor {
            req = req.query(&[("cursor", cursor)]);
        }
        let response = self.send(req).await?;
        let body = response.bytes().await.map_err(OriginError::from_reqwest)?;
        serde_json::from_slice(&body)
            .map_err(|e| OriginError::Permanent(format!("malformed listing page: {e}")))
    }

    async fn fetch(&self, source_ref: &str) -> OriginResult<PayloadStream> {
        let url = self.resolve(source_ref)?;
        let response = self.send(self.http.get(url)).await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(OriginError::from_reqwest));
        Ok(Box::pin(stream))
    }
}

/// Parse `Retry-After` as delay-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap, now: OffsetDateTime) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = OffsetDateTime::parse(value, &Rfc2822).ok()?;
    let delta = at - now;
    Some(if delta.is_positive() {
        Duration::try_from(delta).unwrap_or_default()
    } else {
        Duration::ZERO
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use time::macros::datetime;

    fn origin(base_url: &str) -> HttpOrigin {
        HttpOrigin::new(&OriginConfig {
            base_url: base_url.to_string(),
            ..OriginConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_resolve_source_refs() {
        let origin = origin("http://origin.test/api/");
        assert_eq!(
            origin.resolve("files/a.bin").unwrap().as_str(),
            "http://origin.test/api/files/a.bin"
        );
        assert_eq!(
            origin.resolve("/files/a.bin").unwrap().as_str(),
            "http://origin.test/api/files/a.bin"
        );
        assert_eq!(
            origin.resolve("https://cdn.test/x").unwrap().as_str(),
            "https://cdn.test/x"
        );
        assert_eq!(
            origin.listing_url.as_str(),
            "http://origin.test/api/listing"
        );
    }

    #[test]
    fn test_item_locator_and_advertised_hash() {
        let hash = ContentHash::compute(b"payload");
        let item = OriginItem {
            source_ref: "item-1".into(),
            url: Some("https://cdn.test/item-1".into()),
            sha256: Some(hash.to_hex().to_uppercase()),
            size: Some(7),
        };
        let source = item.to_source_ref();
        assert_eq!(source.source_ref, "https://cdn.test/item-1");
        assert_eq!(source.advertised, Some(hash));

        let mut bad = OriginItem::new("item-2");
        bad.sha256 = Some("not-a-hash".into());
        let source = bad.to_source_ref();
        assert_eq!(source.source_ref, "item-2");
        assert_eq!(source.advertised, None);
    }

    #[test]
    fn test_listing_page_deserialize() {
        let page: OriginPage = serde_json::from_str(
            r#"{"items":[{"source_ref":"a"},{"source_ref":"b","size":3}],"next_cursor":"p2"}"#,
        )
        .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[1].size, Some(3));
        assert_eq!(page.next_cursor.as_deref(), Some("p2"));

        let last: OriginPage = serde_json::from_str(r#"{"items":[]}"#).unwrap();
        assert!(last.next_cursor.is_none());
    }

    #[test]
    fn test_parse_retry_after() {
        let now = datetime!(2024-06-01 12:00:00 UTC);
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers, now), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::from_secs(7)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Sat, 01 Jun 2024 12:00:30 +0000"),
        );
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::from_secs(30)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Sat, 01 Jun 2024 11:00:00 +0000"),
        );
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::ZERO));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers, now), None);
    }
}
