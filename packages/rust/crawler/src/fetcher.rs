//! HTTP page fetcher.
//!
//! Fetches one URL at a time and hands back the raw bytes, the declared
//! content type, and (for HTML) the links found on the page. Concurrency
//! is the caller's business; the batch core bounds it.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use url::Url;

use docflow_shared::{DocflowError, Result};

/// User-Agent string for fetch requests.
const USER_AGENT: &str = concat!("docflow/", env!("CARGO_PKG_VERSION"));

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// FetchedPage
// ---------------------------------------------------------------------------

/// A fetched resource and what we learned about it.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: Url,
    pub status_code: u16,
    /// `Content-Type` header value, lowercased, without parameters.
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// SHA-256 of the body, hex encoded.
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Whether the server declared (or the body looks like) HTML.
    pub fn is_html(&self) -> bool {
        match self.content_type.as_deref() {
            Some(ct) => ct.contains("html"),
            None => {
                let head = String::from_utf8_lossy(&self.body[..self.body.len().min(512)]).to_ascii_lowercase();
                head.contains("<html") || head.contains("<!doctype html")
            }
        }
    }

    /// Absolute links on the page (empty for non-HTML bodies).
    pub fn links(&self) -> Vec<String> {
        if !self.is_html() {
            return Vec::new();
        }
        extract_links(&Html::parse_document(&self.text()), &self.url)
    }
}

// ---------------------------------------------------------------------------
// PageFetcher
// ---------------------------------------------------------------------------

/// HTTP fetcher with SSRF protection.
#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: Client,
    /// Allow localhost/private IPs (mock servers in tests, intranet sources).
    allow_private: bool,
}

impl PageFetcher {
    /// Create a fetcher with the default 30 s timeout.
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create a fetcher whose requests time out after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| DocflowError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            allow_private: false,
        })
    }

    /// Allow fetching localhost/private IPs.
    pub fn allow_localhost(mut self) -> Self {
        self.allow_private = true;
        self
    }

    /// Fetch `url`, failing on non-2xx responses and blocked targets.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let parsed = Url::parse(url).map_err(|e| DocflowError::validation(format!("invalid URL '{url}': {e}")))?;

        if !self.allow_private && is_ssrf_target(&parsed) {
            warn!(%url, "SSRF protection: blocked");
            return Err(DocflowError::validation(format!("refusing to fetch private or non-HTTP target: {url}")));
        }

        debug!("fetching");
        let response = self
            .client
            .get(parsed.as_str())
            .send()
            .await
            .map_err(|e| DocflowError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DocflowError::Network(format!("{url}: HTTP {status}")));
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase());

        let body = response
            .bytes()
            .await
            .map_err(|e| DocflowError::Network(format!("{url}: body read failed: {e}")))?
            .to_vec();

        debug!(bytes = body.len(), content_type = ?content_type, "fetched");
        Ok(FetchedPage {
            url: final_url,
            status_code: status.as_u16(),
            content_type,
            content_hash: compute_hash(&body),
            body,
            fetched_at: Utc::now(),
        })
    }

    /// Fetch `url` and return its body as text.
    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        Ok(self.fetch(url).await?.text())
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

// ---------------------------------------------------------------------------
// Link extraction
// ---------------------------------------------------------------------------

/// Extract all links from a document, resolved against the base URL.
pub fn extract_links(doc: &Html, base_url: &Url) -> Vec<String> {
    let Ok(link_sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let mut links = Vec::new();

    for el in doc.select(&link_sel) {
        if let Some(href) = el.value().attr("href") {
            if href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:") {
                continue;
            }

            if let Ok(mut resolved) = base_url.join(href) {
                resolved.set_fragment(None);
                links.push(resolved.to_string());
            }
        }
    }

    links
}

/// Compute SHA-256 hash of content.
fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}
