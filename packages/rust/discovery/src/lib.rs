//! Sitemap-driven URL discovery.
//!
//! Given a sitemap URL (or any page on a site), produce the list of page
//! URLs worth converting:
//!
//! 1. If the URL itself is a sitemap, read it, following sitemap indexes
//!    down to `max_depth` levels.
//! 2. Otherwise look for the site's sitemaps (`robots.txt` directives, then
//!    `<origin>/sitemap.xml`).
//! 3. Failing that, fall back to the same-host links on the page.
//!
//! Results are deduplicated, filtered by exclude globs and capped at `max_urls`.

mod parser;

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use docflow_crawler::{LinkScope, PageFetcher, glob_to_regex, normalize_url};
use docflow_shared::{DocflowError, Result, SitemapConfig};
use tracing::{debug, info, instrument, warn};
use url::Url;

pub use parser::{SitemapDocument, looks_like_sitemap, parse_robots_sitemaps, parse_sitemap};

/// Default timeout in seconds for discovery requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// UrlDiscoverer
// ---------------------------------------------------------------------------

/// Collaborator that turns one entry URL into a list of page URLs.
#[async_trait]
pub trait UrlDiscoverer: Send + Sync {
    async fn discover(&self, url: &str) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// Discovery options
// ---------------------------------------------------------------------------

/// Configuration for the discovery process.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Timeout for HTTP requests in seconds.
    pub timeout_secs: u64,
    /// Maximum URLs returned.
    pub max_urls: usize,
    /// Levels of nested sitemap indexes to follow.
    pub max_depth: u32,
    /// URL path globs that are never returned.
    pub exclude_patterns: Vec<String>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_urls: 100,
            max_depth: 2,
            exclude_patterns: Vec::new(),
        }
    }
}

impl From<&SitemapConfig> for DiscoveryOptions {
    fn from(config: &SitemapConfig) -> Self {
        Self {
            timeout_secs: config.timeout_secs,
            max_urls: config.max_urls,
            max_depth: config.max_depth,
            exclude_patterns: config.exclude_patterns.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// SitemapDiscoverer
// ---------------------------------------------------------------------------

/// HTTP-backed [`UrlDiscoverer`] reading sitemaps and page links.
#[derive(Debug, Clone)]
pub struct SitemapDiscoverer {
    fetcher: PageFetcher,
    opts: DiscoveryOptions,
}

impl SitemapDiscoverer {
    pub fn new(opts: DiscoveryOptions) -> Result<Self> {
        let fetcher = PageFetcher::with_timeout(Duration::from_secs(opts.timeout_secs))?;
        Ok(Self { fetcher, opts })
    }

    /// Allow discovery against localhost/private IPs.
    pub fn allow_localhost(mut self) -> Self {
        self.fetcher = self.fetcher.allow_localhost();
        self
    }

    pub fn options(&self) -> &DiscoveryOptions {
        &self.opts
    }

    /// Discover page URLs starting from `url`.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn discover_urls(&self, url: &str) -> Result<Vec<String>> {
        let start = Url::parse(url).map_err(|e| DocflowError::validation(format!("invalid URL '{url}': {e}")))?;
        let mut collector = UrlCollector::new(&self.opts);

        let page = self.fetcher.fetch(url).await?;
        let body = page.text();

        if looks_like_sitemap(&body) {
            self.walk_sitemaps(vec![(url.to_string(), Some(body))], &mut collector).await;
        } else {
            let candidates = self.site_sitemaps(&start).await;
            if !candidates.is_empty() {
                self.walk_sitemaps(candidates.into_iter().map(|c| (c, None)).collect(), &mut collector)
                    .await;
            }

            if collector.is_empty() {
                debug!("no sitemap found, falling back to page links");
                let scope = LinkScope::new(&page.url).exclude(&self.opts.exclude_patterns);
                collector.push(page.url.as_str());
                for link in page.links() {
                    if Url::parse(&link).is_ok_and(|u| scope.in_scope(&u)) {
                        collector.push(&link);
                    }
                }
            }
        }

        let urls = collector.into_urls();
        info!(count = urls.len(), max_urls = self.opts.max_urls, "urls discovered");
        Ok(urls)
    }

    /// Breadth-first walk over sitemaps and nested indexes.
    async fn walk_sitemaps(&self, roots: Vec<(String, Option<String>)>, collector: &mut UrlCollector) {
        let mut queue: VecDeque<(String, Option<String>, u32)> =
            roots.into_iter().map(|(u, b)| (u, b, 0)).collect();
        let mut seen = HashSet::new();

        while let Some((sitemap_url, body, depth)) = queue.pop_front() {
            if collector.is_full() {
                break;
            }
            if !seen.insert(sitemap_url.clone()) {
                continue;
            }

            let body = match body {
                Some(b) => b,
                None => match self.fetcher.fetch_text(&sitemap_url).await {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(%sitemap_url, error = %e, "failed to fetch sitemap");
                        continue;
                    }
                },
            };

            match parse_sitemap(&body) {
                Ok(SitemapDocument::UrlSet(locs)) => {
                    debug!(%sitemap_url, urls = locs.len(), "read urlset");
                    for loc in &locs {
                        collector.push(loc);
                    }
                }
                Ok(SitemapDocument::Index(children)) => {
                    if depth < self.opts.max_depth {
                        debug!(%sitemap_url, children = children.len(), "following sitemap index");
                        queue.extend(children.into_iter().map(|c| (c, None, depth + 1)));
                    } else {
                        debug!(%sitemap_url, depth, "sitemap index beyond max depth, skipping");
                    }
                }
                Err(e) => warn!(%sitemap_url, error = %e, "unparseable sitemap"),
            }
        }
    }

    /// Sitemaps a site advertises: robots.txt directives, else `/sitemap.xml`.
    async fn site_sitemaps(&self, start: &Url) -> Vec<String> {
        let Ok(origin) = origin_url(start) else {
            return Vec::new();
        };

        let mut candidates = match self.fetcher.fetch_text(&format!("{origin}/robots.txt")).await {
            Ok(robots) => parse_robots_sitemaps(&robots),
            Err(e) => {
                debug!(error = %e, "no robots.txt");
                Vec::new()
            }
        };

        if candidates.is_empty() {
            let fallback = format!("{origin}/sitemap.xml");
            match self.fetcher.fetch_text(&fallback).await {
                Ok(body) if looks_like_sitemap(&body) => candidates.push(fallback),
                Ok(_) => debug!(%fallback, "not a sitemap"),
                Err(e) => debug!(%fallback, error = %e, "no sitemap.xml"),
            }
        }
        candidates
    }
}

#[async_trait]
impl UrlDiscoverer for SitemapDiscoverer {
    async fn discover(&self, url: &str) -> Result<Vec<String>> {
        self.discover_urls(url).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Dedup + exclude + cap accumulator.
struct UrlCollector {
    seen: HashSet<String>,
    urls: Vec<String>,
    max_urls: usize,
    excludes: Vec<regex::Regex>,
}

impl UrlCollector {
    fn new(opts: &DiscoveryOptions) -> Self {
        Self {
            seen: HashSet::new(),
            urls: Vec::new(),
            max_urls: opts.max_urls,
            excludes: opts.exclude_patterns.iter().filter_map(|p| glob_to_regex(p)).collect(),
        }
    }

    fn push(&mut self, raw: &str) {
        if self.is_full() {
            return;
        }
        let Ok(url) = Url::parse(raw) else {
            debug!(url = raw, "skipping unparseable url");
            return;
        };
        if url.scheme() != "http" && url.scheme() != "https" {
            return;
        }
        if self.excludes.iter().any(|re| re.is_match(url.path())) {
            return;
        }
        if self.seen.insert(normalize_url(&url)) {
            self.urls.push(raw.to_string());
        }
    }

    fn is_full(&self) -> bool {
        self.urls.len() >= self.max_urls
    }

    fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    fn into_urls(self) -> Vec<String> {
        self.urls
    }
}

/// Extract the origin (scheme + host + port) from a URL.
fn origin_url(url: &Url) -> Result<String> {
    let scheme = url.scheme();
    let host = url
        .host_str()
        .ok_or_else(|| DocflowError::validation(format!("URL has no host: {url}")))?;

    match url.port() {
        Some(port) => Ok(format!("{scheme}://{host}:{port}")),
        None => Ok(format!("{scheme}://{host}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn urlset(urls: &[String]) -> String {
        let body: String = urls.iter().map(|u| format!("<url><loc>{u}</loc></url>")).collect();
        format!(r#"<?xml version="1.0"?><urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">{body}</urlset>"#)
    }

    fn discoverer(opts: DiscoveryOptions) -> SitemapDiscoverer {
        SitemapDiscoverer::new(opts).unwrap().allow_localhost()
    }

    async fn mount(server: &MockServer, at: &str, status: u16, body: String) {
        let mime = if body.starts_with("<html") {
            "text/html; charset=utf-8"
        } else if body.contains("<urlset") || body.contains("<sitemapindex") {
            "application/xml"
        } else {
            "text/plain"
        };
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(ResponseTemplate::new(status).set_body_raw(body, mime))
            .mount(server)
            .await;
    }

    #[test]
    fn test_origin_url() {
        let url = Url::parse("https://docs.example.com/foo/bar").unwrap();
        assert_eq!(origin_url(&url).unwrap(), "https://docs.example.com");
        let url = Url::parse("http://localhost:3000/docs").unwrap();
        assert_eq!(origin_url(&url).unwrap(), "http://localhost:3000");
    }

    #[tokio::test]
    async fn reads_urlset_with_dedup_and_cap() {
        let server = MockServer::start().await;
        let base = server.uri();
        let mut urls: Vec<String> = (0..8).map(|i| format!("{base}/page-{i}")).collect();
        urls.push(format!("{base}/page-0#dup"));
        mount(&server, "/sitemap.xml", 200, urlset(&urls)).await;

        let opts = DiscoveryOptions { max_urls: 5, ..Default::default() };
        let found = discoverer(opts).discover(&format!("{base}/sitemap.xml")).await.unwrap();
        assert_eq!(found.len(), 5);
        assert_eq!(found[0], format!("{base}/page-0"));
        assert_eq!(found[4], format!("{base}/page-4"));
    }

    #[tokio::test]
    async fn follows_sitemap_index_within_depth() {
        let server = MockServer::start().await;
        let base = server.uri();
        let index = format!(
            r#"<sitemapindex><sitemap><loc>{base}/docs.xml</loc></sitemap><sitemap><loc>{base}/blog.xml</loc></sitemap></sitemapindex>"#
        );
        mount(&server, "/index.xml", 200, index).await;
        mount(&server, "/docs.xml", 200, urlset(&[format!("{base}/docs/a"), format!("{base}/docs/b")])).await;
        mount(&server, "/blog.xml", 200, urlset(&[format!("{base}/blog/post")])).await;

        let found = discoverer(DiscoveryOptions::default())
            .discover(&format!("{base}/index.xml"))
            .await
            .unwrap();
        assert_eq!(
            found,
            vec![format!("{base}/docs/a"), format!("{base}/docs/b"), format!("{base}/blog/post")]
        );

        let shallow = DiscoveryOptions { max_depth: 0, ..Default::default() };
        let found = discoverer(shallow).discover(&format!("{base}/index.xml")).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn exclude_patterns_filter_sitemap_urls() {
        let server = MockServer::start().await;
        let base = server.uri();
        mount(
            &server,
            "/sitemap.xml",
            200,
            urlset(&[format!("{base}/docs/a"), format!("{base}/blog/2024/post")]),
        )
        .await;

        let opts = DiscoveryOptions {
            exclude_patterns: vec!["/blog/**".into()],
            ..Default::default()
        };
        let found = discoverer(opts).discover(&format!("{base}/sitemap.xml")).await.unwrap();
        assert_eq!(found, vec![format!("{base}/docs/a")]);
    }

    #[tokio::test]
    async fn page_url_uses_site_sitemap() {
        let server = MockServer::start().await;
        let base = server.uri();
        mount(&server, "/docs", 200, "<html><body><a href=\"/x\">x</a></body></html>".into()).await;
        mount(&server, "/robots.txt", 404, String::new()).await;
        mount(&server, "/sitemap.xml", 200, urlset(&[format!("{base}/docs/intro")])).await;

        let found = discoverer(DiscoveryOptions::default())
            .discover(&format!("{base}/docs"))
            .await
            .unwrap();
        assert_eq!(found, vec![format!("{base}/docs/intro")]);
    }

    #[tokio::test]
    async fn robots_directive_points_at_sitemap() {
        let server = MockServer::start().await;
        let base = server.uri();
        mount(&server, "/", 200, "<html><body>home</body></html>".into()).await;
        mount(&server, "/robots.txt", 200, format!("User-agent: *\nSitemap: {base}/maps/main.xml\n")).await;
        mount(&server, "/maps/main.xml", 200, urlset(&[format!("{base}/a")])).await;

        let found = discoverer(DiscoveryOptions::default()).discover(&base).await.unwrap();
        assert_eq!(found, vec![format!("{base}/a")]);
    }

    #[tokio::test]
    async fn falls_back_to_same_host_links() {
        let server = MockServer::start().await;
        let base = server.uri();
        let html = r#"<html><body>
            <a href="/guide">Guide</a>
            <a href="/guide#install">Guide again</a>
            <a href="/blog/news">News</a>
            <a href="https://elsewhere.example.org/page">External</a>
        </body></html>"#;
        mount(&server, "/", 200, html.into()).await;
        mount(&server, "/robots.txt", 404, String::new()).await;
        mount(&server, "/sitemap.xml", 404, String::new()).await;

        let opts = DiscoveryOptions {
            exclude_patterns: vec!["/blog/**".into()],
            ..Default::default()
        };
        let found = discoverer(opts).discover(&base).await.unwrap();
        assert_eq!(found, vec![format!("{base}/"), format!("{base}/guide")]);
    }

    #[tokio::test]
    async fn unreachable_entry_is_an_error() {
        let server = MockServer::start().await;
        mount(&server, "/sitemap.xml", 500, String::new()).await;

        let result = discoverer(DiscoveryOptions::default())
            .discover(&format!("{}/sitemap.xml", server.uri()))
            .await;
        assert!(result.is_err());
    }
}
