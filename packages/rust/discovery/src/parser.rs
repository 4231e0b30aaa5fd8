//! Sitemap and robots.txt parsing.
//!
//! Handles both sitemap flavours from <https://www.sitemaps.org/protocol.html>:
//! - `<urlset>`: page URLs in `<url><loc>`
//! - `<sitemapindex>`: nested sitemap URLs in `<sitemap><loc>`

use std::sync::LazyLock;

use docflow_shared::{DocflowError, Result};
use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A parsed sitemap document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SitemapDocument {
    /// Page URLs, in document order.
    UrlSet(Vec<String>),
    /// Child sitemap URLs, in document order.
    Index(Vec<String>),
}

/// Matches `Sitemap: <url>` directives in robots.txt.
static ROBOTS_SITEMAP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*sitemap\s*:\s*(\S+)\s*$").expect("robots sitemap regex"));

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Cheap check for sitemap XML before running the full parser.
pub fn looks_like_sitemap(body: &str) -> bool {
    body.contains("<urlset") || body.contains("<sitemapindex")
}

/// Parse a sitemap or sitemap index.
pub fn parse_sitemap(xml: &str) -> Result<SitemapDocument> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut root: Option<Vec<u8>> = None;
    let mut locs = Vec::new();
    let mut in_loc = false;
    let mut current = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_vec();
                if root.is_none() {
                    root = Some(name);
                } else if name == b"loc" {
                    in_loc = true;
                    current.clear();
                }
            }
            Ok(Event::Text(te)) if in_loc => {
                let text = te
                    .unescape()
                    .map_err(|e| DocflowError::parse(format!("bad sitemap text: {e}")))?;
                current.push_str(&text);
            }
            Ok(Event::CData(cd)) if in_loc => {
                current.push_str(&String::from_utf8_lossy(&cd.into_inner()));
            }
            Ok(Event::End(e)) => {
                if in_loc && e.local_name().as_ref() == b"loc" {
                    in_loc = false;
                    let loc = current.trim();
                    if !loc.is_empty() {
                        locs.push(loc.to_string());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(DocflowError::parse(format!(
                    "invalid sitemap XML at byte {}: {e}",
                    reader.buffer_position()
                )));
            }
            _ => {}
        }
    }

    match root.as_deref() {
        Some(b"urlset") => Ok(SitemapDocument::UrlSet(locs)),
        Some(b"sitemapindex") => Ok(SitemapDocument::Index(locs)),
        Some(other) => Err(DocflowError::parse(format!(
            "unexpected sitemap root element <{}>",
            String::from_utf8_lossy(other)
        ))),
        None => Err(DocflowError::parse("empty sitemap document")),
    }
}

/// Sitemap URLs advertised in a robots.txt body.
pub fn parse_robots_sitemaps(robots: &str) -> Vec<String> {
    ROBOTS_SITEMAP_RE
        .captures_iter(robots)
        .map(|c| c[1].to_string())
        .collect()
}
