//! Web fetching and link discovery for docflow.
//!
//! - [`fetcher`]: single-URL HTTP fetch with SSRF guard, content type and links
//! - [`scope`]: same-host link scope with include/exclude globs

pub mod fetcher;
pub mod scope;

pub use fetcher::{DEFAULT_TIMEOUT, FetchedPage, PageFetcher, extract_links, is_ssrf_target};
pub use scope::{LinkScope, glob_to_regex, normalize_url};
