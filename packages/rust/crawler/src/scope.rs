//! Link scope: which discovered URLs are worth following.

use url::Url;

/// Same-host scope with optional include/exclude path globs.
#[derive(Debug, Clone)]
pub struct LinkScope {
    base_host: String,
    include_patterns: Vec<regex::Regex>,
    exclude_patterns: Vec<regex::Regex>,
}

impl LinkScope {
    /// Scope rooted at `start_url`'s host.
    pub fn new(start_url: &Url) -> Self {
        Self {
            base_host: start_url.host_str().unwrap_or("").to_string(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
        }
    }

    /// Only keep URLs whose path matches one of `patterns`.
    pub fn include(mut self, patterns: &[String]) -> Self {
        self.include_patterns = patterns.iter().filter_map(|p| glob_to_regex(p)).collect();
        self
    }

    /// Drop URLs whose path matches any of `patterns`.
    pub fn exclude(mut self, patterns: &[String]) -> Self {
        self.exclude_patterns = patterns.iter().filter_map(|p| glob_to_regex(p)).collect();
        self
    }

    pub fn in_scope(&self, url: &Url) -> bool {
        if url.scheme() != "http" && url.scheme() != "https" {
            return false;
        }

        if url.host_str().unwrap_or("") != self.base_host {
            return false;
        }

        let path = url.path();
        if self.exclude_patterns.iter().any(|p| p.is_match(path)) {
            return false;
        }

        self.include_patterns.is_empty() || self.include_patterns.iter().any(|p| p.is_match(path))
    }
}

/// Convert a glob-like pattern to a regex (`**` crosses `/`, `*` does not).
pub fn glob_to_regex(pattern: &str) -> Option<regex::Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*\*", ".*")
        .replace(r"\*", "[^/]*")
        .replace(r"\?", ".");
    regex::Regex::new(&format!("^{escaped}$")).ok()
}

/// Normalize a URL for deduplication (strip fragment and trailing slash).
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut s = normalized.to_string();
    // Keep the root slash
    if s.ends_with('/') && normalized.path() != "/" {
        s.pop();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_host_only() {
        let scope = LinkScope::new(&Url::parse("https://docs.example.com/guide/").unwrap());
        assert!(scope.in_scope(&Url::parse("https://docs.example.com/guide/intro").unwrap()));
        assert!(scope.in_scope(&Url::parse("https://docs.example.com/api").unwrap()));
        assert!(!scope.in_scope(&Url::parse("https://other.example.com/guide/intro").unwrap()));
        assert!(!scope.in_scope(&Url::parse("ftp://docs.example.com/file").unwrap()));
    }

    #[test]
    fn exclude_and_include_globs() {
        let scope = LinkScope::new(&Url::parse("https://docs.example.com/").unwrap())
            .exclude(&["/blog/**".to_string()]);
        assert!(!scope.in_scope(&Url::parse("https://docs.example.com/blog/post-1").unwrap()));
        assert!(scope.in_scope(&Url::parse("https://docs.example.com/guide/intro").unwrap()));

        let scope = LinkScope::new(&Url::parse("https://docs.example.com/").unwrap())
            .include(&["/docs/*".to_string()]);
        assert!(scope.in_scope(&Url::parse("https://docs.example.com/docs/a").unwrap()));
        assert!(!scope.in_scope(&Url::parse("https://docs.example.com/docs/a/b").unwrap()));
    }

    #[test]
    fn normalize_strips_fragment_and_slash() {
        let url = Url::parse("https://docs.example.com/guide/intro/#section-1").unwrap();
        assert_eq!(normalize_url(&url), "https://docs.example.com/guide/intro");

        let root = Url::parse("https://docs.example.com/").unwrap();
        assert_eq!(normalize_url(&root), "https://docs.example.com/");
    }
}
