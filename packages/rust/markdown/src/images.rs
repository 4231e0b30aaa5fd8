//! Image references inside Markdown.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

/// Matches `![alt](url)` and `![alt](url "title")`.
static IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"!\[([^\]]*)\]\(([^)\s]+)(\s+"[^"]*")?\)"#).expect("image regex"));

/// One image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub alt: String,
    pub url: String,
}

impl ImageRef {
    /// Whether the target is an absolute HTTP(S) URL.
    pub fn is_remote(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }
}

/// All image references in document order (duplicates included).
pub fn image_refs(md: &str) -> Vec<ImageRef> {
    IMAGE_RE
        .captures_iter(md)
        .map(|c| ImageRef {
            alt: c[1].to_string(),
            url: c[2].to_string(),
        })
        .collect()
}

/// Replace image targets using `replacements` (old url → new url).
pub fn rewrite_image_urls(md: &str, replacements: &HashMap<String, String>) -> String {
    IMAGE_RE
        .replace_all(md, |c: &regex::Captures| match replacements.get(&c[2]) {
            Some(new_url) => format!(
                "![{}]({}{})",
                &c[1],
                new_url,
                c.get(3).map_or("", |m| m.as_str())
            ),
            None => c[0].to_string(),
        })
        .into_owned()
}

/// Insert a blockquote under every reference to an image in `descriptions`.
pub fn insert_image_descriptions(md: &str, descriptions: &HashMap<String, String>) -> String {
    IMAGE_RE
        .replace_all(md, |c: &regex::Captures| match descriptions.get(&c[2]) {
            Some(text) => {
                let quoted = text
                    .trim()
                    .lines()
                    .map(|l| format!("> {l}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("{}\n\n{quoted}\n", &c[0])
            }
            None => c[0].to_string(),
        })
        .into_owned()
}
