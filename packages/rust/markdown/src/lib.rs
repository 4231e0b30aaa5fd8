//! HTML-to-Markdown and text-to-Markdown conversion with cleanup passes.
//!
//! HTML goes through `htmd` after chrome stripping and table pre-processing;
//! plain text and existing Markdown only go through the cleanup pipeline.
//! Frontmatter is optional and carries the document's source.

mod cleanup;
pub mod images;

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, instrument};
use url::Url;

use docflow_shared::{DocflowError, Result};

pub use images::{ImageRef, image_refs, insert_image_descriptions, rewrite_image_urls};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Result of converting a document to Markdown.
#[derive(Debug, Clone)]
pub struct ConvertResult {
    /// The final Markdown content (with frontmatter when requested).
    pub markdown: String,
    /// Extracted or inferred title.
    pub title: String,
    /// Approximate word count of the body (excluding code and frontmatter).
    pub word_count: usize,
}

/// Options for a conversion.
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Where the document came from (URL, path, or a label). URLs are used
    /// to resolve relative links and images.
    pub source: String,
    /// Override title (if `None`, taken from the first H1).
    pub title: Option<String>,
    /// ISO 8601 timestamp for the `converted_at` frontmatter field.
    pub converted_at: Option<String>,
    /// Prepend a YAML frontmatter block.
    pub frontmatter: bool,
}

impl ConvertOptions {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    fn base_url(&self) -> Option<Url> {
        Url::parse(&self.source)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"))
    }
}

/// Flavour of textual input for [`convert_text`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFlavor {
    /// Already Markdown; only cleaned.
    Markdown,
    /// Plain text (PDF extraction, `.txt`); paragraphs and page breaks normalized.
    Plain,
}

// ---------------------------------------------------------------------------
// Converters
// ---------------------------------------------------------------------------

/// Convert an HTML page to clean Markdown.
///
/// 1. Extract the content HTML (strip nav/header/footer/aside/script/style)
/// 2. Pre-process tables into Markdown tables
/// 3. Convert HTML → Markdown via `htmd`
/// 4. Run the cleanup pipeline
#[instrument(skip(html, opts), fields(source = %opts.source))]
pub fn convert_html(html: &str, opts: &ConvertOptions) -> Result<ConvertResult> {
    let page_title = html_title(html);
    let content_html = extract_content_html(html);
    let content_html = preprocess_tables(&content_html);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "nav", "iframe", "noscript", "svg", "form", "button"])
        .build();

    let raw_markdown = converter
        .convert(&content_html)
        .map_err(|e| DocflowError::Conversion(format!("htmd conversion failed: {e}")))?;
    debug!(raw_len = raw_markdown.len(), "htmd conversion complete");

    let cleaned = cleanup::run_pipeline(&raw_markdown, opts.base_url().as_ref());
    Ok(finish(cleaned, opts, page_title))
}

/// Convert plain text or Markdown into clean Markdown.
#[instrument(skip(text, opts), fields(source = %opts.source))]
pub fn convert_text(text: &str, flavor: TextFlavor, opts: &ConvertOptions) -> Result<ConvertResult> {
    let text = text.trim_start_matches('\u{feff}');
    let body = match flavor {
        TextFlavor::Markdown => strip_frontmatter(text).to_string(),
        TextFlavor::Plain => plain_text_to_markdown(text),
    };

    if body.trim().is_empty() {
        return Err(DocflowError::Conversion(format!(
            "{}: document has no text content",
            opts.source
        )));
    }

    let cleaned = cleanup::run_pipeline(&body, opts.base_url().as_ref());
    Ok(finish(cleaned, opts, None))
}

fn finish(cleaned: String, opts: &ConvertOptions, fallback_title: Option<String>) -> ConvertResult {
    let title = opts
        .title
        .clone()
        .or_else(|| extract_title_from_markdown(&cleaned))
        .or(fallback_title)
        .unwrap_or_else(|| "Untitled".to_string());

    let word_count = count_words(&cleaned);
    let markdown = if opts.frontmatter {
        let frontmatter = build_frontmatter(&opts.source, &title, opts.converted_at.as_deref());
        format!("{frontmatter}\n{cleaned}")
    } else {
        cleaned
    };

    debug!(title = %title, word_count, final_len = markdown.len(), "conversion complete");
    ConvertResult {
        markdown,
        title,
        word_count,
    }
}

// ---------------------------------------------------------------------------
// Plain text
// ---------------------------------------------------------------------------

/// Page breaks become rules, hyphenated line wraps are joined, and wrapped
/// lines inside a paragraph are unwrapped.
fn plain_text_to_markdown(text: &str) -> String {
    static HYPHEN_WRAP_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(\w)-\n(\w)").expect("valid regex"));

    let text = cleanup::normalize_line_endings(text);
    let text = HYPHEN_WRAP_RE.replace_all(&text, "$1$2");

    let mut out: Vec<String> = Vec::new();
    for page in text.split('\u{c}') {
        let paragraphs: Vec<String> = cleanup::collapse_blank_lines(page)
            .split("\n\n")
            .map(|p| {
                p.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .filter(|p| !p.is_empty())
            .collect();
        if paragraphs.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push("---".to_string());
        }
        out.extend(paragraphs);
    }
    out.join("\n\n")
}

/// Drop a leading YAML frontmatter block from existing Markdown.
fn strip_frontmatter(md: &str) -> &str {
    let Some(rest) = md.strip_prefix("---\n") else {
        return md;
    };
    match rest.find("\n---\n") {
        Some(end) => &rest[end + 5..],
        None => md,
    }
}

// ---------------------------------------------------------------------------
// Table pre-processing
// ---------------------------------------------------------------------------

static TABLE_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table").expect("table selector"));
static TR_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("tr selector"));
static CELL_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("th, td").expect("cell selector"));

/// Replace `<table>` elements with Markdown tables before htmd runs.
///
/// `htmd` 0.1 has no table support.
fn preprocess_tables(html: &str) -> String {
    let doc = Html::parse_fragment(html);
    let mut result = html.to_string();

    for table in doc.select(&TABLE_SEL) {
        result = result.replacen(&table.html(), &table_to_markdown(&table), 1);
    }
    result
}

fn table_to_markdown(table: &scraper::ElementRef) -> String {
    let rows: Vec<Vec<String>> = table
        .select(&TR_SEL)
        .map(|tr| {
            tr.select(&CELL_SEL)
                .map(|cell| {
                    cell.text()
                        .collect::<String>()
                        .split_whitespace()
                        .collect::<Vec<_>>()
                        .join(" ")
                        .replace('|', "\\|")
                })
                .collect::<Vec<_>>()
        })
        .filter(|r| !r.is_empty())
        .collect();

    let cols = rows.iter().map(Vec::len).max().unwrap_or(0);
    if cols == 0 {
        return String::new();
    }

    let render = |row: &[String]| {
        let mut cells: Vec<&str> = row.iter().map(String::as_str).collect();
        cells.resize(cols, "");
        format!("| {} |\n", cells.join(" | "))
    };

    let mut md = String::from("\n\n");
    md.push_str(&render(&rows[0]));
    md.push_str(&format!("|{}\n", " --- |".repeat(cols)));
    for row in &rows[1..] {
        md.push_str(&render(row));
    }
    md.push('\n');
    md
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extract the main content HTML, stripping page chrome.
fn extract_content_html(html: &str) -> String {
    let doc = Html::parse_document(html);

    for sel_str in ["[role=\"main\"]", "main", "article", ".content", "body"] {
        if let Ok(selector) = Selector::parse(sel_str) {
            if let Some(el) = doc.select(&selector).next() {
                return el.inner_html();
            }
        }
    }

    html.to_string()
}

/// `<title>` text, used when the body has no H1.
fn html_title(html: &str) -> Option<String> {
    static TITLE_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").expect("title selector"));

    Html::parse_document(html)
        .select(&TITLE_SEL)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Extract title from the first H1 in the Markdown text.
fn extract_title_from_markdown(md: &str) -> Option<String> {
    static H1_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^# (.+)$").expect("valid regex"));

    H1_RE.captures(md).map(|c| c[1].trim().to_string())
}

/// Count words in Markdown body (excluding code blocks).
fn count_words(md: &str) -> usize {
    static CODE_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("valid regex"));

    CODE_BLOCK_RE
        .replace_all(md, "")
        .split_whitespace()
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .count()
}

/// Build a YAML frontmatter block.
pub fn build_frontmatter(source: &str, title: &str, converted_at: Option<&str>) -> String {
    let mut fm = String::from("---\n");
    fm.push_str(&format!("source: \"{}\"\n", escape_yaml_string(source)));
    fm.push_str(&format!("title: \"{}\"\n", escape_yaml_string(title)));
    if let Some(ts) = converted_at {
        fm.push_str(&format!("converted_at: \"{ts}\"\n"));
    }
    fm.push_str("---\n");
    fm
}

/// Escape special characters in a YAML string value.
fn escape_yaml_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(source: &str) -> ConvertOptions {
        ConvertOptions::new(source)
    }

    #[test]
    fn convert_simple_html() {
        let html = "<html><body><main><h1>Hello World</h1><p>Some text.</p></main></body></html>";
        let result = convert_html(html, &opts("https://example.com/page")).unwrap();

        assert!(result.markdown.contains("# Hello World"));
        assert!(result.markdown.contains("Some text."));
        assert_eq!(result.title, "Hello World");
        assert_eq!(result.word_count, 4);
    }

    #[test]
    fn frontmatter_is_opt_in() {
        let html = "<html><body><main><h1>Test</h1><p>Body</p></main></body></html>";
        let result = convert_html(
            html,
            &ConvertOptions {
                source: "https://example.com/test".into(),
                title: None,
                converted_at: Some("2024-01-15T10:30:00Z".into()),
                frontmatter: true,
            },
        )
        .unwrap();

        assert!(result.markdown.starts_with("---\n"));
        assert!(result.markdown.contains("source: \"https://example.com/test\""));
        assert!(result.markdown.contains("title: \"Test\""));
        assert!(result.markdown.contains("converted_at: \"2024-01-15T10:30:00Z\""));
    }

    #[test]
    fn chrome_is_stripped() {
        let html = r#"<html><body>
            <nav><a href="/">Home</a></nav>
            <main><h1>Content</h1><p>Important text.</p></main>
            <footer><p>Copyright 2024</p></footer>
        </body></html>"#;

        let result = convert_html(html, &opts("https://example.com/")).unwrap();
        assert!(result.markdown.contains("Important text."));
        assert!(!result.markdown.contains("Copyright 2024"));
    }

    #[test]
    fn code_blocks_survive() {
        let html = r#"<html><body><main>
            <h1>Code Example</h1>
            <pre><code class="language-rust">fn main() {
    println!("hello");
}</code></pre>
        </main></body></html>"#;

        let result = convert_html(html, &opts("https://example.com/code")).unwrap();
        assert!(result.markdown.contains("```rust"));
        assert!(result.markdown.contains("println!"));
    }

    #[test]
    fn tables_become_markdown() {
        let html = r#"<html><body><main>
            <h1>Data</h1>
            <table>
                <thead><tr><th>Name</th><th>Value</th></tr></thead>
                <tbody>
                    <tr><td>foo</td><td>bar</td></tr>
                </tbody>
            </table>
        </main></body></html>"#;

        let result = convert_html(html, &opts("https://example.com/data")).unwrap();
        assert!(result.markdown.contains("| Name | Value |"));
        assert!(result.markdown.contains("| --- | --- |"));
        assert!(result.markdown.contains("| foo | bar |"));
    }

    #[test]
    fn relative_images_become_absolute() {
        let html = r#"<html><body><main><h1>Pics</h1><img src="/img/a.png" alt="A"></main></body></html>"#;
        let result = convert_html(html, &opts("https://example.com/docs/page")).unwrap();
        let refs = image_refs(&result.markdown);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].url, "https://example.com/img/a.png");
    }

    #[test]
    fn title_falls_back_to_html_title() {
        let html = "<html><head><title>Page Title</title></head><body><p>No heading here.</p></body></html>";
        let result = convert_html(html, &opts("page.html")).unwrap();
        assert_eq!(result.title, "Page Title");

        let empty = convert_html("<html><body></body></html>", &opts("x")).unwrap();
        assert_eq!(empty.title, "Untitled");
    }

    #[test]
    fn title_override_wins() {
        let html = "<html><body><main><h1>Original</h1><p>Text</p></main></body></html>";
        let mut o = opts("https://example.com/");
        o.title = Some("Custom Title".into());
        assert_eq!(convert_html(html, &o).unwrap().title, "Custom Title");
    }

    #[test]
    fn word_count_excludes_code_blocks() {
        let html = r#"<html><body><main>
            <h1>Title</h1>
            <p>One two three.</p>
            <pre><code>lots of code words that should not be counted</code></pre>
        </main></body></html>"#;

        let result = convert_html(html, &opts("https://example.com/wc")).unwrap();
        assert!(result.word_count < 10, "word_count={}", result.word_count);
    }

    #[test]
    fn plain_text_paragraphs_and_pages() {
        let text = "Annual Report\r\n\r\nThe quick brown\nfox jumps over the lazy dog, docu-\nmentation says.\n\n\n\nSecond para.\u{c}Page two text.";
        let result = convert_text(text, TextFlavor::Plain, &opts("report.pdf")).unwrap();
        assert_eq!(
            result.markdown,
            "Annual Report\n\nThe quick brown fox jumps over the lazy dog, documentation says.\n\nSecond para.\n\n---\n\nPage two text.\n"
        );
    }

    #[test]
    fn markdown_input_is_cleaned_and_frontmatter_replaced() {
        let md = "---\ntitle: old\n---\n# Notes\n\n\n\nBody text.   \n";
        let mut o = opts("notes.md");
        o.frontmatter = true;
        let result = convert_text(md, TextFlavor::Markdown, &o).unwrap();
        assert_eq!(result.title, "Notes");
        assert!(!result.markdown.contains("title: old"));
        assert!(result.markdown.ends_with("# Notes\n\nBody text.\n"));
    }

    #[test]
    fn empty_text_is_a_conversion_error() {
        let err = convert_text("  \n\n ", TextFlavor::Plain, &opts("blank.txt")).unwrap_err();
        assert!(err.to_string().contains("no text content"));
    }
}
