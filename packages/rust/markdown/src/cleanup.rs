//! Post-conversion cleanup pipeline for Markdown output.
//!
//! Each pass is `&str -> String`, applied in sequence.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Run the full cleanup pipeline on raw Markdown text.
pub(crate) fn run_pipeline(md: &str, base_url: Option<&Url>) -> String {
    let passes: [&dyn Fn(&str) -> String; 5] = [
        &normalize_line_endings,
        &demote_extra_h1,
        &collapse_blank_lines,
        &fix_code_fence_languages,
        &strip_layout_tags,
    ];

    let mut result = md.to_string();
    for pass in passes {
        result = pass(&result);
    }
    result = resolve_relative_urls(&result, base_url);
    tidy_whitespace(&result)
}

/// CRLF / CR to LF.
pub(crate) fn normalize_line_endings(md: &str) -> String {
    md.replace("\r\n", "\n").replace('\r', "\n")
}

/// Keep the first H1; later H1s become H2 so the document has one title.
fn demote_extra_h1(md: &str) -> String {
    let mut seen_h1 = false;
    let mut in_fence = false;

    md.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
            }
            if !in_fence && line.starts_with("# ") {
                if seen_h1 {
                    return format!("#{line}");
                }
                seen_h1 = true;
            }
            line.to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// At most one empty line between blocks.
pub(crate) fn collapse_blank_lines(md: &str) -> String {
    static BLANKS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").expect("valid regex"));

    BLANKS_RE.replace_all(md, "\n\n").into_owned()
}

/// `language-js` / `lang-python` / `highlight-rust` fence hints to the bare language.
fn fix_code_fence_languages(md: &str) -> String {
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^(\s*)```(?:language-|lang-|highlight-)([\w+#-]+)").expect("valid regex")
    });

    FENCE_RE.replace_all(md, "$1```$2").into_owned()
}

/// Remove layout-only tags htmd let through, outside fenced code.
fn strip_layout_tags(md: &str) -> String {
    static LAYOUT_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"</?(?:div|span|section|article|aside|header|footer|figure|figcaption|details|summary|font|center)(?:\s[^>]*)?/?>",
        )
        .expect("valid regex")
    });

    let mut in_fence = false;
    md.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
                return line.to_string();
            }
            if in_fence {
                line.to_string()
            } else {
                LAYOUT_TAG_RE.replace_all(line, "").into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Make relative link and image targets absolute against `base_url`.
///
/// Images are resolved too so later stages (annotation, image download)
/// only ever see absolute references.
fn resolve_relative_urls(md: &str, base_url: Option<&Url>) -> String {
    static TARGET_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(!?)\[([^\]]*)\]\(([^)\s]+)((?:\s+[^)]*)?)\)").expect("valid regex"));

    let Some(base) = base_url else {
        return md.to_string();
    };

    TARGET_RE
        .replace_all(md, |caps: &regex::Captures| {
            let bang = &caps[1];
            let text = &caps[2];
            let href = &caps[3];
            let rest = &caps[4];

            let keep = href.starts_with('#')
                || href.starts_with("mailto:")
                || href.starts_with("data:")
                || Url::parse(href).is_ok();
            if keep {
                return caps[0].to_string();
            }

            match base.join(href) {
                Ok(resolved) => format!("{bang}[{text}]({resolved}{rest})"),
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Trim trailing spaces per line and end with exactly one newline.
pub(crate) fn tidy_whitespace(md: &str) -> String {
    let body = md
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    let body = body.trim_matches('\n');
    format!("{body}\n")
}
