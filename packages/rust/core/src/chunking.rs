//! Paragraph-boundary Markdown chunker.
//!
//! Paragraphs (blank-line separated, fenced code blocks kept whole) are
//! packed greedily into chunks of at most `max_tokens` estimated tokens.
//! A paragraph larger than the limit is split on word boundaries; an
//! oversize code block is split on line boundaries, each piece re-fenced.

use serde::Serialize;

/// Approximate characters per token.
pub const CHARS_PER_TOKEN: usize = 4;

/// One piece of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub token_count: usize,
}

/// Estimated token count: `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Split Markdown into chunks. A leading YAML frontmatter block is skipped.
pub fn chunk_markdown(markdown: &str, max_tokens: usize) -> Vec<Chunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let body = strip_frontmatter(markdown);

    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();

    for block in blocks(body) {
        let block_len = block.chars().count();
        let current_len = current.chars().count();

        if !current.is_empty() && current_len + 2 + block_len > max_chars {
            pieces.push(std::mem::take(&mut current));
        }

        if block_len > max_chars {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            if is_fence(&block) {
                pieces.extend(split_fence(&block, max_chars));
            } else {
                pieces.extend(split_words(&block, max_chars));
            }
            continue;
        }

        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(&block);
    }
    if !current.is_empty() {
        pieces.push(current);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            index,
            token_count: estimate_tokens(&text),
            text,
        })
        .collect()
}

fn strip_frontmatter(md: &str) -> &str {
    let Some(rest) = md.strip_prefix("---\n") else {
        return md;
    };
    match rest.find("\n---\n") {
        Some(end) => &rest[end + 5..],
        None => md,
    }
}

/// Blank-line separated blocks; a fenced code block is never split.
fn blocks(md: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut in_fence = false;

    for line in md.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        if !in_fence && line.trim().is_empty() {
            if !current.is_empty() {
                out.push(current.join("\n"));
                current.clear();
            }
            continue;
        }
        current.push(line);
    }
    if !current.is_empty() {
        out.push(current.join("\n"));
    }
    out
}

fn is_fence(block: &str) -> bool {
    block.trim_start().starts_with("```")
}

/// Split a fenced block into fenced pieces of at most `max_chars`,
/// keeping every line (and its whitespace) intact.
fn split_fence(block: &str, max_chars: usize) -> Vec<String> {
    let lines: Vec<&str> = block.lines().collect();
    let open = lines[0];
    let close = lines
        .last()
        .filter(|l| lines.len() > 1 && l.trim_start().starts_with("```"))
        .copied();
    let body_end = if close.is_some() { lines.len() - 1 } else { lines.len() };
    let body = &lines[1..body_end];

    let overhead = open.chars().count() + 1 + close.map_or(0, |c| c.chars().count() + 1);
    if overhead >= max_chars {
        return split_lines(&lines, max_chars);
    }

    split_lines(body, max_chars - overhead)
        .into_iter()
        .map(|piece| match close {
            Some(close) => format!("{open}\n{piece}\n{close}"),
            None => format!("{open}\n{piece}"),
        })
        .collect()
}

/// Pack lines into pieces of at most `max_chars`; a longer line is cut by
/// characters.
fn split_lines(lines: &[&str], max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    let mut has_line = false;

    for line in lines {
        let line_len = line.chars().count();
        if has_line && current_len + 1 + line_len > max_chars {
            out.push(std::mem::take(&mut current));
            current_len = 0;
            has_line = false;
        }
        if line_len > max_chars {
            let chars: Vec<char> = line.chars().collect();
            out.extend(chars.chunks(max_chars).map(|piece| piece.iter().collect::<String>()));
            continue;
        }
        if has_line {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
        has_line = true;
    }
    if has_line {
        out.push(current);
    }
    out
}

/// Hard-split text on whitespace into pieces of at most `max_chars`.
fn split_words(text: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        let sep = usize::from(!current.is_empty());
        if current_len + sep + word_len > max_chars && !current.is_empty() {
            out.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if word_len > max_chars {
            // a single huge token: cut by characters
            let chars: Vec<char> = word.chars().collect();
            for piece in chars.chunks(max_chars) {
                out.push(piece.iter().collect());
            }
            continue;
        }
        if !current.is_empty() {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(word);
        current_len += word_len;
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}
