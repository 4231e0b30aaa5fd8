//! Render a stored [`PipelineReport`] as JSON, CSV, Markdown or HTML.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::Local;
use docflow_shared::{DocflowError, Result};
use serde::Serialize;
use tracing::info;

use crate::pipeline::{DocumentSummary, PipelineReport};

/// Directory used when no output directory is given.
pub const DEFAULT_EXPORT_DIR: &str = "exports";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Markdown,
    Html,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Markdown => "markdown",
            Self::Html => "html",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Markdown => "md",
            other => other.as_str(),
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = DocflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            "markdown" | "md" => Ok(Self::Markdown),
            "html" => Ok(Self::Html),
            other => Err(DocflowError::validation(format!(
                "unsupported export format '{other}': expected json, csv, markdown or html"
            ))),
        }
    }
}

/// Render `report` in `format`.
pub fn export(report: &PipelineReport, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => serde_json::to_string_pretty(report)
            .map_err(|e| DocflowError::parse(format!("failed to serialize report: {e}"))),
        ExportFormat::Csv => to_csv(&report.results),
        ExportFormat::Markdown => Ok(to_markdown(report)),
        ExportFormat::Html => Ok(to_html(report)),
    }
}

/// `<batch_id>_<format>_<YYYYmmdd_HHMMSS>.<ext>`
pub fn export_file_name(report: &PipelineReport, format: ExportFormat) -> String {
    format!(
        "{}_{}_{}.{}",
        report.batch_id.as_deref().unwrap_or(&report.tool),
        format.as_str(),
        Local::now().format("%Y%m%d_%H%M%S"),
        format.extension()
    )
}

/// Render and write `report`. A path with an extension is used as the
/// output file; anything else is treated as the output directory.
pub fn write_export(
    report: &PipelineReport,
    format: ExportFormat,
    out: Option<&Path>,
) -> Result<PathBuf> {
    let path = match out {
        Some(p) if p.extension().is_some() => p.to_path_buf(),
        Some(dir) => dir.join(export_file_name(report, format)),
        None => Path::new(DEFAULT_EXPORT_DIR).join(export_file_name(report, format)),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| DocflowError::io(parent, e))?;
    }

    let content = export(report, format)?;
    std::fs::write(&path, content).map_err(|e| DocflowError::io(&path, e))?;
    info!(path = %path.display(), format = format.as_str(), "report exported");
    Ok(path)
}

#[derive(Serialize)]
struct CsvRow<'a> {
    source: &'a str,
    success: bool,
    input_type: Option<&'a str>,
    output_path: Option<&'a str>,
    content_length: Option<usize>,
    chunk_count: Option<usize>,
    processing_time: f64,
    attempts: u32,
    retried: bool,
    error: Option<&'a str>,
}

fn to_csv(results: &[DocumentSummary]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for r in results {
        writer
            .serialize(CsvRow {
                source: &r.source,
                success: r.success,
                input_type: r.input_type.as_deref(),
                output_path: r.output_path.as_deref(),
                content_length: r.content_length,
                chunk_count: r.chunk_count,
                processing_time: r.processing_time.as_secs_f64(),
                attempts: r.attempts,
                retried: r.retried,
                error: r.error.as_deref(),
            })
            .map_err(|e| DocflowError::parse(format!("failed to write CSV row: {e}")))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| DocflowError::parse(format!("failed to finish CSV: {e}")))?;
    String::from_utf8(bytes).map_err(|e| DocflowError::parse(format!("CSV is not UTF-8: {e}")))
}

fn status(success: bool) -> &'static str {
    if success { "success" } else { "failed" }
}

fn to_markdown(report: &PipelineReport) -> String {
    let mut md = String::from("# Processing Results Export\n\n## Summary\n\n");
    md.push_str("| Field | Value |\n|---|---|\n");
    let _ = writeln!(md, "| Batch ID | {} |", report.batch_id.as_deref().unwrap_or("n/a"));
    let _ = writeln!(md, "| Tool | {} |", report.tool);
    let _ = writeln!(md, "| Status | {} |", status(report.success));
    let _ = writeln!(md, "| Total documents | {} |", report.total_documents);
    let _ = writeln!(md, "| Successful | {} |", report.successful_documents);
    let _ = writeln!(md, "| Failed | {} |", report.failed_documents);
    let _ = writeln!(
        md,
        "| Processing time | {:.2} s |",
        report.total_processing_time.as_secs_f64()
    );
    let _ = writeln!(md, "| Timestamp | {} |", report.timestamp.to_rfc3339());
    if let Some(error) = &report.error {
        let _ = writeln!(md, "| Error | {} |", md_cell(error));
    }

    if !report.results.is_empty() {
        md.push_str("\n## Documents\n\n");
        md.push_str("| # | Source | Status | Output | Length | Time (s) | Attempts | Error |\n");
        md.push_str("|---|---|---|---|---|---|---|---|\n");
        for (i, r) in report.results.iter().enumerate() {
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} | {} | {:.2} | {} | {} |",
                i + 1,
                md_cell(&r.source),
                status(r.success),
                md_cell(r.output_path.as_deref().unwrap_or("")),
                r.content_length.map(|n| n.to_string()).unwrap_or_default(),
                r.processing_time.as_secs_f64(),
                r.attempts,
                md_cell(r.error.as_deref().unwrap_or("")),
            );
        }
    }
    md
}

fn md_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

fn to_html(report: &PipelineReport) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Processing Results Export</title>\n\
<style>body{font-family:sans-serif;margin:2em}table{border-collapse:collapse}\
td,th{border:1px solid #ccc;padding:4px 8px}.failed{color:#b00}</style>\n</head>\n<body>\n\
<h1>Processing Results Export</h1>\n<h2>Summary</h2>\n<ul>\n",
    );
    let _ = writeln!(
        html,
        "<li><strong>Batch ID</strong>: {}</li>",
        escape(report.batch_id.as_deref().unwrap_or("n/a"))
    );
    let _ = writeln!(html, "<li><strong>Tool</strong>: {}</li>", escape(&report.tool));
    let _ = writeln!(
        html,
        "<li><strong>Documents</strong>: {} total, {} successful, {} failed</li>",
        report.total_documents, report.successful_documents, report.failed_documents
    );
    let _ = writeln!(
        html,
        "<li><strong>Processing time</strong>: {:.2} s</li>",
        report.total_processing_time.as_secs_f64()
    );
    if let Some(error) = &report.error {
        let _ = writeln!(html, "<li class=\"failed\"><strong>Error</strong>: {}</li>", escape(error));
    }
    html.push_str("</ul>\n<h2>Documents</h2>\n<table>\n");
    html.push_str("<tr><th>#</th><th>Source</th><th>Status</th><th>Output</th><th>Time (s)</th><th>Error</th></tr>\n");
    for (i, r) in report.results.iter().enumerate() {
        let _ = writeln!(
            html,
            "<tr class=\"{}\"><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{:.2}</td><td>{}</td></tr>",
            status(r.success),
            i + 1,
            escape(&r.source),
            status(r.success),
            escape(r.output_path.as_deref().unwrap_or("")),
            r.processing_time.as_secs_f64(),
            escape(r.error.as_deref().unwrap_or("")),
        );
    }
    html.push_str("</table>\n</body>\n</html>\n");
    html
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn report() -> PipelineReport {
        let summary = |source: &str, success: bool| DocumentSummary {
            source: source.into(),
            success,
            input_type: Some("url".into()),
            output_path: success.then(|| format!("out/{}.md", source.len())),
            content_length: success.then_some(120),
            chunk_count: None,
            token_count: None,
            error: (!success).then(|| "network error: timeout | retry".into()),
            processing_time: Duration::from_millis(250),
            attempts: if success { 1 } else { 3 },
            retried: !success,
        };
        let mut report = PipelineReport::failure("process_list", "unused");
        report.success = true;
        report.error = None;
        report.batch_id = Some("0192-batch".into());
        report.total_documents = 2;
        report.successful_documents = 1;
        report.failed_documents = 1;
        report.results = vec![
            summary("https://a.dev/x", true),
            summary("https://a.dev/<y>", false),
        ];
        report
    }

    #[test]
    fn format_parsing() {
        assert_eq!("MD".parse::<ExportFormat>().unwrap(), ExportFormat::Markdown);
        assert_eq!(ExportFormat::Markdown.extension(), "md");
        assert!("xml".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn csv_has_one_row_per_document() {
        let csv = export(&report(), ExportFormat::Csv).unwrap();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("source,success,input_type,output_path"));
        assert!(lines[2].contains("network error: timeout | retry"));
    }

    #[test]
    fn markdown_escapes_table_cells() {
        let md = export(&report(), ExportFormat::Markdown).unwrap();
        assert!(md.contains("| Batch ID | 0192-batch |"));
        assert!(md.contains("timeout \\| retry"));
        assert!(md.contains("| 2 | https://a.dev/<y> | failed |"));
    }

    #[test]
    fn html_escapes_sources() {
        let html = export(&report(), ExportFormat::Html).unwrap();
        assert!(html.contains("https://a.dev/&lt;y&gt;"));
        assert!(html.contains("1 successful, 1 failed"));
    }

    #[test]
    fn json_export_parses_back() {
        let json = export(&report(), ExportFormat::Json).unwrap();
        let back: PipelineReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.results.len(), 2);
        assert_eq!(back.batch_id.as_deref(), Some("0192-batch"));
    }

    #[test]
    fn write_export_names_file_by_batch_and_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_export(&report(), ExportFormat::Csv, Some(dir.path())).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("0192-batch_csv_"));
        assert!(name.ends_with(".csv"));
        assert!(path.exists());

        let explicit = dir.path().join("nested/report.html");
        let path = write_export(&report(), ExportFormat::Html, Some(&explicit)).unwrap();
        assert_eq!(path, explicit);
        assert!(explicit.exists());
    }
}
