//! Text extraction for binary formats (PDF, DOCX).

use std::io::{Cursor, Read};

use docflow_shared::{DocflowError, Result};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

/// Maximum decompressed bytes read from one ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Plain text of a PDF. CPU-bound; call from a blocking task.
pub fn pdf_text(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| DocflowError::Conversion(format!("PDF extraction failed: {e}")))
}

/// Markdown-ish text of a Word document: one paragraph per `w:p`,
/// `Heading1..6` / `Title` paragraph styles become ATX headings.
pub fn docx_markdown(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| DocflowError::Conversion(format!("DOCX is not a valid archive: {e}")))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| DocflowError::Conversion("word/document.xml not found".into()))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| DocflowError::Conversion(format!("DOCX read failed: {e}")))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(DocflowError::Conversion(
            "word/document.xml exceeds size limit".into(),
        ));
    }

    document_xml_to_markdown(&xml)
}

fn document_xml_to_markdown(xml: &[u8]) -> Result<String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut heading: Option<usize> = None;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_text = true,
                b"p" => {
                    current.clear();
                    heading = None;
                }
                b"pStyle" => heading = heading.or(heading_level(&e)),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" => current.push('\n'),
                b"pStyle" => heading = heading.or(heading_level(&e)),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| DocflowError::Conversion(format!("DOCX text: {e}")))?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let text = current.trim();
                    if !text.is_empty() {
                        paragraphs.push(match heading {
                            Some(level) => format!("{} {text}", "#".repeat(level)),
                            None => text.to_string(),
                        });
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(DocflowError::Conversion(format!("DOCX XML: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    Ok(paragraphs.join("\n\n"))
}

fn heading_level(style: &BytesStart) -> Option<usize> {
    let value = style
        .attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == b"val")?
        .unescape_value()
        .ok()?;

    if value.eq_ignore_ascii_case("title") {
        return Some(1);
    }
    let digits = value
        .strip_prefix("Heading")
        .or_else(|| value.strip_prefix("heading"))?;
    match digits.trim().parse::<usize>() {
        Ok(n @ 1..=6) => Some(n),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Minimal DOCX archive around `body` (the contents of `<w:body>`).
    pub(crate) fn docx_bytes(body: &str) -> Vec<u8> {
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}</w:body></w:document>"#
        );
        let mut out = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut out);
            let opts = zip::write::SimpleFileOptions::default();
            zip.start_file("word/document.xml", opts).unwrap();
            zip.write_all(xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        out.into_inner()
    }

    #[test]
    fn docx_paragraphs_and_headings() {
        let body = r#"<w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Quarterly Report</w:t></w:r></w:p>
<w:p><w:r><w:t xml:space="preserve">Revenue grew </w:t></w:r><w:r><w:t>12%&amp; more.</w:t></w:r></w:p>
<w:p></w:p>
<w:p><w:pPr><w:pStyle w:val="Heading2"/></w:pPr><w:r><w:t>Outlook</w:t></w:r></w:p>"#;
        let md = docx_markdown(&docx_bytes(body)).unwrap();
        assert_eq!(md, "# Quarterly Report\n\nRevenue grew 12%& more.\n\n## Outlook");
    }

    #[test]
    fn invalid_docx_is_an_error() {
        let err = docx_markdown(b"not a zip").unwrap_err();
        assert!(err.to_string().contains("DOCX"));
    }

    #[test]
    fn archive_without_document_xml() {
        let mut out = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut out);
            zip.start_file("ppt/presentation.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"<p/>").unwrap();
            zip.finish().unwrap();
        }
        let err = docx_markdown(&out.into_inner()).unwrap_err();
        assert!(err.to_string().contains("word/document.xml"));
    }
}
