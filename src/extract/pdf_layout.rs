// 📐 PDF word layout - positioned words -> lines -> columns
//
// PDF text carries no table structure, only words with coordinates. Lines
// are rebuilt by clustering words whose top coordinate lies within a small
// tolerance (baselines drift by a point or two), then each word is dropped
// into a column by its left edge against calibrated boundaries.

use super::compile;
use crate::error::ExtractionFailure;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

/// Vertical tolerance (pt) for two words to share a line
pub const LINE_TOLERANCE: f64 = 3.0;

#[derive(Debug, Clone, PartialEq)]
pub struct PositionedWord {
    pub text: String,
    pub x0: f64,
    pub top: f64,
}

impl PositionedWord {
    pub fn new(text: impl Into<String>, x0: f64, top: f64) -> Self {
        PositionedWord {
            text: text.into(),
            x0,
            top,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageWords {
    pub width: f64,
    pub height: f64,
    pub words: Vec<PositionedWord>,
}

/// A rebuilt text line: its top coordinate and its words left to right
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub top: f64,
    pub words: Vec<PositionedWord>,
}

impl Line {
    pub fn text(&self) -> String {
        self.words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ============================================================================
// WORD SOURCES
// ============================================================================

/// Anything that can turn PDF bytes into positioned words per page.
pub trait WordSource: Send + Sync {
    fn pages(&self, bytes: &[u8]) -> Result<Vec<PageWords>, ExtractionFailure>;
}

/// Runs poppler's `pdftotext -bbox` and parses its XHTML word list.
pub struct PdftotextBbox {
    pub program: PathBuf,
}

impl Default for PdftotextBbox {
    fn default() -> Self {
        PdftotextBbox {
            program: PathBuf::from("pdftotext"),
        }
    }
}

impl WordSource for PdftotextBbox {
    fn pages(&self, bytes: &[u8]) -> Result<Vec<PageWords>, ExtractionFailure> {
        let mut file = tempfile::Builder::new()
            .suffix(".pdf")
            .tempfile()
            .map_err(|e| ExtractionFailure::new(format!("could not create temp file: {}", e)))?;
        file.write_all(bytes)
            .and_then(|_| file.flush())
            .map_err(|e| ExtractionFailure::new(format!("could not write temp file: {}", e)))?;

        let output = Command::new(&self.program)
            .arg("-bbox")
            .arg(file.path())
            .arg("-")
            .output()
            .map_err(|e| {
                ExtractionFailure::new(format!(
                    "could not run {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(ExtractionFailure::new(format!(
                "{} failed: {}",
                self.program.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_bbox_html(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `pdftotext -bbox` output:
/// `<page width=".." height=".."> <word xMin=".." yMin=".." ...>text</word>`
pub fn parse_bbox_html(html: &str) -> Result<Vec<PageWords>, ExtractionFailure> {
    let page_re = compile(r#"<page\s+width="([\d.]+)"\s+height="([\d.]+)""#)?;
    let word_re = compile(r#"<word\s+xMin="([\d.]+)"\s+yMin="([\d.]+)"[^>]*>(.*?)</word>"#)?;

    let mut pages: Vec<PageWords> = Vec::new();
    for line in html.lines() {
        if let Some(c) = page_re.captures(line) {
            pages.push(PageWords {
                width: c[1].parse().unwrap_or(0.0),
                height: c[2].parse().unwrap_or(0.0),
                words: Vec::new(),
            });
            continue;
        }

        if let Some(c) = word_re.captures(line) {
            let Some(page) = pages.last_mut() else {
                continue;
            };
            let (Ok(x0), Ok(top)) = (c[1].parse::<f64>(), c[2].parse::<f64>()) else {
                continue;
            };
            page.words
                .push(PositionedWord::new(unescape_entities(&c[3]), x0, top));
        }
    }

    if pages.is_empty() {
        return Err(ExtractionFailure::new("no pages in PDF word layout"));
    }
    Ok(pages)
}

fn unescape_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

// ============================================================================
// LINES + COLUMNS
// ============================================================================

/// Group words into lines. Words are visited by (top, x0); a word joins the
/// current line when its top is within `tolerance` of the line's first top,
/// otherwise it starts a new line.
pub fn cluster_lines(words: &[PositionedWord], tolerance: f64) -> Vec<Line> {
    let mut sorted: Vec<&PositionedWord> = words.iter().collect();
    sorted.sort_by(|a, b| a.top.total_cmp(&b.top).then(a.x0.total_cmp(&b.x0)));

    let mut lines: Vec<Line> = Vec::new();
    for word in sorted {
        let joins = lines
            .last()
            .is_some_and(|line| (word.top - line.top).abs() <= tolerance);
        if let (true, Some(line)) = (joins, lines.last_mut()) {
            line.words.push(word.clone());
            continue;
        }
        lines.push(Line {
            top: word.top,
            words: vec![word.clone()],
        });
    }

    for line in &mut lines {
        line.words.sort_by(|a, b| a.x0.total_cmp(&b.x0));
    }
    lines
}

/// Column index for an x0, or None when it falls left of the first boundary
/// or past the page edge. The last column runs to the page width.
pub fn column_for(x0: f64, boundaries: &[f64], page_width: f64) -> Option<usize> {
    (0..boundaries.len()).find(|&i| {
        let start = boundaries[i];
        let end = boundaries.get(i + 1).copied().unwrap_or(page_width);
        start <= x0 && x0 < end
    })
}

/// One cell per boundary; words in the same column are joined by a space.
pub fn assign_columns(line: &Line, boundaries: &[f64], page_width: f64) -> Vec<String> {
    let mut cells = vec![String::new(); boundaries.len()];
    for word in &line.words {
        if let Some(i) = column_for(word.x0, boundaries, page_width) {
            if !cells[i].is_empty() {
                cells[i].push(' ');
            }
            cells[i].push_str(&word.text);
        }
    }
    cells
}

/// Full page text, one rebuilt line per text line
pub fn page_text(page: &PageWords) -> String {
    cluster_lines(&page.words, LINE_TOLERANCE)
        .iter()
        .map(Line::text)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Lines strictly between the header marker line and the footer marker line.
/// `None` when the page has no header marker; a missing footer runs the
/// block to the end of the page.
pub fn transaction_block(lines: &[Line], header: &str, footer: &str) -> Option<Vec<Line>> {
    let start = lines.iter().position(|l| l.text().contains(header))?;
    let rest = &lines[start + 1..];
    let end = rest
        .iter()
        .position(|l| l.text().contains(footer))
        .unwrap_or(rest.len());
    Some(rest[..end].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(text: &str, x0: f64, top: f64) -> PositionedWord {
        PositionedWord::new(text, x0, top)
    }

    #[test]
    fn test_cluster_lines_within_tolerance() {
        let words = vec![
            w("COMPRA", 60.0, 101.5),
            w("05/01", 20.0, 100.0),
            w("3.000", 390.0, 102.9),
            w("06/01", 20.0, 112.0),
        ];

        let lines = cluster_lines(&words, LINE_TOLERANCE);

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text(), "05/01 COMPRA 3.000");
        assert_eq!(lines[1].text(), "06/01");
    }

    #[test]
    fn test_cluster_lines_tolerance_is_anchored_to_first_word() {
        // 100 -> 103 joins, 106.5 is > 3 from the line top (100) so it splits
        let words = vec![w("a", 0.0, 100.0), w("b", 10.0, 103.0), w("c", 20.0, 106.5)];
        let lines = cluster_lines(&words, 3.0);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text(), "a b");
    }

    #[test]
    fn test_column_for_boundaries() {
        let b = [15.0, 50.0, 230.0, 300.0, 380.0, 450.0, 550.0];
        assert_eq!(column_for(20.0, &b, 612.0), Some(0));
        assert_eq!(column_for(50.0, &b, 612.0), Some(1));
        assert_eq!(column_for(449.9, &b, 612.0), Some(4));
        assert_eq!(column_for(600.0, &b, 612.0), Some(6));
        assert_eq!(column_for(10.0, &b, 612.0), None);
        assert_eq!(column_for(612.0, &b, 612.0), None);
    }

    #[test]
    fn test_assign_columns_joins_words() {
        let b = [15.0, 50.0, 230.0];
        let line = Line {
            top: 100.0,
            words: vec![w("05/01", 20.0, 100.0), w("PAGO", 60.0, 100.0), w("LUZ", 90.0, 100.0), w("10.000", 240.0, 100.0)],
        };
        assert_eq!(assign_columns(&line, &b, 300.0), vec!["05/01", "PAGO LUZ", "10.000"]);
    }

    #[test]
    fn test_transaction_block_markers() {
        let words = vec![
            w("SALDO", 20.0, 50.0),
            w("DETALLE", 60.0, 80.0),
            w("DE", 100.0, 80.0),
            w("TRANSACCION", 120.0, 80.0),
            w("05/01", 20.0, 100.0),
            w("RETENCION", 20.0, 200.0),
            w("A", 80.0, 200.0),
            w("1", 90.0, 200.0),
            w("DIA", 100.0, 200.0),
            w("99/99", 20.0, 220.0),
        ];
        let lines = cluster_lines(&words, LINE_TOLERANCE);

        let block = transaction_block(&lines, "DETALLE DE TRANSACCION", "RETENCION A 1 DIA").unwrap();
        assert_eq!(block.len(), 1);
        assert_eq!(block[0].text(), "05/01");

        assert!(transaction_block(&lines, "NOT THERE", "RETENCION").is_none());
    }

    #[test]
    fn test_parse_bbox_html() {
        let html = r#"<doc>
  <page width="612.000000" height="792.000000">
    <word xMin="20.000000" yMin="100.000000" xMax="40.000000" yMax="110.000000">05/01</word>
    <word xMin="60.000000" yMin="100.500000" xMax="90.000000" yMax="110.000000">A&amp;B</word>
  </page>
</doc>"#;

        let pages = parse_bbox_html(html).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].width, 612.0);
        assert_eq!(pages[0].words.len(), 2);
        assert_eq!(pages[0].words[1].text, "A&B");
        assert_eq!(page_text(&pages[0]), "05/01 A&B");
    }

    #[test]
    fn test_parse_bbox_html_without_pages_fails() {
        assert!(parse_bbox_html("<html></html>").is_err());
    }
}
