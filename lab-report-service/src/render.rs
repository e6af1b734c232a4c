//! PDF rendering of an analysed report.
//!
//! Layout: title, patient information (one line per metadata field), a
//! five-column results table, the explanation, then the summary split into
//! its three labelled bullet sections. Uses the built-in Helvetica faces, so
//! text is folded to Latin-1 before it is drawn.

use printpdf::{
    BuiltinFont, IndirectFontRef, Mm, PdfDocument, PdfDocumentReference, PdfLayerReference,
};
use regex::Regex;
use std::io::BufWriter;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{Record, TableRow, partition_records, scalar_text};

const PAGE_WIDTH: Mm = Mm(210.0);
const PAGE_HEIGHT: Mm = Mm(297.0);
const TOP: f32 = 280.0;
const BOTTOM: f32 = 20.0;
const LEFT: f32 = 20.0;
const BODY_WRAP: usize = 95;

const REPORT_TITLE: &str = "Medical Report Summary";

/// Column x offsets (mm) and character budgets for the results table
const TABLE_LAYOUT: [(f32, usize); 5] = [
    (20.0, 26),
    (68.0, 14),
    (95.0, 12),
    (120.0, 24),
    (165.0, 12),
];

static SECTION_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^[^A-Za-z\n]*(summary|risks\s*/\s*conditions|actions\s*/\s*recommendations)\s*(?:\*\*\s*:?|:\s*(?:\*\*)?|[ \t]*$)",
    )
    .expect("section label pattern is valid")
});

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("PDF font error: {0}")]
    Font(String),

    #[error("PDF save error: {0}")]
    Save(String),
}

/// The three bullet lists of a summarization response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummarySections {
    pub summary: Vec<String>,
    pub risks: Vec<String>,
    pub actions: Vec<String>,
}

impl SummarySections {
    fn labelled(&self) -> [(&'static str, &[String]); 3] {
        [
            ("Summary:", &self.summary),
            ("Risks/Conditions:", &self.risks),
            ("Actions/Recommendations:", &self.actions),
        ]
    }
}

/// Split summary prose on its section labels. `None` when no label is found.
pub fn parse_summary_sections(summary: &str) -> Option<SummarySections> {
    let labels: Vec<_> = SECTION_LABEL
        .captures_iter(summary)
        .filter_map(|caps| Some((caps.get(0)?, caps.get(1)?.as_str().to_ascii_lowercase())))
        .collect();

    if labels.is_empty() {
        return None;
    }

    let mut sections = SummarySections::default();
    for (i, (label, name)) in labels.iter().enumerate() {
        let end = labels
            .get(i + 1)
            .map_or(summary.len(), |(next, _)| next.start());
        let items = bullet_items(&summary[label.end()..end]);

        let target = if name.starts_with("summary") {
            &mut sections.summary
        } else if name.starts_with("risks") {
            &mut sections.risks
        } else {
            &mut sections.actions
        };
        target.extend(items);
    }

    Some(sections)
}

fn bullet_items(body: &str) -> Vec<String> {
    body.lines()
        .map(|line| {
            line.trim_start_matches(|c: char| c == '*' || c == '-' || c == '•' || c.is_whitespace())
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .collect()
}

/// Render the final report. Missing explanation or summary sections are
/// left out.
pub fn render_report(
    records: &[Record],
    explanation: Option<&str>,
    summary: Option<&str>,
) -> Result<Vec<u8>, RenderError> {
    let (tests, metadata) = partition_records(records);
    let rows: Vec<TableRow> = tests.iter().filter_map(TableRow::from_record).collect();

    let mut writer = PageWriter::new(REPORT_TITLE)?;
    writer.text(REPORT_TITLE, 16.0, LEFT, Font::Bold, 12.0);

    let patient_lines: Vec<String> = metadata
        .iter()
        .flat_map(|record| record.iter())
        .filter_map(|(key, value)| {
            let value = scalar_text(value).filter(|v| !v.is_empty())?;
            Some(format!("{}: {}", capitalize_key(key), value))
        })
        .collect();
    if !patient_lines.is_empty() {
        writer.heading("Patient Information");
        for line in &patient_lines {
            writer.paragraph(line);
        }
        writer.gap(6.0);
    }

    if !rows.is_empty() {
        writer.heading("Test Results");
        writer.table_row(&TableRow::HEADERS, Font::Bold);
        for row in &rows {
            writer.table_row(&row.cells(), Font::Regular);
        }
        writer.gap(6.0);
    }

    if let Some(explanation) = explanation.filter(|e| !e.trim().is_empty()) {
        writer.heading("Explanation");
        for paragraph in explanation.lines() {
            if paragraph.trim().is_empty() {
                writer.gap(2.0);
            } else {
                writer.paragraph(paragraph.trim());
            }
        }
        writer.gap(6.0);
    }

    if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
        writer.heading("Summary and Recommendations");
        match parse_summary_sections(summary) {
            Some(sections) => {
                for (label, items) in sections.labelled() {
                    if items.is_empty() {
                        continue;
                    }
                    writer.text(label, 10.0, LEFT, Font::Bold, 5.5);
                    for item in items {
                        writer.bullet(item);
                    }
                    writer.gap(2.0);
                }
            }
            None => {
                debug!("Summary has no section labels, rendering it as plain text");
                for line in summary.lines().filter(|l| !l.trim().is_empty()) {
                    writer.paragraph(line.trim());
                }
            }
        }
    }

    let bytes = writer.finish()?;
    info!(
        bytes = bytes.len(),
        rows = rows.len(),
        "Rendered PDF report"
    );
    Ok(bytes)
}

#[derive(Clone, Copy)]
enum Font {
    Regular,
    Bold,
}

/// Top-down text cursor that starts a new page when it reaches the margin
struct PageWriter {
    doc: PdfDocumentReference,
    layer: PdfLayerReference,
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    y: Mm,
}

impl PageWriter {
    fn new(title: &str) -> Result<Self, RenderError> {
        let (doc, page, layer) = PdfDocument::new(title, PAGE_WIDTH, PAGE_HEIGHT, "Layer 1");
        let layer = doc.get_page(page).get_layer(layer);
        let regular = doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .map_err(|e| RenderError::Font(e.to_string()))?;
        let bold = doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .map_err(|e| RenderError::Font(e.to_string()))?;

        Ok(Self {
            doc,
            layer,
            regular,
            bold,
            y: Mm(TOP),
        })
    }

    fn ensure_room(&mut self, needed: f32) {
        if self.y.0 - needed < BOTTOM {
            let (page, layer) = self.doc.add_page(PAGE_WIDTH, PAGE_HEIGHT, "Layer 1");
            self.layer = self.doc.get_page(page).get_layer(layer);
            self.y = Mm(TOP);
        }
    }

    fn text(&mut self, text: &str, size: f32, x: f32, font: Font, advance: f32) {
        self.ensure_room(advance);
        let font = match font {
            Font::Regular => &self.regular,
            Font::Bold => &self.bold,
        };
        self.layer.use_text(latin1(text), size, Mm(x), self.y, font);
        self.y -= Mm(advance);
    }

    fn heading(&mut self, text: &str) {
        self.ensure_room(16.0);
        self.text(text, 12.0, LEFT, Font::Bold, 7.0);
    }

    fn paragraph(&mut self, text: &str) {
        for line in wrap_text(text, BODY_WRAP) {
            self.text(&line, 9.0, LEFT, Font::Regular, 4.5);
        }
    }

    fn bullet(&mut self, text: &str) {
        for (i, line) in wrap_text(text, BODY_WRAP - 5).into_iter().enumerate() {
            let line = if i == 0 { format!("- {line}") } else { format!("  {line}") };
            self.text(&line, 9.0, LEFT + 5.0, Font::Regular, 4.5);
        }
    }

    fn table_row(&mut self, cells: &[&str; 5], font: Font) {
        self.ensure_room(5.0);
        let font_ref = match font {
            Font::Regular => &self.regular,
            Font::Bold => &self.bold,
        };
        for (cell, (x, width)) in cells.iter().zip(TABLE_LAYOUT) {
            self.layer
                .use_text(latin1(&truncate(cell, width)), 8.5, Mm(x), self.y, font_ref);
        }
        self.y -= Mm(5.0);
    }

    fn gap(&mut self, mm: f32) {
        self.y -= Mm(mm);
    }

    fn finish(self) -> Result<Vec<u8>, RenderError> {
        let mut buf = BufWriter::new(Vec::new());
        self.doc
            .save(&mut buf)
            .map_err(|e| RenderError::Save(e.to_string()))?;
        buf.into_inner()
            .map_err(|e| RenderError::Save(e.to_string()))
    }
}

/// `patient_name` becomes `Patient name`
fn capitalize_key(key: &str) -> String {
    let spaced = key.trim().replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}

fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if current.chars().count() + word.chars().count() + 1 > max_chars && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Fold text into what the built-in fonts can draw
fn latin1(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '•' | '–' | '—' | '−' => out.push('-'),
            '‘' | '’' => out.push('\''),
            '“' | '”' => out.push('"'),
            '…' => out.push_str("..."),
            '\t' => out.push(' '),
            c if (c as u32) < 0x20 => {}
            c if (c as u32) <= 0xFF => out.push(c),
            _ => {}
        }
    }
    out
}
