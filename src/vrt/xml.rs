//! Editing GDAL VRT documents and reading the raster attribute tables shipped in
//! `.aux.xml` sidecars.
use crate::error::VrtError;
use anyhow::Result;
use roxmltree::{Document, Node};
use std::fs;
use std::ops::Range;
use std::path::Path;

pub const BAND_DESCRIPTIONS: [&str; 3] = ["Elevation", "Uncertainty", "Contributor"];
pub const CONTRIBUTOR_BAND: u32 = 3;

/// Largest count GDAL readers accept for an integer pixel count column.
const MAX_COUNT: i64 = i32::MAX as i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldType {
    Integer = 0,
    Real = 1,
    String = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Usage {
    Generic = 0,
    PixelCount = 1,
    MinMax = 5,
}

struct RatField {
    name: &'static str,
    kind: FieldType,
    usage: Usage,
}

const fn field(name: &'static str, kind: FieldType, usage: Usage) -> RatField {
    RatField { name, kind, usage }
}

/// Columns of the contributor band table, in order.
const RAT_FIELDS: [RatField; 18] = [
    field("value", FieldType::Integer, Usage::MinMax),
    field("count", FieldType::Integer, Usage::PixelCount),
    field("data_assessment", FieldType::Integer, Usage::Generic),
    field("feature_least_depth", FieldType::Real, Usage::Generic),
    field("significant_features", FieldType::Real, Usage::Generic),
    field("feature_size", FieldType::Real, Usage::Generic),
    field("coverage", FieldType::Integer, Usage::Generic),
    field("bathy_coverage", FieldType::Integer, Usage::Generic),
    field("horizontal_uncert_fixed", FieldType::Real, Usage::Generic),
    field("horizontal_uncert_var", FieldType::Real, Usage::Generic),
    field("vertical_uncert_fixed", FieldType::Real, Usage::Generic),
    field("vertical_uncert_var", FieldType::Real, Usage::Generic),
    field("license_name", FieldType::String, Usage::Generic),
    field("license_url", FieldType::String, Usage::Generic),
    field("source_survey_id", FieldType::String, Usage::Generic),
    field("source_institution", FieldType::String, Usage::Generic),
    field("survey_date_start", FieldType::String, Usage::Generic),
    field("survey_date_end", FieldType::String, Usage::Generic),
];

/// Contributor table rows, one string per column of `RAT_FIELDS`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RasterAttributeTable {
    pub rows: Vec<Vec<String>>,
}

impl RasterAttributeTable {
    pub fn read_aux_xml(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content, &path.display().to_string())?)
    }

    /// Reads the table of the contributor band, checking its columns follow the expected order.
    pub fn parse(content: &str, name: &str) -> Result<Self, VrtError> {
        let malformed = |reason: String| VrtError::Malformed(name.to_string(), reason);
        let doc = Document::parse(content).map_err(|e| malformed(e.to_string()))?;

        let table = contributor_table(&doc)
            .ok_or_else(|| malformed("no raster attribute table".to_string()))?;

        let columns: Vec<String> = table
            .children()
            .filter(|n| n.has_tag_name("FieldDefn"))
            .map(|n| child_text(n, "Name").to_lowercase())
            .collect();
        let expected: Vec<&str> = RAT_FIELDS.iter().map(|f| f.name).collect();
        if columns.len() > expected.len()
            || columns.iter().zip(&expected).any(|(found, want)| found != want)
        {
            return Err(VrtError::FieldOrder {
                path: name.to_string(),
                expected: expected.join(","),
                found: columns.join(","),
            });
        }

        let rows = table
            .children()
            .filter(|n| n.has_tag_name("Row"))
            .map(|row| {
                let mut values: Vec<String> = row
                    .children()
                    .filter(|n| n.has_tag_name("F"))
                    .map(|f| f.text().unwrap_or_default().to_string())
                    .collect();
                values.resize(RAT_FIELDS.len(), String::new());
                values
            })
            .collect();
        Ok(Self { rows })
    }

    /// Folds `other` in. Rows sharing a `value` keep the first row's attributes and sum counts.
    pub fn merge(&mut self, other: Self) {
        for row in other.rows {
            match self.rows.iter_mut().find(|r| r[0] == row[0]) {
                Some(existing) => {
                    let count = (parse_count(&existing[1]) + parse_count(&row[1])).min(MAX_COUNT);
                    existing[1] = count.to_string();
                }
                None => self.rows.push(row),
            }
        }
    }

    pub fn to_xml(&self, indent: &str) -> String {
        let mut xml = format!("{indent}<GDALRasterAttributeTable tableType=\"thematic\">\n");
        for (idx, field) in RAT_FIELDS.iter().enumerate() {
            xml.push_str(&format!(
                "{indent}  <FieldDefn index=\"{idx}\">\n{indent}    <Name>{}</Name>\n{indent}    <Type>{}</Type>\n{indent}    <Usage>{}</Usage>\n{indent}  </FieldDefn>\n",
                field.name, field.kind as u8, field.usage as u8
            ));
        }
        for (idx, row) in self.rows.iter().enumerate() {
            xml.push_str(&format!("{indent}  <Row index=\"{idx}\">\n"));
            for (value, field) in row.iter().zip(RAT_FIELDS.iter()) {
                let value = match field.kind {
                    FieldType::Integer | FieldType::Real => numeric(value),
                    FieldType::String => escape(value),
                };
                xml.push_str(&format!("{indent}    <F>{value}</F>\n"));
            }
            xml.push_str(&format!("{indent}  </Row>\n"));
        }
        xml.push_str(&format!("{indent}</GDALRasterAttributeTable>\n"));
        xml
    }
}

fn is_table(node: &Node) -> bool {
    node.has_tag_name("GDALRasterAttributeTable")
}

/// The table of band 3, or failing that the first table in the document.
fn contributor_table<'a, 'input>(doc: &'a Document<'input>) -> Option<Node<'a, 'input>> {
    doc.descendants()
        .filter(|n| n.has_tag_name("PAMRasterBand") || n.has_tag_name("VRTRasterBand"))
        .find(|n| n.attribute("band").and_then(|b| b.parse().ok()) == Some(CONTRIBUTOR_BAND))
        .and_then(|band| band.children().find(is_table))
        .or_else(|| doc.descendants().find(is_table))
}

fn child_text(node: Node, tag: &str) -> String {
    node.children()
        .find(|n| n.has_tag_name(tag))
        .and_then(|n| n.text())
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn parse_count(value: &str) -> i64 {
    value.trim().parse::<f64>().map(|v| v as i64).unwrap_or(0)
}

fn numeric(value: &str) -> String {
    match value.trim() {
        "" => "0".to_string(),
        v => escape(v),
    }
}

pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Replacements on byte ranges of the original text.
fn apply_edits(content: &str, mut edits: Vec<(Range<usize>, String)>) -> String {
    edits.sort_by(|a, b| b.0.start.cmp(&a.0.start));
    let mut out = content.to_string();
    for (range, text) in edits {
        out.replace_range(range, &text);
    }
    out
}

fn raster_bands<'a, 'input>(
    doc: &'a Document<'input>,
) -> impl Iterator<Item = (u32, Node<'a, 'input>)> {
    doc.descendants()
        .filter(|n| n.has_tag_name("VRTRasterBand"))
        .filter_map(|n| Some((n.attribute("band")?.parse().ok()?, n)))
}

/// Byte offset just past the start tag of `node`.
fn after_start_tag(content: &str, node: Node) -> Option<usize> {
    let start = node.range().start;
    content[start..].find('>').map(|i| start + i + 1)
}

fn indent_of(content: &str, node: Node) -> String {
    let start = node.range().start;
    let line_start = content[..start].rfind('\n').map(|i| i + 1).unwrap_or(0);
    content[line_start..start]
        .chars()
        .take_while(|c| c.is_whitespace())
        .collect()
}

pub fn set_band_descriptions(content: &str, name: &str) -> Result<String, VrtError> {
    let doc = Document::parse(content).map_err(|e| VrtError::Malformed(name.into(), e.to_string()))?;
    let mut edits = vec![];
    let mut described = 0;
    for (band, node) in raster_bands(&doc) {
        let Some(description) = BAND_DESCRIPTIONS.get((band as usize).wrapping_sub(1)) else {
            continue;
        };
        let element = format!("<Description>{}</Description>", escape(description));
        match node.children().find(|n| n.has_tag_name("Description")) {
            Some(existing) => edits.push((existing.range(), element)),
            None => {
                let at = after_start_tag(content, node)
                    .ok_or_else(|| VrtError::Malformed(name.into(), "unterminated band".into()))?;
                let indent = format!("{}  ", indent_of(content, node));
                edits.push((at..at, format!("\n{indent}{element}")));
            }
        }
        described += 1;
    }
    if described < BAND_DESCRIPTIONS.len() {
        return Err(VrtError::Malformed(
            name.into(),
            format!("expected {} bands, found {}", BAND_DESCRIPTIONS.len(), described),
        ));
    }
    Ok(apply_edits(content, edits))
}

/// Replaces any attribute table on `band` with `rat`.
pub fn attach_rat(
    content: &str,
    name: &str,
    band: u32,
    rat: &RasterAttributeTable,
) -> Result<String, VrtError> {
    let malformed = |reason: &str| VrtError::Malformed(name.into(), reason.into());
    let doc = Document::parse(content).map_err(|e| malformed(&e.to_string()))?;
    let (_, node) = raster_bands(&doc)
        .find(|(b, _)| *b == band)
        .ok_or_else(|| malformed("missing contributor band"))?;

    const CLOSE: &str = "</VRTRasterBand>";
    let end = node.range().end;
    if !content[..end].ends_with(CLOSE) {
        return Err(malformed("unexpected band closing tag"));
    }
    let close_at = end - CLOSE.len();
    let line_start = content[..close_at].rfind('\n').map(|i| i + 1).unwrap_or(close_at);
    let insert_at = if content[line_start..close_at].trim().is_empty() {
        line_start
    } else {
        close_at
    };

    let mut edits: Vec<(Range<usize>, String)> = node
        .children()
        .filter(|n| n.has_tag_name("GDALRasterAttributeTable"))
        .map(|n| (n.range(), String::new()))
        .collect();
    let indent = format!("{}  ", indent_of(content, node));
    edits.push((insert_at..insert_at, rat.to_xml(&indent)));
    Ok(apply_edits(content, edits))
}

/// Rewrites an XML file in place.
pub fn rewrite(path: &Path, edit: impl FnOnce(&str, &str) -> Result<String, VrtError>) -> Result<()> {
    let content = fs::read_to_string(path)?;
    let updated = edit(&content, &path.display().to_string())?;
    fs::write(path, updated)?;
    Ok(())
}
