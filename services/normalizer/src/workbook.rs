//! In-memory workbook model.
//!
//! Every source (multi-sheet spreadsheet or flat CSV) is read into the same
//! `Workbook` shape: named sheets of rows of string / number / blank cells.
//! Row and column positions are absolute, so header row indices reported by the
//! locator match what a spreadsheet application shows (0-based).

use crate::config::SourceFormat;
use crate::error::IngestError;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
}

impl Cell {
    /// Empty cells and whitespace-only strings count as blank.
    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            Cell::Number(_) => false,
        }
    }

    /// Trimmed textual form; integral numbers print without a fraction.
    pub fn text(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.trim().to_string(),
            Cell::Number(n) => format_number(*n),
        }
    }
}

impl From<&Data> for Cell {
    fn from(data: &Data) -> Self {
        match data {
            Data::Empty => Cell::Empty,
            Data::String(s) => Cell::Text(s.clone()),
            Data::Float(f) => Cell::Number(*f),
            Data::Int(i) => Cell::Number(*i as f64),
            Data::Bool(b) => Cell::Text(b.to_string()),
            Data::DateTime(dt) => Cell::Number(dt.as_f64()),
            Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
            Data::Error(e) => Cell::Text(e.to_string()),
        }
    }
}

pub(crate) fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<Cell>>,
}

impl Sheet {
    pub fn new(name: impl Into<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self {
            name: name.into(),
            rows,
        }
    }

    /// (rows, widest row)
    pub fn size(&self) -> (usize, usize) {
        let width = self.rows.iter().map(Vec::len).max().unwrap_or(0);
        (self.rows.len(), width)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workbook {
    /// Source identifier the workbook was loaded for.
    pub id: String,
    pub sheets: Vec<Sheet>,
    /// `sha256:<hex>` of the raw file bytes.
    pub content_hash: String,
}

impl Workbook {
    pub fn new(id: impl Into<String>, sheets: Vec<Sheet>) -> Self {
        Self {
            id: id.into(),
            sheets,
            content_hash: String::new(),
        }
    }

    /// Read a source file from disk.
    pub fn open(path: &Path, format: SourceFormat, id: &str) -> Result<Workbook, IngestError> {
        let bytes = std::fs::read(path)?;
        let content_hash = hash_bytes(&bytes);

        let sheets = match format {
            SourceFormat::Workbook => read_spreadsheet(bytes)?,
            SourceFormat::Csv => {
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| id.to_string());
                vec![parse_csv(&decode_text(&bytes), &name)?]
            }
        };

        Ok(Workbook {
            id: id.to_string(),
            sheets,
            content_hash,
        })
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// Read every sheet of an xls/xlsx/xlsb/ods container.
fn read_spreadsheet(bytes: Vec<u8>) -> Result<Vec<Sheet>, IngestError> {
    // calamine auto-detects the container format from the bytes
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))?;
    let names = workbook.sheet_names().to_vec();

    let mut sheets = Vec::with_capacity(names.len());
    for name in names {
        let range = workbook.worksheet_range(&name)?;

        // Ranges start at the first used cell; pad back to absolute positions.
        let (row_offset, col_offset) = range
            .start()
            .map(|(r, c)| (r as usize, c as usize))
            .unwrap_or((0, 0));

        let mut rows: Vec<Vec<Cell>> = vec![Vec::new(); row_offset];
        for row in range.rows() {
            let mut cells = vec![Cell::Empty; col_offset];
            cells.extend(row.iter().map(Cell::from));
            rows.push(cells);
        }
        sheets.push(Sheet::new(name, rows));
    }
    Ok(sheets)
}

/// Decode CSV bytes: UTF-8 (BOM stripped), else Windows-1252 as exported by
/// older spreadsheet tools.
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.strip_prefix('\u{feff}').unwrap_or(s).to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Parse CSV content into a single sheet. Cells stay textual so codes such as
/// `0880` keep their leading zeros; coercion happens in the mapper.
pub fn parse_csv(content: &str, sheet_name: &str) -> Result<Sheet, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(content.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(
            record
                .iter()
                .map(|field| {
                    if field.trim().is_empty() {
                        Cell::Empty
                    } else {
                        Cell::Text(field.to_string())
                    }
                })
                .collect(),
        );
    }
    Ok(Sheet::new(sheet_name, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_text_formats_integral_numbers() {
        assert_eq!(Cell::Number(2019.0).text(), "2019");
        assert_eq!(Cell::Number(87.3).text(), "87.3");
        assert_eq!(Cell::Text("  Denver County 1 ".into()).text(), "Denver County 1");
        assert_eq!(Cell::Empty.text(), "");
    }

    #[test]
    fn test_cell_blank() {
        assert!(Cell::Empty.is_blank());
        assert!(Cell::Text("   ".into()).is_blank());
        assert!(!Cell::Number(0.0).is_blank());
        assert!(!Cell::Text("*".into()).is_blank());
    }

    #[test]
    fn test_cell_from_calamine_data() {
        assert_eq!(Cell::from(&Data::Int(42)), Cell::Number(42.0));
        assert_eq!(Cell::from(&Data::Float(0.5)), Cell::Number(0.5));
        assert_eq!(Cell::from(&Data::Empty), Cell::Empty);
        assert_eq!(
            Cell::from(&Data::String("District Name".into())),
            Cell::Text("District Name".into())
        );
        assert_eq!(Cell::from(&Data::Bool(true)), Cell::Text("true".into()));
    }

    #[test]
    fn test_parse_csv_keeps_text_and_blanks() {
        let sheet = parse_csv("Code,Name,Count\n0880,Denver County 1,\n", "enrollment").unwrap();
        assert_eq!(sheet.name, "enrollment");
        assert_eq!(sheet.rows.len(), 2);
        assert_eq!(sheet.rows[1][0], Cell::Text("0880".into()));
        assert_eq!(sheet.rows[1][2], Cell::Empty);
    }

    #[test]
    fn test_parse_csv_ragged_rows() {
        let sheet = parse_csv("Report title\nA,B,C\n1,2,3\n", "s").unwrap();
        assert_eq!(sheet.rows[0].len(), 1);
        assert_eq!(sheet.size(), (3, 3));
    }

    #[test]
    fn test_decode_text_strips_bom() {
        let bytes = "\u{feff}District Name,Count\n".as_bytes();
        assert_eq!(decode_text(bytes), "District Name,Count\n");
    }

    #[test]
    fn test_decode_text_windows_1252_fallback() {
        // "Cañon City" with 0xF1 for ñ
        let bytes = b"Ca\xf1on City RE-1";
        assert_eq!(decode_text(bytes), "Cañon City RE-1");
    }

    #[test]
    fn test_open_csv_from_disk_hashes_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frl_2019.csv");
        std::fs::write(&path, "District Name,Free Lunch\nAdams 14,120\n").unwrap();

        let workbook = Workbook::open(&path, SourceFormat::Csv, "frl-2019").unwrap();
        assert_eq!(workbook.id, "frl-2019");
        assert_eq!(workbook.sheet_names(), vec!["frl_2019"]);
        assert!(workbook.content_hash.starts_with("sha256:"));
        assert_eq!(workbook.content_hash.len(), "sha256:".len() + 64);

        let again = Workbook::open(&path, SourceFormat::Csv, "frl-2019").unwrap();
        assert_eq!(workbook, again);
    }

    #[test]
    fn test_open_missing_file_is_io_error() {
        let result = Workbook::open(Path::new("/nonexistent/x.xlsx"), SourceFormat::Workbook, "x");
        assert!(matches!(result, Err(IngestError::Io(_))));
    }

    #[test]
    fn test_open_garbage_workbook_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.xlsx");
        std::fs::write(&path, b"definitely not a zip container").unwrap();
        let result = Workbook::open(&path, SourceFormat::Workbook, "broken");
        assert!(result.is_err());
    }
}
