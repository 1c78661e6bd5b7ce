//! `inspect` subcommand: show what the locator sees in one file, to help
//! write schema aliases and sheet hints for a new export.

use crate::config::{SheetHints, SourceFormat};
use crate::error::IngestError;
use crate::locator::locate;
use crate::workbook::{Cell, Workbook};
use std::fmt::Write;
use std::path::Path;

/// Markers tried when none are given on the command line.
pub const DEFAULT_MARKERS: &[&str] = &[
    "District",
    "District Name",
    "Organization Name",
    "Level",
    "School Name",
];

/// Widest cell printed before truncation.
const MAX_CELL_WIDTH: usize = 24;

fn cell_preview(cell: &Cell) -> String {
    let text = cell.text().replace('\n', " ");
    if text.chars().count() > MAX_CELL_WIDTH {
        let cut: String = text.chars().take(MAX_CELL_WIDTH - 1).collect();
        format!("{cut}…")
    } else {
        text
    }
}

fn row_preview(row: &[Cell]) -> String {
    row.iter().map(cell_preview).collect::<Vec<_>>().join(" | ")
}

/// Text report: sheets with sizes, the located header row and the rows
/// after it.
pub fn describe(workbook: &Workbook, hints: &SheetHints, rows: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== {} ===", workbook.id);
    if !workbook.content_hash.is_empty() {
        let _ = writeln!(out, "Hash: {}", workbook.content_hash);
    }
    let _ = writeln!(out, "Sheets ({}):", workbook.sheets.len());
    for (i, sheet) in workbook.sheets.iter().enumerate() {
        let (height, width) = sheet.size();
        let _ = writeln!(out, "  [{:2}] '{}' {} rows x {} columns", i, sheet.name, height, width);
    }

    match locate(workbook, hints) {
        Ok(found) => {
            let sheet = &workbook.sheets[found.sheet];
            let _ = writeln!(
                out,
                "\nHeader: sheet '{}', row {} (0-based)",
                sheet.name, found.header_row
            );
            for (i, cell) in sheet.rows[found.header_row].iter().enumerate() {
                if !cell.is_blank() {
                    let _ = writeln!(out, "  [{:2}] {}", i, cell_preview(cell));
                }
            }
            let _ = writeln!(out, "\nFirst {} rows:", rows);
            for (idx, row) in sheet.rows.iter().enumerate().skip(found.header_row + 1).take(rows) {
                let _ = writeln!(out, "  {:>5}: {}", idx + 1, row_preview(row));
            }
        }
        Err(e) => {
            let _ = writeln!(out, "\nNo header row found: {e}");
            if let Some(sheet) = workbook.sheets.first() {
                let _ = writeln!(out, "\nFirst {} rows of '{}':", rows, sheet.name);
                for (idx, row) in sheet.rows.iter().enumerate().take(rows) {
                    let _ = writeln!(out, "  {:>5}: {}", idx + 1, row_preview(row));
                }
            }
        }
    }
    out
}

/// Open `path` and print its description to stdout.
pub fn inspect(path: &Path, rows: usize, markers: &[String]) -> Result<(), IngestError> {
    let format = SourceFormat::detect(path);
    let id = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let workbook = Workbook::open(path, format, &id)?;

    let hints = SheetHints {
        header_markers: if markers.is_empty() {
            DEFAULT_MARKERS.iter().map(|m| m.to_string()).collect()
        } else {
            markers.to_vec()
        },
        skip_sheets: vec!["Interpretation".into(), "Cheat Sheet".into()],
        ..SheetHints::default()
    };

    print!("{}", describe(&workbook, &hints, rows));
    Ok(())
}
