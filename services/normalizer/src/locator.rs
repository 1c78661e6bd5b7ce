//! Sheet Locator - finds the sheet and header row of a source workbook.
//!
//! Exports rarely put the header at row 0: title banners, footnotes and
//! "PRELIMINARY" notices sit above it. The locator scans the first rows of the
//! candidate sheets for a row that carries one of the expected header markers
//! and enough populated cells to not be a stray title.

use crate::config::SheetHints;
use crate::entity::collapse_whitespace;
use crate::error::IngestError;
use crate::workbook::{Sheet, Workbook};

/// A qualifying (sheet, header row) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    pub sheet: usize,
    pub header_row: usize,
}

/// First qualifying (sheet, row) pair, in sheet declaration order.
pub fn locate(workbook: &Workbook, hints: &SheetHints) -> Result<Located, IngestError> {
    candidate_sheets(workbook, hints)
        .into_iter()
        .find_map(|idx| {
            find_header_row(&workbook.sheets[idx], hints).map(|header_row| Located {
                sheet: idx,
                header_row,
            })
        })
        .ok_or_else(|| not_found(workbook, hints))
}

/// Every qualifying sheet, each with its first qualifying header row.
pub fn locate_all(workbook: &Workbook, hints: &SheetHints) -> Result<Vec<Located>, IngestError> {
    let found: Vec<Located> = candidate_sheets(workbook, hints)
        .into_iter()
        .filter_map(|idx| {
            find_header_row(&workbook.sheets[idx], hints).map(|header_row| Located {
                sheet: idx,
                header_row,
            })
        })
        .collect();

    if found.is_empty() {
        return Err(not_found(workbook, hints));
    }
    Ok(found)
}

fn not_found(workbook: &Workbook, hints: &SheetHints) -> IngestError {
    IngestError::SchemaNotFound {
        source_id: workbook.id.clone(),
        detail: format!(
            "markers {:?} not found within first {} rows of sheets {:?}",
            hints.header_markers,
            hints.scan_rows,
            workbook.sheet_names()
        ),
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Sheets matching a name hint, or every sheet when none match.
/// Skipped sheets are excluded either way.
fn candidate_sheets(workbook: &Workbook, hints: &SheetHints) -> Vec<usize> {
    let eligible: Vec<usize> = workbook
        .sheets
        .iter()
        .enumerate()
        .filter(|(_, s)| !hints.skip_sheets.iter().any(|skip| contains_ci(&s.name, skip)))
        .map(|(i, _)| i)
        .collect();

    let named: Vec<usize> = eligible
        .iter()
        .copied()
        .filter(|&i| {
            hints
                .sheet_names
                .iter()
                .any(|hint| contains_ci(&workbook.sheets[i].name, hint))
        })
        .collect();

    if named.is_empty() {
        eligible
    } else {
        named
    }
}

fn find_header_row(sheet: &Sheet, hints: &SheetHints) -> Option<usize> {
    let markers: Vec<String> = hints
        .header_markers
        .iter()
        .map(|m| collapse_whitespace(m).to_lowercase())
        .collect();

    sheet
        .rows
        .iter()
        .take(hints.scan_rows)
        .position(|row| {
            let non_empty = row.iter().filter(|c| !c.is_blank()).count();
            non_empty >= hints.min_non_empty
                && row.iter().any(|cell| {
                    let text = collapse_whitespace(&cell.text()).to_lowercase();
                    !text.is_empty() && markers.contains(&text)
                })
        })
}
