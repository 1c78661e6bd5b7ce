//! Row Schema Mapper
//!
//! Header names drift every year ("Organization Name" vs "District Name",
//! "Free Lunch" vs "Free Lunch Count"). A schema lists, for each canonical
//! field, the aliases it has been exported under; the first alias present in
//! the header wins. Columns are resolved once per sheet, then applied to every
//! data row.

use crate::coerce::Sentinels;
use crate::config::{FieldSpec, RowFilter, SchemaConfig};
use crate::entity::collapse_whitespace;
use crate::extract::extract_year;
use crate::workbook::Cell;
use indexmap::IndexMap;

/// One data row keyed by raw header text. Ephemeral.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub source_id: String,
    pub sheet: String,
    /// 0-based row index within the sheet.
    pub row: usize,
    pub cells: IndexMap<String, Cell>,
}

impl RawRecord {
    pub fn get(&self, header: &str) -> Option<&Cell> {
        self.cells.get(header)
    }

    pub fn location(&self) -> String {
        format!("sheet='{}':row={}", self.sheet, self.row + 1)
    }
}

/// Why a row produced no record. Skips are expected, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    BlankEntity,
    TotalRow(String),
    MissingColumns(Vec<String>),
    Filtered { column: String, value: String },
    NoYear,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Record(RawRecord),
    Skipped(SkipReason),
}

/// A schema field bound to a header column.
#[derive(Debug, Clone)]
pub struct ResolvedField<'a> {
    pub header: String,
    pub spec: &'a FieldSpec,
    pub sentinels: Sentinels,
    /// Observation year taken from the header itself (year-column layout).
    pub year: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct SchemaMapper<'a> {
    schema: &'a SchemaConfig,
    source_id: String,
    sheet: String,
    headers: Vec<String>,
    entity: Option<String>,
    code: Option<String>,
    year: Option<String>,
    fields: Vec<ResolvedField<'a>>,
    filters: Vec<(String, &'a RowFilter)>,
    missing: Vec<String>,
}

fn header_text(cell: &Cell) -> String {
    collapse_whitespace(&cell.text())
}

/// First alias present in the header (exact, case-insensitive), as the
/// header's own spelling.
fn find_column(headers: &[String], aliases: &[String], year: Option<i32>) -> Option<String> {
    aliases.iter().find_map(|alias| {
        let alias = match year {
            Some(y) => alias.replace("{year}", &y.to_string()),
            None => alias.clone(),
        };
        let wanted = collapse_whitespace(&alias).to_lowercase();
        headers
            .iter()
            .find(|h| !h.is_empty() && h.to_lowercase() == wanted)
            .cloned()
    })
}

/// Headers that are a bare year, e.g. `2019 | 2023 | 2024` in multi-year
/// summary exports.
fn year_headers(headers: &[String]) -> Vec<(String, i32)> {
    headers
        .iter()
        .filter(|h| h.len() == 4 && h.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|h| extract_year(h).map(|year| (h.clone(), year)))
        .collect()
}

impl<'a> SchemaMapper<'a> {
    /// Resolve schema columns against a header row. `default_year` fills
    /// `{year}` placeholders in aliases.
    pub fn new(schema: &'a SchemaConfig, header_row: &[Cell], default_year: Option<i32>) -> Self {
        let headers: Vec<String> = header_row.iter().map(header_text).collect();
        let mut missing = Vec::new();

        let entity = find_column(&headers, &schema.entity.aliases, default_year);
        if entity.is_none() {
            missing.push("entity".to_string());
        }
        let code = schema
            .entity_code
            .as_ref()
            .and_then(|c| find_column(&headers, &c.aliases, default_year));
        let year = schema
            .year
            .as_ref()
            .and_then(|c| find_column(&headers, &c.aliases, default_year));

        let mut fields = Vec::new();
        for spec in &schema.fields {
            let sentinels = Sentinels::resolve(spec.sentinels.as_ref(), schema.sentinels.as_ref());
            if spec.year_columns {
                let by_year = year_headers(&headers);
                if !by_year.is_empty() {
                    fields.extend(by_year.into_iter().map(|(header, year)| ResolvedField {
                        header,
                        spec,
                        sentinels: sentinels.clone(),
                        year: Some(year),
                    }));
                    continue;
                }
            }
            match find_column(&headers, &spec.aliases, default_year) {
                Some(header) => fields.push(ResolvedField {
                    header,
                    spec,
                    sentinels,
                    year: None,
                }),
                None if spec.required => missing.push(spec.metric.clone()),
                None => {}
            }
        }
        if fields.is_empty() {
            missing.extend(
                schema
                    .fields
                    .iter()
                    .filter(|f| !f.required)
                    .map(|f| f.metric.clone()),
            );
        }

        let mut filters = Vec::new();
        for filter in &schema.filters {
            match find_column(&headers, &filter.aliases, default_year) {
                Some(header) => filters.push((header, filter)),
                None => missing.push(filter.aliases.first().cloned().unwrap_or_default()),
            }
        }

        Self {
            schema,
            source_id: String::new(),
            sheet: String::new(),
            headers,
            entity,
            code,
            year,
            fields,
            filters,
            missing,
        }
    }

    /// Attach the source and sheet identifiers carried by produced records.
    pub fn with_origin(mut self, source_id: &str, sheet: &str) -> Self {
        self.source_id = source_id.to_string();
        self.sheet = sheet.to_string();
        self
    }

    pub fn schema(&self) -> &'a SchemaConfig {
        self.schema
    }

    /// Canonical names of required columns absent from the header.
    pub fn missing_columns(&self) -> &[String] {
        &self.missing
    }

    pub fn fields(&self) -> &[ResolvedField<'a>] {
        &self.fields
    }

    pub fn map_row(&self, row_index: usize, row: &[Cell]) -> RowOutcome {
        if !self.missing.is_empty() {
            return RowOutcome::Skipped(SkipReason::MissingColumns(self.missing.clone()));
        }

        let mut cells = IndexMap::new();
        for (idx, header) in self.headers.iter().enumerate() {
            if header.is_empty() {
                continue;
            }
            let cell = row.get(idx).cloned().unwrap_or(Cell::Empty);
            cells.entry(header.clone()).or_insert(cell);
        }
        let record = RawRecord {
            source_id: self.source_id.clone(),
            sheet: self.sheet.clone(),
            row: row_index,
            cells,
        };

        let name = self.entity_name(&record).unwrap_or_default();
        if name.is_empty() {
            return RowOutcome::Skipped(SkipReason::BlankEntity);
        }
        let code = self.entity_code(&record);
        for marker in &self.schema.total_markers {
            let is_total = name.eq_ignore_ascii_case(marker.trim())
                || code
                    .as_deref()
                    .is_some_and(|c| c.eq_ignore_ascii_case(marker.trim()));
            if is_total {
                return RowOutcome::Skipped(SkipReason::TotalRow(marker.clone()));
            }
        }

        for (header, filter) in &self.filters {
            let value = record.get(header).map(header_text).unwrap_or_default();
            if !filter.equals.iter().any(|accepted| accepted.eq_ignore_ascii_case(&value)) {
                return RowOutcome::Skipped(SkipReason::Filtered {
                    column: header.clone(),
                    value,
                });
            }
        }

        RowOutcome::Record(record)
    }

    pub fn entity_name(&self, record: &RawRecord) -> Option<String> {
        self.text_of(record, self.entity.as_deref())
    }

    pub fn entity_code(&self, record: &RawRecord) -> Option<String> {
        self.text_of(record, self.code.as_deref())
    }

    pub fn year_text(&self, record: &RawRecord) -> Option<String> {
        self.text_of(record, self.year.as_deref())
    }

    fn text_of(&self, record: &RawRecord, header: Option<&str>) -> Option<String> {
        header
            .and_then(|h| record.get(h))
            .map(header_text)
            .filter(|s| !s.is_empty())
    }
}

/// Map a single data row against its header row.
pub fn map_row(header_row: &[Cell], data_row: &[Cell], schema: &SchemaConfig) -> RowOutcome {
    SchemaMapper::new(schema, header_row, None).map_row(0, data_row)
}
