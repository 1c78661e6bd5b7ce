//! Record extraction: mapped rows -> canonical records.
//!
//! Resolves the observation year, coerces every mapped field, and applies the
//! per-source rollup (school rows -> district totals, grade rows -> district
//! average) and derived metrics (free + reduced lunch over enrollment).

use crate::coerce::{coerce, Coerced};
use crate::config::{DerivedMetric, RollupMode};
use crate::entity::{display_form, EntityKey};
use crate::mapper::{RawRecord, SchemaMapper, SkipReason};
use crate::model::{CanonicalRecord, Provenance, Reading, ValueKind};
use crate::workbook::Cell;
use std::collections::BTreeMap;

const MIN_YEAR: i32 = 1990;
const MAX_YEAR: i32 = 2100;

/// Per-source settings carried onto every record.
#[derive(Debug, Clone)]
pub struct ExtractContext<'a> {
    pub source_id: &'a str,
    pub source_quality: i32,
    /// Year used when the row has no year column.
    pub default_year: Option<i32>,
    pub key_with_code: bool,
    /// Location prefix, e.g. `xlsx` or `csv`.
    pub format_tag: &'a str,
}

/// First standalone 4-digit year in `text`: `2023-2024` -> 2023,
/// `2019 CMAS ELA` -> 2019. Longer digit runs such as codes are ignored.
pub fn extract_year(text: &str) -> Option<i32> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i - start == 4 {
                if let Ok(year) = text[start..i].parse::<i32>() {
                    if (MIN_YEAR..=MAX_YEAR).contains(&year) {
                        return Some(year);
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    None
}

/// Canonical records for one mapped row. Blank cells produce nothing.
pub fn extract_records(
    record: &RawRecord,
    mapper: &SchemaMapper<'_>,
    ctx: &ExtractContext<'_>,
) -> Result<Vec<CanonicalRecord>, SkipReason> {
    let name = mapper.entity_name(record).ok_or(SkipReason::BlankEntity)?;
    let row_year = mapper
        .year_text(record)
        .and_then(|t| extract_year(&t))
        .or(ctx.default_year);
    if row_year.is_none() && mapper.fields().iter().any(|f| f.year.is_none()) {
        return Err(SkipReason::NoYear);
    }

    let code = if ctx.key_with_code {
        mapper.entity_code(record)
    } else {
        None
    };
    let entity_key = EntityKey::new(&name, code.as_deref());
    let provenance = Provenance::new(ctx.source_id, format!("{}:{}", ctx.format_tag, record.location()));

    let mut records = Vec::new();
    for field in mapper.fields() {
        let Some(year) = field.year.or(row_year) else {
            continue;
        };
        let cell = record.get(&field.header).unwrap_or(&Cell::Empty);
        let reading = match coerce(cell, field.spec.coerce, &field.sentinels) {
            Coerced::Blank => continue,
            Coerced::Reading(reading) => reading,
        };
        records.push(CanonicalRecord {
            entity_key: entity_key.clone(),
            entity_display_name: display_form(&name),
            entity_code: code.clone(),
            year,
            family: field.spec.family.clone(),
            metric: field.spec.metric.clone(),
            reading,
            kind: if field.spec.coerce.is_percentage() {
                ValueKind::Fraction
            } else {
                ValueKind::Number
            },
            source_quality: ctx.source_quality,
            provenance: provenance.clone(),
        });
    }
    Ok(records)
}

type SlotKey = (EntityKey, String, String, i32);

fn slot(record: &CanonicalRecord) -> SlotKey {
    (
        record.entity_key.clone(),
        record.family.clone(),
        record.metric.clone(),
        record.year,
    )
}

/// Combine records of one source that share (entity, family, metric, year).
/// Unavailable members are ignored; a group without values keeps its first note.
pub fn rollup(records: Vec<CanonicalRecord>, mode: RollupMode) -> Vec<CanonicalRecord> {
    if mode == RollupMode::None {
        return records;
    }

    let mut groups: BTreeMap<SlotKey, Vec<CanonicalRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(slot(&record)).or_default().push(record);
    }

    groups
        .into_values()
        .filter_map(|group| {
            let values: Vec<f64> = group.iter().filter_map(CanonicalRecord::value).collect();
            let rows = group.len();
            let mut combined = group.into_iter().next()?;
            if !values.is_empty() {
                let total: f64 = values.iter().sum();
                let value = match mode {
                    RollupMode::Mean => total / values.len() as f64,
                    _ => total,
                };
                combined.reading = Reading::Value(value);
            }
            if rows > 1 {
                combined.provenance.location =
                    format!("{} (+{} rows)", combined.provenance.location, rows - 1);
            }
            Some(combined)
        })
        .collect()
}

/// Derived ratio metrics, computed per (entity, year) where the denominator
/// was observed.
pub fn derive(records: &[CanonicalRecord], derived: &[DerivedMetric]) -> Vec<CanonicalRecord> {
    if derived.is_empty() {
        return Vec::new();
    }

    let mut by_entity_year: BTreeMap<(EntityKey, i32), Vec<&CanonicalRecord>> = BTreeMap::new();
    for record in records {
        by_entity_year
            .entry((record.entity_key.clone(), record.year))
            .or_default()
            .push(record);
    }

    let mut out = Vec::new();
    for group in by_entity_year.values() {
        for metric in derived {
            let Some(denominator) = group.iter().find(|r| r.metric == metric.denominator) else {
                continue;
            };
            let numerators: Vec<&&CanonicalRecord> = group
                .iter()
                .filter(|r| metric.numerators.contains(&r.metric))
                .collect();
            if numerators.is_empty() {
                continue;
            }

            let values: Vec<f64> = numerators.iter().filter_map(|r| r.value()).collect();
            let reading = match denominator.value() {
                Some(d) if d > 0.0 && !values.is_empty() => {
                    Reading::Value(values.iter().sum::<f64>() / d)
                }
                Some(d) if d > 0.0 => Reading::Unavailable(format!(
                    "insufficient data: no {} value",
                    metric.numerators.join("/")
                )),
                _ => Reading::Unavailable(format!(
                    "insufficient data: {} unavailable",
                    metric.denominator
                )),
            };

            out.push(CanonicalRecord {
                entity_key: denominator.entity_key.clone(),
                entity_display_name: denominator.entity_display_name.clone(),
                entity_code: denominator.entity_code.clone(),
                year: denominator.year,
                family: metric.family.clone(),
                metric: metric.metric.clone(),
                reading,
                kind: ValueKind::Fraction,
                source_quality: denominator.source_quality,
                provenance: Provenance::new(
                    denominator.provenance.source_id.clone(),
                    format!("derived:{}", denominator.provenance.location),
                ),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnSpec, Coercion, FieldSpec, SchemaConfig};
    use crate::mapper::RowOutcome;

    fn row(cells: &[&str]) -> Vec<Cell> {
        cells
            .iter()
            .map(|c| if c.is_empty() { Cell::Empty } else { Cell::Text(c.to_string()) })
            .collect()
    }

    fn schema() -> SchemaConfig {
        SchemaConfig {
            entity: ColumnSpec {
                aliases: vec!["District Name".into()],
            },
            entity_code: Some(ColumnSpec {
                aliases: vec!["School Code".into()],
            }),
            key_with_code: false,
            year: Some(ColumnSpec {
                aliases: vec!["School Year".into()],
            }),
            fields: vec![
                FieldSpec {
                    metric: "enrollment".into(),
                    family: "enrollment_trends".into(),
                    aliases: vec!["PK-12 Total".into()],
                    coerce: Coercion::Number,
                    required: false,
                    sentinels: None,
                    year_columns: false,
                },
                FieldSpec {
                    metric: "attendance_rate".into(),
                    family: "attendance".into(),
                    aliases: vec!["Attendance Rate".into()],
                    coerce: Coercion::Percent,
                    required: false,
                    sentinels: None,
                    year_columns: false,
                },
            ],
            total_markers: vec!["TOTAL".into()],
            filters: vec![],
            derived: vec![],
            sentinels: None,
        }
    }

    fn ctx(default_year: Option<i32>) -> ExtractContext<'static> {
        ExtractContext {
            source_id: "attendance-2019",
            source_quality: 2,
            default_year,
            key_with_code: false,
            format_tag: "xlsx",
        }
    }

    fn extract(header: &[&str], data: &[&str], ctx: &ExtractContext) -> Result<Vec<CanonicalRecord>, SkipReason> {
        let schema = schema();
        let mapper = SchemaMapper::new(&schema, &row(header), ctx.default_year).with_origin(ctx.source_id, "Sheet1");
        match mapper.map_row(7, &row(data)) {
            RowOutcome::Record(raw) => extract_records(&raw, &mapper, ctx),
            RowOutcome::Skipped(reason) => Err(reason),
        }
    }

    fn count(entity: &str, year: i32, metric: &str, reading: Reading, location: &str) -> CanonicalRecord {
        CanonicalRecord {
            entity_key: EntityKey::new(entity, None),
            entity_display_name: entity.into(),
            entity_code: None,
            year,
            family: "enrollment_trends".into(),
            metric: metric.into(),
            reading,
            kind: ValueKind::Number,
            source_quality: 1,
            provenance: Provenance::new("frl-2019", location),
        }
    }

    // -------------------------------------------------------------------------
    // YEAR RESOLUTION
    // -------------------------------------------------------------------------

    #[test]
    fn test_extract_year_patterns() {
        assert_eq!(extract_year("2023-2024"), Some(2023));
        assert_eq!(extract_year("2019 CMAS ELA and Math"), Some(2019));
        assert_eq!(extract_year("2016-17_PK-12_PupilMembership"), Some(2016));
        assert_eq!(extract_year("code 123456 then 2018"), Some(2018));
        assert_eq!(extract_year("Sheet1"), None);
        assert_eq!(extract_year("1850"), None);
    }

    #[test]
    fn test_year_column_wins_over_default() {
        let records = extract(
            &["School Year", "District Name", "PK-12 Total"],
            &["2021-2022", "Adams 14", "7000"],
            &ctx(Some(2019)),
        )
        .unwrap();
        assert_eq!(records[0].year, 2021);
    }

    #[test]
    fn test_default_year_when_no_column() {
        let records = extract(&["District Name", "PK-12 Total"], &["Adams 14", "7000"], &ctx(Some(2019))).unwrap();
        assert_eq!(records[0].year, 2019);
    }

    #[test]
    fn test_no_year_skips_row() {
        let result = extract(&["District Name", "PK-12 Total"], &["Adams 14", "7000"], &ctx(None));
        assert_eq!(result, Err(SkipReason::NoYear));
    }

    // -------------------------------------------------------------------------
    // RECORD CONTENT
    // -------------------------------------------------------------------------

    #[test]
    fn test_records_carry_kind_quality_and_provenance() {
        let records = extract(
            &["District Name", "PK-12 Total", "Attendance Rate"],
            &["  DENVER   COUNTY 1 ", "92000", "91.2"],
            &ctx(Some(2019)),
        )
        .unwrap();
        assert_eq!(records.len(), 2);

        let enrollment = &records[0];
        assert_eq!(enrollment.metric, "enrollment");
        assert_eq!(enrollment.kind, ValueKind::Number);
        assert_eq!(enrollment.value(), Some(92000.0));
        assert_eq!(enrollment.entity_display_name, "DENVER COUNTY 1");
        assert_eq!(enrollment.entity_key.name(), "denver county 1");
        assert_eq!(enrollment.source_quality, 2);
        assert_eq!(enrollment.provenance.location, "xlsx:sheet='Sheet1':row=8");

        let rate = &records[1];
        assert_eq!(rate.family, "attendance");
        assert_eq!(rate.kind, ValueKind::Fraction);
        assert!((rate.value().unwrap() - 0.912).abs() < 1e-9);
    }

    #[test]
    fn test_blank_cells_produce_no_record_but_sentinels_do() {
        let records = extract(
            &["District Name", "PK-12 Total", "Attendance Rate"],
            &["Adams 14", "", "*"],
            &ctx(Some(2019)),
        )
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metric, "attendance_rate");
        assert_eq!(records[0].value(), None);
        assert_eq!(records[0].note(), Some("suppressed"));
    }

    #[test]
    fn test_key_with_code() {
        let mut c = ctx(Some(2019));
        c.key_with_code = true;
        let records = extract(
            &["School Code", "District Name", "PK-12 Total"],
            &["0880", "Denver County 1", "5"],
            &c,
        )
        .unwrap();
        assert_eq!(records[0].entity_key.code(), Some("880"));
        assert_eq!(records[0].entity_code.as_deref(), Some("0880"));
    }

    #[test]
    fn test_key_with_code_same_for_text_and_number_cells() {
        let schema = schema();
        let mut c = ctx(Some(2019));
        c.key_with_code = true;
        let header = row(&["School Code", "District Name", "PK-12 Total"]);
        let mapper = SchemaMapper::new(&schema, &header, c.default_year);

        let from_csv = row(&["0880", "Denver County 1", "5"]);
        let from_xlsx = vec![
            Cell::Number(880.0),
            Cell::Text("Denver County 1".into()),
            Cell::Number(5.0),
        ];
        let keys: Vec<EntityKey> = [from_csv, from_xlsx]
            .iter()
            .map(|data| match mapper.map_row(1, data) {
                RowOutcome::Record(raw) => extract_records(&raw, &mapper, &c).unwrap()[0].entity_key.clone(),
                RowOutcome::Skipped(reason) => panic!("unexpected skip: {:?}", reason),
            })
            .collect();
        assert_eq!(keys[0], keys[1]);
    }

    // -------------------------------------------------------------------------
    // YEAR COLUMNS
    // -------------------------------------------------------------------------

    fn year_column_schema() -> SchemaConfig {
        let mut schema = schema();
        schema.year = None;
        schema.fields = vec![FieldSpec {
            metric: "met_or_exceeded_pct".into(),
            family: "cmas_scores".into(),
            aliases: vec!["Percent Met or Exceeded Expectations".into(), "{year}".into()],
            coerce: Coercion::Percent,
            required: false,
            sentinels: None,
            year_columns: true,
        }];
        schema
    }

    fn extract_year_columns(ctx: &ExtractContext) -> Result<Vec<CanonicalRecord>, SkipReason> {
        let schema = year_column_schema();
        let header = row(&["District Name", "Grade", "2019", "2023", "2024"]);
        let mapper = SchemaMapper::new(&schema, &header, ctx.default_year);
        match mapper.map_row(4, &row(&["Adams 14", "All Grades", "31.5", "N/A", "28.0"])) {
            RowOutcome::Record(raw) => extract_records(&raw, &mapper, ctx),
            RowOutcome::Skipped(reason) => Err(reason),
        }
    }

    #[test]
    fn test_year_columns_emit_one_record_per_year() {
        let records = extract_year_columns(&ctx(Some(2024))).unwrap();
        let years: Vec<i32> = records.iter().map(|r| r.year).collect();
        assert_eq!(years, vec![2019, 2023, 2024]);
        assert!((records[0].value().unwrap() - 0.315).abs() < 1e-9);
        assert_eq!(records[1].value(), None);
        assert!(records[1].note().is_some());
        assert!((records[2].value().unwrap() - 0.28).abs() < 1e-9);
        assert!(records.iter().all(|r| r.kind == ValueKind::Fraction));
    }

    #[test]
    fn test_year_columns_need_no_source_year() {
        let records = extract_year_columns(&ctx(None)).unwrap();
        assert_eq!(records.len(), 3);
    }

    // -------------------------------------------------------------------------
    // ROLLUP
    // -------------------------------------------------------------------------

    #[test]
    fn test_rollup_sum_school_rows() {
        let records = vec![
            count("Adams 14", 2019, "enrollment", Reading::Value(300.0), "row=2"),
            count("ADAMS 14", 2019, "enrollment", Reading::Value(200.0), "row=3"),
            count("Adams 14", 2019, "enrollment", Reading::Unavailable("suppressed".into()), "row=4"),
            count("Mapleton 1", 2019, "enrollment", Reading::Value(50.0), "row=5"),
        ];
        let rolled = rollup(records, RollupMode::Sum);
        assert_eq!(rolled.len(), 2);
        assert_eq!(rolled[0].value(), Some(500.0));
        assert_eq!(rolled[0].entity_display_name, "Adams 14");
        assert_eq!(rolled[0].provenance.location, "row=2 (+2 rows)");
        assert_eq!(rolled[1].value(), Some(50.0));
        assert_eq!(rolled[1].provenance.location, "row=5");
    }

    #[test]
    fn test_rollup_mean() {
        let records = vec![
            count("Adams 14", 2019, "met", Reading::Value(0.30), "row=2"),
            count("Adams 14", 2019, "met", Reading::Value(0.40), "row=3"),
        ];
        let rolled = rollup(records, RollupMode::Mean);
        assert!((rolled[0].value().unwrap() - 0.35).abs() < 1e-12);
    }

    #[test]
    fn test_rollup_all_unavailable_keeps_note() {
        let records = vec![
            count("Adams 14", 2019, "met", Reading::Unavailable("suppressed".into()), "row=2"),
            count("Adams 14", 2019, "met", Reading::Unavailable("not reported".into()), "row=3"),
        ];
        let rolled = rollup(records, RollupMode::Mean);
        assert_eq!(rolled.len(), 1);
        assert_eq!(rolled[0].note(), Some("suppressed"));
    }

    #[test]
    fn test_rollup_none_is_identity() {
        let records = vec![
            count("Adams 14", 2019, "enrollment", Reading::Value(1.0), "row=2"),
            count("Adams 14", 2019, "enrollment", Reading::Value(2.0), "row=3"),
        ];
        assert_eq!(rollup(records.clone(), RollupMode::None), records);
    }

    // -------------------------------------------------------------------------
    // DERIVED METRICS
    // -------------------------------------------------------------------------

    fn frl_rate() -> Vec<DerivedMetric> {
        vec![DerivedMetric {
            metric: "frl_rate".into(),
            family: "enrollment_trends".into(),
            numerators: vec!["free_lunch".into(), "reduced_lunch".into()],
            denominator: "enrollment".into(),
        }]
    }

    #[test]
    fn test_derived_ratio() {
        let records = vec![
            count("Adams 14", 2019, "enrollment", Reading::Value(1000.0), "row=2"),
            count("Adams 14", 2019, "free_lunch", Reading::Value(600.0), "row=2"),
            count("Adams 14", 2019, "reduced_lunch", Reading::Unavailable("suppressed".into()), "row=2"),
        ];
        let derived = derive(&records, &frl_rate());
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].metric, "frl_rate");
        assert_eq!(derived[0].kind, ValueKind::Fraction);
        assert!((derived[0].value().unwrap() - 0.6).abs() < 1e-12);
        assert_eq!(derived[0].provenance.location, "derived:row=2");
    }

    #[test]
    fn test_derived_unavailable_with_note() {
        let records = vec![
            count("Adams 14", 2019, "enrollment", Reading::Value(0.0), "row=2"),
            count("Adams 14", 2019, "free_lunch", Reading::Value(10.0), "row=2"),
            count("Mapleton 1", 2019, "enrollment", Reading::Value(100.0), "row=3"),
            count("Mapleton 1", 2019, "free_lunch", Reading::Unavailable("suppressed".into()), "row=3"),
        ];
        let derived = derive(&records, &frl_rate());
        assert_eq!(derived.len(), 2);
        assert_eq!(derived[0].note(), Some("insufficient data: enrollment unavailable"));
        assert_eq!(
            derived[1].note(),
            Some("insufficient data: no free_lunch/reduced_lunch value")
        );
    }

    #[test]
    fn test_derived_requires_denominator_and_numerators() {
        let only_free = vec![count("Adams 14", 2019, "free_lunch", Reading::Value(10.0), "row=2")];
        assert!(derive(&only_free, &frl_rate()).is_empty());

        let only_enrollment = vec![count("Adams 14", 2019, "enrollment", Reading::Value(10.0), "row=2")];
        assert!(derive(&only_enrollment, &frl_rate()).is_empty());
    }
}
