use std::collections::BTreeMap;

use atoi::atoi;
use chrono::NaiveDate;
use csv::StringRecord;
use memchr::memchr_iter;
use rayon::prelude::*;
use serde_json::Value;
use tracing::warn;

use super::schema::{ColumnMap, FieldKind, RecordSchema};

/// A typed field value after coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Amount(f64),
    Date(NaiveDate),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Whether the value carries information worth writing over an existing one.
    pub fn is_meaningful(&self) -> bool {
        match self {
            FieldValue::Null => false,
            FieldValue::Text(s) => !s.is_empty(),
            FieldValue::Amount(v) => *v != 0.0,
            FieldValue::Date(_) => true,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_amount(&self) -> Option<f64> {
        match self {
            FieldValue::Amount(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Amount(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        }
    }

    /// Rebuild a value read back from storage, using the schema's kind to
    /// tell dates apart from text.
    pub fn from_json(kind: FieldKind, value: &Value) -> FieldValue {
        match (kind, value) {
            (_, Value::Null) => FieldValue::Null,
            (FieldKind::Amount, Value::Number(n)) => {
                n.as_f64().map(FieldValue::Amount).unwrap_or(FieldValue::Null)
            }
            (FieldKind::Date, Value::String(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(FieldValue::Date)
                .unwrap_or(FieldValue::Null),
            (_, Value::String(s)) => FieldValue::Text(s.clone()),
            (_, other) => FieldValue::Text(other.to_string()),
        }
    }
}

/// Parser output: canonical field name → typed value, tagged with the natural key.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub natural_key: String,
    pub cycle: i32,
    pub fields: BTreeMap<String, FieldValue>,
}

impl NormalizedRecord {
    pub fn get(&self, field: &str) -> &FieldValue {
        self.fields.get(field).unwrap_or(&FieldValue::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingNaturalKey { field: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSkip {
    pub line: u64,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRow {
    Record {
        record: NormalizedRecord,
        /// Fields that needed a lossy fallback (e.g. a non-numeric amount).
        warnings: u32,
    },
    Skip(ParseSkip),
}

/// Parsed contents of one chunk, in source order.
#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub records: Vec<NormalizedRecord>,
    pub skipped: u64,
    pub data_warnings: u64,
}

/// Turns raw rows into normalized records for one schema and cycle.
#[derive(Debug, Clone)]
pub struct RecordParser {
    schema: &'static RecordSchema,
    columns: ColumnMap,
    cycle: i32,
}

impl RecordParser {
    pub fn new(schema: &'static RecordSchema, columns: ColumnMap, cycle: i32) -> Self {
        Self {
            schema,
            columns,
            cycle,
        }
    }

    pub fn schema(&self) -> &'static RecordSchema {
        self.schema
    }

    pub fn parse(&self, line: u64, row: &StringRecord) -> ParsedRow {
        let mut fields = BTreeMap::new();
        let mut warnings = 0u32;
        for spec in self.schema.fields {
            let raw = self
                .columns
                .position(spec.name)
                .and_then(|idx| row.get(idx))
                .unwrap_or("");
            let value = match spec.kind {
                FieldKind::Text => parse_text(raw),
                FieldKind::Date => parse_date(raw)
                    .map(FieldValue::Date)
                    .unwrap_or(FieldValue::Null),
                FieldKind::Amount => match parse_amount(raw) {
                    AmountParse::Empty => FieldValue::Null,
                    AmountParse::Value(v) => FieldValue::Amount(v),
                    AmountParse::Garbled => {
                        warnings += 1;
                        warn!(
                            target: "fec::parser",
                            line,
                            field = spec.name,
                            raw,
                            "non-numeric amount; defaulting to 0.0"
                        );
                        FieldValue::Amount(0.0)
                    }
                },
            };
            fields.insert(spec.name.to_string(), value);
        }

        let mut parts = Vec::with_capacity(self.schema.natural_key.fields.len() + 1);
        for key_field in self.schema.natural_key.fields {
            match fields.get(*key_field).and_then(FieldValue::as_text) {
                Some(v) => parts.push(v.to_string()),
                None => {
                    return ParsedRow::Skip(ParseSkip {
                        line,
                        reason: SkipReason::MissingNaturalKey { field: *key_field },
                    })
                }
            }
        }
        if self.schema.natural_key.scoped_by_cycle {
            parts.push(self.cycle.to_string());
        }

        if self.schema.data_type == super::schema::DataType::IndividualContributions {
            let category = contributor_category(
                fields.get("entity_type").and_then(FieldValue::as_text),
                fields.get("transaction_type").and_then(FieldValue::as_text),
                fields.get("other_id").and_then(FieldValue::as_text),
            );
            fields.insert(
                "contributor_category".to_string(),
                FieldValue::Text(category.as_str().to_string()),
            );
        }

        ParsedRow::Record {
            record: NormalizedRecord {
                natural_key: parts.join(":"),
                cycle: self.cycle,
                fields,
            },
            warnings,
        }
    }

    /// Parse a chunk in parallel on the current rayon pool, keeping row order.
    pub fn parse_batch(&self, rows: &[(u64, StringRecord)]) -> ParsedBatch {
        let parsed: Vec<ParsedRow> = rows
            .par_iter()
            .map(|(line, row)| self.parse(*line, row))
            .collect();
        let mut out = ParsedBatch {
            records: Vec::with_capacity(parsed.len()),
            ..ParsedBatch::default()
        };
        for row in parsed {
            match row {
                ParsedRow::Record { record, warnings } => {
                    out.data_warnings += u64::from(warnings);
                    out.records.push(record);
                }
                ParsedRow::Skip(_) => out.skipped += 1,
            }
        }
        out
    }
}

fn parse_text(raw: &str) -> FieldValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        FieldValue::Null
    } else {
        FieldValue::Text(trimmed.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AmountParse {
    Empty,
    Value(f64),
    Garbled,
}

/// Parse a currency amount as it appears in FEC files.
///
/// `$` and `,` are dropped, `(12.50)` and `12.50-` are negative, and a value
/// with several decimal points is cut at the second one (`0.00.00.00` → `0.00`).
pub fn parse_amount(raw: &str) -> AmountParse {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return AmountParse::Empty;
    }
    let (negative, body) = if let Some(inner) =
        trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')'))
    {
        (true, inner)
    } else if let Some(inner) = trimmed.strip_suffix('-') {
        (true, inner)
    } else {
        (false, trimmed)
    };
    let cleaned: Vec<u8> = body
        .bytes()
        .filter(|b| !matches!(b, b'$' | b',' | b' '))
        .collect();
    let cut = memchr_iter(b'.', &cleaned).nth(1).unwrap_or(cleaned.len());
    let digits = &cleaned[..cut];
    if digits.is_empty() {
        return AmountParse::Garbled;
    }
    match std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite())
    {
        Some(v) if negative => AmountParse::Value(-v),
        Some(v) => AmountParse::Value(v),
        None => AmountParse::Garbled,
    }
}

/// Parse an FEC date. Accepts `MMDDYYYY`, `YYYY-MM-DD`, `MM/DD/YYYY` and
/// `DD-MON-YY`; anything else is `None`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() == 8 && bytes.iter().all(u8::is_ascii_digit) {
        let month = atoi::<u32>(&bytes[0..2])?;
        let day = atoi::<u32>(&bytes[2..4])?;
        let year = atoi::<i32>(&bytes[4..8])?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }
    ["%Y-%m-%d", "%m/%d/%Y", "%d-%b-%y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContributorCategory {
    Individual,
    Pac,
    Party,
    Committee,
}

impl ContributorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContributorCategory::Individual => "individual",
            ContributorCategory::Pac => "pac",
            ContributorCategory::Party => "party",
            ContributorCategory::Committee => "committee",
        }
    }
}

/// Classify a Schedule A contributor.
///
/// Precedence: entity type code, then transaction type code, then a
/// committee id in `other_id`; unknown combinations count as individuals.
pub fn contributor_category(
    entity_type: Option<&str>,
    transaction_type: Option<&str>,
    other_id: Option<&str>,
) -> ContributorCategory {
    match entity_type.map(|s| s.to_ascii_uppercase()).as_deref() {
        Some("IND") | Some("CAN") => return ContributorCategory::Individual,
        Some("PAC") => return ContributorCategory::Pac,
        Some("PTY") => return ContributorCategory::Party,
        Some("CCM") | Some("COM") | Some("ORG") => return ContributorCategory::Committee,
        _ => {}
    }
    match transaction_type.map(|s| s.to_ascii_uppercase()).as_deref() {
        Some("15") | Some("15E") | Some("15J") | Some("10") | Some("11") => {
            return ContributorCategory::Individual
        }
        Some("24K") | Some("24Z") | Some("24E") | Some("24C") => return ContributorCategory::Pac,
        Some("18K") | Some("18G") | Some("18J") => return ContributorCategory::Committee,
        _ => {}
    }
    if other_id.is_some_and(|id| id.starts_with('C') && id.len() == 9) {
        return ContributorCategory::Committee;
    }
    ContributorCategory::Individual
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::schema::DataType;

    fn contribution_row(sub_id: &str, date: &str, amount: &str) -> StringRecord {
        let mut cols = vec![""; 21];
        cols[0] = "C00123456";
        cols[5] = "15";
        cols[6] = "IND";
        cols[7] = "DOE, JANE";
        cols[13] = date;
        cols[14] = amount;
        cols[20] = sub_id;
        StringRecord::from(cols)
    }

    fn contributions_parser() -> RecordParser {
        let schema = DataType::IndividualContributions.schema();
        RecordParser::new(schema, schema.resolve_columns(None).unwrap(), 2024)
    }

    #[test]
    fn truncates_amounts_at_second_decimal_point() {
        assert_eq!(parse_amount("0.00.00.00"), AmountParse::Value(0.0));
        assert_eq!(parse_amount("12.50.7"), AmountParse::Value(12.5));
    }

    #[test]
    fn strips_currency_formatting() {
        assert_eq!(parse_amount("$1,234.56"), AmountParse::Value(1234.56));
        assert_eq!(parse_amount(" 250 "), AmountParse::Value(250.0));
        assert_eq!(parse_amount("-75"), AmountParse::Value(-75.0));
        assert_eq!(parse_amount("(40.00)"), AmountParse::Value(-40.0));
        assert_eq!(parse_amount(""), AmountParse::Empty);
        assert_eq!(parse_amount("N/A"), AmountParse::Garbled);
        assert_eq!(parse_amount("75-"), AmountParse::Value(-75.0));
        assert_eq!(parse_amount("$1,250.00-"), AmountParse::Value(-1250.0));
        assert_eq!(parse_amount("-"), AmountParse::Garbled);
        assert_eq!(parse_amount("$"), AmountParse::Garbled);
    }

    #[test]
    fn parses_mmddyyyy_dates() {
        assert_eq!(parse_date("11192025"), NaiveDate::from_ymd_opt(2025, 11, 19));
        assert_eq!(parse_date("2024-03-01"), NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(parse_date("03/15/2022"), NaiveDate::from_ymd_opt(2022, 3, 15));
        assert_eq!(parse_date("15-OCT-24"), NaiveDate::from_ymd_opt(2024, 10, 15));
    }

    #[test]
    fn bad_dates_become_null() {
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_date("abc"), None);
        assert_eq!(parse_date("1119202"), None);
        assert_eq!(parse_date("13452025"), None);
        assert_eq!(parse_date("1119202a"), None);
    }

    #[test]
    fn parses_contribution_row() {
        let parser = contributions_parser();
        let row = contribution_row("4123", "01152024", "$500.00");
        let ParsedRow::Record { record, warnings } = parser.parse(1, &row) else {
            panic!("expected record");
        };
        assert_eq!(warnings, 0);
        assert_eq!(record.natural_key, "4123");
        assert_eq!(record.cycle, 2024);
        assert_eq!(record.get("amount"), &FieldValue::Amount(500.0));
        assert_eq!(
            record.get("transaction_date"),
            &FieldValue::Date(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap())
        );
        assert_eq!(record.get("memo_text"), &FieldValue::Null);
        assert_eq!(
            record.get("contributor_category"),
            &FieldValue::Text("individual".into())
        );
    }

    #[test]
    fn garbled_amount_defaults_to_zero_with_warning() {
        let parser = contributions_parser();
        let row = contribution_row("77", "", "twelve");
        let ParsedRow::Record { record, warnings } = parser.parse(9, &row) else {
            panic!("expected record");
        };
        assert_eq!(warnings, 1);
        assert_eq!(record.get("amount"), &FieldValue::Amount(0.0));
        assert_eq!(record.get("transaction_date"), &FieldValue::Null);
    }

    #[test]
    fn blank_natural_key_is_skipped() {
        let parser = contributions_parser();
        let row = contribution_row("  ", "01152024", "10");
        assert_eq!(
            parser.parse(3, &row),
            ParsedRow::Skip(ParseSkip {
                line: 3,
                reason: SkipReason::MissingNaturalKey { field: "sub_id" },
            })
        );
    }

    #[test]
    fn cycle_scoped_keys_include_the_cycle() {
        let schema = DataType::CommitteeSummary.schema();
        let parser = RecordParser::new(schema, schema.resolve_columns(None).unwrap(), 2022);
        let mut cols = vec![""; 27];
        cols[0] = "C00999999";
        cols[5] = "1000";
        let ParsedRow::Record { record, .. } = parser.parse(1, &StringRecord::from(cols)) else {
            panic!("expected record");
        };
        assert_eq!(record.natural_key, "C00999999:2022");
    }

    #[test]
    fn batch_parse_keeps_order_and_counts() {
        let parser = contributions_parser();
        let rows = vec![
            (1, contribution_row("1", "01012024", "10")),
            (2, contribution_row("", "01012024", "10")),
            (3, contribution_row("3", "01012024", "oops")),
            (4, contribution_row("4", "01012024", "40")),
        ];
        let batch = parser.parse_batch(&rows);
        let keys: Vec<_> = batch.records.iter().map(|r| r.natural_key.as_str()).collect();
        assert_eq!(keys, vec!["1", "3", "4"]);
        assert_eq!(batch.skipped, 1);
        assert_eq!(batch.data_warnings, 1);
    }

    #[test]
    fn classifies_contributors() {
        use ContributorCategory::*;
        assert_eq!(contributor_category(Some("PAC"), Some("15"), None), Pac);
        assert_eq!(contributor_category(Some("pty"), None, None), Party);
        assert_eq!(contributor_category(Some("ORG"), None, None), Committee);
        assert_eq!(contributor_category(None, Some("24K"), None), Pac);
        assert_eq!(contributor_category(None, Some("18K"), None), Committee);
        assert_eq!(contributor_category(None, None, Some("C00401224")), Committee);
        assert_eq!(contributor_category(None, Some("99"), Some("H0XX00000")), Individual);
        assert_eq!(contributor_category(None, None, None), Individual);
    }

    #[test]
    fn field_values_survive_json_storage() {
        let date = FieldValue::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(FieldValue::from_json(FieldKind::Date, &date.to_json()), date);
        let amt = FieldValue::Amount(1234.56);
        assert_eq!(FieldValue::from_json(FieldKind::Amount, &amt.to_json()), amt);
        assert_eq!(
            FieldValue::from_json(FieldKind::Text, &Value::String("2024-02-29".into())),
            FieldValue::Text("2024-02-29".into())
        );
    }
}
