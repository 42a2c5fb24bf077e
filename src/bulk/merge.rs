//! Insert-or-smart-merge decisions for one chunk of normalized records.
//!
//! The planner is pure: it sees the rows already stored under the chunk's
//! natural keys and returns what to write. Stores apply the plan inside the
//! same transaction that advances the job checkpoint.
use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use super::parser::{FieldValue, NormalizedRecord};
use super::schema::{FieldKind, RecordSchema};
use crate::database_ops::Store;

const AMOUNT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredRow {
    pub natural_key: String,
    pub cycle: i32,
    pub fields: BTreeMap<String, FieldValue>,
}

impl StoredRow {
    pub fn get(&self, field: &str) -> &FieldValue {
        self.fields.get(field).unwrap_or(&FieldValue::Null)
    }

    /// Project a field for one of the indexed storage columns.
    pub fn index_text(&self, field: Option<&str>) -> Option<String> {
        field.and_then(|f| self.get(f).as_text()).map(str::to_owned)
    }

    pub fn index_date(&self, field: Option<&str>) -> Option<chrono::NaiveDate> {
        field.and_then(|f| self.get(f).as_date())
    }

    pub fn index_amount(&self, field: Option<&str>) -> Option<f64> {
        field.and_then(|f| self.get(f).as_amount())
    }

    /// JSON object of every non-null field, as persisted in the `fields` column.
    pub fn fields_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Inverse of [`fields_json`](Self::fields_json); unknown keys read back as text.
    pub fn from_json(
        schema: &RecordSchema,
        natural_key: String,
        cycle: i32,
        json: &serde_json::Value,
    ) -> Self {
        let fields = json
            .as_object()
            .map(|obj| {
                obj.iter()
                    .map(|(k, v)| {
                        let kind = schema.kind_of(k).unwrap_or(FieldKind::Text);
                        (k.clone(), FieldValue::from_json(kind, v))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            natural_key,
            cycle,
            fields,
        }
    }
}

impl From<NormalizedRecord> for StoredRow {
    fn from(r: NormalizedRecord) -> Self {
        Self {
            natural_key: r.natural_key,
            cycle: r.cycle,
            fields: r.fields,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeCounts {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeAction {
    Insert(StoredRow),
    Update {
        row: StoredRow,
        changed: Vec<&'static str>,
    },
}

impl MergeAction {
    pub fn row(&self) -> &StoredRow {
        match self {
            MergeAction::Insert(row) | MergeAction::Update { row, .. } => row,
        }
    }
}

#[derive(Debug, Default)]
pub struct MergePlan {
    pub actions: Vec<MergeAction>,
    pub counts: MergeCounts,
}

impl MergePlan {
    pub fn inserts(&self) -> impl Iterator<Item = &StoredRow> {
        self.actions.iter().filter_map(|a| match a {
            MergeAction::Insert(row) => Some(row),
            MergeAction::Update { .. } => None,
        })
    }

    pub fn updates(&self) -> impl Iterator<Item = &StoredRow> {
        self.actions.iter().filter_map(|a| match a {
            MergeAction::Update { row, .. } => Some(row),
            MergeAction::Insert(_) => None,
        })
    }
}

fn differs(current: &FieldValue, incoming: &FieldValue) -> bool {
    match (current, incoming) {
        (FieldValue::Amount(a), FieldValue::Amount(b)) => (a - b).abs() > AMOUNT_EPSILON,
        (a, b) => a != b,
    }
}

/// Apply `incoming` onto `target`, returning the smart-merge fields that changed.
///
/// Only fields in the schema's smart-merge set are considered, and only
/// meaningful incoming values overwrite.
pub fn smart_merge(
    schema: &RecordSchema,
    target: &mut StoredRow,
    incoming: &NormalizedRecord,
) -> Vec<&'static str> {
    let mut changed = Vec::new();
    for &field in schema.smart_merge {
        let value = incoming.get(field);
        if !value.is_meaningful() {
            continue;
        }
        if differs(target.get(field), value) {
            target.fields.insert(field.to_string(), value.clone());
            changed.push(field);
        }
    }
    changed
}

enum Pending {
    Insert(StoredRow),
    Update {
        row: StoredRow,
        changed: Vec<&'static str>,
    },
    Unchanged(StoredRow),
}

/// Decide, per natural key, whether to insert, update or skip.
///
/// Every input record lands in exactly one count bucket. A key repeated inside
/// the batch folds onto the first occurrence; later copies count as updates
/// when they change something and as skips otherwise.
pub fn plan_merge(
    schema: &RecordSchema,
    existing: &HashMap<String, StoredRow>,
    records: Vec<NormalizedRecord>,
) -> MergePlan {
    let mut counts = MergeCounts::default();
    let mut order: Vec<String> = Vec::new();
    let mut pending: HashMap<String, Pending> = HashMap::with_capacity(records.len());

    for record in records {
        match pending.get_mut(&record.natural_key) {
            Some(slot) => {
                let delta = match &mut *slot {
                    Pending::Insert(row) | Pending::Unchanged(row) | Pending::Update { row, .. } => {
                        smart_merge(schema, row, &record)
                    }
                };
                if delta.is_empty() {
                    counts.skipped += 1;
                    continue;
                }
                counts.updated += 1;
                match slot {
                    Pending::Update { changed, .. } => {
                        for f in delta {
                            if !changed.contains(&f) {
                                changed.push(f);
                            }
                        }
                    }
                    Pending::Unchanged(row) => {
                        let row = std::mem::take(row);
                        *slot = Pending::Update {
                            row,
                            changed: delta,
                        };
                    }
                    Pending::Insert(_) => {}
                }
            }
            None => {
                let key = record.natural_key.clone();
                let entry = match existing.get(&key) {
                    None => {
                        counts.inserted += 1;
                        Pending::Insert(record.into())
                    }
                    Some(current) => {
                        let mut row = current.clone();
                        let changed = smart_merge(schema, &mut row, &record);
                        if changed.is_empty() {
                            counts.skipped += 1;
                            Pending::Unchanged(row)
                        } else {
                            counts.updated += 1;
                            Pending::Update { row, changed }
                        }
                    }
                };
                order.push(key.clone());
                pending.insert(key, entry);
            }
        }
    }

    let actions = order
        .into_iter()
        .filter_map(|key| match pending.remove(&key)? {
            Pending::Insert(row) => Some(MergeAction::Insert(row)),
            Pending::Update { row, changed } => Some(MergeAction::Update { row, changed }),
            Pending::Unchanged(_) => None,
        })
        .collect();

    MergePlan { actions, counts }
}

/// One-shot merge of a targeted record set outside any import job.
///
/// Runs the same transactional path as a chunk commit, without a checkpoint.
pub async fn merge_batch(
    store: &dyn Store,
    schema: &'static RecordSchema,
    records: Vec<NormalizedRecord>,
) -> anyhow::Result<MergeCounts> {
    if records.is_empty() {
        return Ok(MergeCounts::default());
    }
    store.merge_chunk(schema, records, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::schema::DataType;
    use chrono::NaiveDate;

    fn record(key: &str, amount: FieldValue, date: FieldValue, name: &str) -> NormalizedRecord {
        let mut fields = BTreeMap::new();
        fields.insert("sub_id".to_string(), FieldValue::Text(key.to_string()));
        fields.insert("amount".to_string(), amount);
        fields.insert("transaction_date".to_string(), date);
        fields.insert("contributor_name".to_string(), FieldValue::Text(name.to_string()));
        NormalizedRecord {
            natural_key: key.to_string(),
            cycle: 2024,
            fields,
        }
    }

    fn d(y: i32, m: u32, day: u32) -> FieldValue {
        FieldValue::Date(NaiveDate::from_ymd_opt(y, m, day).unwrap())
    }

    fn stored(records: &[NormalizedRecord]) -> HashMap<String, StoredRow> {
        records
            .iter()
            .cloned()
            .map(|r| (r.natural_key.clone(), StoredRow::from(r)))
            .collect()
    }

    #[test]
    fn inserts_absent_keys() {
        let schema = DataType::IndividualContributions.schema();
        let plan = plan_merge(
            schema,
            &HashMap::new(),
            vec![
                record("1", FieldValue::Amount(10.0), d(2024, 1, 2), "A"),
                record("2", FieldValue::Amount(20.0), d(2024, 1, 3), "B"),
            ],
        );
        assert_eq!(
            plan.counts,
            MergeCounts {
                inserted: 2,
                updated: 0,
                skipped: 0
            }
        );
        assert_eq!(plan.inserts().count(), 2);
    }

    #[test]
    fn reimport_of_identical_rows_is_all_skips() {
        let schema = DataType::IndividualContributions.schema();
        let rows = vec![
            record("1", FieldValue::Amount(10.0), d(2024, 1, 2), "A"),
            record("2", FieldValue::Amount(20.0), d(2024, 1, 3), "B"),
        ];
        let plan = plan_merge(schema, &stored(&rows), rows);
        assert_eq!(plan.counts.skipped, 2);
        assert_eq!(plan.counts.inserted + plan.counts.updated, 0);
        assert!(plan.actions.is_empty());
    }

    #[test]
    fn null_and_zero_never_overwrite_existing_values() {
        let schema = DataType::IndividualContributions.schema();
        let existing = stored(&[record("1", FieldValue::Amount(250.0), d(2024, 5, 1), "A")]);
        let plan = plan_merge(
            schema,
            &existing,
            vec![record("1", FieldValue::Amount(0.0), FieldValue::Null, "A")],
        );
        assert_eq!(plan.counts.skipped, 1);
        assert!(plan.actions.is_empty());
    }

    #[test]
    fn meaningful_changes_update_only_merge_fields() {
        let schema = DataType::IndividualContributions.schema();
        let existing = stored(&[record("1", FieldValue::Amount(250.0), d(2024, 5, 1), "Old Name")]);
        let plan = plan_merge(
            schema,
            &existing,
            vec![record("1", FieldValue::Amount(300.0), d(2024, 5, 1), "New Name")],
        );
        assert_eq!(plan.counts.updated, 1);
        match &plan.actions[0] {
            MergeAction::Update { row, changed } => {
                assert_eq!(changed, &vec!["amount"]);
                assert_eq!(row.get("amount"), &FieldValue::Amount(300.0));
                assert_eq!(row.get("contributor_name"), &FieldValue::Text("Old Name".into()));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_keys_in_batch_fold_into_one_write() {
        let schema = DataType::IndividualContributions.schema();
        let plan = plan_merge(
            schema,
            &HashMap::new(),
            vec![
                record("1", FieldValue::Amount(10.0), FieldValue::Null, "A"),
                record("1", FieldValue::Amount(10.0), FieldValue::Null, "A"),
                record("1", FieldValue::Amount(15.0), d(2024, 2, 2), "A"),
            ],
        );
        assert_eq!(plan.counts.inserted, 1);
        assert_eq!(plan.counts.skipped, 1);
        assert_eq!(plan.counts.updated, 1);
        assert_eq!(plan.actions.len(), 1);
        let row = plan.actions[0].row();
        assert_eq!(row.get("amount"), &FieldValue::Amount(15.0));
        assert_eq!(row.get("transaction_date"), &d(2024, 2, 2));
    }

    #[test]
    fn unchanged_existing_row_becomes_update_when_a_later_duplicate_changes_it() {
        let schema = DataType::IndividualContributions.schema();
        let base = record("1", FieldValue::Amount(10.0), d(2024, 1, 1), "A");
        let plan = plan_merge(
            schema,
            &stored(std::slice::from_ref(&base)),
            vec![
                base.clone(),
                record("1", FieldValue::Amount(12.0), d(2024, 1, 1), "A"),
            ],
        );
        assert_eq!(plan.counts.skipped, 1);
        assert_eq!(plan.counts.updated, 1);
        assert!(matches!(
            &plan.actions[..],
            [MergeAction::Update { changed, .. }] if changed == &vec!["amount"]
        ));
    }

    #[test]
    fn fields_json_round_trips_through_schema_kinds() {
        let schema = DataType::IndividualContributions.schema();
        let row = StoredRow::from(record("9", FieldValue::Amount(1.5), d(2023, 12, 31), "Z"));
        let back = StoredRow::from_json(schema, "9".into(), 2024, &row.fields_json());
        assert_eq!(back.get("transaction_date"), &d(2023, 12, 31));
        assert_eq!(back.get("amount"), &FieldValue::Amount(1.5));
        assert_eq!(back.get("contributor_name"), &FieldValue::Text("Z".into()));
    }
}
