//! Record layouts for every FEC bulk data type the importer understands.
//!
//! The government pipe-delimited files carry no header row, so their layouts
//! are fixed column orders. Data types exported as headed CSV instead resolve
//! their columns through per-field alias lists, because the header spelling
//! drifts between years ("Cand_Id", "CAND_ID", "candidate_id", ...).
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    IndividualContributions,
    OperatingExpenditures,
    CandidateSummary,
    CommitteeSummary,
    CandidateMaster,
    CommitteeMaster,
    IndependentExpenditures,
}

impl DataType {
    pub const ALL: [DataType; 7] = [
        DataType::IndividualContributions,
        DataType::OperatingExpenditures,
        DataType::CandidateSummary,
        DataType::CommitteeSummary,
        DataType::CandidateMaster,
        DataType::CommitteeMaster,
        DataType::IndependentExpenditures,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::IndividualContributions => "individual_contributions",
            DataType::OperatingExpenditures => "operating_expenditures",
            DataType::CandidateSummary => "candidate_summary",
            DataType::CommitteeSummary => "committee_summary",
            DataType::CandidateMaster => "candidate_master",
            DataType::CommitteeMaster => "committee_master",
            DataType::IndependentExpenditures => "independent_expenditures",
        }
    }

    /// Storage table holding the normalized rows for this data type.
    pub fn table(&self) -> &'static str {
        match self {
            DataType::IndividualContributions => "fec_individual_contributions",
            DataType::OperatingExpenditures => "fec_operating_expenditures",
            DataType::CandidateSummary => "fec_candidate_summaries",
            DataType::CommitteeSummary => "fec_committee_summaries",
            DataType::CandidateMaster => "fec_candidates",
            DataType::CommitteeMaster => "fec_committees",
            DataType::IndependentExpenditures => "fec_independent_expenditures",
        }
    }

    /// File name published on the FEC bulk download site for a cycle.
    pub fn bulk_file_name(&self, cycle: i32) -> String {
        let yy = cycle.rem_euclid(100);
        match self {
            DataType::IndividualContributions => format!("indiv{yy:02}.zip"),
            DataType::OperatingExpenditures => format!("oppexp{yy:02}.zip"),
            DataType::CandidateSummary => format!("weball{yy:02}.zip"),
            DataType::CommitteeSummary => format!("webk{yy:02}.zip"),
            DataType::CandidateMaster => format!("cn{yy:02}.zip"),
            DataType::CommitteeMaster => format!("cm{yy:02}.zip"),
            DataType::IndependentExpenditures => format!("independent_expenditure_{cycle}.csv"),
        }
    }

    pub fn schema(&self) -> &'static RecordSchema {
        match self {
            DataType::IndividualContributions => &INDIVIDUAL_CONTRIBUTIONS,
            DataType::OperatingExpenditures => &OPERATING_EXPENDITURES,
            DataType::CandidateSummary => &CANDIDATE_SUMMARY,
            DataType::CommitteeSummary => &COMMITTEE_SUMMARY,
            DataType::CandidateMaster => &CANDIDATE_MASTER,
            DataType::CommitteeMaster => &COMMITTEE_MASTER,
            DataType::IndependentExpenditures => &INDEPENDENT_EXPENDITURES,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        DataType::ALL
            .into_iter()
            .find(|dt| dt.as_str() == wanted)
            .ok_or_else(|| anyhow::anyhow!("unknown FEC data type '{s}'"))
    }
}

/// Validates an election cycle: an even year in a range the FEC publishes.
pub fn validate_cycle(cycle: i32) -> anyhow::Result<i32> {
    if cycle % 2 != 0 || !(1980..=2100).contains(&cycle) {
        anyhow::bail!("cycle must be an even year between 1980 and 2100 (got {cycle})");
    }
    Ok(cycle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Amount,
    Date,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// Canonical field name used in normalized records and storage.
    pub name: &'static str,
    pub kind: FieldKind,
    /// Header spellings tried in priority order (headed CSV layouts only).
    pub aliases: &'static [&'static str],
    pub required: bool,
}

impl FieldSpec {
    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Text,
            aliases: &[],
            required: false,
        }
    }

    pub const fn amount(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Amount,
            aliases: &[],
            required: false,
        }
    }

    pub const fn date(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Date,
            aliases: &[],
            required: false,
        }
    }

    pub const fn aliased(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }

    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Headerless `|`-delimited file with a fixed column order.
    PipeDelimited,
    /// Comma-separated file whose first row is a header.
    HeadedCsv,
}

impl SourceFormat {
    pub fn delimiter(&self) -> u8 {
        match self {
            SourceFormat::PipeDelimited => b'|',
            SourceFormat::HeadedCsv => b',',
        }
    }

    pub fn has_headers(&self) -> bool {
        matches!(self, SourceFormat::HeadedCsv)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeySpec {
    /// Key components, joined with `:` when more than one.
    pub fields: &'static [&'static str],
    /// Append the cycle so per-cycle snapshots (summaries, masters) don't collide.
    pub scoped_by_cycle: bool,
}

/// Fields projected into the indexed storage columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexFields {
    pub committee_id: Option<&'static str>,
    pub candidate_id: Option<&'static str>,
    pub date: Option<&'static str>,
    pub amount: Option<&'static str>,
}

#[derive(Debug)]
pub struct RecordSchema {
    pub data_type: DataType,
    pub format: SourceFormat,
    pub fields: &'static [FieldSpec],
    pub natural_key: KeySpec,
    /// Fields the merge engine may overwrite on an existing row.
    pub smart_merge: &'static [&'static str],
    pub index: IndexFields,
}

impl RecordSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn kind_of(&self, name: &str) -> Option<FieldKind> {
        self.field(name).map(|f| f.kind)
    }

    pub fn amount_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields
            .iter()
            .filter(|f| f.kind == FieldKind::Amount)
            .map(|f| f.name)
    }

    pub fn date_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields
            .iter()
            .filter(|f| f.kind == FieldKind::Date)
            .map(|f| f.name)
    }

    /// Resolve one field against a header row by trying its aliases in order.
    pub fn resolve_field(&self, field: &'static FieldSpec, headers: &[String]) -> ColumnResolution {
        let normalized: Vec<String> = headers
            .iter()
            .map(|h| normalize_header(h))
            .collect();
        resolve_against(field, &normalized)
    }

    /// Map schema fields onto source column positions.
    ///
    /// Pipe-delimited layouts map positionally and ignore `headers`. Headed
    /// layouts fail when any required field has no matching column.
    pub fn resolve_columns(
        &'static self,
        headers: Option<&[String]>,
    ) -> Result<ColumnMap, SchemaResolutionError> {
        match self.format {
            SourceFormat::PipeDelimited => Ok(ColumnMap {
                positions: self
                    .fields
                    .iter()
                    .enumerate()
                    .map(|(idx, f)| (f.name, Some(idx)))
                    .collect(),
                expected_width: Some(self.fields.len()),
            }),
            SourceFormat::HeadedCsv => {
                let headers = headers.unwrap_or(&[]);
                let normalized: Vec<String> =
                    headers.iter().map(|h| normalize_header(h)).collect();
                let mut positions = Vec::with_capacity(self.fields.len());
                let mut missing = Vec::new();
                for field in self.fields {
                    match resolve_against(field, &normalized) {
                        ColumnResolution::Resolved { index, .. } => {
                            positions.push((field.name, Some(index)))
                        }
                        ColumnResolution::Missing { tried, .. } => {
                            if field.required {
                                missing.push(MissingField {
                                    field: field.name,
                                    tried,
                                });
                            }
                            positions.push((field.name, None));
                        }
                    }
                }
                if !missing.is_empty() {
                    return Err(SchemaResolutionError {
                        data_type: self.data_type,
                        missing,
                    });
                }
                Ok(ColumnMap {
                    positions,
                    expected_width: Some(headers.len()),
                })
            }
        }
    }
}

fn normalize_header(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('\u{feff}')
        .trim_matches('"')
        .to_ascii_lowercase()
}

fn resolve_against(field: &'static FieldSpec, normalized_headers: &[String]) -> ColumnResolution {
    let candidates: Vec<&'static str> = if field.aliases.is_empty() {
        vec![field.name]
    } else {
        field.aliases.to_vec()
    };
    for alias in candidates.iter().copied() {
        let wanted = alias.to_ascii_lowercase();
        if let Some(index) = normalized_headers.iter().position(|h| *h == wanted) {
            return ColumnResolution::Resolved {
                field: field.name,
                index,
                matched: alias,
            };
        }
    }
    ColumnResolution::Missing {
        field: field.name,
        tried: candidates,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnResolution {
    Resolved {
        field: &'static str,
        index: usize,
        matched: &'static str,
    },
    Missing {
        field: &'static str,
        tried: Vec<&'static str>,
    },
}

/// Field name → source column index (None when an optional column is absent).
#[derive(Debug, Clone)]
pub struct ColumnMap {
    pub positions: Vec<(&'static str, Option<usize>)>,
    /// Column count a well-formed line must have.
    pub expected_width: Option<usize>,
}

impl ColumnMap {
    pub fn position(&self, field: &str) -> Option<usize> {
        self.positions
            .iter()
            .find(|(name, _)| *name == field)
            .and_then(|(_, idx)| *idx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingField {
    pub field: &'static str,
    pub tried: Vec<&'static str>,
}

#[derive(Debug, Clone, Error)]
#[error("cannot resolve {data_type} columns: {}", describe_missing(.missing))]
pub struct SchemaResolutionError {
    pub data_type: DataType,
    pub missing: Vec<MissingField>,
}

fn describe_missing(missing: &[MissingField]) -> String {
    missing
        .iter()
        .map(|m| format!("{} (tried {})", m.field, m.tried.join("/")))
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Layouts
// ---------------------------------------------------------------------------

static INDIVIDUAL_CONTRIBUTIONS: RecordSchema = RecordSchema {
    data_type: DataType::IndividualContributions,
    format: SourceFormat::PipeDelimited,
    fields: &[
        FieldSpec::text("committee_id"),
        FieldSpec::text("amendment_indicator"),
        FieldSpec::text("report_type"),
        FieldSpec::text("transaction_pgi"),
        FieldSpec::text("image_number"),
        FieldSpec::text("transaction_type"),
        FieldSpec::text("entity_type"),
        FieldSpec::text("contributor_name"),
        FieldSpec::text("city"),
        FieldSpec::text("state"),
        FieldSpec::text("zip_code"),
        FieldSpec::text("employer"),
        FieldSpec::text("occupation"),
        FieldSpec::date("transaction_date"),
        FieldSpec::amount("amount"),
        FieldSpec::text("other_id"),
        FieldSpec::text("transaction_id"),
        FieldSpec::text("file_number"),
        FieldSpec::text("memo_code"),
        FieldSpec::text("memo_text"),
        FieldSpec::text("sub_id"),
    ],
    natural_key: KeySpec {
        fields: &["sub_id"],
        scoped_by_cycle: false,
    },
    smart_merge: &["transaction_date", "amount"],
    index: IndexFields {
        committee_id: Some("committee_id"),
        candidate_id: None,
        date: Some("transaction_date"),
        amount: Some("amount"),
    },
};

static OPERATING_EXPENDITURES: RecordSchema = RecordSchema {
    data_type: DataType::OperatingExpenditures,
    format: SourceFormat::PipeDelimited,
    fields: &[
        FieldSpec::text("committee_id"),
        FieldSpec::text("amendment_indicator"),
        FieldSpec::text("report_year"),
        FieldSpec::text("report_type"),
        FieldSpec::text("image_number"),
        FieldSpec::text("line_number"),
        FieldSpec::text("form_type"),
        FieldSpec::text("schedule_type"),
        FieldSpec::text("payee_name"),
        FieldSpec::text("city"),
        FieldSpec::text("state"),
        FieldSpec::text("zip_code"),
        FieldSpec::date("transaction_date"),
        FieldSpec::amount("amount"),
        FieldSpec::text("transaction_pgi"),
        FieldSpec::text("purpose"),
        FieldSpec::text("category"),
        FieldSpec::text("category_description"),
        FieldSpec::text("memo_code"),
        FieldSpec::text("memo_text"),
        FieldSpec::text("entity_type"),
        FieldSpec::text("sub_id"),
        FieldSpec::text("file_number"),
        FieldSpec::text("transaction_id"),
        FieldSpec::text("back_reference_transaction_id"),
    ],
    natural_key: KeySpec {
        fields: &["sub_id"],
        scoped_by_cycle: false,
    },
    smart_merge: &["transaction_date", "amount"],
    index: IndexFields {
        committee_id: Some("committee_id"),
        candidate_id: None,
        date: Some("transaction_date"),
        amount: Some("amount"),
    },
};

static CANDIDATE_SUMMARY: RecordSchema = RecordSchema {
    data_type: DataType::CandidateSummary,
    format: SourceFormat::PipeDelimited,
    fields: &[
        FieldSpec::text("candidate_id"),
        FieldSpec::text("candidate_name"),
        FieldSpec::text("incumbent_challenger_status"),
        FieldSpec::text("party_code"),
        FieldSpec::text("party_affiliation"),
        FieldSpec::amount("total_receipts"),
        FieldSpec::amount("transfers_from_authorized"),
        FieldSpec::amount("total_disbursements"),
        FieldSpec::amount("transfers_to_authorized"),
        FieldSpec::amount("cash_on_hand_beginning"),
        FieldSpec::amount("cash_on_hand_close"),
        FieldSpec::amount("candidate_contributions"),
        FieldSpec::amount("candidate_loans"),
        FieldSpec::amount("other_loans"),
        FieldSpec::amount("candidate_loan_repayments"),
        FieldSpec::amount("other_loan_repayments"),
        FieldSpec::amount("debts_owed_by"),
        FieldSpec::amount("total_individual_contributions"),
        FieldSpec::text("office_state"),
        FieldSpec::text("office_district"),
        FieldSpec::text("special_election_status"),
        FieldSpec::text("primary_election_status"),
        FieldSpec::text("runoff_election_status"),
        FieldSpec::text("general_election_status"),
        FieldSpec::amount("general_election_percent"),
        FieldSpec::amount("other_committee_contributions"),
        FieldSpec::amount("party_contributions"),
        FieldSpec::date("coverage_end_date"),
        FieldSpec::amount("individual_refunds"),
        FieldSpec::amount("committee_refunds"),
    ],
    natural_key: KeySpec {
        fields: &["candidate_id"],
        scoped_by_cycle: true,
    },
    smart_merge: &[
        "total_receipts",
        "total_disbursements",
        "cash_on_hand_beginning",
        "cash_on_hand_close",
        "debts_owed_by",
        "total_individual_contributions",
        "coverage_end_date",
    ],
    index: IndexFields {
        committee_id: None,
        candidate_id: Some("candidate_id"),
        date: Some("coverage_end_date"),
        amount: Some("total_receipts"),
    },
};

static COMMITTEE_SUMMARY: RecordSchema = RecordSchema {
    data_type: DataType::CommitteeSummary,
    format: SourceFormat::PipeDelimited,
    fields: &[
        FieldSpec::text("committee_id"),
        FieldSpec::text("committee_name"),
        FieldSpec::text("committee_type"),
        FieldSpec::text("committee_designation"),
        FieldSpec::text("filing_frequency"),
        FieldSpec::amount("total_receipts"),
        FieldSpec::amount("transfers_from_affiliates"),
        FieldSpec::amount("individual_contributions"),
        FieldSpec::amount("other_committee_contributions"),
        FieldSpec::amount("candidate_contributions"),
        FieldSpec::amount("candidate_loans"),
        FieldSpec::amount("total_loans_received"),
        FieldSpec::amount("total_disbursements"),
        FieldSpec::amount("transfers_to_affiliates"),
        FieldSpec::amount("individual_refunds"),
        FieldSpec::amount("other_committee_refunds"),
        FieldSpec::amount("candidate_loan_repayments"),
        FieldSpec::amount("loan_repayments"),
        FieldSpec::amount("cash_on_hand_beginning"),
        FieldSpec::amount("cash_on_hand_close"),
        FieldSpec::amount("debts_owed_by"),
        FieldSpec::amount("nonfederal_transfers_received"),
        FieldSpec::amount("contributions_to_other_committees"),
        FieldSpec::amount("independent_expenditures"),
        FieldSpec::amount("party_coordinated_expenditures"),
        FieldSpec::amount("nonfederal_share_expenditures"),
        FieldSpec::date("coverage_end_date"),
    ],
    natural_key: KeySpec {
        fields: &["committee_id"],
        scoped_by_cycle: true,
    },
    smart_merge: &[
        "total_receipts",
        "total_disbursements",
        "individual_contributions",
        "cash_on_hand_close",
        "debts_owed_by",
        "independent_expenditures",
        "coverage_end_date",
    ],
    index: IndexFields {
        committee_id: Some("committee_id"),
        candidate_id: None,
        date: Some("coverage_end_date"),
        amount: Some("total_receipts"),
    },
};

static CANDIDATE_MASTER: RecordSchema = RecordSchema {
    data_type: DataType::CandidateMaster,
    format: SourceFormat::PipeDelimited,
    fields: &[
        FieldSpec::text("candidate_id"),
        FieldSpec::text("candidate_name"),
        FieldSpec::text("party_affiliation"),
        FieldSpec::text("election_year"),
        FieldSpec::text("office_state"),
        FieldSpec::text("office"),
        FieldSpec::text("office_district"),
        FieldSpec::text("incumbent_challenger_status"),
        FieldSpec::text("candidate_status"),
        FieldSpec::text("principal_committee_id"),
        FieldSpec::text("street_1"),
        FieldSpec::text("street_2"),
        FieldSpec::text("city"),
        FieldSpec::text("state"),
        FieldSpec::text("zip_code"),
    ],
    natural_key: KeySpec {
        fields: &["candidate_id"],
        scoped_by_cycle: true,
    },
    smart_merge: &["party_affiliation", "candidate_status", "principal_committee_id"],
    index: IndexFields {
        committee_id: Some("principal_committee_id"),
        candidate_id: Some("candidate_id"),
        date: None,
        amount: None,
    },
};

static COMMITTEE_MASTER: RecordSchema = RecordSchema {
    data_type: DataType::CommitteeMaster,
    format: SourceFormat::PipeDelimited,
    fields: &[
        FieldSpec::text("committee_id"),
        FieldSpec::text("committee_name"),
        FieldSpec::text("treasurer_name"),
        FieldSpec::text("street_1"),
        FieldSpec::text("street_2"),
        FieldSpec::text("city"),
        FieldSpec::text("state"),
        FieldSpec::text("zip_code"),
        FieldSpec::text("committee_designation"),
        FieldSpec::text("committee_type"),
        FieldSpec::text("party_affiliation"),
        FieldSpec::text("filing_frequency"),
        FieldSpec::text("organization_type"),
        FieldSpec::text("connected_org_name"),
        FieldSpec::text("candidate_id"),
    ],
    natural_key: KeySpec {
        fields: &["committee_id"],
        scoped_by_cycle: true,
    },
    smart_merge: &[
        "committee_name",
        "treasurer_name",
        "committee_designation",
        "filing_frequency",
        "candidate_id",
    ],
    index: IndexFields {
        committee_id: Some("committee_id"),
        candidate_id: Some("candidate_id"),
        date: None,
        amount: None,
    },
};

static INDEPENDENT_EXPENDITURES: RecordSchema = RecordSchema {
    data_type: DataType::IndependentExpenditures,
    format: SourceFormat::HeadedCsv,
    fields: &[
        FieldSpec::text("candidate_id").aliased(&["cand_id", "candidate_id", "can_id"]),
        FieldSpec::text("candidate_name").aliased(&["cand_name", "candidate_name", "can_nam"]),
        FieldSpec::text("committee_id")
            .aliased(&["spe_id", "committee_id", "cmte_id", "filer_id"])
            .required(),
        FieldSpec::text("committee_name").aliased(&["spe_nam", "committee_name", "spender_name"]),
        FieldSpec::text("election_type").aliased(&["ele_type", "election_type"]),
        FieldSpec::text("office_state").aliased(&[
            "can_office_state",
            "cand_office_st",
            "candidate_office_state",
        ]),
        FieldSpec::text("office_district").aliased(&[
            "can_office_dis",
            "cand_office_district",
            "candidate_office_district",
        ]),
        FieldSpec::text("office").aliased(&["can_office", "cand_office", "candidate_office"]),
        FieldSpec::text("party_affiliation").aliased(&[
            "cand_pty_aff",
            "candidate_party",
            "cand_pty_affiliation",
        ]),
        FieldSpec::amount("amount")
            .aliased(&["exp_amo", "expenditure_amount", "exp_amt", "amount"])
            .required(),
        FieldSpec::date("expenditure_date").aliased(&["exp_date", "expenditure_date", "exp_dt"]),
        FieldSpec::amount("aggregate_amount").aliased(&["agg_amo", "aggregate_amount", "agg_amt"]),
        FieldSpec::text("support_oppose").aliased(&[
            "sup_opp",
            "support_oppose_indicator",
            "sup_opp_ind",
        ]),
        FieldSpec::text("purpose").aliased(&["pur", "purpose", "expenditure_description"]),
        FieldSpec::text("payee_name").aliased(&["pay", "payee_name", "payee"]),
        FieldSpec::text("file_number")
            .aliased(&["file_num", "file_number"])
            .required(),
        FieldSpec::text("amendment_indicator").aliased(&["amndt_ind", "amendment_indicator"]),
        FieldSpec::text("transaction_id")
            .aliased(&["tran_id", "transaction_id"])
            .required(),
        FieldSpec::text("image_number").aliased(&["image_num", "image_number"]),
        FieldSpec::date("receipt_date").aliased(&["receipt_dat", "receipt_date"]),
        FieldSpec::text("election_year").aliased(&["fec_election_yr", "election_year"]),
        FieldSpec::date("dissemination_date").aliased(&["dissem_dt", "dissemination_date"]),
    ],
    natural_key: KeySpec {
        fields: &["file_number", "transaction_id"],
        scoped_by_cycle: false,
    },
    smart_merge: &[
        "expenditure_date",
        "amount",
        "aggregate_amount",
        "dissemination_date",
    ],
    index: IndexFields {
        committee_id: Some("committee_id"),
        candidate_id: Some("candidate_id"),
        date: Some("expenditure_date"),
        amount: Some("amount"),
    },
};
