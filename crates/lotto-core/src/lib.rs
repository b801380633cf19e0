//! Core domain model for lottery draw ingestion.
//!
//! Providers hand over [`RawDrawRow`]s; the only way to obtain a
//! [`DrawRecord`] is through [`DrawRecord::try_from`], so every record held by
//! the store or compared by the reconciler has already passed the per-row
//! domain checks.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::ops::RangeInclusive;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotto-core";

pub const NUMBERS_PER_DRAW: usize = 6;
pub const SPECIALS_PER_DRAW: usize = 2;
pub const NUMBER_RANGE: RangeInclusive<i64> = 1..=50;
pub const SPECIAL_RANGE: RangeInclusive<i64> = 1..=6;

/// Sequential contest number assigned by the lottery operator.
pub type DrawId = u32;

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"];

/// Parse a draw date in any of the formats the sources publish.
pub fn parse_draw_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

/// Unvalidated row exactly as a provider extracted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDrawRow {
    pub draw_id: i64,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub numbers: Vec<i64>,
    #[serde(default)]
    pub specials: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawField {
    Date,
    Numbers,
    Specials,
}

impl fmt::Display for DrawField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Date => "date",
            Self::Numbers => "numbers",
            Self::Specials => "specials",
        };
        f.write_str(name)
    }
}

/// Why a single raw row cannot become a [`DrawRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowDefect {
    #[error("draw id must be positive, got {0}")]
    NonPositiveId(i64),
    #[error("draw id {0} does not fit a contest number")]
    IdOutOfRange(i64),
    #[error("date is missing")]
    MissingDate,
    #[error("date {0:?} is not a real calendar date")]
    InvalidDate(String),
    #[error("{field} must hold exactly {expected} values, found {found}")]
    WrongCount {
        field: DrawField,
        expected: usize,
        found: usize,
    },
    #[error("{field} value {value} outside [{min},{max}]")]
    OutOfRange {
        field: DrawField,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("{field} value {value} appears more than once")]
    Repeated { field: DrawField, value: i64 },
}

/// One validated lottery draw. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDrawRow", into = "RawDrawRow")]
pub struct DrawRecord {
    draw_id: DrawId,
    date: NaiveDate,
    numbers: [u8; NUMBERS_PER_DRAW],
    specials: [u8; SPECIALS_PER_DRAW],
}

impl DrawRecord {
    pub fn draw_id(&self) -> DrawId {
        self.draw_id
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn numbers(&self) -> &[u8; NUMBERS_PER_DRAW] {
        &self.numbers
    }

    pub fn specials(&self) -> &[u8; SPECIALS_PER_DRAW] {
        &self.specials
    }

    /// Rendered value of one field, used in divergence and conflict reports.
    pub fn field_value(&self, field: DrawField) -> String {
        match field {
            DrawField::Date => self.date.format("%Y-%m-%d").to_string(),
            DrawField::Numbers => format!("{:?}", self.numbers),
            DrawField::Specials => format!("{:?}", self.specials),
        }
    }

    /// Fields whose values differ between two records of the same draw.
    pub fn differing_fields(&self, other: &DrawRecord) -> Vec<DrawField> {
        let mut fields = Vec::new();
        if self.date != other.date {
            fields.push(DrawField::Date);
        }
        if self.numbers != other.numbers {
            fields.push(DrawField::Numbers);
        }
        if self.specials != other.specials {
            fields.push(DrawField::Specials);
        }
        fields
    }

    pub fn to_raw(&self) -> RawDrawRow {
        RawDrawRow::from(self.clone())
    }
}

impl fmt::Display for DrawRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {:?} + {:?}",
            self.draw_id, self.date, self.numbers, self.specials
        )
    }
}

fn checked_values<const N: usize>(
    field: DrawField,
    values: &[i64],
    range: RangeInclusive<i64>,
) -> Result<[u8; N], RowDefect> {
    if values.len() != N {
        return Err(RowDefect::WrongCount {
            field,
            expected: N,
            found: values.len(),
        });
    }

    let mut out = [0u8; N];
    let mut seen = HashSet::with_capacity(N);
    for (slot, &value) in out.iter_mut().zip(values) {
        if !range.contains(&value) {
            return Err(RowDefect::OutOfRange {
                field,
                value,
                min: *range.start(),
                max: *range.end(),
            });
        }
        if !seen.insert(value) {
            return Err(RowDefect::Repeated { field, value });
        }
        *slot = value as u8;
    }
    Ok(out)
}

impl TryFrom<&RawDrawRow> for DrawRecord {
    type Error = RowDefect;

    fn try_from(raw: &RawDrawRow) -> Result<Self, Self::Error> {
        if raw.draw_id <= 0 {
            return Err(RowDefect::NonPositiveId(raw.draw_id));
        }
        let draw_id =
            DrawId::try_from(raw.draw_id).map_err(|_| RowDefect::IdOutOfRange(raw.draw_id))?;

        let date_text = raw
            .date
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .ok_or(RowDefect::MissingDate)?;
        let date =
            parse_draw_date(date_text).ok_or_else(|| RowDefect::InvalidDate(date_text.to_string()))?;

        let numbers = checked_values(DrawField::Numbers, &raw.numbers, NUMBER_RANGE)?;
        let specials = checked_values(DrawField::Specials, &raw.specials, SPECIAL_RANGE)?;

        Ok(Self {
            draw_id,
            date,
            numbers,
            specials,
        })
    }
}

impl TryFrom<RawDrawRow> for DrawRecord {
    type Error = RowDefect;

    fn try_from(raw: RawDrawRow) -> Result<Self, Self::Error> {
        DrawRecord::try_from(&raw)
    }
}

impl From<DrawRecord> for RawDrawRow {
    fn from(record: DrawRecord) -> Self {
        Self {
            draw_id: i64::from(record.draw_id),
            date: Some(record.date.format("%Y-%m-%d").to_string()),
            numbers: record.numbers.iter().map(|&n| i64::from(n)).collect(),
            specials: record.specials.iter().map(|&n| i64::from(n)).collect(),
        }
    }
}

/// One disagreement between two sources about the same draw.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Divergence {
    pub draw_id: DrawId,
    pub field: DrawField,
    pub primary_value: String,
    pub secondary_value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceReport {
    pub divergences: Vec<Divergence>,
    pub only_in_primary: Vec<DrawId>,
    pub only_in_secondary: Vec<DrawId>,
}

impl DivergenceReport {
    pub fn is_empty(&self) -> bool {
        self.divergences.is_empty()
    }

    pub fn draw_ids(&self) -> BTreeSet<DrawId> {
        self.divergences.iter().map(|d| d.draw_id).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Anomalous,
    Failed,
}

impl RunOutcome {
    /// Process exit status external schedulers key on.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failed => 1,
            Self::Anomalous => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    StructuralMismatch,
    Validation,
    Conflict,
    Divergence,
    State,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Anomaly,
    Divergence,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anomaly => f.write_str("anomaly"),
            Self::Divergence => f.write_str("divergence"),
        }
    }
}

/// Payload delivered to every notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: EventKind,
    pub message: String,
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyResult {
    pub delivered: BTreeSet<String>,
    pub failed: BTreeSet<String>,
}

impl NotifyResult {
    pub fn any_delivered(&self) -> bool {
        !self.delivered.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub kind: EventKind,
    pub result: NotifyResult,
}

/// Final, immutable report of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub rows_fetched: usize,
    pub rows_inserted: usize,
    pub rows_updated: usize,
    pub source_used: Option<String>,
    pub latest_draw_id: Option<DrawId>,
    pub consecutive_no_new_draws: Option<u32>,
    pub divergent_draw_ids: Vec<DrawId>,
    /// Ids below the latest draw that the source did not serve; retried next run.
    #[serde(default)]
    pub missing_draw_ids: Vec<DrawId>,
    pub notifications: Vec<DispatchRecord>,
    pub failure: Option<RunFailure>,
    pub skipped: Option<String>,
}

impl IngestionRun {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}
