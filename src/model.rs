use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime};

/// Row identifier of a saved plan.
pub type PlanId = i64;

/// Layout version written into every draft blob.
pub const DRAFT_SCHEMA_VERSION: u32 = 1;

/// Opaque account identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Returns `None` for blank identifiers.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum Quarter {
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Quarter {
    pub fn number(self) -> u8 {
        match self {
            Quarter::Q1 => 1,
            Quarter::Q2 => 2,
            Quarter::Q3 => 3,
            Quarter::Q4 => 4,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Quarter::Q1),
            2 => Some(Quarter::Q2),
            3 => Some(Quarter::Q3),
            4 => Some(Quarter::Q4),
            _ => None,
        }
    }
}

/// The planning period a saved plan belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    pub year: i32,
    pub quarter: Quarter,
}

impl Period {
    pub fn new(quarter: Quarter, year: i32) -> Self {
        Self { year, quarter }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.year, self.quarter)
    }
}

static PERIOD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)(?:(\d{4})\s*-?\s*Q([1-4])|Q([1-4])\s*-?\s*(\d{4}))$")
        .expect("period pattern compiles")
});

impl FromStr for Period {
    type Err = anyhow::Error;

    /// Accepts `2026-Q3`, `2026Q3` and `Q3-2026`, case-insensitively.
    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let caps = PERIOD_PATTERN
            .captures(trimmed)
            .ok_or_else(|| anyhow!("invalid period '{trimmed}', expected e.g. 2026-Q3"))?;
        let (year, quarter) = match (caps.get(1), caps.get(2)) {
            (Some(year), Some(quarter)) => (year.as_str(), quarter.as_str()),
            _ => (
                caps.get(4).map(|m| m.as_str()).unwrap_or_default(),
                caps.get(3).map(|m| m.as_str()).unwrap_or_default(),
            ),
        };
        let year: i32 = year.parse()?;
        let quarter = quarter
            .parse::<u8>()
            .ok()
            .and_then(Quarter::from_number)
            .ok_or_else(|| anyhow!("invalid quarter in '{trimmed}'"))?;
        Ok(Self::new(quarter, year))
    }
}

/// The form's accumulated answers.
///
/// The engine never looks inside; two documents are the same when their
/// canonical serializations match. Object keys serialize in sorted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanDocument(Value);

impl Default for PlanDocument {
    fn default() -> Self {
        Self(Value::Object(Map::new()))
    }
}

impl PlanDocument {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw).map(Self)
    }

    /// Canonical compact serialization used for change detection and storage.
    pub fn serialized(&self) -> String {
        self.0.to_string()
    }

    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(&self.0).unwrap_or_else(|_| self.serialized())
    }

    pub fn same_content(&self, other: &PlanDocument) -> bool {
        self.serialized() == other.serialized()
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Unsynced, device-local copy of the working document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub data: PlanDocument,
    /// Unix milliseconds.
    #[serde(rename = "timestamp")]
    pub saved_at_ms: i64,
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
}

impl Draft {
    pub fn new(data: PlanDocument, saved_at: OffsetDateTime) -> Self {
        Self {
            data,
            saved_at_ms: (saved_at.unix_timestamp_nanos() / 1_000_000) as i64,
            schema_version: DRAFT_SCHEMA_VERSION,
        }
    }

    pub fn saved_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.saved_at_ms) * 1_000_000)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }
}

/// The authoritative, account-scoped record for one planning period.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedPlan {
    pub id: PlanId,
    pub owner_id: OwnerId,
    pub period: Period,
    pub data: PlanDocument,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
}

impl SavedPlan {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// When a trashed plan becomes eligible for automatic purge.
    pub fn purge_eligible_at(&self, retention: Duration) -> Option<OffsetDateTime> {
        self.deleted_at.map(|deleted_at| deleted_at + retention)
    }
}

/// An immutable, numbered historical snapshot of a saved plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanVersion {
    pub id: i64,
    pub plan_id: PlanId,
    pub version: u32,
    pub data: PlanDocument,
    pub created_at: OffsetDateTime,
}
