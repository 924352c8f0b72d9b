//! Core domain model for field agents, farmers, tickets and activity reports.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Field agent ("CCE") tracked by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cce {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CceUpdate {
    pub name: Option<String>,
}

impl Cce {
    pub fn apply_update(&mut self, update: CceUpdate) {
        overwrite_if_present(&mut self.name, update.name);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Farmer {
    pub id: String,
    pub name: String,
    pub contact: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub district: String,
    #[serde(default)]
    pub tehsil: String,
    #[serde(default)]
    pub village: String,
    #[serde(default)]
    pub pincode: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default, alias = "crop")]
    pub crops: Vec<String>,
}

/// Partial farmer update; absent or empty fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmerUpdate {
    pub name: Option<String>,
    pub contact: Option<String>,
    pub state: Option<String>,
    pub district: Option<String>,
    pub tehsil: Option<String>,
    pub village: Option<String>,
    pub pincode: Option<String>,
    pub address: Option<String>,
    pub tag: Option<String>,
    #[serde(alias = "crop")]
    pub crops: Option<Vec<String>>,
}

impl Farmer {
    pub fn apply_update(&mut self, update: FarmerUpdate) {
        overwrite_if_present(&mut self.name, update.name);
        overwrite_if_present(&mut self.contact, update.contact);
        overwrite_if_present(&mut self.state, update.state);
        overwrite_if_present(&mut self.district, update.district);
        overwrite_if_present(&mut self.tehsil, update.tehsil);
        overwrite_if_present(&mut self.village, update.village);
        overwrite_if_present(&mut self.pincode, update.pincode);
        overwrite_if_present(&mut self.address, update.address);
        overwrite_if_present(&mut self.tag, update.tag);
        if let Some(crops) = update.crops.filter(|c| !c.is_empty()) {
            self.crops = crops;
        }
    }
}

/// Listing filter for farmers. Empty values are ignored; the rest are ANDed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FarmerFilter {
    pub crop: Option<String>,
    pub district: Option<String>,
    pub village: Option<String>,
    pub pincode: Option<String>,
}

impl FarmerFilter {
    pub fn matches(&self, farmer: &Farmer) -> bool {
        let eq = |wanted: &Option<String>, actual: &str| match non_empty(wanted) {
            Some(w) => w == actual,
            None => true,
        };
        let crop_ok = match non_empty(&self.crop) {
            Some(crop) => farmer.crops.iter().any(|c| c == crop),
            None => true,
        };
        crop_ok
            && eq(&self.district, &farmer.district)
            && eq(&self.village, &farmer.village)
            && eq(&self.pincode, &farmer.pincode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: String,
    pub farmer_id: String,
    pub cce_id: String,
    #[serde(default)]
    pub description: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketUpdate {
    pub farmer_id: Option<String>,
    pub cce_id: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
}

impl Ticket {
    pub fn apply_update(&mut self, update: TicketUpdate, now: DateTime<Utc>) {
        overwrite_if_present(&mut self.farmer_id, update.farmer_id);
        overwrite_if_present(&mut self.cce_id, update.cce_id);
        overwrite_if_present(&mut self.description, update.description);
        overwrite_if_present(&mut self.status, update.status);
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketSortField {
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketSort {
    pub field: TicketSortField,
    pub order: SortOrder,
}

impl TicketSort {
    /// Parses `createdAt`/`updatedAt` plus `asc`/`desc`; unknown fields mean "unsorted".
    pub fn parse(sort_by: &str, sort_order: &str) -> Option<Self> {
        let field = match sort_by {
            "createdAt" => TicketSortField::CreatedAt,
            "updatedAt" => TicketSortField::UpdatedAt,
            _ => return None,
        };
        let order = if sort_order.eq_ignore_ascii_case("desc") {
            SortOrder::Desc
        } else {
            SortOrder::Asc
        };
        Some(Self { field, order })
    }

    pub fn apply(&self, tickets: &mut [Ticket]) {
        tickets.sort_by(|a, b| {
            let ord = match self.field {
                TicketSortField::CreatedAt => a.created_at.cmp(&b.created_at),
                TicketSortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            };
            match self.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShootKind {
    Whatsapp,
    Call,
}

impl ShootKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Whatsapp => "whatsapp",
            Self::Call => "call",
        }
    }
}

impl FromStr for ShootKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whatsapp" => Ok(Self::Whatsapp),
            "call" => Ok(Self::Call),
            other => Err(ParseEnumError::new("shoot kind", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShootStatus {
    Completed,
    Missed,
}

impl ShootStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Missed => "missed",
        }
    }
}

impl FromStr for ShootStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "missed" => Ok(Self::Missed),
            other => Err(ParseEnumError::new("shoot status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {what}: {value:?}")]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// One logged farmer contact: a WhatsApp message or a phone call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shoot {
    pub id: String,
    pub farmer_id: String,
    pub cce_id: String,
    #[serde(rename = "type")]
    pub kind: ShootKind,
    pub status: ShootStatus,
    pub timestamp: DateTime<Utc>,
    /// Only meaningful for calls.
    #[serde(default, rename = "duration")]
    pub duration_secs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Daily,
    Weekly,
    Monthly,
}

impl ReportKind {
    pub const ALL: [ReportKind; 3] = [Self::Daily, Self::Weekly, Self::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid report kind: {0:?}")]
pub struct InvalidReportKind(pub String);

impl FromStr for ReportKind {
    type Err = InvalidReportKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(InvalidReportKind(other.to_string())),
        }
    }
}

/// Half-open reporting interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReportWindow {
    /// Window for `kind` ending at the start of the UTC day containing `now`.
    ///
    /// Monthly windows subtract one calendar month, so the length follows the
    /// previous month (28 to 31 days). Returns `None` only when the date falls
    /// outside chrono's representable range.
    pub fn ending_at(kind: ReportKind, now: DateTime<Utc>) -> Option<Self> {
        let end = now.date_naive().and_hms_opt(0, 0, 0)?.and_utc();
        let start = match kind {
            ReportKind::Daily => end - Duration::days(1),
            ReportKind::Weekly => end - Duration::days(7),
            ReportKind::Monthly => end.checked_sub_months(Months::new(1))?,
        };
        Some(Self { start, end })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Per-agent counters folded from one report window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReport {
    pub cce_id: String,
    pub name: String,
    pub missed_calls: u64,
    pub completed_shoots: u64,
    pub attended_calls: u64,
    pub total_talk_time: u64,
    pub avg_talk_time: f64,
}

impl AgentReport {
    pub fn seeded(cce: &Cce) -> Self {
        Self {
            cce_id: cce.id.clone(),
            name: cce.name.clone(),
            missed_calls: 0,
            completed_shoots: 0,
            attended_calls: 0,
            total_talk_time: 0,
            avg_talk_time: 0.0,
        }
    }

    pub fn record(&mut self, shoot: &Shoot) {
        match shoot.status {
            ShootStatus::Missed => self.missed_calls += 1,
            ShootStatus::Completed => {
                self.completed_shoots += 1;
                if shoot.kind == ShootKind::Call {
                    self.attended_calls += 1;
                    self.total_talk_time += u64::from(shoot.duration_secs);
                }
            }
        }
    }

    pub fn finalize(&mut self) {
        self.avg_talk_time = if self.attended_calls > 0 {
            self.total_talk_time as f64 / self.attended_calls as f64
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: Uuid,
    pub report_type: ReportKind,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub cce_reports: BTreeMap<String, AgentReport>,
}

/// Lightweight listing row for persisted reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub id: Uuid,
    pub report_type: ReportKind,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub agent_count: usize,
}

impl From<&Report> for ReportSummary {
    fn from(report: &Report) -> Self {
        Self {
            id: report.id,
            report_type: report.report_type,
            start_date: report.start_date,
            end_date: report.end_date,
            created_at: report.created_at,
            agent_count: report.cce_reports.len(),
        }
    }
}

fn overwrite_if_present(slot: &mut String, value: Option<String>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        *slot = v;
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
