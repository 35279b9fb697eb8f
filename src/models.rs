use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Fully-qualified metric key to value, handed to the plugin protocol as-is.
pub type MetricMap = BTreeMap<String, f64>;

/// Linked-account id to sanitized display name.
pub type AccountNameIndex = HashMap<String, String>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
pub enum MetricKind {
    #[value(name = "BlendedCost")]
    BlendedCost,
    #[value(name = "UnblendedCost")]
    UnblendedCost,
    #[value(name = "UsageQuantity")]
    UsageQuantity,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::BlendedCost => "BlendedCost",
            MetricKind::UnblendedCost => "UnblendedCost",
            MetricKind::UsageQuantity => "UsageQuantity",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Dimension {
    LinkedAccount,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Granularity {
    Monthly,
}

/// Month-to-date window the billing queries cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportingWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Seconds from the start of the month until `now`.
    pub elapsed_seconds: i64,
    /// Length of the whole month in seconds.
    pub period_seconds: i64,
}

impl ReportingWindow {
    pub fn containing(now: DateTime<Utc>) -> Self {
        let end = now.date_naive();
        let start = end - Duration::days(i64::from(end.day0()));
        // Only fails at the very end of chrono's supported range.
        let next_month = start
            .checked_add_months(Months::new(1))
            .unwrap_or(NaiveDate::MAX);

        let start_at = start.and_time(NaiveTime::MIN).and_utc();
        let next_at = next_month.and_time(NaiveTime::MIN).and_utc();

        Self {
            start,
            end,
            elapsed_seconds: (now - start_at).num_seconds(),
            period_seconds: (next_at - start_at).num_seconds(),
        }
    }

    pub fn interval(&self) -> DateInterval {
        DateInterval {
            start: self.start,
            end: self.end,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostRecord {
    pub account_id: String,
    pub amount: f64,
}

#[derive(Debug, Clone)]
pub struct CostAndUsageQuery {
    pub window: ReportingWindow,
    pub granularity: Granularity,
    pub metrics: Vec<MetricKind>,
    pub group_by: Dimension,
}

#[derive(Debug, Clone, Default)]
pub struct CostAndUsageResult {
    pub results_by_time: Vec<ResultByTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct DateInterval {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DimensionValue {
    pub value: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResultByTime {
    #[serde(default)]
    pub time_period: Option<DateInterval>,
    #[serde(default)]
    pub groups: Vec<CostGroup>,
    #[serde(default)]
    pub estimated: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CostGroup {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub metrics: HashMap<String, MetricValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricValue {
    pub amount: Option<String>,
}
