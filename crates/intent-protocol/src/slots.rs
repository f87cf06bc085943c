use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ── Slot Types ────────────────────────────────────────────────

/// Typed parameter kinds the slot extractor recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotType {
    DeviceId,
    EmployeeId,
    CustomerId,
    BatchId,
    OrderId,
    ProductId,
    SupplierId,
    MaterialId,
    Metric,
    Department,
    Status,
    PersonName,
    TimeRange,
    Comparison,
    Number,
}

impl SlotType {
    pub const ALL: [SlotType; 15] = [
        Self::DeviceId,
        Self::EmployeeId,
        Self::CustomerId,
        Self::BatchId,
        Self::OrderId,
        Self::ProductId,
        Self::SupplierId,
        Self::MaterialId,
        Self::Metric,
        Self::Department,
        Self::Status,
        Self::PersonName,
        Self::TimeRange,
        Self::Comparison,
        Self::Number,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceId => "DEVICE_ID",
            Self::EmployeeId => "EMPLOYEE_ID",
            Self::CustomerId => "CUSTOMER_ID",
            Self::BatchId => "BATCH_ID",
            Self::OrderId => "ORDER_ID",
            Self::ProductId => "PRODUCT_ID",
            Self::SupplierId => "SUPPLIER_ID",
            Self::MaterialId => "MATERIAL_ID",
            Self::Metric => "METRIC",
            Self::Department => "DEPARTMENT",
            Self::Status => "STATUS",
            Self::PersonName => "PERSON_NAME",
            Self::TimeRange => "TIME_RANGE",
            Self::Comparison => "COMPARISON",
            Self::Number => "NUMBER",
        }
    }

    /// `{SLOT_TYPE}` marker used in the normalized rendering.
    pub fn placeholder(&self) -> String {
        format!("{{{}}}", self.as_str())
    }

    /// Entity identifiers (as opposed to descriptive slots like metrics).
    pub fn is_entity_id(&self) -> bool {
        matches!(
            self,
            Self::DeviceId
                | Self::EmployeeId
                | Self::CustomerId
                | Self::BatchId
                | Self::OrderId
                | Self::ProductId
                | Self::SupplierId
                | Self::MaterialId
        )
    }
}

impl std::fmt::Display for SlotType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SlotType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown slot type: {s}"))
    }
}

/// One recognized span, with provenance for normalized-text reconstruction.
///
/// Positions are UTF-8 byte offsets into the text handed to the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotMatch {
    pub slot_type: SlotType,
    pub value: String,
    pub start_pos: usize,
    pub end_pos: usize,
    pub matched_text: String,
    pub confidence: f64,
}

impl SlotMatch {
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        start < self.end_pos && self.start_pos < end
    }
}

// ── Time Ranges ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RangeType {
    /// A single day ("今天", "yesterday").
    Point,
    /// Relative to today ("最近7天", "未来3天").
    Relative,
    /// A whole calendar period ("上个月", "本季度").
    CalendarPeriod,
}

/// A resolved date range. `start_date <= end_date` unless `range_type` is `Point`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub range_type: RangeType,
    pub is_future: bool,
    pub original_expression: String,
}

impl TimeRange {
    pub fn point(date: NaiveDate, is_future: bool, expr: impl Into<String>) -> Self {
        Self {
            start_date: date,
            end_date: date,
            range_type: RangeType::Point,
            is_future,
            original_expression: expr.into(),
        }
    }

    /// Inclusive number of days covered.
    pub fn days(&self) -> i64 {
        (self.end_date - self.start_date).num_days() + 1
    }

    pub fn is_well_formed(&self) -> bool {
        self.range_type == RangeType::Point || self.start_date <= self.end_date
    }
}

// ── Comparison / Numeric ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComparisonType {
    Ranking,
    Max,
    Min,
    Yoy,
    Mom,
    Qoq,
    Trend,
    Sum,
    Average,
    Count,
    Ratio,
}

impl ComparisonType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ranking => "RANKING",
            Self::Max => "MAX",
            Self::Min => "MIN",
            Self::Yoy => "YOY",
            Self::Mom => "MOM",
            Self::Qoq => "QOQ",
            Self::Trend => "TREND",
            Self::Sum => "SUM",
            Self::Average => "AVERAGE",
            Self::Count => "COUNT",
            Self::Ratio => "RATIO",
        }
    }

    pub fn is_ranking(&self) -> bool {
        matches!(self, Self::Ranking | Self::Max | Self::Min)
    }

    pub fn is_period_comparison(&self) -> bool {
        matches!(self, Self::Yoy | Self::Mom | Self::Qoq)
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Sum | Self::Average | Self::Count | Self::Ratio)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonDetails {
    pub comparison_type: ComparisonType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<SortDirection>,
    pub source_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NumericType {
    TopN,
    BottomN,
    GreaterThan,
    LessThan,
    Percentage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericDetails {
    pub numeric_type: NumericType,
    pub value: f64,
    pub source_text: String,
}

// ── Extraction Result ─────────────────────────────────────────

/// Output of one extraction pass.
///
/// `matches` is sorted by `start_pos` and never overlaps; `values` holds at
/// most one value per slot type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedSlots {
    pub original_text: String,
    pub values: BTreeMap<SlotType, String>,
    pub matches: Vec<SlotMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison: Option<ComparisonDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric: Option<NumericDetails>,
    /// Input with recognized spans replaced by `{SLOT_TYPE}` placeholders.
    pub normalized_text: String,
}

impl ExtractedSlots {
    pub fn empty(text: &str) -> Self {
        Self {
            original_text: text.to_string(),
            normalized_text: text.to_string(),
            ..Self::default()
        }
    }

    pub fn get(&self, slot_type: SlotType) -> Option<&str> {
        self.values.get(&slot_type).map(String::as_str)
    }

    pub fn has(&self, slot_type: SlotType) -> bool {
        self.values.contains_key(&slot_type)
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn entity_matches(&self) -> impl Iterator<Item = &SlotMatch> {
        self.matches.iter().filter(|m| m.slot_type.is_entity_id())
    }

    /// Rebuild the original input from `normalized_text` by putting each
    /// match's `matched_text` back in place of its placeholder, back-to-front.
    pub fn restore_original(&self) -> String {
        let mut shift: isize = 0;
        let mut spans = Vec::with_capacity(self.matches.len());
        for m in &self.matches {
            let placeholder_len = m.slot_type.placeholder().len() as isize;
            let start = (m.start_pos as isize + shift) as usize;
            let end = start + placeholder_len as usize;
            spans.push((start, end, m.matched_text.as_str()));
            shift += placeholder_len - (m.end_pos - m.start_pos) as isize;
        }

        let mut out = self.normalized_text.clone();
        for (start, end, text) in spans.into_iter().rev() {
            if end <= out.len() && out.is_char_boundary(start) && out.is_char_boundary(end) {
                out.replace_range(start..end, text);
            }
        }
        out
    }
}
