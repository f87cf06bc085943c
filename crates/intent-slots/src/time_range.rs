//! Time expression parsing.
//!
//! Four families, each resolved from the current date plus the text alone:
//! - single-day keywords (今天, 昨天, tomorrow)
//! - "last N units" relative ranges (最近7天, 近三个月, last 2 weeks)
//! - calendar-relative periods (上个月, 本季度, next year)
//! - "N units from now" future ranges (未来3天, 5天后, in 2 weeks)

use chrono::{Datelike, Days, Duration, Months, NaiveDate};
use regex::Regex;
use std::sync::LazyLock;

use intent_protocol::{RangeType, TimeRange};

use crate::numerals::parse_count;
use crate::span::{Candidate, sort_candidates};

static RE_SINGLE_DAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)今天|今日|昨天|昨日|前天|明天|后天|\btoday\b|\byesterday\b|\btomorrow\b")
        .unwrap()
});

static RE_LAST_N: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:最近|近|过去|前)\s*([0-9]+|[零一二两三四五六七八九十]+)\s*(?:个)?\s*(天|日|周|星期|礼拜|月|年)")
        .unwrap()
});

static RE_LAST_N_EN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:last|past)\s+(\d+)\s+(day|week|month|year)s?\b").unwrap()
});

static RE_FUTURE_N: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:未来|接下来|今后)\s*([0-9]+|[零一二两三四五六七八九十]+)\s*(?:个)?\s*(天|日|周|星期|礼拜|月|年)")
        .unwrap()
});

static RE_AFTER_N: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9]+|[零一二两三四五六七八九十]+)\s*(?:个)?\s*(天|日|周|星期|礼拜|月|年)\s*(?:之后|以后|后)")
        .unwrap()
});

static RE_FUTURE_EN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:next|coming|in)\s+(\d+)\s+(day|week|month|year)s?\b").unwrap()
});

static RE_CALENDAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"本周|这周|这个星期|这星期|上周|上个星期|上星期|下周|下个星期|下星期|本月|这个月|上个月|上月|下个月|下月|本季度|这个季度|这季度|上个季度|上季度|下个季度|下季度|今年|去年|明年|前年",
    )
    .unwrap()
});

static RE_CALENDAR_EN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(this|last|next)\s+(week|month|quarter|year)\b").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Day,
    Week,
    Month,
    Year,
}

impl Unit {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "天" | "日" | "day" => Some(Self::Day),
            "周" | "星期" | "礼拜" | "week" => Some(Self::Week),
            "月" | "month" => Some(Self::Month),
            "年" | "year" => Some(Self::Year),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Period {
    Week,
    Month,
    Quarter,
    Year,
}

/// All time-range candidates in `text`, ordered by position.
pub fn candidates(text: &str, today: NaiveDate) -> Vec<Candidate<TimeRange>> {
    let mut out = Vec::new();

    for m in RE_SINGLE_DAY.find_iter(text) {
        if let Some(range) = single_day(m.as_str(), today) {
            out.push(Candidate::new(m.start(), m.end(), m.as_str(), m.as_str(), 0.95, range));
        }
    }

    for re in [&*RE_LAST_N, &*RE_LAST_N_EN] {
        for caps in re.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let (Some(n), Some(unit)) = (parse_count(&caps[1]), Unit::parse(&caps[2])) else {
                continue;
            };
            if let Some(range) = last_n(today, n, unit, whole.as_str()) {
                out.push(Candidate::new(
                    whole.start(),
                    whole.end(),
                    whole.as_str(),
                    whole.as_str(),
                    0.95,
                    range,
                ));
            }
        }
    }

    for re in [&*RE_FUTURE_N, &*RE_AFTER_N, &*RE_FUTURE_EN] {
        for caps in re.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let (Some(n), Some(unit)) = (parse_count(&caps[1]), Unit::parse(&caps[2])) else {
                continue;
            };
            if let Some(range) = next_n(today, n, unit, whole.as_str()) {
                out.push(Candidate::new(
                    whole.start(),
                    whole.end(),
                    whole.as_str(),
                    whole.as_str(),
                    0.9,
                    range,
                ));
            }
        }
    }

    for m in RE_CALENDAR.find_iter(text) {
        if let Some((period, offset)) = calendar_word(m.as_str())
            && let Some(range) = calendar_period(today, period, offset, m.as_str())
        {
            out.push(Candidate::new(m.start(), m.end(), m.as_str(), m.as_str(), 0.95, range));
        }
    }

    for caps in RE_CALENDAR_EN.captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let offset = match caps[1].to_ascii_lowercase().as_str() {
            "last" => -1,
            "next" => 1,
            _ => 0,
        };
        let period = match caps[2].to_ascii_lowercase().as_str() {
            "week" => Period::Week,
            "month" => Period::Month,
            "quarter" => Period::Quarter,
            _ => Period::Year,
        };
        if let Some(range) = calendar_period(today, period, offset, whole.as_str()) {
            out.push(Candidate::new(
                whole.start(),
                whole.end(),
                whole.as_str(),
                whole.as_str(),
                0.9,
                range,
            ));
        }
    }

    sort_candidates(&mut out);
    out
}

fn single_day(word: &str, today: NaiveDate) -> Option<TimeRange> {
    let (offset, future) = match word.to_ascii_lowercase().as_str() {
        "今天" | "今日" | "today" => (0, false),
        "昨天" | "昨日" | "yesterday" => (-1, false),
        "前天" => (-2, false),
        "明天" | "tomorrow" => (1, true),
        "后天" => (2, true),
        _ => return None,
    };
    Some(TimeRange::point(today.checked_add_signed(Duration::days(offset))?, future, word))
}

/// Range ending today and covering the last `n` units, today included.
fn last_n(today: NaiveDate, n: u32, unit: Unit, expr: &str) -> Option<TimeRange> {
    if n == 0 {
        return None;
    }
    let start = match unit {
        Unit::Day => today.checked_sub_days(Days::new(u64::from(n) - 1))?,
        Unit::Week => today.checked_sub_days(Days::new(7 * u64::from(n) - 1))?,
        Unit::Month => today.checked_sub_months(Months::new(n))?.checked_add_days(Days::new(1))?,
        Unit::Year => today
            .checked_sub_months(Months::new(n.checked_mul(12)?))?
            .checked_add_days(Days::new(1))?,
    };
    Some(TimeRange {
        start_date: start,
        end_date: today,
        range_type: RangeType::Relative,
        is_future: false,
        original_expression: expr.to_string(),
    })
}

/// Range starting today and reaching `n` units ahead.
fn next_n(today: NaiveDate, n: u32, unit: Unit, expr: &str) -> Option<TimeRange> {
    if n == 0 {
        return None;
    }
    let end = match unit {
        Unit::Day => today.checked_add_days(Days::new(u64::from(n)))?,
        Unit::Week => today.checked_add_days(Days::new(7 * u64::from(n)))?,
        Unit::Month => today.checked_add_months(Months::new(n))?,
        Unit::Year => today.checked_add_months(Months::new(n.checked_mul(12)?))?,
    };
    Some(TimeRange {
        start_date: today,
        end_date: end,
        range_type: RangeType::Relative,
        is_future: true,
        original_expression: expr.to_string(),
    })
}

fn calendar_word(word: &str) -> Option<(Period, i32)> {
    Some(match word {
        "本周" | "这周" | "这个星期" | "这星期" => (Period::Week, 0),
        "上周" | "上个星期" | "上星期" => (Period::Week, -1),
        "下周" | "下个星期" | "下星期" => (Period::Week, 1),
        "本月" | "这个月" => (Period::Month, 0),
        "上个月" | "上月" => (Period::Month, -1),
        "下个月" | "下月" => (Period::Month, 1),
        "本季度" | "这个季度" | "这季度" => (Period::Quarter, 0),
        "上个季度" | "上季度" => (Period::Quarter, -1),
        "下个季度" | "下季度" => (Period::Quarter, 1),
        "今年" => (Period::Year, 0),
        "去年" => (Period::Year, -1),
        "前年" => (Period::Year, -2),
        "明年" => (Period::Year, 1),
        _ => return None,
    })
}

fn calendar_period(today: NaiveDate, period: Period, offset: i32, expr: &str) -> Option<TimeRange> {
    let (start, end) = match period {
        Period::Week => {
            let monday = today
                .checked_sub_days(Days::new(u64::from(today.weekday().num_days_from_monday())))?;
            let start = monday.checked_add_signed(Duration::days(7 * i64::from(offset)))?;
            (start, start.checked_add_days(Days::new(6))?)
        }
        Period::Month => {
            let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
            let start = shift_months(first, offset)?;
            (start, start.checked_add_months(Months::new(1))?.checked_sub_days(Days::new(1))?)
        }
        Period::Quarter => {
            let q_month = (today.month() - 1) / 3 * 3 + 1;
            let first = NaiveDate::from_ymd_opt(today.year(), q_month, 1)?;
            let start = shift_months(first, offset * 3)?;
            (start, start.checked_add_months(Months::new(3))?.checked_sub_days(Days::new(1))?)
        }
        Period::Year => {
            let year = today.year() + offset;
            (
                NaiveDate::from_ymd_opt(year, 1, 1)?,
                NaiveDate::from_ymd_opt(year, 12, 31)?,
            )
        }
    };
    Some(TimeRange {
        start_date: start,
        end_date: end,
        range_type: RangeType::CalendarPeriod,
        is_future: offset > 0,
        original_expression: expr.to_string(),
    })
}

fn shift_months(date: NaiveDate, offset: i32) -> Option<NaiveDate> {
    if offset >= 0 {
        date.checked_add_months(Months::new(offset as u32))
    } else {
        date.checked_sub_months(Months::new(offset.unsigned_abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        // A Friday.
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn first(text: &str) -> TimeRange {
        candidates(text, today()).remove(0).payload
    }

    #[test]
    fn last_seven_days_includes_today() {
        let r = first("最近7天带鱼入库多少");
        assert_eq!(r.range_type, RangeType::Relative);
        assert_eq!(r.start_date, d(2024, 3, 9));
        assert_eq!(r.end_date, d(2024, 3, 15));
        assert_eq!(r.days(), 7);
        assert!(!r.is_future);
        assert_eq!(r.original_expression, "最近7天");
    }

    #[test]
    fn chinese_numeral_months() {
        let r = first("近三个月的出勤率");
        assert_eq!(r.start_date, d(2023, 12, 16));
        assert_eq!(r.end_date, today());
    }

    #[test]
    fn english_last_weeks() {
        let r = first("shipments in the last 2 weeks");
        assert_eq!(r.start_date, d(2024, 3, 2));
        assert_eq!(r.end_date, today());
    }

    #[test]
    fn yesterday_is_point() {
        let r = first("昨天的产量");
        assert_eq!(r.range_type, RangeType::Point);
        assert_eq!(r.start_date, d(2024, 3, 14));
        assert_eq!(r.start_date, r.end_date);
    }

    #[test]
    fn tomorrow_is_future_point() {
        let r = first("明天的排班");
        assert!(r.is_future);
        assert_eq!(r.start_date, d(2024, 3, 16));
    }

    #[test]
    fn last_month_covers_leap_february() {
        let r = first("上个月的合格率");
        assert_eq!(r.range_type, RangeType::CalendarPeriod);
        assert_eq!(r.start_date, d(2024, 2, 1));
        assert_eq!(r.end_date, d(2024, 2, 29));
    }

    #[test]
    fn this_week_starts_monday() {
        let r = first("本周设备故障");
        assert_eq!(r.start_date, d(2024, 3, 11));
        assert_eq!(r.end_date, d(2024, 3, 17));
    }

    #[test]
    fn next_quarter_is_future() {
        let r = first("下季度的生产计划");
        assert_eq!(r.start_date, d(2024, 4, 1));
        assert_eq!(r.end_date, d(2024, 6, 30));
        assert!(r.is_future);
    }

    #[test]
    fn last_year_calendar() {
        let r = first("去年的销量");
        assert_eq!(r.start_date, d(2023, 1, 1));
        assert_eq!(r.end_date, d(2023, 12, 31));
    }

    #[test]
    fn future_n_days() {
        let r = first("未来3天的发货");
        assert_eq!(r.start_date, today());
        assert_eq!(r.end_date, d(2024, 3, 18));
        assert!(r.is_future);

        let r = first("5天后到期的批次");
        assert_eq!(r.end_date, d(2024, 3, 20));
        assert!(r.is_future);
    }

    #[test]
    fn english_calendar_and_future() {
        assert_eq!(first("orders this month").start_date, d(2024, 3, 1));
        let r = first("plan for the next 2 days");
        assert!(r.is_future);
        assert_eq!(r.end_date, d(2024, 3, 17));
    }

    #[test]
    fn zero_count_is_rejected() {
        assert!(candidates("最近0天", today()).is_empty());
    }

    #[test]
    fn no_time_expression() {
        assert!(candidates("带鱼库存多少", today()).is_empty());
    }

    #[test]
    fn all_ranges_well_formed() {
        for text in ["最近7天", "上周", "本季度", "未来2个月", "今年", "前天"] {
            for c in candidates(text, today()) {
                assert!(c.payload.is_well_formed(), "{text}");
            }
        }
    }
}
