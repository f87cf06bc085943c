//! Ranking / period-comparison / aggregate markers and numeric qualifiers.

use regex::Regex;
use std::sync::LazyLock;

use intent_protocol::{ComparisonDetails, ComparisonType, NumericDetails, NumericType, SortDirection};

use crate::numerals::{format_number, parse_count};
use crate::span::{Candidate, scan_dictionary, sort_candidates};

/// Marker words per comparison type, with the sort direction they imply.
const COMPARISON_WORDS: &[(&[&str], ComparisonType, Option<SortDirection>)] = &[
    (
        &["最高", "最多", "最大", "最好", "第一", "最快", "最强", "highest", "most"],
        ComparisonType::Max,
        Some(SortDirection::Desc),
    ),
    (
        &["最低", "最少", "最小", "最差", "倒数", "最慢", "lowest", "least"],
        ComparisonType::Min,
        Some(SortDirection::Asc),
    ),
    (
        &["排名", "排行", "排序", "前几名", "ranking"],
        ComparisonType::Ranking,
        Some(SortDirection::Desc),
    ),
    (
        &["同比", "去年同期", "同期", "比去年", "year over year", "yoy"],
        ComparisonType::Yoy,
        None,
    ),
    (
        &["环比", "比上月", "比上个月", "上月相比", "month over month"],
        ComparisonType::Mom,
        None,
    ),
    (
        &["比上季度", "季度环比", "较上季度", "quarter over quarter", "qoq"],
        ComparisonType::Qoq,
        None,
    ),
    (
        &["趋势", "走势", "变化情况", "波动", "trend"],
        ComparisonType::Trend,
        None,
    ),
    (
        &["总共", "合计", "总计", "一共", "总和", "累计", "total"],
        ComparisonType::Sum,
        None,
    ),
    (&["平均", "average", "avg"], ComparisonType::Average, None),
    (
        &["多少个", "多少条", "多少次", "几个", "几次", "数量", "总数", "次数", "how many"],
        ComparisonType::Count,
        None,
    ),
    (
        &["占比", "比例", "百分比", "比率", "ratio", "proportion"],
        ComparisonType::Ratio,
        None,
    ),
];

const NUM: &str = r"([0-9]+|[零一二两三四五六七八九十]+)";
const DECIMAL: &str = r"([0-9]+(?:\.[0-9]+)?)";

static RE_TOP_N: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"前\s*{NUM}\s*(?:名|位|个|条|大)|(?i:top)\s*{NUM}")).unwrap());

static RE_BOTTOM_N: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?:倒数|后)\s*{NUM}\s*(?:名|位|个|条)|(?i:bottom)\s*{NUM}")).unwrap()
});

static RE_GREATER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?:大于|超过|高于|多于|不少于|>=?|＞)\s*{DECIMAL}|(?i:more than|greater than|over|above)\s+{DECIMAL}"
    ))
    .unwrap()
});

static RE_LESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?:小于|低于|少于|不足|不到|<=?|＜)\s*{DECIMAL}|(?i:less than|fewer than|below|under)\s+{DECIMAL}"
    ))
    .unwrap()
});

static RE_PERCENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"{DECIMAL}\s*(?:%|％)|百分之\s*{NUM}")).unwrap()
});

/// Comparison-marker candidates, ordered by position.
pub fn comparison_candidates(text: &str) -> Vec<Candidate<ComparisonDetails>> {
    let lower = text.to_lowercase();
    // Lowercasing can shift byte offsets for non-ASCII; fall back to the raw text then.
    let haystack = if lower.len() == text.len() { lower.as_str() } else { text };

    let mut out = Vec::new();
    for (words, kind, direction) in COMPARISON_WORDS {
        for (start, end, _) in scan_dictionary(haystack, words) {
            let matched = &text[start..end];
            out.push(Candidate::new(
                start,
                end,
                matched,
                kind.as_str(),
                0.9,
                ComparisonDetails {
                    comparison_type: *kind,
                    direction: *direction,
                    source_text: matched.to_string(),
                },
            ));
        }
    }
    sort_candidates(&mut out);
    out
}

/// TOP_N / BOTTOM_N / threshold / percentage candidates, ordered by position.
pub fn numeric_candidates(text: &str) -> Vec<Candidate<NumericDetails>> {
    let mut out = Vec::new();
    let patterns: [(&Regex, NumericType); 5] = [
        (&RE_TOP_N, NumericType::TopN),
        (&RE_BOTTOM_N, NumericType::BottomN),
        (&RE_GREATER, NumericType::GreaterThan),
        (&RE_LESS, NumericType::LessThan),
        (&RE_PERCENT, NumericType::Percentage),
    ];

    for (re, kind) in patterns {
        for caps in re.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            // Exactly one alternative's group participates.
            let Some(raw) = caps.iter().skip(1).flatten().next().map(|m| m.as_str()) else {
                continue;
            };
            let value = match raw.parse::<f64>() {
                Ok(v) => v,
                Err(_) => match parse_count(raw) {
                    Some(v) => f64::from(v),
                    None => continue,
                },
            };
            out.push(Candidate::new(
                whole.start(),
                whole.end(),
                whole.as_str(),
                format_number(value),
                0.9,
                NumericDetails {
                    numeric_type: kind,
                    value,
                    source_text: whole.as_str().to_string(),
                },
            ));
        }
    }
    sort_candidates(&mut out);
    out
}

/// Ranking implied by a TOP_N / BOTTOM_N qualifier when no explicit marker exists.
pub fn implied_ranking(numeric: &NumericDetails) -> Option<ComparisonDetails> {
    let direction = match numeric.numeric_type {
        NumericType::TopN => SortDirection::Desc,
        NumericType::BottomN => SortDirection::Asc,
        _ => return None,
    };
    Some(ComparisonDetails {
        comparison_type: ComparisonType::Ranking,
        direction: Some(direction),
        source_text: numeric.source_text.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_is_max_desc() {
        let c = comparison_candidates("销量最高的客户是谁").remove(0);
        assert_eq!(c.payload.comparison_type, ComparisonType::Max);
        assert_eq!(c.payload.direction, Some(SortDirection::Desc));
        assert_eq!(c.matched_text, "最高");
    }

    #[test]
    fn lowest_is_min_asc() {
        let c = comparison_candidates("合格率最低的车间").remove(0);
        assert_eq!(c.payload.comparison_type, ComparisonType::Min);
        assert_eq!(c.payload.direction, Some(SortDirection::Asc));
    }

    #[test]
    fn yoy_and_mom_markers() {
        assert_eq!(
            comparison_candidates("产量同比增长多少")[0].payload.comparison_type,
            ComparisonType::Yoy
        );
        assert_eq!(
            comparison_candidates("出货量环比")[0].payload.comparison_type,
            ComparisonType::Mom
        );
        assert_eq!(
            comparison_candidates("利润比上季度")[0].payload.comparison_type,
            ComparisonType::Qoq
        );
    }

    #[test]
    fn english_markers_case_insensitive() {
        let c = comparison_candidates("Average output per line").remove(0);
        assert_eq!(c.payload.comparison_type, ComparisonType::Average);
        assert_eq!(c.matched_text, "Average");
    }

    #[test]
    fn top_n_chinese_and_english() {
        let n = numeric_candidates("销量前5名的产品").remove(0);
        assert_eq!(n.payload.numeric_type, NumericType::TopN);
        assert_eq!(n.payload.value, 5.0);
        assert_eq!(n.value, "5");

        let n = numeric_candidates("top 10 suppliers").remove(0);
        assert_eq!(n.payload.numeric_type, NumericType::TopN);
        assert_eq!(n.payload.value, 10.0);
    }

    #[test]
    fn bottom_n_with_chinese_numeral() {
        let n = numeric_candidates("出勤率倒数三名").remove(0);
        assert_eq!(n.payload.numeric_type, NumericType::BottomN);
        assert_eq!(n.payload.value, 3.0);
    }

    #[test]
    fn thresholds_and_percentages() {
        let n = numeric_candidates("库存大于500的物料").remove(0);
        assert_eq!(n.payload.numeric_type, NumericType::GreaterThan);
        assert_eq!(n.payload.value, 500.0);

        let n = numeric_candidates("不良率低于2.5的批次").remove(0);
        assert_eq!(n.payload.numeric_type, NumericType::LessThan);
        assert_eq!(n.payload.value, 2.5);

        let n = numeric_candidates("合格率95%以上").remove(0);
        assert_eq!(n.payload.numeric_type, NumericType::Percentage);
        assert_eq!(n.payload.value, 95.0);
    }

    #[test]
    fn top_n_implies_desc_ranking() {
        let n = numeric_candidates("前3名").remove(0).payload;
        let r = implied_ranking(&n).unwrap();
        assert_eq!(r.comparison_type, ComparisonType::Ranking);
        assert_eq!(r.direction, Some(SortDirection::Desc));
        assert!(implied_ranking(&NumericDetails {
            numeric_type: NumericType::GreaterThan,
            value: 1.0,
            source_text: ">1".into(),
        })
        .is_none());
    }
}
