//! Comparison / ranking overlay.
//!
//! Reads the comparison, numeric and time details the slot extractor found
//! and turns them into query modifiers, most specific first. The composition
//! table then maps `(domain, QUERY, modifier)` to a more specific intent.

use intent_protocol::{ComparisonType, ExtractedSlots, QueryModifier};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlayResult {
    /// Most specific first; the classifier tries them in this order.
    pub modifiers: Vec<QueryModifier>,
}

impl OverlayResult {
    pub fn is_empty(&self) -> bool {
        self.modifiers.is_empty()
    }

    fn push(&mut self, m: QueryModifier) {
        if !self.modifiers.contains(&m) {
            self.modifiers.push(m);
        }
    }
}

/// Derive query modifiers from extracted slots.
pub fn analyze(slots: &ExtractedSlots) -> OverlayResult {
    let mut out = OverlayResult::default();

    if let Some(cmp) = &slots.comparison {
        match cmp.comparison_type {
            ComparisonType::Ranking | ComparisonType::Max | ComparisonType::Min => {
                out.push(QueryModifier::Ranking)
            }
            ComparisonType::Yoy => out.push(QueryModifier::Yoy),
            ComparisonType::Mom => out.push(QueryModifier::Mom),
            ComparisonType::Qoq => out.push(QueryModifier::Qoq),
            ComparisonType::Trend => out.push(QueryModifier::Comparison),
            ComparisonType::Average | ComparisonType::Ratio => out.push(QueryModifier::Stats),
            ComparisonType::Sum | ComparisonType::Count => out.push(QueryModifier::Aggregation),
        }
        if cmp.comparison_type.is_period_comparison() {
            out.push(QueryModifier::Comparison);
        }
        if cmp.comparison_type.is_aggregate() {
            out.push(QueryModifier::Stats);
        }
    }

    if let Some(tr) = &slots.time_range
        && tr.is_future
    {
        out.push(QueryModifier::Future);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use intent_slots::SlotExtractor;

    fn slots(text: &str) -> ExtractedSlots {
        SlotExtractor::new().extract_at(text, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap())
    }

    #[test]
    fn highest_becomes_ranking() {
        assert_eq!(analyze(&slots("销量最高的客户是谁")).modifiers, [QueryModifier::Ranking]);
    }

    #[test]
    fn period_comparison_adds_generic_comparison() {
        assert_eq!(
            analyze(&slots("本月出货量环比")).modifiers,
            [QueryModifier::Mom, QueryModifier::Comparison]
        );
    }

    #[test]
    fn aggregates_fall_back_to_stats() {
        assert_eq!(
            analyze(&slots("上个月迟到总数")).modifiers,
            [QueryModifier::Aggregation, QueryModifier::Stats]
        );
        assert_eq!(analyze(&slots("平均合格率")).modifiers, [QueryModifier::Stats]);
    }

    #[test]
    fn future_time_range() {
        assert_eq!(
            analyze(&slots("未来3天要过期的原料")).modifiers,
            [QueryModifier::Future]
        );
    }

    #[test]
    fn top_n_implies_ranking() {
        assert_eq!(
            analyze(&slots("销售额前5名的客户")).modifiers,
            [QueryModifier::Ranking]
        );
    }

    #[test]
    fn plain_query_has_no_modifiers() {
        assert!(analyze(&slots("查一下库存")).is_empty());
    }
}
