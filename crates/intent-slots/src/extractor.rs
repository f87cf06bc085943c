//! Span arbitration across matchers and normalized-text rendering.
//!
//! Matchers run in a fixed priority order. Each one claims the earliest of its
//! candidates that does not overlap a span already claimed, so the output has
//! non-overlapping positions and at most one value per slot type.

use chrono::{Local, NaiveDate};
use tracing::debug;

use intent_protocol::{ExtractedSlots, SlotMatch, SlotType};

use crate::comparison::{comparison_candidates, implied_ranking, numeric_candidates};
use crate::entities::{
    department_candidates, entity_candidates, metric_candidates, number_candidates,
    person_candidates, status_candidates,
};
use crate::span::Candidate;
use crate::time_range;

/// Entity ID types in claim order.
const ENTITY_ORDER: [SlotType; 8] = [
    SlotType::BatchId,
    SlotType::OrderId,
    SlotType::DeviceId,
    SlotType::EmployeeId,
    SlotType::CustomerId,
    SlotType::ProductId,
    SlotType::SupplierId,
    SlotType::MaterialId,
];

/// Stateless slot extractor. Cheap to construct and share.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotExtractor;

impl SlotExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract slots using the local calendar date for relative time expressions.
    pub fn extract(&self, text: &str) -> ExtractedSlots {
        self.extract_at(text, Local::now().date_naive())
    }

    /// Deterministic core: the same `(text, today)` always yields the same result.
    pub fn extract_at(&self, text: &str, today: NaiveDate) -> ExtractedSlots {
        let mut acc = Accumulator::new(text);

        let entities = entity_candidates(text);
        for slot_type in ENTITY_ORDER {
            let typed = entities.iter().filter(|c| c.payload == slot_type);
            acc.claim(slot_type, typed);
        }

        let time = time_range::candidates(text, today);
        let time_range = acc.claim(SlotType::TimeRange, time.iter()).cloned();

        let numerics = numeric_candidates(text);
        let numeric = acc.claim(SlotType::Number, numerics.iter()).cloned();

        let comparisons = comparison_candidates(text);
        let mut comparison = acc.claim(SlotType::Comparison, comparisons.iter()).cloned();
        if comparison.is_none()
            && let Some(implied) = numeric.as_ref().and_then(implied_ranking)
        {
            // Shares the numeric span, so it is recorded as a value only.
            acc.values_only(SlotType::Comparison, implied.comparison_type.as_str());
            comparison = Some(implied);
        }

        acc.claim(SlotType::Metric, metric_candidates(text).iter());
        acc.claim(SlotType::Department, department_candidates(text).iter());
        acc.claim(SlotType::Status, status_candidates(text).iter());
        acc.claim(SlotType::PersonName, person_candidates(text).iter());
        acc.claim(SlotType::Number, number_candidates(text).iter());

        let mut slots = acc.finish();
        slots.time_range = time_range;
        slots.comparison = comparison;
        slots.numeric = numeric;

        debug!(
            text,
            slots = slots.matches.len(),
            normalized = %slots.normalized_text,
            "slots extracted"
        );
        slots
    }
}

struct Accumulator<'a> {
    text: &'a str,
    slots: ExtractedSlots,
}

impl<'a> Accumulator<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            slots: ExtractedSlots::empty(text),
        }
    }

    /// Claim the first free candidate for `slot_type`; returns its payload.
    fn claim<'c, T: 'c>(
        &mut self,
        slot_type: SlotType,
        candidates: impl Iterator<Item = &'c Candidate<T>>,
    ) -> Option<&'c T> {
        if self.slots.has(slot_type) {
            return None;
        }
        for c in candidates {
            if self.slots.matches.iter().any(|m| m.overlaps(c.start, c.end)) {
                continue;
            }
            self.slots.values.insert(slot_type, c.value.clone());
            self.slots.matches.push(SlotMatch {
                slot_type,
                value: c.value.clone(),
                start_pos: c.start,
                end_pos: c.end,
                matched_text: c.matched_text.clone(),
                confidence: c.confidence,
            });
            return Some(&c.payload);
        }
        None
    }

    fn values_only(&mut self, slot_type: SlotType, value: &str) {
        self.slots.values.entry(slot_type).or_insert_with(|| value.to_string());
    }

    fn finish(mut self) -> ExtractedSlots {
        self.slots.matches.sort_by_key(|m| m.start_pos);

        let mut normalized = self.text.to_string();
        for m in self.slots.matches.iter().rev() {
            normalized.replace_range(m.start_pos..m.end_pos, &m.slot_type.placeholder());
        }
        self.slots.normalized_text = normalized;
        self.slots
    }
}
