//! Rule-based classification: two-stage domain/action classifier plus the
//! comparison overlay.

pub mod keywords;
pub mod overlay;
pub mod two_stage;

pub use keywords::{ActionRules, DomainKeywords};
pub use overlay::OverlayResult;
pub use two_stage::{ActionReason, PhrasingFlags, TwoStageClassifier, TwoStageResult};
