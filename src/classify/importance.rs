//! Importance scoring.
//!
//! A pure function from (observation type, outcome) to an integer 1-5.
//! Callers may override the result explicitly; nothing else in the engine
//! ever re-derives importance.

use crate::model::ObservationType;

/// Score an observation's importance.
///
/// `passed` only matters for verification-style observations (`vr_check`,
/// `pattern_compliance`): a pass is routine (2), a failure demands attention
/// (4). `None` is treated as a failure for those types.
#[must_use]
pub fn importance(obs_type: ObservationType, passed: Option<bool>) -> u8 {
    match obs_type {
        ObservationType::Decision | ObservationType::FailedAttempt => 5,
        ObservationType::CrViolation | ObservationType::IncidentNearMiss => 4,
        ObservationType::VrCheck | ObservationType::PatternCompliance => {
            if passed == Some(true) {
                2
            } else {
                4
            }
        }
        ObservationType::Feature | ObservationType::Bugfix => 3,
        ObservationType::Refactor => 2,
        ObservationType::FileChange | ObservationType::Discovery => 1,
    }
}
