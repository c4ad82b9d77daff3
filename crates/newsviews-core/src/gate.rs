//! Content gate: field validation, duplicate detection and image moderation
//! folded into one decision.
//!
//! All three checks always run so the stored record explains every reason it
//! was turned away. The status itself comes from [`decide`], a pure table over
//! the three check results.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capabilities::{ModerationService, ModerationVerdict, RowMarker};
use crate::duplicate::{CorpusEntry, DuplicateDetector, DuplicateResult};
use crate::models::{Submission, SubmissionStatus};

/// Default minimum description length, in characters.
pub const DEFAULT_MIN_DESCRIPTION_LENGTH: usize = 50;

const MIN_PHONE_DIGITS: usize = 7;
const MAX_PHONE_DIGITS: usize = 15;

/// How a submission whose only problem is being a duplicate is labelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Store with `status = duplicate`.
    #[default]
    Label,
    /// Store with `status = rejected`.
    Reject,
}

/// Result of the gate for one submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateDecision {
    pub status: SubmissionStatus,
    pub validation_errors: Vec<String>,
    pub duplicate: DuplicateResult,
    /// `None` when the submission carries no image.
    pub moderation: Option<ModerationVerdict>,
}

impl GateDecision {
    pub fn is_approved(&self) -> bool {
        self.status == SubmissionStatus::Approved
    }

    /// Rejected submissions hand their image back for cleanup.
    pub fn release_image(&self) -> bool {
        !self.is_approved()
    }

    fn moderation_failed(&self) -> bool {
        self.moderation.as_ref().is_some_and(|v| !v.passes())
    }

    /// Source annotation for a rejected row. Invalid fields win over a
    /// duplicate match, which wins over inappropriate content.
    pub fn marker(&self) -> Option<RowMarker> {
        if self.is_approved() {
            None
        } else if !self.validation_errors.is_empty() {
            Some(RowMarker::Invalid)
        } else if self.duplicate.is_duplicate {
            Some(RowMarker::Duplicate)
        } else if self.moderation_failed() {
            Some(RowMarker::Inappropriate)
        } else {
            None
        }
    }

    /// Every reason the submission was not approved.
    pub fn reasons(&self) -> Vec<String> {
        let mut reasons = self.validation_errors.clone();
        if self.duplicate.is_duplicate {
            reasons.push(format!(
                "Duplicate of {} (similarity {:.2})",
                self.duplicate.matched_id.as_deref().unwrap_or("unknown"),
                self.duplicate.score.unwrap_or_default()
            ));
        }
        if let Some(ModerationVerdict::Inappropriate { reason }) = &self.moderation {
            reasons.push(format!("Inappropriate image: {}", reason));
        }
        reasons
    }

    /// Copies the decision onto the submission that will be stored.
    pub fn apply(&self, submission: &mut Submission) {
        submission.status = self.status;
        submission.validation_errors = self.validation_errors.clone();
        submission.duplicate_score = self.duplicate.score;
        submission.duplicate_of = if self.duplicate.is_duplicate {
            self.duplicate.matched_id.clone()
        } else {
            None
        };
        submission.moderation_reason = match &self.moderation {
            Some(ModerationVerdict::Inappropriate { reason })
            | Some(ModerationVerdict::Unavailable { reason }) => Some(reason.clone()),
            _ => None,
        };
    }
}

/// Maps the three check outcomes onto a status.
///
/// Approved iff everything passes. A duplicate match that is the sole failure
/// is labelled according to `policy`; any other failure set is rejected.
pub fn decide(
    validation_failed: bool,
    duplicate_found: bool,
    moderation_failed: bool,
    policy: DuplicatePolicy,
) -> SubmissionStatus {
    match (validation_failed, duplicate_found, moderation_failed) {
        (false, false, false) => SubmissionStatus::Approved,
        (false, true, false) => match policy {
            DuplicatePolicy::Label => SubmissionStatus::Duplicate,
            DuplicatePolicy::Reject => SubmissionStatus::Rejected,
        },
        _ => SubmissionStatus::Rejected,
    }
}

/// Checks required fields, the description length and the phone format.
pub fn validate(submission: &Submission, min_description_length: usize) -> Vec<String> {
    let mut errors = Vec::new();

    if submission.title.trim().is_empty() {
        errors.push("News title cannot be empty".to_string());
    }

    let description = submission.description.trim();
    if description.is_empty() {
        errors.push("News description cannot be empty".to_string());
    } else if description.chars().count() < min_description_length {
        errors.push(format!(
            "News description must be at least {} characters long",
            min_description_length
        ));
    }

    if submission.city.trim().is_empty() {
        errors.push("City cannot be empty".to_string());
    }

    if submission.category.trim().is_empty() {
        errors.push("Category cannot be empty".to_string());
    }

    if submission.publisher_name.trim().is_empty() {
        errors.push("Publisher's name cannot be empty".to_string());
    }

    let phone = submission.publisher_phone.trim();
    if phone.is_empty() {
        errors.push("Publisher's phone number cannot be empty".to_string());
    } else if !is_valid_phone(phone) {
        errors.push(format!(
            "Publisher's phone number must contain {} to {} digits",
            MIN_PHONE_DIGITS, MAX_PHONE_DIGITS
        ));
    }

    errors
}

/// Digits with optional separators (space, `-`, `.`, parentheses) and an
/// optional leading `+`.
fn is_valid_phone(phone: &str) -> bool {
    let body = phone.strip_prefix('+').unwrap_or(phone);
    let mut digits = 0;
    for c in body.chars() {
        match c {
            '0'..='9' => digits += 1,
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => return false,
        }
    }
    (MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits)
}

/// Evaluates submissions against the accepted corpus and the moderation service.
pub struct ContentGate {
    detector: DuplicateDetector,
    moderation: Option<Arc<dyn ModerationService>>,
    moderation_timeout: Duration,
    min_description_length: usize,
    policy: DuplicatePolicy,
}

impl ContentGate {
    pub fn new(
        detector: DuplicateDetector,
        moderation: Option<Arc<dyn ModerationService>>,
        moderation_timeout: Duration,
        min_description_length: usize,
        policy: DuplicatePolicy,
    ) -> Self {
        Self {
            detector,
            moderation,
            moderation_timeout,
            min_description_length,
            policy,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Runs all checks for `submission`. Never fails.
    pub async fn evaluate(&self, submission: &Submission, corpus: &[CorpusEntry]) -> GateDecision {
        let validation_errors = validate(submission, self.min_description_length);
        let duplicate = self
            .detector
            .detect(&submission.comparison_text(), corpus);
        let moderation = match &submission.image_reference {
            Some(image) => Some(self.moderate(image).await),
            None => None,
        };

        let moderation_failed = moderation.as_ref().is_some_and(|v| !v.passes());
        let status = decide(
            !validation_errors.is_empty(),
            duplicate.is_duplicate,
            moderation_failed,
            self.policy,
        );

        debug!(
            id = %submission.id,
            status = %status,
            errors = validation_errors.len(),
            score = ?duplicate.score,
            "Gate evaluated submission"
        );

        GateDecision {
            status,
            validation_errors,
            duplicate,
            moderation,
        }
    }

    async fn moderate(&self, image: &str) -> ModerationVerdict {
        let Some(service) = &self.moderation else {
            return ModerationVerdict::Appropriate;
        };

        let verdict = match tokio::time::timeout(self.moderation_timeout, service.moderate(image))
            .await
        {
            Ok(verdict) => verdict,
            Err(_) => ModerationVerdict::Unavailable {
                reason: format!(
                    "moderation timed out after {} seconds",
                    self.moderation_timeout.as_secs()
                ),
            },
        };

        if let ModerationVerdict::Unavailable { reason } = &verdict {
            warn!(image, reason = %reason, "Moderation unavailable, letting image through");
        }
        verdict
    }
}
