//! Status conditions and the Ready summarization.
//!
//! Conditions are plain data on the object status; the summary is computed by
//! a pure reducer over the condition set, never by per-condition logic
//! scattered through the reconcilers.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition types owned by the source reconcilers.
pub mod types {
    pub const READY: &str = "Ready";
    pub const STALLED: &str = "Stalled";
    pub const RECONCILING: &str = "Reconciling";
    pub const FETCH_FAILED: &str = "FetchFailed";
    pub const BUILD_FAILED: &str = "BuildFailed";
    pub const STORAGE_OPERATION_FAILED: &str = "StorageOperationFailed";
    pub const ARTIFACT_OUTDATED: &str = "ArtifactOutdated";
    pub const ARTIFACT_IN_STORAGE: &str = "ArtifactInStorage";
    pub const SOURCE_VERIFIED: &str = "SourceVerified";
}

/// Well-known condition and event reasons.
pub mod reasons {
    pub const SUCCEEDED: &str = "Succeeded";
    pub const FAILED: &str = "Failed";
    pub const PROGRESSING: &str = "Progressing";
    pub const PROGRESSING_WITH_RETRY: &str = "ProgressingWithRetry";
    pub const URL_INVALID: &str = "URLInvalid";
    pub const UNSUPPORTED_SOURCE_KIND: &str = "UnsupportedSourceKind";
    pub const AUTHENTICATION_FAILED: &str = "AuthenticationFailed";
    pub const VERIFICATION_ERROR: &str = "VerificationError";
    pub const NO_SOURCE_ARTIFACT: &str = "NoSourceArtifact";
    pub const NEW_REVISION: &str = "NewRevision";
    pub const NEW_CHART: &str = "NewChart";
}

/// A single observation on an object, mirroring the Kubernetes meta/v1
/// Condition shape.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    pub reason: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";
pub const STATUS_UNKNOWN: &str = "Unknown";

/// Accessor for objects carrying a condition list in their status.
pub trait HasConditions {
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

fn set(obj: &mut impl HasConditions, condition: Condition) {
    let conditions = obj.conditions_mut();
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        // Only bump the transition time when the status flips.
        let transition = if existing.status != condition.status {
            condition.last_transition_time
        } else {
            existing.last_transition_time
        };
        *existing = Condition {
            last_transition_time: transition,
            ..condition
        };
    } else {
        conditions.push(condition);
    }
}

fn mark(
    obj: &mut impl HasConditions,
    type_: &str,
    status: &str,
    reason: &str,
    message: impl Into<String>,
    generation: i64,
) {
    set(
        obj,
        Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: Some(Utc::now()),
            observed_generation: Some(generation),
        },
    );
}

pub fn mark_true(
    obj: &mut impl HasConditions,
    type_: &str,
    reason: &str,
    message: impl Into<String>,
    generation: i64,
) {
    mark(obj, type_, STATUS_TRUE, reason, message, generation);
}

pub fn mark_false(
    obj: &mut impl HasConditions,
    type_: &str,
    reason: &str,
    message: impl Into<String>,
    generation: i64,
) {
    mark(obj, type_, STATUS_FALSE, reason, message, generation);
}

/// Marks the object as reconciling with the given progress message.
pub fn mark_reconciling(
    obj: &mut impl HasConditions,
    reason: &str,
    message: impl Into<String>,
    generation: i64,
) {
    delete(obj, types::STALLED);
    mark_true(obj, types::RECONCILING, reason, message, generation);
}

/// Marks the object as stalled with the given reason.
pub fn mark_stalled(
    obj: &mut impl HasConditions,
    reason: &str,
    message: impl Into<String>,
    generation: i64,
) {
    delete(obj, types::RECONCILING);
    mark_true(obj, types::STALLED, reason, message, generation);
}

pub fn delete(obj: &mut impl HasConditions, type_: &str) {
    obj.conditions_mut().retain(|c| c.type_ != type_);
}

pub fn get<'a>(obj: &'a impl HasConditions, type_: &str) -> Option<&'a Condition> {
    obj.conditions().iter().find(|c| c.type_ == type_)
}

pub fn is_true(obj: &impl HasConditions, type_: &str) -> bool {
    get(obj, type_).map(|c| c.status == STATUS_TRUE).unwrap_or(false)
}

pub fn is_false(obj: &impl HasConditions, type_: &str) -> bool {
    get(obj, type_).map(|c| c.status == STATUS_FALSE).unwrap_or(false)
}

pub fn is_ready(obj: &impl HasConditions) -> bool {
    is_true(obj, types::READY)
}

pub fn is_stalled(obj: &impl HasConditions) -> bool {
    is_true(obj, types::STALLED)
}

pub fn is_reconciling(obj: &impl HasConditions) -> bool {
    is_true(obj, types::RECONCILING)
}

/// Negative-polarity conditions, ordered worst first. The first one found
/// True decides the Ready reason.
const NEGATIVE_POLARITY: [&str; 4] = [
    types::STORAGE_OPERATION_FAILED,
    types::BUILD_FAILED,
    types::FETCH_FAILED,
    types::ARTIFACT_OUTDATED,
];

/// Direction of a Ready transition produced by [`summarize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyTransition {
    BecameReady { reason: String, message: String },
    BecameUnready { reason: String, message: String },
}

/// Collapses the sub-condition set into the Ready condition.
///
/// The rules, in priority order:
/// 1. Stalled=True wins and propagates its reason; Reconciling is removed.
/// 2. A True negative-polarity condition makes Ready=False with the worst
///    reason (storage > build > fetch > outdated).
/// 3. SourceVerified=False makes Ready=False.
/// 4. ArtifactInStorage=True with no active Reconciling makes Ready=True.
/// 5. Otherwise Ready keeps its previous state.
///
/// A still-present Reconciling condition after a failed run is rewritten to
/// the ProgressingWithRetry reason. Returns at most one Ready transition for
/// event emission.
pub fn summarize(obj: &mut impl HasConditions, generation: i64) -> Option<ReadyTransition> {
    let was_ready = is_ready(obj);

    if let Some(stalled) = get(obj, types::STALLED).cloned() {
        if stalled.status == STATUS_TRUE {
            delete(obj, types::RECONCILING);
            mark_false(obj, types::READY, &stalled.reason, stalled.message, generation);
            return transition(obj, was_ready);
        }
    }

    for type_ in NEGATIVE_POLARITY {
        if let Some(c) = get(obj, type_).cloned() {
            if c.status == STATUS_TRUE {
                mark_false(obj, types::READY, &c.reason, c.message, generation);
                collapse_retry(obj, generation);
                return transition(obj, was_ready);
            }
        }
    }

    if let Some(verified) = get(obj, types::SOURCE_VERIFIED).cloned() {
        if verified.status == STATUS_FALSE {
            mark_false(obj, types::READY, &verified.reason, verified.message, generation);
            collapse_retry(obj, generation);
            return transition(obj, was_ready);
        }
    }

    let in_storage = get(obj, types::ARTIFACT_IN_STORAGE).cloned();
    if let Some(c) = in_storage {
        if c.status == STATUS_TRUE && !is_reconciling(obj) {
            mark_true(obj, types::READY, &c.reason, c.message, generation);
            return transition(obj, was_ready);
        }
    }

    // No decisive observation: Ready keeps its previous state, or Unknown if
    // it never had one.
    if get(obj, types::READY).is_none() {
        mark(
            obj,
            types::READY,
            STATUS_UNKNOWN,
            reasons::PROGRESSING,
            "reconciliation in progress",
            generation,
        );
    }
    collapse_retry(obj, generation);
    transition(obj, was_ready)
}

/// A Reconciling condition that survives a failed run means the controller
/// is retrying; rewrite its reason so observers can tell.
fn collapse_retry(obj: &mut impl HasConditions, generation: i64) {
    if let Some(reconciling) = get(obj, types::RECONCILING).cloned() {
        if reconciling.status == STATUS_TRUE && reconciling.reason != reasons::PROGRESSING_WITH_RETRY {
            mark_true(
                obj,
                types::RECONCILING,
                reasons::PROGRESSING_WITH_RETRY,
                reconciling.message,
                generation,
            );
        }
    }
}

fn transition(obj: &impl HasConditions, was_ready: bool) -> Option<ReadyTransition> {
    let ready = get(obj, types::READY)?;
    match (was_ready, ready.status.as_str()) {
        (false, STATUS_TRUE) => Some(ReadyTransition::BecameReady {
            reason: ready.reason.clone(),
            message: ready.message.clone(),
        }),
        (true, STATUS_FALSE) => Some(ReadyTransition::BecameUnready {
            reason: ready.reason.clone(),
            message: ready.message.clone(),
        }),
        _ => None,
    }
}
