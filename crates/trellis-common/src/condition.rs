//! Kubernetes-style conditions and the transition helper that writes them
//!
//! Conditions are the single user-visible status channel. A
//! [`ConditionTracker`] applies a transition only when the desired
//! status, reason or message differs from what is already recorded, and
//! reports whether anything changed so callers can skip the status write.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Provisioned, Updated)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// A status object that carries a list of conditions
pub trait HasConditions {
    /// Current conditions
    fn conditions(&self) -> &[Condition];
    /// Mutable access to the conditions
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

/// Applies transitions for one named condition type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConditionTracker(&'static str);

/// Node or cluster work has completed
pub const PROVISIONED: ConditionTracker = ConditionTracker::new("Provisioned");
/// The desired tree was materialized from the latest spec
pub const UPDATED: ConditionTracker = ConditionTracker::new("Updated");
/// Reconciliation is waiting on something outside its control
pub const WAITING: ConditionTracker = ConditionTracker::new("Waiting");
/// The object is usable
pub const READY: ConditionTracker = ConditionTracker::new("Ready");

impl ConditionTracker {
    /// Tracker for the given condition type
    pub const fn new(type_: &'static str) -> Self {
        Self(type_)
    }

    /// Condition type name
    pub fn name(&self) -> &'static str {
        self.0
    }

    /// The recorded condition, if any
    pub fn get<'a, T: HasConditions + ?Sized>(&self, obj: &'a T) -> Option<&'a Condition> {
        obj.conditions().iter().find(|c| c.type_ == self.0)
    }

    /// Recorded status, `Unknown` when the condition is absent
    pub fn status<T: HasConditions + ?Sized>(&self, obj: &T) -> ConditionStatus {
        self.get(obj)
            .map(|c| c.status.clone())
            .unwrap_or_default()
    }

    /// Whether the condition is recorded as True
    pub fn is_true<T: HasConditions + ?Sized>(&self, obj: &T) -> bool {
        self.status(obj) == ConditionStatus::True
    }

    /// Whether the condition is recorded as False
    pub fn is_false<T: HasConditions + ?Sized>(&self, obj: &T) -> bool {
        self.status(obj) == ConditionStatus::False
    }

    /// Recorded message, empty when absent
    pub fn message<'a, T: HasConditions + ?Sized>(&self, obj: &'a T) -> &'a str {
        self.get(obj).map(|c| c.message.as_str()).unwrap_or("")
    }

    /// Recorded reason, empty when absent
    pub fn reason<'a, T: HasConditions + ?Sized>(&self, obj: &'a T) -> &'a str {
        self.get(obj).map(|c| c.reason.as_str()).unwrap_or("")
    }

    /// Apply a transition, returning whether anything changed
    ///
    /// The transition time only moves when the status itself changes; a
    /// reason or message change updates the text in place.
    pub fn set<T: HasConditions + ?Sized>(
        &self,
        obj: &mut T,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        let reason = reason.into();
        let message = message.into();
        let conditions = obj.conditions_mut();

        match conditions.iter_mut().find(|c| c.type_ == self.0) {
            Some(existing) => {
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message
                {
                    return false;
                }
                if existing.status != status {
                    existing.last_transition_time = Utc::now();
                    existing.status = status;
                }
                existing.reason = reason;
                existing.message = message;
                true
            }
            None => {
                conditions.push(Condition::new(self.0, status, reason, message));
                true
            }
        }
    }

    /// Mark the condition True
    pub fn set_true<T: HasConditions + ?Sized>(&self, obj: &mut T, reason: &str) -> bool {
        self.set(obj, ConditionStatus::True, reason, "")
    }

    /// Mark the condition False with a message
    pub fn set_false<T: HasConditions + ?Sized>(
        &self,
        obj: &mut T,
        reason: &str,
        message: impl Into<String>,
    ) -> bool {
        self.set(obj, ConditionStatus::False, reason, message)
    }

    /// Mark the condition Unknown with a message
    pub fn set_unknown<T: HasConditions + ?Sized>(
        &self,
        obj: &mut T,
        reason: &str,
        message: impl Into<String>,
    ) -> bool {
        self.set(obj, ConditionStatus::Unknown, reason, message)
    }

    /// Remove the condition, returning whether it was present
    pub fn clear<T: HasConditions + ?Sized>(&self, obj: &mut T) -> bool {
        let conditions = obj.conditions_mut();
        let before = conditions.len();
        conditions.retain(|c| c.type_ != self.0);
        before != conditions.len()
    }
}
