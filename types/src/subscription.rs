use serde::{Deserialize, Serialize};

use crate::common::{EnvVar, Millis};
use crate::id::ResourceId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionHeader {
    pub key: String,
    pub value: EnvVar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: ResourceId,
    pub owner_id: String,
    pub url: String,
    pub headers: Vec<SubscriptionHeader>,
    pub event_type: Option<String>,
    /// How long delivery may keep failing before the subscription is
    /// flagged unhealthy, in milliseconds.
    pub failure_threshold_ms: i64,
    pub last_delivery_attempt_at: Millis,
    pub last_delivery_success_at: Millis,
    pub failure_count: i64,

    pub create_at: Millis,
    pub update_at: Millis,
    pub delete_at: Millis,
}

impl Subscription {
    pub fn is_deleted(&self) -> bool {
        self.delete_at != 0
    }

    /// Unhealthy once failures have persisted longer than the threshold.
    pub fn is_unhealthy(&self, now_ms: Millis) -> bool {
        self.failure_count > 0
            && self.last_delivery_success_at < self.last_delivery_attempt_at
            && now_ms.saturating_sub(self.last_delivery_attempt_at) >= 0
            && self.failure_count_duration(now_ms) >= self.failure_threshold_ms
    }

    fn failure_count_duration(&self, now_ms: Millis) -> i64 {
        let since = if self.last_delivery_success_at > 0 {
            self.last_delivery_success_at
        } else {
            self.create_at
        };
        now_ms.saturating_sub(since)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub owner_id: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<SubscriptionHeader>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default = "default_failure_threshold_ms")]
    pub failure_threshold_ms: i64,
}

fn default_failure_threshold_ms() -> i64 {
    24 * 60 * 60 * 1000
}

/// A resource transitioning from one state to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeEventData {
    pub resource_type: String,
    pub resource_id: ResourceId,
    /// Owner the transitioned resource belongs to, used to resolve which
    /// subscriptions should receive this event. Resources with no natural
    /// owner (e.g. a Group) use `"system"`.
    pub owner_id: String,
    pub old_state: String,
    pub new_state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub id: ResourceId,
    pub timestamp: Millis,
    pub event_type: String,
    pub data: StateChangeEventData,
    /// Set when the transition was admission-driven, for client
    /// correlation with the originating HTTP request.
    pub request_id: Option<String>,
    pub delivered: bool,
}
