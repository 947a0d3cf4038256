//! Manual-message eligibility
//!
//! Whether an operator may currently send a free-form (non-template)
//! message to a customer. Computed fresh from the conversation's stored
//! timestamps and counters on every read; nothing here is persisted.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::model::Conversation;

/// Manual attempts allowed before the customer must reply.
pub const MANUAL_ATTEMPTS_LIMIT: i32 = 2;
/// Hours an operator is blocked after a manual send.
pub const MANUAL_BLOCK_HOURS: i64 = 3;
/// Hours after which the attempt counter window expires.
pub const ATTEMPT_RESET_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize)]
pub struct Eligibility {
    pub can_send: bool,
    pub attempts_count: i32,
    pub attempts_limit: i32,
    pub blocked_until: Option<DateTime<Utc>>,
    pub limit_reached: bool,
    pub is_blocked_by_time: bool,
    pub last_message_from_customer: bool,
}

/// Why a manual send was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendDenial {
    AttemptLimit,
    TimeWindow(Option<DateTime<Utc>>),
    Blocked,
}

impl SendDenial {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::AttemptLimit => "attempt_limit_reached",
            Self::TimeWindow(_) => "wait_for_time_window",
            Self::Blocked => "blocked",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::AttemptLimit => format!(
                "Manual attempt limit of {} reached; wait for the customer to reply",
                MANUAL_ATTEMPTS_LIMIT
            ),
            Self::TimeWindow(Some(until)) => {
                format!("Wait for the time window; blocked until {}", until.to_rfc3339())
            }
            Self::TimeWindow(None) => "Wait for the time window".to_string(),
            Self::Blocked => "Sending is currently blocked for this conversation".to_string(),
        }
    }
}

/// Compute current eligibility from the conversation snapshot.
pub fn compute_eligibility(conversation: &Conversation, now: DateTime<Utc>) -> Eligibility {
    // Rolling-window expiry of the attempt counter
    let attempts = match conversation.manual_attempts_window_start {
        Some(window_start) if now - window_start >= Duration::hours(ATTEMPT_RESET_HOURS) => 0,
        _ => conversation.manual_attempts_count,
    };

    // "Customer replied since the last operator message", inferred without
    // a dedicated flag: any customer message counts while no block/agent
    // timestamp exists to compare against.
    let customer_replied = conversation.last_customer_message_at.is_some()
        && (conversation.manual_blocked_until.is_none()
            || conversation.last_agent_message_at.is_none()
            || conversation.last_customer_message_at > conversation.last_agent_message_at);

    if customer_replied {
        // The customer's reply is the universal unlock: counters report
        // fully reset regardless of stored values.
        return Eligibility {
            can_send: true,
            attempts_count: 0,
            attempts_limit: MANUAL_ATTEMPTS_LIMIT,
            blocked_until: None,
            limit_reached: false,
            is_blocked_by_time: false,
            last_message_from_customer: true,
        };
    }

    let is_blocked_by_time = conversation
        .manual_blocked_until
        .map_or(false, |until| until > now);
    let limit_reached = attempts >= MANUAL_ATTEMPTS_LIMIT;

    Eligibility {
        can_send: !is_blocked_by_time && !limit_reached,
        attempts_count: attempts,
        attempts_limit: MANUAL_ATTEMPTS_LIMIT,
        blocked_until: conversation.manual_blocked_until,
        limit_reached,
        is_blocked_by_time,
        last_message_from_customer: false,
    }
}

/// The denial reason when `can_send` is false.
pub fn send_denial(eligibility: &Eligibility) -> Option<SendDenial> {
    if eligibility.can_send {
        return None;
    }
    if eligibility.limit_reached {
        Some(SendDenial::AttemptLimit)
    } else if eligibility.is_blocked_by_time {
        Some(SendDenial::TimeWindow(eligibility.blocked_until))
    } else {
        Some(SendDenial::Blocked)
    }
}

/// Conversation updates applied after a successful manual send.
#[derive(Debug, Clone)]
pub struct ManualSendEffects {
    pub attempts_count: i32,
    pub window_start: DateTime<Utc>,
    pub blocked_until: DateTime<Utc>,
}

/// The counter side effects of a manual send at `now`. A reply-unlocked or
/// expired window restarts counting from scratch.
pub fn manual_send_effects(conversation: &Conversation, now: DateTime<Utc>) -> ManualSendEffects {
    let eligibility = compute_eligibility(conversation, now);
    let window_start = if eligibility.attempts_count == 0 {
        now
    } else {
        conversation.manual_attempts_window_start.unwrap_or(now)
    };
    ManualSendEffects {
        attempts_count: (eligibility.attempts_count + 1).min(MANUAL_ATTEMPTS_LIMIT),
        window_start,
        blocked_until: now + Duration::hours(MANUAL_BLOCK_HOURS),
    }
}
