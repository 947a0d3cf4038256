//! Core domain types shared across the gateway

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default country code prefixed to national numbers (Brazil).
pub const DEFAULT_COUNTRY_CODE: &str = "55";

/// Conversation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Open,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Message direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// Delivery status of a message.
///
/// Statuses are ranked so reconciliation only ever moves forward:
/// a `delivered` webhook arriving after `read` is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Ordering for idempotent reconciliation; `failed` is terminal.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            Self::Failed => 4,
        }
    }
}

/// Campaign lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Pending,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Per-recipient campaign outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Pending,
    Sent,
    Failed,
    Skipped24h,
}

impl ContactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Skipped24h => "skipped_24h",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "skipped_24h" => Some(Self::Skipped24h),
            _ => None,
        }
    }
}

/// Who produced a conversation event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Operator,
    Campaign,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::Campaign => "campaign",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "operator" => Some(Self::Operator),
            "campaign" => Some(Self::Campaign),
            _ => None,
        }
    }
}

/// Audit event kinds appended to the conversation log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationEventType {
    MessageSent,
    MessageReceived,
    TabulationApplied,
    CpcMarked,
    CpcCleared,
}

impl ConversationEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageSent => "message_sent",
            Self::MessageReceived => "message_received",
            Self::TabulationApplied => "tabulation_applied",
            Self::CpcMarked => "cpc_marked",
            Self::CpcCleared => "cpc_cleared",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "message_sent" => Some(Self::MessageSent),
            "message_received" => Some(Self::MessageReceived),
            "tabulation_applied" => Some(Self::TabulationApplied),
            "cpc_marked" => Some(Self::CpcMarked),
            "cpc_cleared" => Some(Self::CpcCleared),
            _ => None,
        }
    }
}

/// Phone number normalized to international digits (no `+`).
///
/// National 11-digit numbers (DDD + 9-digit mobile) get the default
/// country code prefixed; anything else is kept as its bare digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Normalize a raw phone string. Returns `None` when no digits remain.
    pub fn normalize(raw: &str) -> Option<Self> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return None;
        }
        if digits.len() == 11 {
            Some(Self(format!("{}{}", DEFAULT_COUNTRY_CODE, digits)))
        } else {
            Some(Self(digits))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn international(&self) -> String {
        format!("+{}", self.0)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validate a CPF (Brazilian taxpayer id) by its two check digits.
pub fn is_valid_cpf(raw: &str) -> bool {
    let digits: Vec<u32> = raw.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 11 {
        return false;
    }
    // Sequences like 000.000.000-00 pass the checksum but are not issued
    if digits.iter().all(|&d| d == digits[0]) {
        return false;
    }

    let check = |len: usize| -> u32 {
        let sum: u32 = digits[..len]
            .iter()
            .enumerate()
            .map(|(i, &d)| d * (len as u32 + 1 - i as u32))
            .sum();
        let rem = (sum * 10) % 11;
        if rem == 10 {
            0
        } else {
            rem
        }
    };

    check(9) == digits[9] && check(10) == digits[10]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_prefixes_country_code_on_national_numbers() {
        let phone = PhoneNumber::normalize("(11) 99999-8888").unwrap();
        assert_eq!(phone.as_str(), "5511999998888");
        assert_eq!(phone.international(), "+5511999998888");
    }

    #[test]
    fn normalize_keeps_already_international_numbers() {
        let phone = PhoneNumber::normalize("+55 11 99999-8888").unwrap();
        assert_eq!(phone.as_str(), "5511999998888");
    }

    #[test]
    fn normalize_leaves_short_numbers_untouched() {
        // 10 digits (landline without the ninth digit) is not prefixed
        let phone = PhoneNumber::normalize("1133334444").unwrap();
        assert_eq!(phone.as_str(), "1133334444");
    }

    #[test]
    fn normalize_rejects_empty_input() {
        assert!(PhoneNumber::normalize("abc").is_none());
        assert!(PhoneNumber::normalize("").is_none());
    }

    #[test]
    fn status_ranks_are_monotonic() {
        assert!(MessageStatus::Sent.rank() < MessageStatus::Delivered.rank());
        assert!(MessageStatus::Delivered.rank() < MessageStatus::Read.rank());
        assert!(MessageStatus::Read.rank() < MessageStatus::Failed.rank());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Read,
            MessageStatus::Failed,
        ] {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MessageStatus::parse("unknown"), None);
    }

    #[test]
    fn cpf_check_digits() {
        assert!(is_valid_cpf("529.982.247-25"));
        assert!(is_valid_cpf("52998224725"));
        assert!(!is_valid_cpf("529.982.247-26"));
        assert!(!is_valid_cpf("111.111.111-11"));
        assert!(!is_valid_cpf("1234567890"));
    }
}
