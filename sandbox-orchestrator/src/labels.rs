//! Label convention for policy metadata stored on backend resources.
//!
//! Engines persist labels alongside the resource, so tenant tier, guest flag
//! and expiry survive a process restart without a database round-trip.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;

use crate::types::SandboxInfo;

pub const MANAGED: &str = "sandbox.managed";
pub const TENANT_ID: &str = "sandbox.tenant_id";
pub const NAME: &str = "sandbox.name";
pub const IMAGE: &str = "sandbox.image";
pub const ROLE: &str = "sandbox.role";
pub const TIER: &str = "sandbox.tier";
pub const GUEST: &str = "sandbox.guest";
pub const EXPIRES_AT: &str = "sandbox.expires_at";
pub const MEMORY_MB: &str = "sandbox.memory_mb";
pub const CPU_MILLICORES: &str = "sandbox.cpu_millicores";
pub const DISK_MB: &str = "sandbox.disk_mb";
pub const SHELL: &str = "sandbox.shell";

pub const GUEST_TIER: &str = "guest";

/// Session cap for guest sandboxes that carry no explicit expiry label.
pub const GUEST_MAX_SESSION: ChronoDuration = ChronoDuration::hours(2);

/// Merge caller labels over system labels. Caller labels win on conflict.
pub fn merge_labels(
    system: HashMap<String, String>,
    caller: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = system;
    for (key, value) in caller {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Whether the labels mark a guest (policy-subject) sandbox.
pub fn is_guest(labels: &HashMap<String, String>) -> bool {
    labels.get(TIER).is_some_and(|tier| tier == GUEST_TIER) || labels.contains_key(GUEST)
}

/// Explicit absolute expiry, if present and parseable as RFC 3339.
pub fn expires_at(labels: &HashMap<String, String>) -> Option<DateTime<Utc>> {
    labels
        .get(EXPIRES_AT)
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// The instant at which a sandbox's hard session cap elapses.
///
/// `None` for sandboxes that are neither guests nor carry an explicit expiry:
/// those run indefinitely.
pub fn session_deadline(info: &SandboxInfo) -> Option<DateTime<Utc>> {
    if let Some(deadline) = expires_at(&info.labels) {
        return Some(deadline);
    }
    if is_guest(&info.labels) {
        return Some(info.created_at + GUEST_MAX_SESSION);
    }
    None
}

pub fn is_expired(info: &SandboxInfo, now: DateTime<Utc>) -> bool {
    session_deadline(info).is_some_and(|deadline| now > deadline)
}

/// Remaining session time, zero once expired. `None` when uncapped.
pub fn time_remaining(info: &SandboxInfo, now: DateTime<Utc>) -> Option<ChronoDuration> {
    session_deadline(info).map(|deadline| (deadline - now).max(ChronoDuration::zero()))
}

/// Maximum concurrent sandboxes per tenant tier.
pub fn tenant_limit(tier: &str) -> usize {
    match tier {
        "guest" => 1,
        "trial" | "free" => 5,
        "pro" => 10,
        "enterprise" => 20,
        _ => 5,
    }
}

/// Parse a numeric label, ignoring missing or malformed values.
pub fn parse_u64(labels: &HashMap<String, String>, key: &str) -> Option<u64> {
    labels.get(key).and_then(|value| value.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SandboxStatus;

    fn info_with(labels: &[(&str, &str)], age: ChronoDuration) -> SandboxInfo {
        let now = Utc::now();
        SandboxInfo {
            id: "abc".into(),
            tenant_id: "t1".into(),
            name: "box".into(),
            image: "ubuntu".into(),
            provider: "docker".into(),
            status: SandboxStatus::Running,
            created_at: now - age,
            last_used_at: now,
            ip_address: String::new(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn caller_labels_override_system_labels() {
        let system = HashMap::from([
            (TENANT_ID.to_string(), "t1".to_string()),
            (TIER.to_string(), "free".to_string()),
        ]);
        let caller = HashMap::from([(TIER.to_string(), "guest".to_string())]);
        let merged = merge_labels(system, &caller);
        assert_eq!(merged.get(TIER).map(String::as_str), Some("guest"));
        assert_eq!(merged.get(TENANT_ID).map(String::as_str), Some("t1"));
    }

    #[test]
    fn guest_detection_accepts_tier_or_flag() {
        assert!(is_guest(&info_with(&[(TIER, "guest")], ChronoDuration::zero()).labels));
        assert!(is_guest(&info_with(&[(GUEST, "")], ChronoDuration::zero()).labels));
        assert!(!is_guest(&info_with(&[(TIER, "pro")], ChronoDuration::zero()).labels));
    }

    #[test]
    fn persistent_tier_never_expires() {
        let info = info_with(&[(TIER, "pro")], ChronoDuration::days(30));
        assert!(!is_expired(&info, Utc::now()));
        assert!(time_remaining(&info, Utc::now()).is_none());
    }

    #[test]
    fn guest_falls_back_to_max_session() {
        let fresh = info_with(&[(TIER, "guest")], ChronoDuration::minutes(10));
        let old = info_with(&[(TIER, "guest")], ChronoDuration::hours(3));
        assert!(!is_expired(&fresh, Utc::now()));
        assert!(is_expired(&old, Utc::now()));
        assert_eq!(
            time_remaining(&old, Utc::now()),
            Some(ChronoDuration::zero())
        );
    }

    #[test]
    fn explicit_expiry_wins_over_guest_fallback() {
        let past = (Utc::now() - ChronoDuration::minutes(1)).to_rfc3339();
        let future = (Utc::now() + ChronoDuration::hours(5)).to_rfc3339();

        // Young guest with an expiry in the past is expired.
        let info = info_with(&[(TIER, "guest"), (EXPIRES_AT, &past)], ChronoDuration::zero());
        assert!(is_expired(&info, Utc::now()));

        // Old guest with an expiry in the future is not.
        let info = info_with(&[(GUEST, "1"), (EXPIRES_AT, &future)], ChronoDuration::hours(3));
        assert!(!is_expired(&info, Utc::now()));

        // Expiry alone makes a non-guest expirable.
        let info = info_with(&[(EXPIRES_AT, &past)], ChronoDuration::zero());
        assert!(is_expired(&info, Utc::now()));
    }

    #[test]
    fn malformed_expiry_is_ignored() {
        let info = info_with(&[(EXPIRES_AT, "tomorrow")], ChronoDuration::days(10));
        assert!(!is_expired(&info, Utc::now()));
    }

    #[test]
    fn tier_limits() {
        assert_eq!(tenant_limit("guest"), 1);
        assert_eq!(tenant_limit("free"), 5);
        assert_eq!(tenant_limit("pro"), 10);
        assert_eq!(tenant_limit("enterprise"), 20);
        assert_eq!(tenant_limit("whatever"), 5);
    }
}
