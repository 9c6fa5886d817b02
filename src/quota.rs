use chrono::{DateTime, Utc};

use crate::session::{SessionState, SessionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaOutcome {
    Allowed { remaining: i64 },
    Unlimited,
    Exceeded,
    /// No session stored under the key.
    UnknownKey,
}

impl QuotaOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaOutcome::Allowed { .. } | QuotaOutcome::Unlimited)
    }
}

/// Take one request off the quota of `key`, renewing the window first when
/// it has elapsed. The check and the decrement happen in one store update.
pub async fn consume(store: &SessionStore, key: &str, now: DateTime<Utc>) -> QuotaOutcome {
    let now_ts = now.timestamp();
    let updated = store
        .update(key, Box::new(move |current| take_one(current?, now_ts)))
        .await;

    match updated.session {
        None => QuotaOutcome::UnknownKey,
        Some(s) if s.quota_max < 0 => QuotaOutcome::Unlimited,
        Some(s) if updated.changed => QuotaOutcome::Allowed { remaining: s.quota_remaining },
        Some(_) => QuotaOutcome::Exceeded,
    }
}

fn take_one(mut s: SessionState, now_ts: i64) -> Option<SessionState> {
    if s.quota_max < 0 {
        return None;
    }
    if s.quota_renewal_rate > 0 && now_ts >= s.quota_renews {
        s.quota_remaining = s.quota_max;
        s.quota_renews = now_ts + s.quota_renewal_rate;
    }
    if s.quota_remaining <= 0 {
        return None;
    }
    s.quota_remaining -= 1;
    s.last_updated = now_ts;
    Some(s)
}

/// Quota counters to keep when a session is re-persisted: carried over when
/// the quota definition did not change, reset otherwise.
pub fn carry_over(previous: Option<&SessionState>, next: &mut SessionState, now: DateTime<Utc>) {
    match previous {
        Some(prev)
            if prev.quota_max == next.quota_max
                && prev.quota_renewal_rate == next.quota_renewal_rate =>
        {
            next.quota_remaining = prev.quota_remaining;
            next.quota_renews = prev.quota_renews;
        }
        _ => {
            next.quota_remaining = next.quota_max;
            next.quota_renews = if next.quota_renewal_rate > 0 {
                now.timestamp() + next.quota_renewal_rate
            } else {
                0
            };
        }
    }
}
