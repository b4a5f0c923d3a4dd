//! Time utilities and constants for swap coordination.

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Protocol timing constants.
pub mod constants {
    use super::Duration;

    /// Default distributed lock TTL (30 seconds).
    pub fn default_lock_ttl() -> Duration {
        Duration::seconds(30)
    }

    /// Maximum distributed lock TTL (5 minutes).
    pub fn max_lock_ttl() -> Duration {
        Duration::minutes(5)
    }

    /// How long a terminal swap record is retained before garbage collection (7 days).
    pub fn record_retention() -> Duration {
        Duration::days(7)
    }

    /// How long a secret entry is retained for audit (14 days).
    pub fn secret_retention() -> Duration {
        Duration::days(14)
    }

    /// How long lock audit entries are retained (1 day).
    pub fn lock_audit_retention() -> Duration {
        Duration::days(1)
    }
}

/// A timestamp with timezone (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Check if a timestamp has expired (is in the past).
pub fn is_expired(expiry: Timestamp) -> bool {
    now() > expiry
}

/// Calculate expiry time from now.
pub fn expires_in(duration: Duration) -> Timestamp {
    now() + duration
}

/// Calculate expiry time from now for a `std` duration, saturating on overflow.
pub fn expires_in_std(duration: std::time::Duration) -> Timestamp {
    Duration::from_std(duration)
        .ok()
        .and_then(|d| now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Convert a `std` duration, saturating at one century.
pub fn chrono_duration(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or_else(|_| Duration::days(36_500))
}

/// Seconds since the Unix epoch, clamped at zero.
pub fn unix_seconds(ts: Timestamp) -> u64 {
    u64::try_from(ts.timestamp()).unwrap_or(0)
}

/// Timestamp for a Unix second count, if representable.
pub fn from_unix_seconds(secs: u64) -> Option<Timestamp> {
    let secs = i64::try_from(secs).ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

/// Duration extensions for convenient conversion.
pub trait DurationExt {
    fn as_std(&self) -> std::time::Duration;
}

impl DurationExt for Duration {
    fn as_std(&self) -> std::time::Duration {
        self.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_expired() {
        let past = now() - Duration::seconds(10);
        assert!(is_expired(past));

        let future = now() + Duration::seconds(10);
        assert!(!is_expired(future));
    }

    #[test]
    fn test_unix_round_trip() {
        let ts = from_unix_seconds(1_700_000_000).unwrap();
        assert_eq!(unix_seconds(ts), 1_700_000_000);
    }

    #[test]
    fn test_chrono_duration() {
        assert_eq!(
            chrono_duration(std::time::Duration::from_secs(90)),
            Duration::seconds(90)
        );
        assert_eq!(
            chrono_duration(std::time::Duration::from_secs(u64::MAX)),
            Duration::days(36_500)
        );
    }

    #[test]
    fn test_expires_in_std_saturates() {
        let far = expires_in_std(std::time::Duration::from_secs(u64::MAX));
        assert!(far > now());
    }
}
