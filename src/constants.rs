//! Application-wide constants for sitebell.
//!
//! This module centralizes all magic numbers and configuration constants
//! to improve maintainability and discoverability. Constants are grouped
//! by domain with documentation explaining their purpose.
//!
//! # Categories
//!
//! - **Timeouts**: Network and operation timeouts
//! - **Dispatch**: Fan-out limits
//! - **Credentials**: Bearer token lifecycle
//! - **Change feed**: Reconnection and buffering
//! - **Surfacing**: Local alert scheduling

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// Per-request timeout for push gateway sends.
///
/// A send that has not completed within this window is reported as a
/// transient failure for that endpoint. Kept short so one slow endpoint
/// cannot stall a fan-out with dozens of siblings.
pub const GATEWAY_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP timeout for the bearer token exchange.
///
/// The exchange is a single small POST; 10 seconds covers slow links
/// while preventing indefinite hangs on network issues.
pub const TOKEN_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client request timeout for ledger backend calls.
pub const LEDGER_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the change-feed server's welcome frame.
pub const FEED_WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Dispatch
// ============================================================================

/// Maximum concurrent in-flight gateway sends per process.
///
/// Accounts typically hold a handful of device endpoints, but shared
/// accounts can accumulate dozens. Capping in-flight sends keeps the
/// connection pool within the gateway's budget.
pub const MAX_IN_FLIGHT_SENDS: usize = 50;

// ============================================================================
// Credentials
// ============================================================================

/// Renewal margin subtracted from a bearer token's expiry.
///
/// A cached token is treated as expired this long before its actual
/// expiry so a send never goes out with a token about to lapse mid-flight.
pub const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Lifetime of the signed assertion presented to the token endpoint.
pub const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Clock-skew allowance backdating the assertion's issued-at claim.
///
/// Token endpoints reject assertions issued "in the future"; backdating
/// by a minute tolerates modest clock drift.
pub const CLOCK_SKEW_ALLOWANCE_SECS: i64 = 60;

// ============================================================================
// Change feed
// ============================================================================

/// Initial reconnect backoff after a dropped feed connection.
pub const FEED_INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum reconnect backoff between feed connection attempts.
pub const FEED_MAX_BACKOFF_SECS: u64 = 30;

/// Feed connection is considered dead after this much silence.
///
/// The feed server pings every few seconds, so a healthy but idle
/// subscription never trips this.
pub const FEED_STALE_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval between feed connection health checks.
pub const FEED_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Buffer size of the per-subscription event queue.
pub const FEED_CHANNEL_CAPACITY: usize = 256;

/// Buffer size of the per-account event fan-out to local consumers.
///
/// A consumer that falls further behind than this sees a resync event
/// instead of the missed deltas.
pub const FEED_FANOUT_CAPACITY: usize = 64;

// ============================================================================
// Surfacing & listing
// ============================================================================

/// Defer between observing a notification and firing its local alert.
///
/// Gives the in-app surface a beat to settle before the alert fires,
/// matching how the mobile sessions schedule theirs.
pub const ALERT_DEFER: Duration = Duration::from_millis(300);

/// Page size applied to ledger listings when the caller gives no limit.
pub const DEFAULT_LIST_LIMIT: usize = 50;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_values_are_reasonable() {
        // Gateway sends must stay well under the exchange/ledger timeouts
        assert!(GATEWAY_SEND_TIMEOUT < TOKEN_EXCHANGE_TIMEOUT);
        assert!(GATEWAY_SEND_TIMEOUT >= Duration::from_secs(2));
        assert!(LEDGER_REQUEST_TIMEOUT <= Duration::from_secs(60));
    }

    #[test]
    fn test_expiry_margin_smaller_than_assertion_lifetime() {
        assert!(i64::try_from(TOKEN_EXPIRY_MARGIN.as_secs()).unwrap() < ASSERTION_LIFETIME_SECS);
        assert!(CLOCK_SKEW_ALLOWANCE_SECS < ASSERTION_LIFETIME_SECS);
    }

    #[test]
    fn test_feed_backoff_ordering() {
        assert!(FEED_INITIAL_BACKOFF_SECS < FEED_MAX_BACKOFF_SECS);
        assert!(FEED_HEALTH_CHECK_INTERVAL < FEED_STALE_TIMEOUT);
    }

    #[test]
    fn test_fanout_bounds_are_positive() {
        assert!(MAX_IN_FLIGHT_SENDS >= 1);
        assert!(FEED_CHANNEL_CAPACITY >= FEED_FANOUT_CAPACITY);
        assert!(DEFAULT_LIST_LIMIT >= 1);
    }
}
