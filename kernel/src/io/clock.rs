//! Wall-clock timestamps for persisted records.

use chrono::{SecondsFormat, Utc};

/// Current UTC time as RFC 3339 with millisecond precision.
pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
