use chrono::SecondsFormat;
use chrono::Utc;

/// Current UTC time as RFC3339 with second precision,
/// e.g. `2026-10-19T08:30:00Z`.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
