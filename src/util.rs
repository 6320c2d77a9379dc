use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in whole seconds since the epoch.
pub fn now_ts_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current wall-clock time in microseconds since the epoch. Used for chat
/// history timestamps, which need finer resolution than seconds to keep
/// `(module_id, profile, session_id, timestamp)` unique under load.
pub fn now_ts_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Generates a readable, collision-resistant identifier in the style the
/// platform uses for module ids: a caller-supplied prefix followed by the
/// first 12 hex characters of a v4 UUID, so ids stay shorter than a bare
/// UUID while remaining legible in logs and UIs.
pub fn generate_readable_uid(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..12])
}
