use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Minimum match confidence for a positive identification.
    pub match_threshold: f32,
    /// Number of detection results retained.
    pub result_log_capacity: usize,
    /// Directory of frames to replay as the live stream. No stream when unset.
    pub frame_dir: Option<PathBuf>,
    /// Interval between frame pulls for the live stream.
    pub frame_interval: Duration,
    /// Where alert notifications go.
    pub alert_destination: Option<String>,
    /// Overrides the default alert text.
    pub alert_message: Option<String>,
    /// Program invoked as `<cmd> <destination> <message>` per alert. Alerts
    /// are only logged when unset.
    pub alert_command: Option<String>,
    /// Upper bound on a single notification attempt.
    pub notify_timeout: Duration,
}

impl Config {
    /// Load configuration from `VIGIL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("vigil");

        let db_path = std::env::var("VIGIL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("watchlist.db"));

        Self {
            db_path,
            match_threshold: env_f32("VIGIL_MATCH_THRESHOLD", vigil_core::DEFAULT_MATCH_THRESHOLD),
            result_log_capacity: env_usize(
                "VIGIL_RESULT_LOG_CAPACITY",
                vigil_store::result_log::DEFAULT_CAPACITY,
            ),
            frame_dir: env_string("VIGIL_FRAME_DIR").map(PathBuf::from),
            frame_interval: Duration::from_millis(env_u64("VIGIL_FRAME_INTERVAL_MS", 200)),
            alert_destination: env_string("VIGIL_ALERT_DESTINATION"),
            alert_message: env_string("VIGIL_ALERT_MESSAGE"),
            alert_command: env_string("VIGIL_ALERT_COMMAND"),
            notify_timeout: Duration::from_secs(env_u64("VIGIL_NOTIFY_TIMEOUT_SECS", 10)),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring malformed config value");
            default
        }),
        Err(_) => default,
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    let value = env_parsed(key, default);
    if (0.0..=1.0).contains(&value) {
        value
    } else {
        tracing::warn!(key, value, "threshold outside [0, 1], using default");
        default
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_parsed(key, default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env_parsed(key, default)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own keys; the process environment is shared.

    #[test]
    fn test_parsed_values_and_fallbacks() {
        std::env::set_var("VIGIL_TEST_U64_OK", " 42 ");
        std::env::set_var("VIGIL_TEST_U64_BAD", "lots");
        assert_eq!(env_u64("VIGIL_TEST_U64_OK", 1), 42);
        assert_eq!(env_u64("VIGIL_TEST_U64_BAD", 7), 7);
        assert_eq!(env_u64("VIGIL_TEST_U64_UNSET", 9), 9);
    }

    #[test]
    fn test_threshold_out_of_range_falls_back() {
        std::env::set_var("VIGIL_TEST_F32_HIGH", "1.5");
        std::env::set_var("VIGIL_TEST_F32_OK", "0.65");
        assert_eq!(env_f32("VIGIL_TEST_F32_HIGH", 0.8), 0.8);
        assert_eq!(env_f32("VIGIL_TEST_F32_OK", 0.8), 0.65);
    }

    #[test]
    fn test_blank_strings_are_unset() {
        std::env::set_var("VIGIL_TEST_BLANK", "   ");
        assert_eq!(env_string("VIGIL_TEST_BLANK"), None);
    }
}
