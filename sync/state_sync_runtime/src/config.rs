use serde::{Deserialize, Serialize};

pub const DEFAULT_OUTBOUND_QUEUE_CAP: usize = 256;
pub const DEFAULT_MAX_BUFFERED_MESSAGES: usize = 64;
pub const DEFAULT_GAP_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 10_000;
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_MAX_RESEND_MESSAGES: usize = 256;

/// Bounds shared by the server and client sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Capacity of the host's outbound frame channel.
    pub outbound_queue_cap: usize,
    /// Out-of-order messages held while waiting for a missing one.
    pub max_buffered_messages: usize,
    pub gap_timeout_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_interval_ms: u64,
    /// Unacknowledged messages retained for replay. Beyond this, reconnect
    /// falls back to a snapshot.
    pub max_resend_messages: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            outbound_queue_cap: DEFAULT_OUTBOUND_QUEUE_CAP,
            max_buffered_messages: DEFAULT_MAX_BUFFERED_MESSAGES,
            gap_timeout_ms: DEFAULT_GAP_TIMEOUT_MS,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            max_resend_messages: DEFAULT_MAX_RESEND_MESSAGES,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads every `STATE_SYNC_*` setting through `lookup`. Missing, invalid
    /// or zero values keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            outbound_queue_cap: parse_positive(
                &lookup,
                "STATE_SYNC_OUTBOUND_QUEUE_CAP",
                DEFAULT_OUTBOUND_QUEUE_CAP,
            ),
            max_buffered_messages: parse_positive(
                &lookup,
                "STATE_SYNC_MAX_BUFFERED_MESSAGES",
                DEFAULT_MAX_BUFFERED_MESSAGES,
            ),
            gap_timeout_ms: parse_positive(
                &lookup,
                "STATE_SYNC_GAP_TIMEOUT_MS",
                DEFAULT_GAP_TIMEOUT_MS,
            ),
            reconnect_attempts: parse_positive(
                &lookup,
                "STATE_SYNC_RECONNECT_ATTEMPTS",
                DEFAULT_RECONNECT_ATTEMPTS,
            ),
            reconnect_interval_ms: parse_positive(
                &lookup,
                "STATE_SYNC_RECONNECT_INTERVAL_MS",
                DEFAULT_RECONNECT_INTERVAL_MS,
            ),
            max_resend_messages: parse_positive(
                &lookup,
                "STATE_SYNC_MAX_RESEND_MESSAGES",
                DEFAULT_MAX_RESEND_MESSAGES,
            ),
        }
    }
}

fn parse_positive<T, F>(lookup: &F, name: &str, default: T) -> T
where
    T: std::str::FromStr + PartialEq + Default,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .filter(|value| *value != T::default())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(SyncConfig::from_lookup(|_| None), SyncConfig::default());
    }

    #[test]
    fn reads_overrides() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("STATE_SYNC_MAX_BUFFERED_MESSAGES", "8"),
            ("STATE_SYNC_GAP_TIMEOUT_MS", " 250 "),
            ("STATE_SYNC_RECONNECT_ATTEMPTS", "3"),
        ]));

        assert_eq!(config.max_buffered_messages, 8);
        assert_eq!(config.gap_timeout_ms, 250);
        assert_eq!(config.reconnect_attempts, 3);
        assert_eq!(config.outbound_queue_cap, DEFAULT_OUTBOUND_QUEUE_CAP);
    }

    #[test]
    fn zero_and_garbage_fall_back_to_defaults() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("STATE_SYNC_OUTBOUND_QUEUE_CAP", "0"),
            ("STATE_SYNC_MAX_RESEND_MESSAGES", "lots"),
        ]));

        assert_eq!(config.outbound_queue_cap, DEFAULT_OUTBOUND_QUEUE_CAP);
        assert_eq!(config.max_resend_messages, DEFAULT_MAX_RESEND_MESSAGES);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"gap_timeout_ms": 100}"#).expect("decode config");
        assert_eq!(config.gap_timeout_ms, 100);
        assert_eq!(config.max_buffered_messages, DEFAULT_MAX_BUFFERED_MESSAGES);
    }
}
