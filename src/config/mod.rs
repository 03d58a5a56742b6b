use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://localhost:6689";

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EnvConfig {
    pub api_url: String,
}

impl EnvConfig {
    pub fn new() -> Self {
        // Both `window.ENV.API_URL` and the older `window.ENV.api_url` are accepted.
        for key in ["API_URL", "api_url"] {
            if let Some(url) = read_env_value(key).and_then(|v| v.as_string()) {
                return Self { api_url: url };
            }
        }

        Self {
            api_url: DEFAULT_API_URL.to_string(),
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn read_env_value(key: &str) -> Option<wasm_bindgen::JsValue> {
    let window = web_sys::window()?;
    let env = window.get("ENV")?;
    if env.is_undefined() || !env.is_object() {
        return None;
    }
    let value = js_sys::Reflect::get(&env, &key.into()).ok()?;
    if value.is_undefined() || value.is_null() {
        None
    } else {
        Some(value)
    }
}

/// Timing knobs for the sync engine. Durations are given in milliseconds when
/// deserialized.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub retry_base: Duration,
    #[serde(with = "millis")]
    pub retry_cap: Duration,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    #[serde(with = "millis")]
    pub reconnect_delay: Duration,
    #[serde(with = "millis")]
    pub debounce: Duration,
    pub push_path: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(5),
            debounce: Duration::from_secs(1),
            push_path: "/notes/events".to_string(),
        }
    }
}

impl SyncConfig {
    /// Defaults overlaid with `window.ENV.SYNC` (a JSON object) when present.
    pub fn from_env() -> Self {
        let Some(raw) = read_env_value("SYNC") else {
            return Self::default();
        };
        let Ok(Some(json)) = js_sys::JSON::stringify(&raw).map(|s| s.as_string()) else {
            return Self::default();
        };
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Self {
        match serde_json::from_str(json) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed sync config");
                Self::default()
            }
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_retry_contract() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_base, Duration::from_secs(1));
        assert_eq!(cfg.retry_cap, Duration::from_secs(30));
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.debounce, Duration::from_secs(1));
    }

    #[test]
    fn test_partial_json_overlays_defaults() {
        let cfg = SyncConfig::from_json(r#"{"poll_interval": 5000, "push_path": "/sse"}"#);
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.push_path, "/sse");
        assert_eq!(cfg.max_retries, 3);
    }

    #[test]
    fn test_malformed_json_falls_back() {
        assert_eq!(SyncConfig::from_json("not json"), SyncConfig::default());
    }
}
