//! Connection descriptor handed to a session at construction.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backend connection options plus the session-level connectivity knobs.
///
/// Everything other than `ping_interval` and `auto_reconnect` is opaque to the
/// engine and forwarded to the backend capability as-is.
///
/// ```
/// use dbsession_core::ConnectionOptions;
///
/// let opts: ConnectionOptions = serde_json::from_str(
///     r#"{"db_file": ":memory:", "ping_interval": 30, "auto_reconnect": true}"#,
/// ).unwrap();
/// assert_eq!(opts.get_str("db_file"), Some(":memory:"));
/// assert!(opts.auto_reconnect);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Backend-specific options (host, credentials, file path, ...)
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
    /// Keep-alive interval in seconds; absent or non-positive disables probing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_interval: Option<f64>,
    /// Retry statements that fail on a lost connection after reconnecting
    #[serde(default)]
    pub auto_reconnect: bool,
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a descriptor from a JSON object.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::config(
                "connection_options",
                "No connection_options dict given.",
            ));
        }
        let options: Self = serde_json::from_value(value)
            .map_err(|e| Error::config("connection_options", e.to_string()))?;
        if let Some(secs) = options.ping_interval {
            if secs > 0.0 && Duration::try_from_secs_f64(secs).is_err() {
                return Err(Error::config(
                    "ping_interval",
                    format!("The ping_interval of {} seconds is out of range.", secs),
                ));
            }
        }
        Ok(options)
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval.as_secs_f64());
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Keep-alive interval, if probing is enabled.
    ///
    /// Intervals too large for a [`Duration`] disable probing as well.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.ping_interval
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.options.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(serde_json::Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(serde_json::Value::as_bool)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(serde_json::Value::as_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_knobs_are_split_from_backend_options() {
        let opts = ConnectionOptions::from_json(json!({
            "db_file": "/tmp/x.db",
            "database_name": "main",
            "ping_interval": 0.5,
            "auto_reconnect": true
        }))
        .unwrap();

        assert_eq!(opts.options.len(), 2);
        assert_eq!(opts.get_str("database_name"), Some("main"));
        assert_eq!(opts.keepalive_interval(), Some(Duration::from_millis(500)));
        assert!(opts.auto_reconnect);
    }

    #[test]
    fn non_positive_ping_interval_disables_probing() {
        let opts = ConnectionOptions {
            ping_interval: Some(0.0),
            ..ConnectionOptions::default()
        };
        assert_eq!(opts.keepalive_interval(), None);

        let parsed = ConnectionOptions::from_json(json!({"ping_interval": -3})).unwrap();
        assert_eq!(parsed.keepalive_interval(), None);
        assert!(!parsed.auto_reconnect);
    }

    #[test]
    fn huge_ping_interval_is_rejected_when_parsed() {
        let err = ConnectionOptions::from_json(json!({"ping_interval": 1e30})).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.message().contains("out of range"));
    }

    #[test]
    fn unrepresentable_interval_disables_probing() {
        for secs in [1e30, f64::INFINITY, f64::NAN] {
            let opts = ConnectionOptions {
                ping_interval: Some(secs),
                ..ConnectionOptions::default()
            };
            assert_eq!(opts.keepalive_interval(), None, "secs={secs}");
        }
    }

    #[test]
    fn non_object_descriptor_is_rejected() {
        let err = ConnectionOptions::from_json(json!("sqlite://x")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.message().contains("No connection_options dict given."));
    }

    #[test]
    fn builder_round_trips_through_json() {
        let opts = ConnectionOptions::new()
            .option("host", "localhost")
            .option("port", 3306)
            .ping_interval(Duration::from_secs(60))
            .auto_reconnect(true);
        let value = serde_json::to_value(&opts).unwrap();
        assert_eq!(value["host"], json!("localhost"));
        assert_eq!(value["ping_interval"], json!(60.0));
        assert_eq!(ConnectionOptions::from_json(value).unwrap(), opts);
    }
}
