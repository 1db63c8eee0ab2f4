//! IDENTIFY negotiation.
//!
//! The client describes itself and asks for features in a JSON document;
//! the broker answers with the features it actually enabled. Option names
//! are checked against a fixed set before anything is sent.

use quay_core::error::{QuayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Option names accepted in the IDENTIFY document.
pub const RECOGNIZED_KEYS: &[&str] = &[
    "client_id",
    "hostname",
    "user_agent",
    "heartbeat_interval",
    "output_buffer_size",
    "output_buffer_timeout",
    "tls_v1",
    "snappy",
    "deflate",
    "deflate_level",
    "sample_rate",
    "feature_negotiation",
];

/// Broker default when it does not advertise `max_rdy_count`.
pub const DEFAULT_MAX_RDY_COUNT: u64 = 2500;

/// Client side of the IDENTIFY exchange.
///
/// Integer durations are milliseconds, as on the wire. `-1` disables
/// heartbeats or output buffering.
///
/// # Examples
///
/// ```
/// use quay_nsq::identify::IdentifyOptions;
/// use serde_json::json;
///
/// let mut opts = IdentifyOptions::default();
/// opts.set("snappy", json!(true)).unwrap();
/// assert!(opts.set("snappy_level", json!(3)).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifyOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub user_agent: String,
    pub heartbeat_interval: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_buffer_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_buffer_timeout: Option<i64>,
    pub tls_v1: bool,
    pub snappy: bool,
    pub deflate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deflate_level: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    pub feature_negotiation: bool,
}

impl Default for IdentifyOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            hostname: None,
            user_agent: concat!("quay/", env!("CARGO_PKG_VERSION")).to_string(),
            heartbeat_interval: 30_000,
            output_buffer_size: None,
            output_buffer_timeout: None,
            tls_v1: false,
            snappy: false,
            deflate: false,
            deflate_level: None,
            sample_rate: None,
            feature_negotiation: true,
        }
    }
}

impl IdentifyOptions {
    /// Build from string-keyed pairs. Fails on the first unknown key or
    /// mistyped value.
    pub fn from_pairs<I, K>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let mut opts = Self::default();
        for (key, value) in pairs {
            opts.set(key.as_ref(), value)?;
        }
        Ok(opts)
    }

    /// Set one option by its wire name.
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        match key {
            "client_id" => self.client_id = Some(as_string(key, value)?),
            "hostname" => self.hostname = Some(as_string(key, value)?),
            "user_agent" => self.user_agent = as_string(key, value)?,
            "heartbeat_interval" => self.heartbeat_interval = as_i64(key, &value)?,
            "output_buffer_size" => self.output_buffer_size = Some(as_i64(key, &value)?),
            "output_buffer_timeout" => self.output_buffer_timeout = Some(as_i64(key, &value)?),
            "tls_v1" => self.tls_v1 = as_bool(key, &value)?,
            "snappy" => self.snappy = as_bool(key, &value)?,
            "deflate" => self.deflate = as_bool(key, &value)?,
            "deflate_level" => self.deflate_level = Some(as_u32(key, &value)?),
            "sample_rate" => self.sample_rate = Some(as_u32(key, &value)?),
            "feature_negotiation" => self.feature_negotiation = as_bool(key, &value)?,
            unknown => {
                return Err(QuayError::config(format!(
                    "unrecognized IDENTIFY option {unknown:?}"
                )))
            }
        }
        Ok(())
    }

    /// Set the heartbeat interval; `None` disables heartbeats.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval.map_or(-1, |d| d.as_millis() as i64);
        self
    }

    #[must_use]
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_snappy(mut self) -> Self {
        self.snappy = true;
        self.deflate = false;
        self
    }

    #[must_use]
    pub fn with_deflate(mut self, level: u32) -> Self {
        self.deflate = true;
        self.deflate_level = Some(level);
        self.snappy = false;
        self
    }

    #[must_use]
    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    /// Heartbeat interval, or `None` when disabled.
    pub fn heartbeat(&self) -> Option<Duration> {
        u64::try_from(self.heartbeat_interval)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Cross-field checks.
    pub fn validate(&self) -> Result<()> {
        if self.snappy && self.deflate {
            return Err(QuayError::config("snappy and deflate are mutually exclusive"));
        }
        if let Some(level) = self.deflate_level {
            if !(1..=9).contains(&level) {
                return Err(QuayError::config(format!(
                    "deflate_level {level} outside 1..=9"
                )));
            }
        }
        if let Some(rate) = self.sample_rate {
            if rate > 99 {
                return Err(QuayError::config(format!("sample_rate {rate} outside 0..=99")));
            }
        }
        if self.heartbeat_interval != -1 && self.heartbeat_interval <= 0 {
            return Err(QuayError::config(format!(
                "heartbeat_interval {} must be -1 or positive",
                self.heartbeat_interval
            )));
        }
        for (name, value) in [
            ("output_buffer_size", self.output_buffer_size),
            ("output_buffer_timeout", self.output_buffer_timeout),
        ] {
            if matches!(value, Some(v) if v < -1) {
                return Err(QuayError::config(format!("{name} must be >= -1")));
            }
        }
        Ok(())
    }

    /// Serialize the IDENTIFY body.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| QuayError::config(e.to_string()))
    }
}

fn type_error(key: &str, expected: &str, value: &Value) -> QuayError {
    QuayError::config(format!("IDENTIFY option {key:?} expects {expected}, got {value}"))
}

fn as_string(key: &str, value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(type_error(key, "a string", &other)),
    }
}

fn as_bool(key: &str, value: &Value) -> Result<bool> {
    value.as_bool().ok_or_else(|| type_error(key, "a boolean", value))
}

fn as_i64(key: &str, value: &Value) -> Result<i64> {
    value.as_i64().ok_or_else(|| type_error(key, "an integer", value))
}

fn as_u32(key: &str, value: &Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| type_error(key, "a non-negative integer", value))
}

/// Features the broker enabled for this connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IdentifyResponse {
    pub max_rdy_count: u64,
    pub version: String,
    pub max_msg_timeout: u64,
    pub msg_timeout: u64,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: u32,
    pub snappy: bool,
    pub sample_rate: u32,
    pub auth_required: bool,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: i64,
}

impl Default for IdentifyResponse {
    fn default() -> Self {
        Self {
            max_rdy_count: DEFAULT_MAX_RDY_COUNT,
            version: String::new(),
            max_msg_timeout: 0,
            msg_timeout: 0,
            tls_v1: false,
            deflate: false,
            deflate_level: 6,
            snappy: false,
            sample_rate: 0,
            auth_required: false,
            output_buffer_size: 0,
            output_buffer_timeout: 0,
        }
    }
}

impl IdentifyResponse {
    /// Parse the IDENTIFY response payload. A bare `OK` means the broker
    /// did not negotiate features.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload == crate::codec::OK {
            return Ok(Self::default());
        }
        serde_json::from_slice(payload)
            .map_err(|e| QuayError::protocol(format!("bad IDENTIFY response: {e}")))
    }
}

/// Broker answer to `AUTH`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthResponse {
    pub identity: String,
    pub identity_url: Option<String>,
    pub permission_count: u64,
}

impl AuthResponse {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| QuayError::protocol(format!("bad AUTH response: {e}")))
    }
}
