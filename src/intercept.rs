//! Replacement of outbound settings messages
//!
//! Every client text frame passes through [`Interceptor::intercept`] on its
//! way upstream. Frames are screened in two stages: a scan of a bounded
//! prefix for the `"type"` key followed by the quoted sentinel value, then a
//! full JSON parse only for frames that pass the scan. Matching frames are
//! swapped for the configured replacement document.

use std::sync::Arc;
use tracing::{debug, info};

use crate::config::InterceptionConfig;
use crate::Result;

/// Number of leading bytes searched for the discriminating substrings.
/// Fields that only appear past this bound are not detected.
pub const PREFIX_SCAN_LEN: usize = 50;

const TYPE_KEY: &str = "\"type\"";

#[derive(Debug, Clone)]
pub struct Interceptor {
    sentinel: String,
    quoted_sentinel: String,
    replacement: Arc<str>,
}

impl Interceptor {
    /// Serializes `replacement` once; every match returns the same text.
    pub fn new(sentinel: impl Into<String>, replacement: &serde_json::Value) -> Result<Self> {
        let sentinel = sentinel.into();
        let quoted_sentinel = serde_json::to_string(&sentinel)?;
        let replacement = serde_json::to_string(replacement)?;

        Ok(Self {
            sentinel,
            quoted_sentinel,
            replacement: replacement.into(),
        })
    }

    pub fn from_config(config: &InterceptionConfig) -> Result<Self> {
        let replacement = config.load_replacement()?;
        Self::new(config.sentinel_type.clone(), &replacement)
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    /// Return the replacement document if `payload` is a message of the
    /// sentinel type, otherwise `payload` itself. Only meant for text frames.
    pub fn intercept(&self, payload: String) -> String {
        if self.matches(&payload) {
            info!(
                sentinel = %self.sentinel,
                "Intercepted {} message from client, replacing with proxy settings",
                self.sentinel
            );
            return self.replacement.to_string();
        }
        payload
    }

    fn matches(&self, payload: &str) -> bool {
        let bytes = payload.as_bytes();
        if bytes.len() <= 2 {
            return false;
        }

        if bytes.iter().find(|b| !b.is_ascii_whitespace()) != Some(&b'{') {
            return false;
        }

        if !self.prefix_matches(bytes) {
            return false;
        }

        match serde_json::from_str::<serde_json::Value>(payload) {
            Ok(document) => {
                document.get("type").and_then(serde_json::Value::as_str) == Some(self.sentinel.as_str())
            }
            Err(e) => {
                debug!(error = %e, "Candidate message is not valid JSON, forwarding unchanged");
                false
            }
        }
    }

    fn prefix_matches(&self, bytes: &[u8]) -> bool {
        let end = bytes.len().min(PREFIX_SCAN_LEN);
        let prefix = String::from_utf8_lossy(&bytes[..end]);

        match (prefix.find(TYPE_KEY), prefix.find(&self.quoted_sentinel)) {
            (Some(type_at), Some(sentinel_at)) => type_at < sentinel_at,
            _ => false,
        }
    }
}
