//! Provider-side failure representation.

use std::fmt;

/// Maximum number of error-body bytes copied into the message.
const MAX_BODY_BYTES: usize = 4096;

/// A failure reported by (or while talking to) an LLM provider. Carries the
/// HTTP status when one was received and a bounded copy of the body.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    /// Build from a non-2xx response. The body is truncated at a char
    /// boundary to [`MAX_BODY_BYTES`].
    pub fn from_status(status: u16, body: &str) -> Self {
        Self {
            status: Some(status),
            message: truncate_at_boundary(body, MAX_BODY_BYTES).to_string(),
        }
    }

    /// Transport-level failure with no HTTP status.
    pub fn network(err: &dyn std::error::Error) -> Self {
        Self {
            status: None,
            message: err.to_string(),
        }
    }

    pub fn message(msg: impl Into<String>) -> Self {
        Self {
            status: None,
            message: msg.into(),
        }
    }

    /// Anthropic rejects some source IPs with 403 at the edge. Surface the
    /// likely cause so the operator doesn't chase key problems.
    pub fn with_anthropic_hint(mut self) -> Self {
        if self.status == Some(403) {
            self.message.push_str(
                "\nhint: Anthropic returns 403 for IP-blocked regions; \
                 configure a transit base URL for this provider",
            );
        }
        self
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "provider error (status {}): {}", code, self.message),
            None => write!(f, "provider error: {}", self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

fn truncate_at_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
