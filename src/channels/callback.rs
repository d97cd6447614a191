//! Callback data for inline approve/reject buttons.
//!
//! Format: `prefix:verb:shortId`, verb `a` (approve) or `r` (reject).
//! Telegram caps callback data at 64 bytes.

use std::fmt;

use crate::error::ChannelError;

/// Telegram's callback_data limit.
pub const MAX_CALLBACK_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackVerb {
    Approve,
    Reject,
}

impl CallbackVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "a",
            Self::Reject => "r",
        }
    }
}

/// A decoded button press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackData {
    pub prefix: String,
    pub verb: CallbackVerb,
    pub short_id: String,
}

impl CallbackData {
    pub fn new(prefix: impl Into<String>, verb: CallbackVerb, short_id: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            verb,
            short_id: short_id.into(),
        }
    }

    /// Encode, rejecting empty parts, embedded colons, or oversize output.
    pub fn encode(&self) -> Result<String, ChannelError> {
        validate_part("prefix", &self.prefix)?;
        validate_part("short id", &self.short_id)?;
        let encoded = self.to_string();
        if encoded.len() > MAX_CALLBACK_BYTES {
            return Err(ChannelError::InvalidCallback(format!(
                "{} bytes exceeds the {MAX_CALLBACK_BYTES}-byte limit",
                encoded.len()
            )));
        }
        Ok(encoded)
    }

    /// Parse callback data produced by [`CallbackData::encode`].
    pub fn parse(data: &str) -> Result<Self, ChannelError> {
        if data.len() > MAX_CALLBACK_BYTES {
            return Err(ChannelError::InvalidCallback(format!(
                "{} bytes exceeds the {MAX_CALLBACK_BYTES}-byte limit",
                data.len()
            )));
        }

        let parts: Vec<&str> = data.split(':').collect();
        let [prefix, verb, short_id] = parts.as_slice() else {
            return Err(ChannelError::InvalidCallback(format!(
                "expected prefix:verb:id, got {data:?}"
            )));
        };

        let verb = match *verb {
            "a" => CallbackVerb::Approve,
            "r" => CallbackVerb::Reject,
            other => {
                return Err(ChannelError::InvalidCallback(format!(
                    "unknown verb {other:?}"
                )));
            }
        };
        validate_part("prefix", prefix)?;
        validate_part("short id", short_id)?;

        Ok(Self::new(*prefix, verb, *short_id))
    }
}

impl fmt::Display for CallbackData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.prefix, self.verb.as_str(), self.short_id)
    }
}

fn validate_part(what: &str, value: &str) -> Result<(), ChannelError> {
    if value.is_empty() {
        return Err(ChannelError::InvalidCallback(format!("empty {what}")));
    }
    if value.contains(':') {
        return Err(ChannelError::InvalidCallback(format!(
            "{what} {value:?} contains ':'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_and_parses() {
        let data = CallbackData::new("task", CallbackVerb::Approve, "aaaaaaaa");
        let encoded = data.encode().unwrap();
        assert_eq!(encoded, "task:a:aaaaaaaa");
        assert_eq!(CallbackData::parse(&encoded).unwrap(), data);

        let reject = CallbackData::parse("prop:r:1234abcd").unwrap();
        assert_eq!(reject.verb, CallbackVerb::Reject);
        assert_eq!(reject.prefix, "prop");
        assert_eq!(reject.short_id, "1234abcd");
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "task", "task:a", "task:x:abc", "task:a:", ":a:abc", "a:b:c:d"] {
            assert!(
                matches!(CallbackData::parse(bad), Err(ChannelError::InvalidCallback(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn enforces_size_limit() {
        let long_prefix = "p".repeat(60);
        let data = CallbackData::new(long_prefix.as_str(), CallbackVerb::Approve, "aaaaaaaa");
        assert!(data.encode().is_err());

        // exactly at the limit is fine
        let fits = CallbackData::new("p".repeat(53), CallbackVerb::Reject, "aaaaaaaa");
        assert_eq!(fits.encode().unwrap().len(), MAX_CALLBACK_BYTES);

        let oversized = format!("{}:a:aaaaaaaa", "p".repeat(60));
        assert!(CallbackData::parse(&oversized).is_err());
    }

    #[test]
    fn colons_in_parts_are_rejected() {
        let data = CallbackData::new("a:b", CallbackVerb::Approve, "x");
        assert!(data.encode().is_err());
    }
}
