//! Bearer token claim decoding for display.
//!
//! Tokens are never verified here. The payload segment is decoded only so
//! the operator can see who the token belongs to and when it expires;
//! anything malformed yields `None` and a log line, never an error.

use std::fmt;

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::DateTime;
use serde_json::Value;
use tracing::debug;

/// Decoded token payload.
pub type Claims = serde_json::Map<String, Value>;

/// Remaining lifetime below which a token counts as expiring soon.
pub const EXPIRING_SOON_SECS: i64 = 3600;

const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode the payload (second) segment of a three-part token.
///
/// Returns `None` if the segment is missing, is not base64, or is not a JSON
/// object.
#[must_use]
pub fn decode_token(token: &str) -> Option<Claims> {
    let Some(segment) = token.split('.').nth(1) else {
        debug!("token has no payload segment");
        return None;
    };
    let standard = segment.replace('-', "+").replace('_', "/");

    let bytes = match PAYLOAD_ENGINE.decode(standard) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "token payload is not valid base64");
            return None;
        }
    };

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(claims)) => Some(claims),
        Ok(other) => {
            debug!(kind = json_kind(&other), "token payload is not a JSON object");
            None
        }
        Err(e) => {
            debug!(error = %e, "token payload is not valid JSON");
            None
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// How an `exp` claim compares to the current time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryStatus {
    Expired,
    ExpiringSoon,
    ValidUntil { exp: i64 },
}

/// Classify `exp` (seconds since the epoch) against `now`.
#[must_use]
pub fn classify_expiry(exp: i64, now: i64) -> ExpiryStatus {
    let remaining = exp.saturating_sub(now);
    if remaining <= 0 {
        ExpiryStatus::Expired
    } else if remaining < EXPIRING_SOON_SECS {
        ExpiryStatus::ExpiringSoon
    } else {
        ExpiryStatus::ValidUntil { exp }
    }
}

/// Render a Unix timestamp as `YYYY-MM-DD HH:MM:SS UTC`.
#[must_use]
pub fn format_timestamp(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0).map_or_else(
        || secs.to_string(),
        |dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

impl fmt::Display for ExpiryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => f.write_str("Expired"),
            Self::ExpiringSoon => f.write_str("Expiring Soon"),
            Self::ValidUntil { exp } => write!(f, "Valid until {}", format_timestamp(*exp)),
        }
    }
}

/// One key/value line of the claims table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRow {
    pub key: String,
    pub value: String,
    /// Set for a numeric `exp` claim.
    pub expiry: Option<ExpiryStatus>,
}

/// Flatten claims into display rows, classifying a numeric `exp`.
#[must_use]
pub fn claim_rows(claims: &Claims, now: i64) -> Vec<ClaimRow> {
    claims
        .iter()
        .map(|(key, value)| {
            let expiry = (key == "exp").then(|| numeric_secs(value)).flatten();
            let expiry = expiry.map(|exp| classify_expiry(exp, now));
            let value = match expiry {
                Some(status) => status.to_string(),
                None => display_value(value),
            };
            ClaimRow {
                key: key.clone(),
                value,
                expiry,
            }
        })
        .collect()
}

#[allow(clippy::cast_possible_truncation)]
fn numeric_secs(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.floor() as i64))
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
