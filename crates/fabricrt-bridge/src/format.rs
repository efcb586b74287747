//! The pluggable exception→HTTP formatter (spec.md §4.4 "Error to HTTP").

use crate::error::BridgeError;

/// `(status, content_type, body)`.
pub type FormattedError = (u16, String, String);

pub trait ErrorFormatter: Send + Sync {
    fn format(&self, err: &BridgeError) -> FormattedError;
}

/// The default formatter, used when no `ehFormatCallback` is configured.
pub struct JsonErrorFormatter;

impl ErrorFormatter for JsonErrorFormatter {
    fn format(&self, err: &BridgeError) -> FormattedError {
        let body = serde_json::json!({
            "error": err.to_string(),
            "code": err.code(),
        })
        .to_string();
        (err.http_status(), "application/json".to_string(), body)
    }
}
