//! Result envelope protocol of adapter processes.
//!
//! An adapter may print any number of diagnostic lines to stdout, plus exactly
//! one JSON object carrying the outcome. The caller scans the output in
//! reverse and takes the first line that starts with `{`, ends with `}` and
//! parses as JSON. Everything else is ignored for control flow.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use super::invoker::{Action, ActionError};

/// Decoded outcome of one adapter run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Authoritative success flag. The exit code is informational only.
    #[serde(default)]
    pub success: bool,
    /// Pipeline-specific sub-outcome (e.g. `resolved`, `ambiguous`).
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub data: JsonValue,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Suggested delay before retrying, in minutes.
    #[serde(default)]
    pub retry_after_minutes: Option<i64>,
}

impl Envelope {
    /// Build from the last well-formed JSON object on stdout.
    pub fn from_stdout(action: Action, stdout: &str) -> Result<Option<Self>, ActionError> {
        let Some(object) = extract_last_object(stdout) else {
            return Ok(None);
        };
        serde_json::from_value(JsonValue::Object(object))
            .map(Some)
            .map_err(|e| ActionError::MalformedEnvelope {
                action,
                message: e.to_string(),
            })
    }

    /// Best available failure text.
    pub fn error_text(&self) -> String {
        self.error_message
            .clone()
            .or_else(|| self.error.clone())
            .unwrap_or_else(|| "adapter reported failure without a message".to_string())
    }

    /// Turn a `success: false` envelope into [`ActionError::Rejected`].
    pub fn require_success(self, action: Action) -> Result<Self, ActionError> {
        if self.success {
            return Ok(self);
        }
        Err(ActionError::Rejected {
            action,
            message: self.error_text(),
            status: self.status,
            retry_after_minutes: self.retry_after_minutes,
        })
    }

    /// String field of `data`.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(JsonValue::as_str)
    }
}

/// Scan `stdout` bottom-up for the last line that is a JSON object.
pub fn extract_last_object(stdout: &str) -> Option<Map<String, JsonValue>> {
    stdout.lines().rev().find_map(|line| {
        let line = line.trim();
        if !(line.starts_with('{') && line.ends_with('}')) {
            return None;
        }
        match serde_json::from_str::<JsonValue>(line) {
            Ok(JsonValue::Object(map)) => Some(map),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tolerates_leading_diagnostics() {
        let stdout = "loading...\n{\"ok\":1}\n{\"success\":true,\"data\":{}}";

        let object = extract_last_object(stdout).unwrap();
        assert_eq!(object.get("success"), Some(&JsonValue::Bool(true)));

        let envelope = Envelope::from_stdout(Action::RequestReport, stdout).unwrap().unwrap();
        assert!(envelope.success);
        assert_eq!(envelope.data, serde_json::json!({}));
    }

    #[test]
    fn skips_trailing_garbage_and_broken_objects() {
        let stdout = "{\"success\":true,\"data\":{\"report_id\":\"R1\"}}\n{not json}\nDone.\n";

        let envelope = Envelope::from_stdout(Action::RequestReport, stdout).unwrap().unwrap();
        assert_eq!(envelope.data_str("report_id"), Some("R1"));
    }

    #[test]
    fn no_object_means_no_envelope() {
        assert_eq!(Envelope::from_stdout(Action::PollReport, "fatal error\n").unwrap(), None);
        assert_eq!(Envelope::from_stdout(Action::PollReport, "").unwrap(), None);
        // A JSON array is not an envelope.
        assert_eq!(extract_last_object("[1,2]\n"), None);
    }

    #[test]
    fn wrongly_typed_fields_are_malformed() {
        let err = Envelope::from_stdout(Action::FetchOrders, "{\"success\":\"yes\"}").unwrap_err();
        assert!(matches!(err, ActionError::MalformedEnvelope { .. }));
    }

    #[test]
    fn rejected_envelope_keeps_retry_hint() {
        let envelope = Envelope {
            success: false,
            error: Some("QuotaExceeded".into()),
            retry_after_minutes: Some(12),
            ..Default::default()
        };

        match envelope.require_success(Action::GetCatalogItem) {
            Err(ActionError::Rejected {
                message,
                retry_after_minutes,
                ..
            }) => {
                assert_eq!(message, "QuotaExceeded");
                assert_eq!(retry_after_minutes, Some(12));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn error_message_wins_over_error() {
        let envelope = Envelope {
            error: Some("E1".into()),
            error_message: Some("readable".into()),
            ..Default::default()
        };
        assert_eq!(envelope.error_text(), "readable");
    }

    proptest! {
        /// Property: any amount of non-JSON noise before the envelope is ignored.
        #[test]
        fn envelope_survives_leading_noise(noise in prop::collection::vec("[a-zA-Z0-9 .:]{0,40}", 0..20)) {
            let mut stdout = noise.join("\n");
            stdout.push_str("\n{\"success\":true,\"status\":\"done\"}\n");

            let envelope = Envelope::from_stdout(Action::ImportReport, &stdout).unwrap().unwrap();
            prop_assert!(envelope.success);
            prop_assert_eq!(envelope.status.as_deref(), Some("done"));
        }
    }
}
