// The per-job result record written to `results.json`.

use chrono::{DateTime, Utc};
use grader_sdk::StringUtil;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of one grading job. Built once per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingResults {
    pub job_id: String,
    pub received_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub succeeded: bool,
    #[serde(rename = "timedOut", default)]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The grader's own output; `null` unless the run succeeded.
    #[serde(default)]
    pub results: Option<Value>,
}

impl GradingResults {
    pub fn new(job_id: impl Into<String>, received_time: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            received_time,
            start_time: None,
            end_time: None,
            succeeded: false,
            timed_out: false,
            message: None,
            results: None,
        }
    }

    /// A failure that happened before any container ran.
    pub fn failed_before_start(
        job_id: impl Into<String>,
        received_time: DateTime<Utc>,
        message: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            start_time: Some(now),
            end_time: Some(now),
            message: Some(message),
            ..Self::new(job_id, received_time)
        }
    }
}

/// Strip NUL characters from every string and object key in `value`.
///
/// The bookkeeping store rejects `\u0000` in JSON columns.
pub fn sanitize(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(StringUtil::strip_nul(s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (StringUtil::strip_nul(k), sanitize(v)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_wire_field_names() {
        let received = Utc::now();
        let mut results = GradingResults::new("42", received);
        results.succeeded = true;
        results.results = Some(json!({"score": 1}));

        let value = serde_json::to_value(&results).unwrap();
        assert_eq!(value["job_id"], "42");
        assert_eq!(value["succeeded"], true);
        assert_eq!(value["timedOut"], false);
        assert_eq!(value["results"], json!({"score": 1}));
        assert!(value.get("message").is_none());
        assert!(value.get("received_time").is_some());
    }

    #[test]
    fn failed_results_serialize_null_results() {
        let results = GradingResults::failed_before_start("1", Utc::now(), "boom".into());
        let value = serde_json::to_value(&results).unwrap();
        assert_eq!(value["results"], Value::Null);
        assert_eq!(value["message"], "boom");
        assert!(value["start_time"].is_string());
    }

    #[test]
    fn sanitize_strips_nul_everywhere() {
        let dirty = json!({
            "sc\u{0}ore": 0.5,
            "tests": [{"name": "a\u{0}b", "output": "\u{0}\u{0}"}],
            "ok": true
        });
        let clean = sanitize(dirty);
        assert_eq!(
            clean,
            json!({"score": 0.5, "tests": [{"name": "ab", "output": ""}], "ok": true})
        );
    }
}
