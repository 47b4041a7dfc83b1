//! JSON output.

use serde::Serialize;

/// Pretty-printed JSON, or `{}` if the value cannot be serialized.
pub fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::fixtures;
    use crate::pipeline::RunOutcome;

    #[test]
    fn test_report_json_fields() {
        let report = fixtures::report(RunOutcome::Completed);
        let value: serde_json::Value = serde_json::from_str(&to_json(&report)).unwrap();
        assert_eq!(value["outcome"], "completed");
        assert_eq!(value["frames_presented"], 30);
        assert_eq!(value["elapsed"], 1003.0);
        assert_eq!(value["worker_reports"][1]["exit"], "exited with code 1");
        assert_eq!(value["worker_reports"][0]["stats"]["overdue"], 2);
        assert!(value["worker_reports"][1]["stats"].is_null());
    }
}
