use serde::Serialize;
use serde_json::{json, Value};

/// Structured error payload for validation and handler failures.
///
/// Every user-visible failure keeps the run id so clients can correlate
/// the response with logs and spans.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub reason: String,
    pub path: String,
    pub method: String,
    pub route: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
}

impl ErrorBody {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({"error": self.error.clone()}))
    }
}

/// Body for a strict-route 422 (request validation) or 500 (response
/// validation / handler failure).
pub fn validation_error_body(
    error: &str,
    reason: &str,
    path: &str,
    method: &str,
    route: &str,
    run: Option<&str>,
) -> Value {
    ErrorBody {
        error: error.to_string(),
        reason: reason.to_string(),
        path: path.to_string(),
        method: method.to_string(),
        route: route.to_string(),
        run: run.map(str::to_string),
    }
    .to_value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_route_descriptor_and_run() {
        let body = validation_error_body(
            "validation_failed",
            "body.topic must be a string",
            "/orders",
            "POST",
            "POST /orders",
            Some("run-1"),
        );
        assert_eq!(body["error"], "validation_failed");
        assert_eq!(body["method"], "POST");
        assert_eq!(body["route"], "POST /orders");
        assert_eq!(body["run"], "run-1");
    }

    #[test]
    fn run_is_omitted_when_absent() {
        let body = validation_error_body("x", "y", "/p", "GET", "GET /p", None);
        assert!(body.get("run").is_none());
    }
}
