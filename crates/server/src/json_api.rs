//! Path-routed administrative JSON API.
//!
//! Requests are routed by splitting the path into segments; each level pops
//! the head segment and hands the tail to the object it names.

use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonApiMethod {
    Get,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonApiStatus {
    Ok,
    BadRequest,
    NotFound,
    BadMethod,
    InternalError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonApiResult {
    pub status: JsonApiStatus,
    pub body: Value,
}

impl JsonApiResult {
    pub fn ok(body: Value) -> Self {
        Self {
            status: JsonApiStatus::Ok,
            body,
        }
    }

    pub fn not_found() -> Self {
        Self::error(JsonApiStatus::NotFound, "not found")
    }

    pub fn bad_method() -> Self {
        Self::error(JsonApiStatus::BadMethod, "unsupported method")
    }

    pub fn bad_request(message: &str) -> Self {
        Self::error(JsonApiStatus::BadRequest, message)
    }

    pub fn internal_error(message: &str) -> Self {
        Self::error(JsonApiStatus::InternalError, message)
    }

    fn error(status: JsonApiStatus, message: &str) -> Self {
        Self {
            status,
            body: json!({ "status": "error", "message": message }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == JsonApiStatus::Ok
    }
}

/// Split a path into its first segment and the rest
pub fn pop_path(path: &[String]) -> (Option<&str>, &[String]) {
    match path.split_first() {
        Some((head, tail)) => (Some(head.as_str()), tail),
        None => (None, path),
    }
}

/// Split a URL path into non-empty segments
pub fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read an optional string field, treating empty strings as absent
pub fn str_field<'a>(request: &'a Value, key: &str) -> Option<&'a str> {
    request
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_path_walks_segments() {
        let path = split_path("/sessions//abc/2/");
        assert_eq!(path, vec!["sessions", "abc", "2"]);

        let (head, tail) = pop_path(&path);
        assert_eq!(head, Some("sessions"));
        let (head, tail) = pop_path(tail);
        assert_eq!(head, Some("abc"));
        let (head, tail) = pop_path(tail);
        assert_eq!(head, Some("2"));
        assert_eq!(pop_path(tail), (None, &[][..]));
    }

    #[test]
    fn error_results_carry_message() {
        let result = JsonApiResult::bad_method();
        assert_eq!(result.status, JsonApiStatus::BadMethod);
        assert_eq!(result.body["status"], "error");
        assert!(!result.is_ok());
    }

    #[test]
    fn empty_string_fields_are_absent() {
        let request = json!({ "message": "", "alert": "hi" });
        assert_eq!(str_field(&request, "message"), None);
        assert_eq!(str_field(&request, "alert"), Some("hi"));
        assert_eq!(str_field(&request, "missing"), None);
    }
}
