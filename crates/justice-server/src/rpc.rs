use serde::{Deserialize, Serialize};

/// JSON-RPC request as posted to `/rpc`.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
}

/// Response envelope: `{ id, success, result?, error?: { code, message, data? } }`.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: Option<serde_json::Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

pub const PARSE_ERROR: &str = "PARSE_ERROR";
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
pub const NOT_FOUND: &str = "NOT_FOUND";
pub const FORBIDDEN: &str = "FORBIDDEN";

impl RpcResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<serde_json::Value>, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(RpcError {
                code: code.to_string(),
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Attach structured detail to an error response.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.data = Some(data);
        }
        self
    }

    pub fn method_not_found(id: Option<serde_json::Value>, method: &str) -> Self {
        Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(id: Option<serde_json::Value>, msg: impl Into<String>) -> Self {
        Self::error(id, INVALID_PARAMS, msg)
    }

    pub fn not_found(id: Option<serde_json::Value>, msg: impl Into<String>) -> Self {
        Self::error(id, NOT_FOUND, msg)
    }

    pub fn internal_error(id: Option<serde_json::Value>, msg: impl Into<String>) -> Self {
        Self::error(id, INTERNAL_ERROR, msg)
    }

    pub fn parse_error() -> Self {
        Self::error(None, PARSE_ERROR, "Parse error")
    }
}

/// camelCase keys accepted from clients and the snake_case names handlers read.
const CAMEL_TO_SNAKE: &[(&str, &str)] = &[
    ("caseId", "case_id"),
    ("expectedTurn", "expected_turn"),
    ("afterSequence", "after_sequence"),
    ("connectionId", "connection_id"),
];

/// Rewrite camelCase params to snake_case. An existing snake_case key wins.
pub fn normalize_params(params: &serde_json::Value) -> serde_json::Value {
    let Some(obj) = params.as_object() else {
        return params.clone();
    };
    let mut result = obj.clone();
    for &(camel, snake) in CAMEL_TO_SNAKE {
        if !result.contains_key(snake) {
            if let Some(val) = result.remove(camel) {
                result.insert(snake.to_string(), val);
            }
        } else {
            result.remove(camel);
        }
    }
    serde_json::Value::Object(result)
}

/// Extract a required string param from the RPC params object.
pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("Missing required parameter: {key}"))
}

pub fn optional_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub fn optional_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

/// Extract an optional non-negative integer that fits a `u32`.
pub fn optional_u32(params: &serde_json::Value, key: &str) -> Result<Option<u32>, String> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| format!("Parameter {key} must be a non-negative integer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_rpc_request() {
        let raw = r#"{"method":"session.submitTurn","params":{"case_id":"case_1","speaker":"a"},"id":1}"#;
        let req: RpcRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.method, "session.submitTurn");
        assert!(req.params.is_some());
        assert_eq!(req.id, Some(json!(1)));
    }

    #[test]
    fn success_response_shape() {
        let resp = RpcResponse::success(Some(json!(1)), json!({"ok": true}));
        let text = serde_json::to_string(&resp).unwrap();
        assert!(text.contains("\"success\":true"));
        assert!(text.contains("\"result\""));
        assert!(!text.contains("\"error\""));
    }

    #[test]
    fn error_response_shape() {
        let resp = RpcResponse::error(Some(json!(7)), "OUT_OF_TURN", "out of turn")
            .with_data(json!({"current_speaker": "a"}));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "OUT_OF_TURN");
        assert_eq!(value["error"]["message"], "out of turn");
        assert_eq!(value["error"]["data"]["current_speaker"], "a");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn method_not_found_names_method() {
        let resp = RpcResponse::method_not_found(None, "case.explode");
        let err = resp.error.unwrap();
        assert_eq!(err.code, METHOD_NOT_FOUND);
        assert!(err.message.contains("case.explode"));
    }

    #[test]
    fn parse_error_has_no_id() {
        let resp = RpcResponse::parse_error();
        assert!(resp.id.is_none());
        assert_eq!(resp.error.as_ref().unwrap().code, PARSE_ERROR);
    }

    #[test]
    fn normalize_renames_camel_case() {
        let params = json!({"caseId": "case_1", "expectedTurn": 2, "content": "x"});
        let normalized = normalize_params(&params);
        assert_eq!(normalized["case_id"], "case_1");
        assert_eq!(normalized["expected_turn"], 2);
        assert_eq!(normalized["content"], "x");
        assert!(normalized.get("caseId").is_none());
    }

    #[test]
    fn normalize_prefers_existing_snake_case() {
        let params = json!({"caseId": "camel", "case_id": "snake"});
        let normalized = normalize_params(&params);
        assert_eq!(normalized["case_id"], "snake");
        assert!(normalized.get("caseId").is_none());
        assert_eq!(normalize_params(&json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn param_helpers() {
        let params = json!({"name": "x", "count": 5, "neg": -1});
        assert_eq!(require_str(&params, "name").unwrap(), "x");
        assert!(require_str(&params, "count").is_err());
        assert_eq!(optional_str(&params, "missing"), None);
        assert_eq!(optional_i64(&params, "count"), Some(5));
        assert_eq!(optional_u32(&params, "count").unwrap(), Some(5));
        assert_eq!(optional_u32(&params, "missing").unwrap(), None);
        assert!(optional_u32(&params, "neg").is_err());
    }
}
