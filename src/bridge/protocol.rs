//! Wire format of the bridge
//!
//! One JSON object per UTF-8 line, `\n` as the only delimiter:
//!
//! ```text
//! → {"id": 7, "method": "run_query", "params": {"query": "SELECT 1"}}
//! ← {"id": 7, "result": [{"1": 1}]}
//! ← {"id": 7, "error": {"code": -32000, "message": "query failed: ..."}}
//! ```
//!
//! A response carries exactly one of `result` / `error`. The constructors
//! below are the only way the server builds one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::ToolError;

/// JSON-RPC style error codes
pub mod codes {
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL: i64 = -32603;
    pub const TOOL_ERROR: i64 = -32000;
    pub const NOT_FOUND: i64 = -32001;
    pub const REJECTED: i64 = -32002;
    pub const UNAVAILABLE: i64 = -32003;
    pub const RATE_LIMITED: i64 = -32029;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: impl Into<Value>, method: &str, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ToolError> for RpcError {
    fn from(e: ToolError) -> Self {
        let code = match &e {
            ToolError::NotFound(_) => codes::NOT_FOUND,
            ToolError::Rejected(_) => codes::REJECTED,
            ToolError::Query(_) => codes::TOOL_ERROR,
            ToolError::Unavailable(_) => codes::UNAVAILABLE,
            ToolError::Remote { code, .. } => *code,
        };
        Self::new(code, e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Exactly one of `result` / `error` is present
    pub fn is_well_formed(&self) -> bool {
        self.result.is_some() != self.error.is_some()
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match (self.result, self.error) {
            (Some(result), None) => Ok(result),
            (None, Some(error)) => Err(error),
            (Some(_), Some(_)) => Err(RpcError::new(
                codes::INTERNAL,
                "response carried both result and error",
            )),
            (None, None) => Err(RpcError::new(
                codes::INTERNAL,
                "response carried neither result nor error",
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Methods
// ═══════════════════════════════════════════════════════════════════════════
// Parameter names accept the older spellings (`table_name`, `sql_query`,
// `query`) so scripts written against the first sandbox shim keep working.
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct DescribeParams {
    #[serde(alias = "table_name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    #[serde(alias = "sql_query", alias = "sql")]
    query: String,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(alias = "query")]
    keyword: String,
}

/// A recognised bridge method with its decoded parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    ListDatasets,
    DescribeDataset { name: String },
    RunQuery { query: String },
    SearchDefinitions { keyword: String },
}

impl Method {
    pub const LIST_DATASETS: &'static str = "list_datasets";
    pub const DESCRIBE_DATASET: &'static str = "describe_dataset";
    pub const RUN_QUERY: &'static str = "run_query";
    pub const SEARCH_DEFINITIONS: &'static str = "search_definitions";

    /// Decode a request's method and params
    pub fn from_request(request: &RpcRequest) -> Result<Self, RpcError> {
        let params = request.params.clone().unwrap_or(Value::Object(Default::default()));

        match request.method.as_str() {
            Self::LIST_DATASETS => Ok(Self::ListDatasets),
            Self::DESCRIBE_DATASET => {
                let p: DescribeParams = decode_params(params)?;
                Ok(Self::DescribeDataset { name: p.name })
            }
            Self::RUN_QUERY => {
                let p: QueryParams = decode_params(params)?;
                Ok(Self::RunQuery { query: p.query })
            }
            Self::SEARCH_DEFINITIONS => {
                let p: SearchParams = decode_params(params)?;
                Ok(Self::SearchDefinitions { keyword: p.keyword })
            }
            other => Err(RpcError::new(
                codes::METHOD_NOT_FOUND,
                format!("method not found: {}", other),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ListDatasets => Self::LIST_DATASETS,
            Self::DescribeDataset { .. } => Self::DESCRIBE_DATASET,
            Self::RunQuery { .. } => Self::RUN_QUERY,
            Self::SearchDefinitions { .. } => Self::SEARCH_DEFINITIONS,
        }
    }

    /// Wire params for this method
    pub fn params(&self) -> Option<Value> {
        match self {
            Self::ListDatasets => None,
            Self::DescribeDataset { name } => Some(serde_json::json!({ "name": name })),
            Self::RunQuery { query } => Some(serde_json::json!({ "query": query })),
            Self::SearchDefinitions { keyword } => Some(serde_json::json!({ "keyword": keyword })),
        }
    }
}

fn decode_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params)
        .map_err(|e| RpcError::new(codes::INVALID_PARAMS, format!("invalid params: {}", e)))
}

// ═══════════════════════════════════════════════════════════════════════════
// Line classification
// ═══════════════════════════════════════════════════════════════════════════

/// What the server makes of one received line
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Well-formed request
    Request(RpcRequest),
    /// Has an `id` but no usable `method`; answered with `INVALID_REQUEST`
    Invalid { id: Value, reason: String },
    /// Not JSON, not an object, or no `id`; dropped without a response
    Malformed(String),
}

pub fn parse_line(line: &str) -> Incoming {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Incoming::Malformed(format!("invalid JSON: {}", e)),
    };

    let Value::Object(mut object) = value else {
        return Incoming::Malformed("not a JSON object".to_string());
    };

    let id = match object.remove("id") {
        Some(Value::Null) | None => return Incoming::Malformed("missing id".to_string()),
        Some(id) => id,
    };

    let method = match object.remove("method") {
        Some(Value::String(m)) if !m.is_empty() => m,
        Some(_) => {
            return Incoming::Invalid {
                id,
                reason: "method must be a non-empty string".to_string(),
            }
        }
        None => {
            return Incoming::Invalid {
                id,
                reason: "missing method".to_string(),
            }
        }
    };

    let params = match object.remove("params") {
        None | Some(Value::Null) => None,
        Some(p @ Value::Object(_)) => Some(p),
        Some(_) => {
            return Incoming::Invalid {
                id,
                reason: "params must be an object".to_string(),
            }
        }
    };

    Incoming::Request(RpcRequest { id, method, params })
}

/// Serialize a message as one wire line, newline included
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
