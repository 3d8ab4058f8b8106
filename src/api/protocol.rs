//! HTTP Protocol Definitions
//!
//! Request and response bodies of the node's HTTP surface, plus the JSON form of a `Value`.
//! A ref is written as `{"$ref": "<object id>"}`. Byte strings are summarized on the way
//! out as `{"$bytes": <len>}` and cannot be sent in.

use crate::error::ObjectError;
use crate::executor::types::{TaskId, TaskStatus};
use crate::ownership::handle::ObjectHandle;
use crate::ownership::types::ObjectId;
use crate::payload::Value;

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const ENDPOINT_PUT: &str = "/object/put";
pub const ENDPOINT_OBJECT: &str = "/object/:id";
pub const ENDPOINT_SUBMIT_TASK: &str = "/task/submit";
pub const ENDPOINT_TASK_STATUS: &str = "/task/status/:id";
pub const ENDPOINT_STATS: &str = "/stats";

const REF_KEY: &str = "$ref";
const BYTES_KEY: &str = "$bytes";

#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub value: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutResponse {
    pub object: Option<ObjectId>,
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GetQuery {
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetResponse {
    pub value: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub released: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    pub handler: String,
    /// Objects this session holds, passed as arguments in order.
    #[serde(default)]
    pub args: Vec<ObjectId>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    /// The task's return object.
    pub object: Option<ObjectId>,
    pub task_id: Option<TaskId>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task_id: TaskId,
    pub handler: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub return_object: ObjectId,
    pub created_at: u64,
}

/// Renders a value as JSON. Refs become `{"$ref": id}`.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::Str(s) => json!(s),
        Value::Bytes(bytes) => json!({ BYTES_KEY: bytes.len() }),
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), value_to_json(value)))
                .collect(),
        ),
        Value::Ref(handle) => json!({ REF_KEY: handle.id().to_string() }),
    }
}

/// Parses a JSON document into a value. `resolve` turns a `$ref` id into a handle the
/// caller already holds.
pub fn json_to_value(
    json: &serde_json::Value,
    resolve: &impl Fn(ObjectId) -> Option<ObjectHandle>,
) -> Result<Value, String> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => Value::List(
            items
                .iter()
                .map(|item| json_to_value(item, resolve))
                .collect::<Result<_, _>>()?,
        ),
        serde_json::Value::Object(entries) => {
            if let Some(target) = entries.get(REF_KEY)
                && entries.len() == 1
            {
                let id = target
                    .as_str()
                    .and_then(|raw| Uuid::parse_str(raw).ok())
                    .map(ObjectId)
                    .ok_or_else(|| format!("invalid {} value: {}", REF_KEY, target))?;
                let handle = resolve(id).ok_or_else(|| format!("unknown object {}", id))?;
                return Ok(Value::Ref(handle));
            }
            if entries.contains_key(BYTES_KEY) {
                return Err(format!("{} values cannot be uploaded", BYTES_KEY));
            }

            let mut map = BTreeMap::new();
            for (key, value) in entries {
                map.insert(key.clone(), json_to_value(value, resolve)?);
            }
            Value::Map(map)
        }
    })
}

/// Status code for an error surfaced by `get`, `put` or submission.
pub fn status_for(err: &ObjectError) -> axum::http::StatusCode {
    use axum::http::StatusCode;

    match err {
        ObjectError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
        ObjectError::Lost { .. } => StatusCode::GONE,
        ObjectError::Worker { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ObjectError::StoreFull { .. } => StatusCode::INSUFFICIENT_STORAGE,
        ObjectError::Task { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ObjectError::InvalidRelease { .. }
        | ObjectError::Codec(_)
        | ObjectError::Shutdown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
