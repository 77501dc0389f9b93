//! Method-call facade: turns a method name plus argument mapping into a typed
//! executor call and folds the result back into a serializable outcome.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, instrument};

use crate::storage::{Executor, SecureStoreError, StorageError};

/// Incoming call as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }
}

/// Result of one call. `NotImplemented` mirrors the transport's own
/// "unsupported call" signal and is neither a success nor an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MethodOutcome {
    Success {
        result: Value,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    NotImplemented,
}

impl MethodOutcome {
    fn success(result: Value) -> Self {
        MethodOutcome::Success { result }
    }

    /// Build an error outcome with an explicit code, for transport-level failures.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        MethodOutcome::Error {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }
}

impl From<SecureStoreError> for MethodOutcome {
    fn from(err: SecureStoreError) -> Self {
        let details = match &err {
            SecureStoreError::Storage(StorageError::Backend { operation, status }) => {
                Some(json!({ "operation": operation.to_string(), "status": status }))
            }
            _ => None,
        };
        MethodOutcome::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            details,
        }
    }
}

/// Methods understood by the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    GetPlatformVersion,
    Write,
    Read,
    Delete,
}

impl Method {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "getPlatformVersion" => Some(Method::GetPlatformVersion),
            "write" => Some(Method::Write),
            "read" => Some(Method::Read),
            "delete" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GetPlatformVersion => "getPlatformVersion",
            Method::Write => "write",
            Method::Read => "read",
            Method::Delete => "delete",
        }
    }
}

/// Validated arguments, produced before any storage work starts.
enum Request<'a> {
    PlatformVersion,
    Write { key: &'a str, value: &'a str },
    Read { key: &'a str },
    Delete { key: &'a str },
}

/// Routes calls to the injected [`Executor`]. Each call is independent and
/// runs to completion on the caller's thread.
pub struct Dispatcher {
    executor: Arc<Executor>,
    platform_version: String,
}

impl Dispatcher {
    pub fn new(executor: Arc<Executor>, platform_version: impl Into<String>) -> Self {
        Self {
            executor,
            platform_version: platform_version.into(),
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    #[instrument(skip_all, fields(method = %call.method))]
    pub fn handle(&self, call: &MethodCall) -> MethodOutcome {
        let Some(method) = Method::parse(&call.method) else {
            debug!("method not implemented");
            return MethodOutcome::NotImplemented;
        };

        let request = match validate(method, &call.arguments) {
            Ok(request) => request,
            Err(err) => return err.into(),
        };

        let outcome = self.execute(request);
        debug!(
            ok = matches!(outcome, MethodOutcome::Success { .. }),
            "call completed"
        );
        outcome
    }

    fn execute(&self, request: Request<'_>) -> MethodOutcome {
        let result = match request {
            Request::PlatformVersion => Ok(Value::String(self.platform_version.clone())),
            Request::Write { key, value } => self.executor.write(key, value).map(|()| Value::Null),
            Request::Read { key } => self
                .executor
                .read(key)
                .map(|value| value.map_or(Value::Null, Value::String)),
            Request::Delete { key } => self.executor.delete(key).map(|()| Value::Null),
        };

        match result {
            Ok(value) => MethodOutcome::success(value),
            Err(err) => err.into(),
        }
    }
}

fn validate(method: Method, arguments: &Value) -> Result<Request<'_>, SecureStoreError> {
    let args = arguments.as_object();
    match method {
        Method::GetPlatformVersion => Ok(Request::PlatformVersion),
        Method::Write => match (string_arg(args, "key"), string_arg(args, "value")) {
            (Some(key), Some(value)) => Ok(Request::Write { key, value }),
            _ => Err(SecureStoreError::invalid_argument(
                "Key and value are required",
            )),
        },
        Method::Read => string_arg(args, "key")
            .map(|key| Request::Read { key })
            .ok_or_else(key_required),
        Method::Delete => string_arg(args, "key")
            .map(|key| Request::Delete { key })
            .ok_or_else(key_required),
    }
}

fn string_arg<'a>(args: Option<&'a Map<String, Value>>, name: &str) -> Option<&'a str> {
    args?.get(name)?.as_str()
}

fn key_required() -> SecureStoreError {
    SecureStoreError::invalid_argument("Key is required")
}
