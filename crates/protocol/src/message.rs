//! Request and response payloads.

use rlm_core::{ProtocolError, Prompt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

const NOT_AN_OBJECT: &str = "Request must be a JSON object";
const BAD_PROMPT: &str = "Missing or invalid 'prompt' in request.";
const BAD_MODEL: &str = "Invalid 'model' in request.";

/// `{"prompt": <string | [turns]>, "model"?: <string>}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: Prompt,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<Prompt>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// A request may only be sent with a non-empty prompt.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.prompt.is_empty() {
            return Err(ProtocolError::InvalidRequest(BAD_PROMPT.into()));
        }
        Ok(())
    }

    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        self.validate()?;
        Ok(serde_json::to_value(self)?)
    }

    /// Decode and validate an inbound payload.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::InvalidRequest(NOT_AN_OBJECT.into()));
        };

        let prompt = match obj.remove("prompt") {
            Some(Value::Null) | None => None,
            Some(raw) => serde_json::from_value::<Prompt>(raw).ok(),
        }
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ProtocolError::InvalidRequest(BAD_PROMPT.into()))?;

        let model = match obj.remove("model") {
            Some(Value::Null) | None => None,
            Some(Value::String(m)) => Some(m),
            Some(_) => return Err(ProtocolError::InvalidRequest(BAD_MODEL.into())),
        };

        Ok(Self { prompt, model })
    }
}

/// Exactly one of `content` or `error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionResponse {
    Content(String),
    Error(String),
}

impl CompletionResponse {
    pub fn success(content: impl Into<String>) -> Self {
        CompletionResponse::Content(content.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        CompletionResponse::Error(message.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CompletionResponse::Content(_))
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            CompletionResponse::Content(c) => Some(c),
            CompletionResponse::Error(_) => None,
        }
    }

    pub fn into_result(self) -> Result<String, String> {
        match self {
            CompletionResponse::Content(c) => Ok(c),
            CompletionResponse::Error(e) => Err(e),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            CompletionResponse::Content(c) => json!({ "content": c }),
            CompletionResponse::Error(e) => json!({ "error": e }),
        }
    }

    /// A present, non-null `error` wins; otherwise `content`, defaulting to "".
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(obj) = value else {
            return Err(ProtocolError::Malformed(
                "response must be a JSON object".into(),
            ));
        };
        if let Some(error) = field_text(&obj, "error")? {
            return Ok(CompletionResponse::Error(error));
        }
        Ok(CompletionResponse::Content(
            field_text(&obj, "content")?.unwrap_or_default(),
        ))
    }
}

fn field_text(obj: &Map<String, Value>, key: &str) -> Result<Option<String>, ProtocolError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(ProtocolError::Malformed(format!(
            "'{key}' must be a string, got {other}"
        ))),
    }
}
