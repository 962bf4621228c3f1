//! Ingress validation for subscribe messages and publish requests.
//!
//! Raw bytes are decoded into `SubscribeRequest` or `PublishRequest` here and
//! nowhere else. Anything that does not fit the schema is rejected with a
//! `ValidationError` naming the offending field.

use serde_json::{Map, Value};

use super::registry::SubscriptionKey;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid message format")]
    Malformed,
    #[error("\"{0}\" is required")]
    MissingField(&'static str),
    #[error("\"{field}\" {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("\"{0}\" is not allowed")]
    UnknownField(String),
}

impl ValidationError {
    /// The field the error is about, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Malformed => None,
            Self::MissingField(field) => Some(*field),
            Self::InvalidField { field, .. } => Some(*field),
            Self::UnknownField(field) => Some(field.as_str()),
        }
    }
}

/// A validated subscribe message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub app_key: String,
    /// Normalized event name.
    pub event: String,
    pub channel: String,
}

impl SubscribeRequest {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(&self.app_key, &self.event, &self.channel)
    }
}

/// A validated publish request. `channels` holds one entry for the scalar
/// form and one per element for the array form.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub app_key: String,
    /// Normalized event name.
    pub event: String,
    pub channels: Vec<String>,
    pub data: Value,
}

impl PublishRequest {
    pub fn keys(&self) -> impl Iterator<Item = SubscriptionKey> + '_ {
        self.channels
            .iter()
            .map(|channel| SubscriptionKey::new(&self.app_key, &self.event, channel))
    }
}

const EVENT_CHARSET_REASON: &str =
    "can only contain letters, numbers, underscores, dots, slashes and backslashes";

const PUBLISH_FIELDS: [&str; 4] = ["appKey", "channel", "event", "data"];

/// Parse a subscribe message sent over a WebSocket. Unknown keys are ignored.
pub fn parse_subscribe(raw: &[u8]) -> Result<SubscribeRequest, ValidationError> {
    let body = parse_object(raw)?;

    let app_key = required_string(&body, "appKey")?;
    let channel = required_string(&body, "channel")?;
    let event = required_string(&body, "event")?;

    if !event.chars().all(is_event_char) {
        return Err(ValidationError::InvalidField {
            field: "event",
            reason: EVENT_CHARSET_REASON,
        });
    }

    Ok(SubscribeRequest {
        app_key: app_key.to_string(),
        event: normalize_event(event),
        channel: channel.to_string(),
    })
}

/// Parse a publish request body. Unknown keys are rejected.
pub fn parse_publish(raw: &[u8]) -> Result<PublishRequest, ValidationError> {
    let body = parse_object(raw)?;

    if let Some(unknown) = body.keys().find(|k| !PUBLISH_FIELDS.contains(&k.as_str())) {
        return Err(ValidationError::UnknownField(unknown.clone()));
    }

    let channels = match body.get("channel") {
        None => return Err(ValidationError::MissingField("channel")),
        Some(Value::String(s)) if s.is_empty() => {
            return Err(ValidationError::InvalidField {
                field: "channel",
                reason: "is not allowed to be empty",
            })
        }
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) if !s.is_empty() => Ok(s.clone()),
                _ => Err(ValidationError::InvalidField {
                    field: "channel",
                    reason: "must only contain non-empty strings",
                }),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(ValidationError::InvalidField {
                field: "channel",
                reason: "must be a string or an array of strings",
            })
        }
    };

    let app_key = required_string(&body, "appKey")?;
    let event = normalize_event(required_string(&body, "event")?);
    if event.is_empty() {
        return Err(ValidationError::InvalidField {
            field: "event",
            reason: "is not allowed to be empty",
        });
    }

    // `null` counts as present; only an absent key is missing.
    let data = body
        .get("data")
        .cloned()
        .ok_or(ValidationError::MissingField("data"))?;

    Ok(PublishRequest {
        app_key: app_key.to_string(),
        event,
        channels,
        data,
    })
}

/// Replace every run of path separators (`\` or `/`) with a single `.`.
///
/// `App\Events\Foo` and `App/Events/Foo` both become `App.Events.Foo`.
pub fn normalize_event(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_separator = false;
    for c in raw.chars() {
        if c == '\\' || c == '/' {
            if !in_separator {
                out.push('.');
                in_separator = true;
            }
        } else {
            out.push(c);
            in_separator = false;
        }
    }
    out
}

fn is_event_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '\\' | '/')
}

fn parse_object(raw: &[u8]) -> Result<Map<String, Value>, ValidationError> {
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(ValidationError::Malformed),
    }
}

fn required_string<'a>(
    body: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ValidationError> {
    match body.get(field) {
        None => Err(ValidationError::MissingField(field)),
        Some(Value::String(s)) if s.is_empty() => Err(ValidationError::InvalidField {
            field,
            reason: "is not allowed to be empty",
        }),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(ValidationError::InvalidField {
            field,
            reason: "must be a string",
        }),
    }
}
