//! Wire envelope exchanged between clients, the gateway, and backend functions.
//!
//! Every message is a JSON object with a `type` tag naming one of the five
//! kinds below. The set is closed; anything else is rejected by the codec
//! with [`crate::RelayError::UnsupportedMessageType`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message kind tags as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgKind {
    Subscribe,
    Unsubscribe,
    Request,
    Response,
    Publish,
}

impl MsgKind {
    pub const ALL: [MsgKind; 5] = [
        MsgKind::Subscribe,
        MsgKind::Unsubscribe,
        MsgKind::Request,
        MsgKind::Response,
        MsgKind::Publish,
    ];

    /// The `type` tag string for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgKind::Subscribe => "Subscribe",
            MsgKind::Unsubscribe => "Unsubscribe",
            MsgKind::Request => "Request",
            MsgKind::Response => "Response",
            MsgKind::Publish => "Publish",
        }
    }

    /// Parse a `type` tag. Matching is exact.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == tag)
    }
}

impl std::fmt::Display for MsgKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    Subscribe(SubjectsPayload),
    Unsubscribe(SubjectsPayload),
    Request(RequestPayload),
    Response(ResponsePayload),
    Publish(PublishPayload),
}

impl Message {
    pub fn kind(&self) -> MsgKind {
        match self {
            Message::Subscribe(_) => MsgKind::Subscribe,
            Message::Unsubscribe(_) => MsgKind::Unsubscribe,
            Message::Request(_) => MsgKind::Request,
            Message::Response(_) => MsgKind::Response,
            Message::Publish(_) => MsgKind::Publish,
        }
    }

    /// Build a `Subscribe` for the given subjects.
    pub fn subscribe<I, S>(subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Message::Subscribe(SubjectsPayload::new(subjects))
    }

    /// Build an `Unsubscribe` for the given subjects.
    pub fn unsubscribe<I, S>(subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Message::Unsubscribe(SubjectsPayload::new(subjects))
    }

    /// Build a client-side `Request` (no connection id yet).
    pub fn request(uri: impl Into<String>, inbox: impl Into<String>, payload: Value) -> Self {
        Message::Request(RequestPayload {
            uri: uri.into(),
            inbox: inbox.into(),
            connection_id: None,
            payload,
        })
    }

    /// Build a backend `Response` addressed to `connection_id`'s `inbox`.
    pub fn response(
        connection_id: impl Into<String>,
        inbox: impl Into<String>,
        payload: Value,
    ) -> Self {
        Message::Response(ResponsePayload {
            inbox: inbox.into(),
            connection_id: connection_id.into(),
            payload,
        })
    }

    /// Build a backend `Publish` on `subject`.
    pub fn publish(subject: impl Into<String>, payload: Value) -> Self {
        Message::Publish(PublishPayload {
            subject: subject.into(),
            payload,
        })
    }
}

/// Payload of `Subscribe` / `Unsubscribe`.
///
/// Carries a list of subjects; a lone `subject` field is accepted as well
/// and folded into the list by [`SubjectsPayload::all`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectsPayload {
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl SubjectsPayload {
    pub fn new<I, S>(subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subjects: subjects.into_iter().map(Into::into).collect(),
            subject: None,
        }
    }

    /// All subjects named by this payload, in order, without duplicates or
    /// empty strings.
    pub fn all(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::with_capacity(self.subjects.len() + 1);
        let single = self.subject.as_deref().into_iter();
        for s in self.subjects.iter().map(String::as_str).chain(single) {
            if !s.is_empty() && !out.contains(&s) {
                out.push(s);
            }
        }
        out
    }
}

/// Payload of `Request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// `<api>.<rest>`; the first segment selects the target function.
    pub uri: String,
    /// Caller-chosen correlation token.
    pub inbox: String,
    /// Set by the gateway before the request is forwarded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl RequestPayload {
    /// First `.`-separated segment of the uri.
    pub fn api(&self) -> &str {
        self.uri.split('.').next().unwrap_or_default()
    }
}

/// Payload of `Response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub inbox: String,
    pub connection_id: String,
    #[serde(default)]
    pub payload: Value,
}

/// Payload of `Publish`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishPayload {
    pub subject: String,
    #[serde(default)]
    pub payload: Value,
}
