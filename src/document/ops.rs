//! Structured DOM operations.
//!
//! Every document and element operation is a [`DomOp`]. While the document is
//! being assembled it is applied to the local tree; once the view is live it
//! travels as `__bridge.dom(<json>)` and the bootstrap answers with a JSON
//! envelope. Values are always JSON-encoded, never spliced into script source.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, BridgeResult};
use crate::identity::IdentityTag;

/// Name of the view-side entry point installed by the bootstrap script.
pub const DOM_ENTRY: &str = "__bridge.dom";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum DomOp {
    QueryById {
        id: String,
    },
    QueryByClass {
        name: String,
    },
    QueryByTag {
        name: String,
    },
    GetAttribute {
        target: IdentityTag,
        name: String,
    },
    SetAttribute {
        target: IdentityTag,
        name: String,
        value: String,
    },
    RemoveAttribute {
        target: IdentityTag,
        name: String,
    },
    GetProperty {
        target: IdentityTag,
        name: String,
    },
    SetProperty {
        target: IdentityTag,
        name: String,
        value: Value,
    },
    GetStyle {
        target: IdentityTag,
        name: String,
    },
    SetStyle {
        target: IdentityTag,
        name: String,
        value: String,
    },
    GetClassList {
        target: IdentityTag,
    },
    SetClassList {
        target: IdentityTag,
        classes: Vec<String>,
    },
    GetInnerHtml {
        target: IdentityTag,
    },
    SetInnerHtml {
        target: IdentityTag,
        html: String,
    },
    GetOuterHtml {
        target: IdentityTag,
    },
    GetTextContent {
        target: IdentityTag,
    },
    SetTextContent {
        target: IdentityTag,
        text: String,
    },
    GetTagName {
        target: IdentityTag,
    },
    /// Append markup to `parent`, or to the body when `parent` is `None`.
    AppendHtml {
        parent: Option<IdentityTag>,
        html: String,
    },
    /// Move an existing element under `parent` (or the body).
    AppendElement {
        parent: Option<IdentityTag>,
        child: IdentityTag,
    },
    Remove {
        target: IdentityTag,
    },
    /// Move `target` out of the document into the view's parking area, where
    /// lookups by tag still reach it.
    Park {
        target: IdentityTag,
    },
    /// Insert markup straight into the parking area.
    ParkHtml {
        html: String,
    },
    /// Whether `target` is inside the document rather than parked.
    IsConnected {
        target: IdentityTag,
    },
    /// Wire `event` on `target` (or the document) to a registered function.
    Listen {
        target: Option<IdentityTag>,
        event: String,
        function: String,
    },
}

impl DomOp {
    /// Whether applying the operation can change the document.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            DomOp::QueryById { .. }
                | DomOp::QueryByClass { .. }
                | DomOp::QueryByTag { .. }
                | DomOp::GetAttribute { .. }
                | DomOp::GetProperty { .. }
                | DomOp::GetStyle { .. }
                | DomOp::GetClassList { .. }
                | DomOp::GetInnerHtml { .. }
                | DomOp::GetOuterHtml { .. }
                | DomOp::GetTextContent { .. }
                | DomOp::GetTagName { .. }
                | DomOp::IsConnected { .. }
        )
    }

    /// Script that performs the operation in the live view.
    pub fn to_script(&self) -> BridgeResult<String> {
        let payload = serde_json::to_string(self).map_err(BridgeError::malformed)?;
        Ok(format!("{DOM_ENTRY}({payload})"))
    }

    /// Inverse of [`DomOp::to_script`]; `None` for any other script.
    pub fn from_script(script: &str) -> Option<Self> {
        let payload = script
            .trim()
            .strip_prefix(DOM_ENTRY)?
            .strip_prefix('(')?
            .strip_suffix(')')?;
        serde_json::from_str(payload).ok()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OpReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ok: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    err: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    missing: Option<String>,
}

/// Decodes the envelope `__bridge.dom` returns.
pub fn decode_reply(raw: &str) -> BridgeResult<Value> {
    let reply: OpReply = serde_json::from_str(raw)
        .map_err(|err| BridgeError::MalformedPayload(format!("{err}: {raw}")))?;
    if let Some(tag) = reply.missing {
        return Err(BridgeError::ElementMissing(tag));
    }
    if let Some(message) = reply.err {
        return Err(BridgeError::Script(message));
    }
    Ok(reply.ok.unwrap_or(Value::Null))
}

/// Encodes an operation outcome the way the bootstrap does.
pub fn encode_reply(outcome: &BridgeResult<Value>) -> String {
    let reply = match outcome {
        Ok(value) => OpReply {
            ok: Some(value.clone()),
            ..OpReply::default()
        },
        Err(BridgeError::ElementMissing(tag)) => OpReply {
            missing: Some(tag.clone()),
            ..OpReply::default()
        },
        Err(err) => OpReply {
            err: Some(err.to_string()),
            ..OpReply::default()
        },
    };
    serde_json::to_string(&reply).unwrap_or_else(|_| String::from("{\"ok\":null}"))
}

pub(crate) fn into_string(value: Value) -> BridgeResult<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(text) => Ok(Some(text)),
        other => Ok(Some(other.to_string())),
    }
}

pub(crate) fn into_strings(value: Value) -> BridgeResult<Vec<String>> {
    serde_json::from_value(value).map_err(BridgeError::malformed)
}

pub(crate) fn into_tag(value: Value) -> BridgeResult<Option<IdentityTag>> {
    into_string(value)?
        .map(|raw| IdentityTag::parse(&raw))
        .transpose()
}

pub(crate) fn into_tags(value: Value) -> BridgeResult<Vec<IdentityTag>> {
    into_strings(value)?
        .iter()
        .map(|raw| IdentityTag::parse(raw))
        .collect()
}
