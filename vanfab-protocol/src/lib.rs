//! Wire protocol for the fabric's peer-to-peer control channel.
//!
//! Three operations, version 1:
//!
//! - `HB` — heartbeat carrying an optional hash-set manifest. A heartbeat
//!   without a hash-set is a beacon.
//! - `GET` — pull one unit of state by key; replied with status, hash, and
//!   the payload bytes.
//! - `CLAIM` — assert a member invitation; replied with the onboarding
//!   bundle or an error status.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Protocol version spoken and accepted.
pub const PROTOCOL_VERSION: u64 = 1;

/// Fixed address of the claim service on every backbone session.
pub const CLAIM_ADDRESS: &str = "skx/claim";

/// Fixed address of the management controller's sync receiver.
pub const MGMT_CONTROLLER_ADDRESS: &str = "skx/sync/mgmtcontroller";

/// Errors raised by the codec and the GET/CLAIM reply paths.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Peer spoke a version we do not understand
    #[error("Unsupported protocol version {0}")]
    BadVersion(u64),

    /// Operation not in the protocol
    #[error("Unknown operation '{0}'")]
    UnknownOp(String),

    /// Structurally invalid message
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A GET reply carried a non-200 status
    #[error("Peer returned status {code}: {description}")]
    Status { code: u64, description: String },
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Heartbeat body. `hashset` maps state keys to content hashes; `None`
/// means beacon only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub site: String,
    pub sclass: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashset: Option<BTreeMap<String, String>>,
}

/// Pull request for one state key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetState {
    pub site: String,
    pub statekey: String,
}

/// Claim assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertClaim {
    pub claim: String,
    pub name: String,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Heartbeat(Heartbeat),
    GetState(GetState),
    AssertClaim(AssertClaim),
}

impl Message {
    pub fn op(&self) -> &'static str {
        match self {
            Message::Heartbeat(_) => "HB",
            Message::GetState(_) => "GET",
            Message::AssertClaim(_) => "CLAIM",
        }
    }
}

/// Encode a message into its wire body.
pub fn encode(message: &Message) -> Value {
    let (op, mut body) = match message {
        Message::Heartbeat(hb) => ("HB", serde_json::to_value(hb).unwrap_or(Value::Null)),
        Message::GetState(get) => ("GET", serde_json::to_value(get).unwrap_or(Value::Null)),
        Message::AssertClaim(claim) => {
            ("CLAIM", serde_json::to_value(claim).unwrap_or(Value::Null))
        }
    };
    if let Some(map) = body.as_object_mut() {
        map.insert("version".into(), json!(PROTOCOL_VERSION));
        map.insert("op".into(), json!(op));
    }
    body
}

/// Decode a wire body, validating version and operation.
pub fn decode(body: &Value) -> ProtocolResult<Message> {
    let obj = body
        .as_object()
        .ok_or_else(|| ProtocolError::Malformed("body is not an object".into()))?;
    let version = obj
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| ProtocolError::Malformed("missing version".into()))?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::BadVersion(version));
    }
    let op = obj
        .get("op")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing op".into()))?;
    let parse_err = |e: serde_json::Error| ProtocolError::Malformed(e.to_string());
    match op {
        "HB" => Ok(Message::Heartbeat(
            serde_json::from_value(body.clone()).map_err(parse_err)?,
        )),
        "GET" => Ok(Message::GetState(
            serde_json::from_value(body.clone()).map_err(parse_err)?,
        )),
        "CLAIM" => Ok(Message::AssertClaim(
            serde_json::from_value(body.clone()).map_err(parse_err)?,
        )),
        other => Err(ProtocolError::UnknownOp(other.to_string())),
    }
}

/// Reply to a GET.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetStateReply {
    #[serde(rename = "statusCode")]
    pub status_code: u64,
    #[serde(rename = "statusDescription")]
    pub status_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statekey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl GetStateReply {
    pub fn ok(statekey: &str, hash: &str, data: Value) -> Self {
        Self {
            status_code: 200,
            status_description: "OK".into(),
            statekey: Some(statekey.to_string()),
            hash: Some(hash.to_string()),
            data: Some(data),
        }
    }

    pub fn error(code: u64, description: impl Into<String>) -> Self {
        Self {
            status_code: code,
            status_description: description.into(),
            statekey: None,
            hash: None,
            data: None,
        }
    }

    /// Fail with `ProtocolError::Status` unless the reply is a 200.
    pub fn into_success(self) -> ProtocolResult<(String, String, Value)> {
        if self.status_code != 200 {
            return Err(ProtocolError::Status {
                code: self.status_code,
                description: self.status_description,
            });
        }
        let statekey = self
            .statekey
            .ok_or_else(|| ProtocolError::Malformed("GET reply missing statekey".into()))?;
        let hash = self
            .hash
            .ok_or_else(|| ProtocolError::Malformed("GET reply missing hash".into()))?;
        Ok((statekey, hash, self.data.unwrap_or(Value::Null)))
    }
}

/// Reply to a CLAIM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimReply {
    #[serde(rename = "statusCode")]
    pub status_code: u64,
    #[serde(rename = "statusDescription", skip_serializing_if = "Option::is_none")]
    pub status_description: Option<String>,
    #[serde(rename = "siteId", skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    #[serde(rename = "outgoingLinks", skip_serializing_if = "Option::is_none")]
    pub outgoing_links: Option<Vec<Value>>,
    #[serde(rename = "siteClient", skip_serializing_if = "Option::is_none")]
    pub site_client: Option<Value>,
}

impl ClaimReply {
    pub fn success(site_id: String, outgoing_links: Vec<Value>, site_client: Value) -> Self {
        Self {
            status_code: 200,
            status_description: None,
            site_id: Some(site_id),
            outgoing_links: Some(outgoing_links),
            site_client: Some(site_client),
        }
    }

    pub fn error(code: u64, description: impl Into<String>) -> Self {
        Self {
            status_code: code,
            status_description: Some(description.into()),
            site_id: None,
            outgoing_links: None,
            site_client: None,
        }
    }
}

/// Handlers a dispatching receiver implements.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_heartbeat(&self, heartbeat: Heartbeat);
    async fn on_get_state(&self, get: GetState) -> GetStateReply;
    async fn on_assert_claim(&self, claim: AssertClaim) -> ClaimReply;
}

/// Validate, decode, and route one incoming body. GET and CLAIM produce a
/// reply body; HB produces none.
pub async fn dispatch(body: &Value, handler: &dyn MessageHandler) -> ProtocolResult<Option<Value>> {
    match decode(body)? {
        Message::Heartbeat(hb) => {
            handler.on_heartbeat(hb).await;
            Ok(None)
        }
        Message::GetState(get) => {
            let reply = handler.on_get_state(get).await;
            Ok(Some(serde_json::to_value(reply).map_err(|e| {
                ProtocolError::Malformed(e.to_string())
            })?))
        }
        Message::AssertClaim(claim) => {
            let reply = handler.on_assert_claim(claim).await;
            Ok(Some(serde_json::to_value(reply).map_err(|e| {
                ProtocolError::Malformed(e.to_string())
            })?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_round_trips() {
        let mut hashset = BTreeMap::new();
        hashset.insert("link-L1".to_string(), "H1".to_string());
        let message = Message::Heartbeat(Heartbeat {
            site: "s1".into(),
            sclass: "backbone".into(),
            address: "reply/abc".into(),
            hashset: Some(hashset),
        });
        let body = encode(&message);
        assert_eq!(body["version"], 1);
        assert_eq!(body["op"], "HB");
        assert_eq!(decode(&body).unwrap(), message);
    }

    #[test]
    fn beacon_omits_hashset() {
        let body = encode(&Message::Heartbeat(Heartbeat {
            site: "s1".into(),
            sclass: "member".into(),
            address: "reply/abc".into(),
            hashset: None,
        }));
        assert!(body.get("hashset").is_none());
    }

    #[test]
    fn unknown_op_is_rejected() {
        let body = serde_json::json!({"version": 1, "op": "NOPE"});
        assert!(matches!(
            decode(&body),
            Err(ProtocolError::UnknownOp(op)) if op == "NOPE"
        ));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let body = serde_json::json!({"version": 2, "op": "HB", "site": "s", "sclass": "member", "address": "a"});
        assert!(matches!(decode(&body), Err(ProtocolError::BadVersion(2))));
    }

    #[test]
    fn get_reply_success_unpacks() {
        let reply = GetStateReply::ok("link-1", "H1", serde_json::json!({"host": "h"}));
        let (key, hash, data) = reply.into_success().unwrap();
        assert_eq!(key, "link-1");
        assert_eq!(hash, "H1");
        assert_eq!(data["host"], "h");
    }

    #[test]
    fn get_reply_error_propagates_status() {
        let reply = GetStateReply::error(404, "no such key");
        assert!(matches!(
            reply.into_success(),
            Err(ProtocolError::Status { code: 404, .. })
        ));
    }

    #[test]
    fn claim_reply_shapes() {
        let success = ClaimReply::success("m-1".into(), vec![], serde_json::json!({}));
        let body = serde_json::to_value(&success).unwrap();
        assert_eq!(body["statusCode"], 200);
        assert_eq!(body["siteId"], "m-1");
        assert!(body.get("statusDescription").is_none());

        let failure = ClaimReply::error(400, "instance limit reached");
        let body = serde_json::to_value(&failure).unwrap();
        assert_eq!(body["statusCode"], 400);
        assert_eq!(body["statusDescription"], "instance limit reached");
    }

    struct Recorder;

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn on_heartbeat(&self, _hb: Heartbeat) {}
        async fn on_get_state(&self, get: GetState) -> GetStateReply {
            GetStateReply::ok(&get.statekey, "H", Value::Null)
        }
        async fn on_assert_claim(&self, claim: AssertClaim) -> ClaimReply {
            ClaimReply::error(400, format!("rejected {}", claim.claim))
        }
    }

    #[tokio::test]
    async fn dispatch_routes_and_replies() {
        let handler = Recorder;
        let hb = encode(&Message::Heartbeat(Heartbeat {
            site: "s".into(),
            sclass: "member".into(),
            address: "a".into(),
            hashset: None,
        }));
        assert!(dispatch(&hb, &handler).await.unwrap().is_none());

        let get = encode(&Message::GetState(GetState {
            site: "s".into(),
            statekey: "k".into(),
        }));
        let reply = dispatch(&get, &handler).await.unwrap().unwrap();
        assert_eq!(reply["statusCode"], 200);
    }
}
