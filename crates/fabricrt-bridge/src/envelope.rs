//! The broker-protocol message envelope (spec.md §6): a block whose body
//! region is the raw HTTP payload and whose metadata region is a packed
//! JSON document describing the conversation.

use bytes::BytesMut;
use fabricrt_messaging::Block;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BridgeError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    #[serde(rename = "AsyncRpcDispatch")]
    AsyncRpcDispatch,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HeaderKv {
    pub name: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestMetadata {
    pub method: String,
    pub url_path: String,
    pub headers: Vec<HeaderKv>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponseMetadata {
    pub http_status_code: u16,
    pub content_type: String,
    pub headers: Vec<HeaderKv>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", untagged)]
pub enum PassThroughUserData {
    Request {
        http_request_metadata: HttpRequestMetadata,
    },
    Response {
        http_response_metadata: HttpResponseMetadata,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPrincipal {
    pub sid: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalIdentityInfo {
    pub security_principal: SecurityPrincipal,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BrokerProtocolDocument {
    pub message_type: MessageType,
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_identity_info: Option<PrincipalIdentityInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_through_user_data: Option<PassThroughUserData>,
}

/// Builds the outbound block for an HTTP request: body region + broker
/// protocol metadata carrying the HTTP request metadata payload.
pub fn build_request_block(
    body: &[u8],
    conversation_id: Uuid,
    token_type: String,
    token_data: String,
    request_metadata: HttpRequestMetadata,
) -> Result<Block, BridgeError> {
    let doc = BrokerProtocolDocument {
        message_type: MessageType::AsyncRpcDispatch,
        conversation_id,
        message_id: Uuid::new_v4(),
        token_type,
        token_data: Some(token_data),
        principal_identity_info: None,
        pass_through_user_data: Some(PassThroughUserData::Request {
            http_request_metadata: request_metadata,
        }),
    };
    let metadata = serde_json::to_vec(&doc)
        .map_err(|err| BridgeError::Internal(format!("failed to encode envelope: {err}")))?;
    let mut data = BytesMut::with_capacity(body.len() + metadata.len());
    data.extend_from_slice(body);
    let offset1 = data.len();
    data.extend_from_slice(&metadata);
    Ok(Block::new(data, offset1))
}

/// Parses an inbound block's metadata region into a
/// [`BrokerProtocolDocument`].
pub fn parse_metadata(block: &Block) -> Result<BrokerProtocolDocument, BridgeError> {
    serde_json::from_slice(block.metadata())
        .map_err(|err| BridgeError::Protocol(format!("malformed broker envelope: {err}")))
}

/// Extracts the `HttpResponseMetadata` payload from a parsed document, if
/// present.
pub fn response_metadata(doc: &BrokerProtocolDocument) -> Option<&HttpResponseMetadata> {
    match &doc.pass_through_user_data {
        Some(PassThroughUserData::Response {
            http_response_metadata,
        }) => Some(http_response_metadata),
        _ => None,
    }
}
