//! The `graphql-transport-ws` wire grammar: client and server message
//! variants, their payloads, and the validation that turns an arbitrary
//! JSON text frame into one or the other.
//!
//! Modeled directly on `juniper_graphql_ws::graphql_transport_ws`'s
//! `ClientMessage`/`ServerMessage` enums, generalized from
//! `juniper::Value<S>`/`juniper::Variables<S>` to plain `serde_json::Value`
//! so that the execution engine stays an opaque, pluggable collaborator
//! (`spec.md` §1, §6) rather than a `juniper`-specific one.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::engine::{ExecutionResult, GraphQLError};

fn default_for_null<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The payload of a client's `Subscribe` message: everything needed to
/// start a query, mutation, or subscription.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    /// The GraphQL document text.
    pub query: String,

    /// Variables for the operation. Absent and explicit `null` both
    /// normalize to an empty object.
    #[serde(default, deserialize_with = "default_for_null")]
    pub variables: Json,

    /// The operation name, required only if `query` contains more than one
    /// operation definition.
    #[serde(default)]
    pub operation_name: Option<String>,

    /// Free-form extension data, passed through to the execution engine
    /// untouched.
    #[serde(default, deserialize_with = "default_for_null")]
    pub extensions: Json,
}

/// Messages a client may send to a server.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Sent once, immediately after the socket opens, to begin the
    /// handshake.
    ConnectionInit {
        /// Free-form connection parameters, commonly used for
        /// authentication.
        #[serde(default, deserialize_with = "default_for_null")]
        payload: Json,
    },
    /// Liveness probe; the peer should reply with `Pong`.
    Ping {
        /// Optional free-form detail.
        #[serde(default, deserialize_with = "default_for_null")]
        payload: Json,
    },
    /// The reply to a server-initiated `Ping`.
    Pong {
        /// Optional free-form detail.
        #[serde(default, deserialize_with = "default_for_null")]
        payload: Json,
    },
    /// Starts a query, mutation, or subscription under `id`.
    Subscribe {
        /// The operation id. Must be unique among this socket's currently
        /// active operations.
        id: String,
        /// The document, variables, and operation name.
        payload: SubscribePayload,
    },
    /// Stops the operation identified by `id`.
    Complete {
        /// The id of the operation to stop.
        id: String,
    },
}

/// Messages a server may send to a client.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Sent in response to a client's `ConnectionInit`, once accepted.
    ConnectionAck {
        /// Optional payload returned by the `on_connect` hook.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Json>,
    },
    /// Liveness probe; the peer should reply with `Pong`.
    Ping {
        /// Optional free-form detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Json>,
    },
    /// The reply to a client-initiated `Ping`, or an unsolicited keep-alive
    /// sent on `keep_alive_interval`.
    Pong {
        /// Optional free-form detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Json>,
    },
    /// One result of the operation identified by `id`. For queries and
    /// mutations this is sent exactly once; for subscriptions, once per
    /// event.
    Next {
        /// The id of the operation this result belongs to.
        id: String,
        /// The execution result.
        payload: ExecutionResult,
    },
    /// The operation identified by `id` failed before producing any
    /// result (parse/validation/setup failure). Always followed by
    /// implicit removal of `id`; never followed by `Next`.
    Error {
        /// The id of the operation that failed.
        id: String,
        /// The non-empty list of errors.
        payload: Vec<GraphQLError>,
    },
    /// No further messages will be sent for the operation identified by
    /// `id`.
    Complete {
        /// The id of the operation that completed.
        id: String,
    },
}

/// A structural grammar violation found while decoding a text frame.
///
/// Every variant maps to a `close_code::BAD_REQUEST` close, per `spec.md`
/// §4.1.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum DecodeError {
    /// The frame was not valid JSON at all.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    /// The frame was valid JSON but not an object, or was missing/had an
    /// unrecognized `type` field, or was otherwise shaped wrong for its
    /// `type`.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Decodes a single text frame into a [`ClientMessage`].
///
/// This is a thin, explicit wrapper around `serde_json` so that the
/// server engine has one call site to translate failures into a
/// `BAD_REQUEST` close, per `spec.md` §4.1's "Failure" clause.
pub fn decode_client_message(frame: &str) -> Result<ClientMessage, DecodeError> {
    serde_json::from_str(frame).map_err(|e| {
        // serde's tagged-enum deserialization surfaces both "not an
        // object"/"bad JSON" and "unknown/missing type" as the same error
        // kind; we don't need to distinguish them for the caller, which
        // always reacts the same way (close 4400).
        if e.is_syntax() || e.is_eof() {
            DecodeError::InvalidJson(e.to_string())
        } else {
            DecodeError::InvalidMessage(e.to_string())
        }
    })
}

/// Encodes a [`ServerMessage`] as a text frame.
///
/// Infallible in practice: every field of [`ServerMessage`] is built from
/// already-validated, already-serializable data.
pub fn encode_server_message(message: &ServerMessage) -> String {
    serde_json::to_string(message).expect("ServerMessage always serializes")
}

/// Encodes a [`ClientMessage`] as a text frame, the client-side mirror of
/// [`encode_server_message`].
///
/// Infallible in practice: every field of [`ClientMessage`] is built from
/// already-serializable data.
pub fn encode_client_message(message: &ClientMessage) -> String {
    serde_json::to_string(message).expect("ClientMessage always serializes")
}

/// Decodes a single text frame into a [`ServerMessage`], the client-side
/// mirror of [`decode_client_message`].
pub fn decode_server_message(frame: &str) -> Result<ServerMessage, DecodeError> {
    serde_json::from_str(frame).map_err(|e| {
        if e.is_syntax() || e.is_eof() {
            DecodeError::InvalidJson(e.to_string())
        } else {
            DecodeError::InvalidMessage(e.to_string())
        }
    })
}
