//! The execution-engine seam: the GraphQL schema, parser, validator, and
//! executor are explicitly out of scope (`spec.md` §1) and are consumed
//! here only through the [`ExecutionEngine`] trait, per the "Execution
//! engine capability" of `spec.md` §6.
//!
//! `juniper_graphql_ws` hard-wires this seam to `juniper::execute` and
//! `juniper::resolve_into_stream` against a `Schema` trait tied to
//! `juniper`'s own type system. This module generalizes that seam so the
//! core has no GraphQL-library dependency at all: `parse`/`validate` are
//! folded into `execute`/`subscribe`, exactly as they are in `juniper`'s
//! two entry points, which already perform parse-validate-execute (or
//! parse-validate-subscribe) as one step and report a single error for
//! any failure before the first result.

use std::future::Future;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// One error in a [`GraphQLError`] list, or nested within an
/// [`ExecutionResult`].
///
/// Mirrors the conventional GraphQL error shape (`message`, optional
/// `locations`, optional `path`, optional `extensions`) rather than a
/// library-specific error type, so any execution engine can produce it
/// from its own error representation with a simple `From` impl.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct GraphQLError {
    /// Human-readable description of the error.
    pub message: String,

    /// Source locations (line/column, 1-indexed) the error applies to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<ErrorLocation>,

    /// The response-data path the error applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Json>,

    /// Engine-specific extension data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Json>,
}

impl GraphQLError {
    /// Builds a bare error with only a message, the common case for
    /// engine-reported setup failures.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: None,
            extensions: None,
        }
    }
}

/// A source location within a GraphQL document.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ErrorLocation {
    /// 1-indexed line number.
    pub line: u32,
    /// 1-indexed column number.
    pub column: u32,
}

/// The result of one execution step: a query/mutation's single result, or
/// one event of a subscription's stream.
///
/// `data` may be any serializable value including `null`, per `spec.md`
/// §3; it is `None` only when the engine produced no data at all (distinct
/// from explicit JSON `null`).
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ExecutionResult {
    /// The result data, if any was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Json>,

    /// Field-level errors encountered while producing `data`. Distinct
    /// from the setup-time errors carried by a `ServerMessage::Error`
    /// frame (`spec.md` §7 "GraphQL execution error").
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,

    /// Engine-specific extension data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Json>,
}

/// Everything the execution engine needs to run one operation, decoded
/// from a client's `Subscribe` payload (or supplied directly by a server
/// `on_subscribe` hook, per `spec.md` §4.3 step 3).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionArgs {
    /// The GraphQL document text.
    pub query: String,
    /// The operation name, if the document contains more than one.
    pub operation_name: Option<String>,
    /// Variables for the operation.
    pub variables: Json,
    /// Extension data passed through from the client.
    pub extensions: Json,
}

/// Whether a document is a query/mutation (single result) or a
/// subscription (a stream of results), per `spec.md` §4.3 step 3 "Infer
/// operation kind".
///
/// `juniper_graphql_ws` avoids asking this question up front: it calls
/// `juniper::execute` first and treats a `GraphQLError::IsSubscription`
/// result as the signal to fall back to `resolve_into_stream`. That trick
/// relies on a concrete, juniper-specific error variant that doesn't exist
/// once execution is behind an opaque trait, so this crate asks engines to
/// answer it directly instead — a cheap, syntactic classification that
/// doesn't require full parsing or validation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperationKind {
    /// A query or mutation: [`ExecutionEngine::execute`] applies.
    Query,
    /// A subscription: [`ExecutionEngine::subscribe`] applies.
    Subscription,
}

/// A pluggable GraphQL execution engine.
///
/// An implementation typically wraps a compiled schema plus whatever
/// parser/validator/executor the embedder already has; this crate never
/// inspects a GraphQL document itself.
pub trait ExecutionEngine: Clone + Send + Sync + 'static {
    /// Per-connection context, produced by the server's `on_connect` hook
    /// and threaded through every operation on that connection.
    type Context: Send + Sync + 'static;

    /// The error an implementation reports when an operation fails before
    /// producing any result (parse error, validation error, or resolver
    /// setup failure). Delivered to the client as a `ServerMessage::Error`
    /// frame, per `spec.md` §4.3 step 3 and §7.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Classifies `args` as a query/mutation or a subscription, so the
    /// server knows whether to call `execute` or `subscribe`.
    fn operation_kind(&self, args: &ExecutionArgs) -> OperationKind;

    /// Executes `args` as a query or mutation, returning its single
    /// result.
    fn execute(
        &self,
        context: &Self::Context,
        args: ExecutionArgs,
    ) -> impl Future<Output = Result<ExecutionResult, Self::Error>> + Send;

    /// Begins `args` as a subscription, returning a stream that yields one
    /// item per event.
    ///
    /// Each item is itself a `Result`: `Ok` for a normal (possibly
    /// field-error-carrying) result, `Err` for a fatal engine failure that
    /// should end the whole connection rather than just this operation
    /// (`spec.md` §4.3 step 3 "On engine-raised error from the stream
    /// itself ... close the socket with 1011").
    ///
    /// The returned stream must stop producing items promptly once
    /// dropped, per the cancellation requirement of `spec.md` §5: the
    /// server drops this stream when it receives `Complete` for the
    /// operation, or when the socket closes.
    ///
    /// Setup is async, mirroring `juniper::resolve_into_stream`, which
    /// itself awaits resolver setup before the stream is available.
    fn subscribe(
        &self,
        context: &Self::Context,
        args: ExecutionArgs,
    ) -> impl Future<
        Output = Result<BoxStream<'static, Result<ExecutionResult, Self::Error>>, Self::Error>,
    > + Send;
}
