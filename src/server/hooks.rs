//! The server's connect/operation hooks (`spec.md` §4.3 "Hooks"), modeled on
//! `juniper_graphql_ws`'s `Init`/`ConnectionConfig` pair in
//! `juniper_graphql_ws/src/lib.rs`, extended with the operation-scoped hooks
//! (`on_subscribe`/`on_next`/`on_error`/`on_complete`) that `spec.md` adds on
//! top of juniper's connect-only `init`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;

use crate::engine::{ExecutionArgs, ExecutionEngine, ExecutionResult, GraphQLError};
use crate::message::SubscribePayload;

/// What an [`Init::init`] call produced: the per-connection context the
/// rest of the connection's lifetime is threaded through, an optional
/// payload to attach to the `ConnectionAck`, and the operation hooks to use
/// for this connection.
pub struct ConnectResult<E: ExecutionEngine> {
    /// The context passed to every `execute`/`subscribe` call on this
    /// connection.
    pub context: E::Context,
    /// An optional payload echoed back on the `ConnectionAck` frame.
    pub ack_payload: Option<Json>,
    /// The operation hooks active for the lifetime of this connection.
    pub hooks: Arc<dyn OperationHooks<E>>,
    /// Caps the number of concurrently active operations on this
    /// connection. `0` means unlimited.
    pub max_in_flight_operations: usize,
    /// If set, the connection sends an unsolicited `Pong` every interval
    /// once acknowledged, as a keep-alive.
    pub keep_alive_interval: Option<Duration>,
}

/// Resolves a `ConnectionInit` payload into a [`ConnectResult`], or rejects
/// the connection.
///
/// Consumed exactly once, by value, at the start of a connection — mirrors
/// `juniper_graphql_ws::Init::init`, which is likewise called once with the
/// init payload and produces the `ConnectionConfig` the rest of the
/// connection runs under. An `Err` closes the socket with
/// [`crate::close_code::FORBIDDEN`] and the returned string as the close
/// reason, per `spec.md` §4.3 step 1.
pub trait Init<E: ExecutionEngine>: Send + 'static {
    /// Resolves the connection.
    fn init(self, payload: Json) -> impl Future<Output = Result<ConnectResult<E>, String>> + Send;
}

/// Observes and optionally adjusts each operation on a connection, per
/// `spec.md` §4.3 steps 3-6.
///
/// Every method has a no-op default so embedders only override what they
/// need, the same shape as `juniper_graphql_ws`'s reliance on
/// `ConnectionConfig` defaults for anything it doesn't customize.
pub trait OperationHooks<E: ExecutionEngine>: Send + Sync {
    /// Called before `payload` is turned into [`ExecutionArgs`]. Returning
    /// `Some` uses those args directly instead of the ones derived from
    /// `payload`, per `spec.md` §4.3 step 3.
    fn on_subscribe(
        &self,
        _context: &E::Context,
        _id: &str,
        _payload: &SubscribePayload,
    ) -> Option<ExecutionArgs> {
        None
    }

    /// Called once per `Next` frame, with the chance to mutate the result
    /// before it's sent.
    fn on_next(&self, _context: &E::Context, _id: &str, _result: &mut ExecutionResult) {}

    /// Called once before an `Error` frame is sent, with the chance to
    /// mutate the error list.
    fn on_error(&self, _context: &E::Context, _id: &str, _errors: &mut Vec<GraphQLError>) {}

    /// Called once the operation identified by `id` has fully ended, for
    /// any reason (natural completion, client `Complete`, or socket close).
    fn on_complete(&self, _context: &E::Context, _id: &str) {}
}

/// The hooks to use when an embedder doesn't need any operation-scoped
/// observation, only a context.
pub struct NoopHooks;

impl<E: ExecutionEngine> OperationHooks<E> for NoopHooks {}

/// A ready-to-use [`Init`] that always accepts the connection with a fixed
/// context, the common case when a connection doesn't need per-socket
/// authentication.
///
/// Mirrors `juniper_graphql_ws::ConnectionConfig<CtxT>`, which plays the
/// same role there.
pub struct ConnectionConfig<E: ExecutionEngine> {
    context: E::Context,
    ack_payload: Option<Json>,
    hooks: Arc<dyn OperationHooks<E>>,
    max_in_flight_operations: usize,
    keep_alive_interval: Option<Duration>,
}

impl<E: ExecutionEngine> ConnectionConfig<E> {
    /// Builds a config that accepts every connection with `context` and no
    /// ack payload, no operation limit, and no keep-alive —
    /// `juniper_graphql_ws`'s defaults.
    pub fn new(context: E::Context) -> Self {
        Self {
            context,
            ack_payload: None,
            hooks: Arc::new(NoopHooks),
            max_in_flight_operations: 0,
            keep_alive_interval: None,
        }
    }

    /// Attaches a payload to every `ConnectionAck` this config produces.
    #[must_use]
    pub fn with_ack_payload(mut self, payload: Json) -> Self {
        self.ack_payload = Some(payload);
        self
    }

    /// Installs operation hooks, replacing [`NoopHooks`].
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn OperationHooks<E>>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Caps the number of concurrently active operations per connection.
    /// `0` (the default) means unlimited.
    #[must_use]
    pub fn with_max_in_flight_operations(mut self, max: usize) -> Self {
        self.max_in_flight_operations = max;
        self
    }

    /// Enables unsolicited keep-alive `Pong` frames on the given interval.
    #[must_use]
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }
}

impl<E: ExecutionEngine> Init<E> for ConnectionConfig<E> {
    async fn init(self, _payload: Json) -> Result<ConnectResult<E>, String> {
        Ok(ConnectResult {
            context: self.context,
            ack_payload: self.ack_payload,
            hooks: self.hooks,
            max_in_flight_operations: self.max_in_flight_operations,
            keep_alive_interval: self.keep_alive_interval,
        })
    }
}
