/*!

# `graphql-transport-ws`

Core protocol engines for the [`graphql-transport-ws`][new] GraphQL over
WebSocket subprotocol, as used by [Apollo] and the [`graphql-ws`][graphql-ws]
npm package. This crate implements the two peer state machines that share
the protocol's wire codec:

- [`server::Connection`] — a per-socket `Sink`/`Stream` state machine that
  performs the handshake, dispatches operations to a pluggable
  [`engine::ExecutionEngine`], and streams results back under the rules of
  the protocol's close-code table ([`close_code`]).
- [`client::Client`] — a cloneable handle backed by a background actor that
  establishes and maintains a socket (lazily or eagerly), multiplexes
  subscriber sinks by operation id, and reconnects with a configurable
  backoff policy, replaying still-registered subscribers under their
  original ids.

The GraphQL schema, parser, validator, and executor are treated as an opaque
collaborator behind [`engine::ExecutionEngine`]; the WebSocket transport
itself is treated as an opaque collaborator behind [`socket::Socket`] and
[`socket::Connector`]. Neither this crate's server half nor its client half
assumes any particular GraphQL library or WebSocket stack — a ready-to-use
[`socket::Connector`]/[`socket::Socket`] pair backed by `tokio-tungstenite`
ships behind the `tungstenite` feature (on by default) for embedders who
don't need to supply their own.

[Apollo]: https://www.apollographql.com
[graphql-ws]: https://npmjs.com/package/graphql-ws
[new]: https://github.com/enisdenjo/graphql-ws/blob/v5.14.0/PROTOCOL.md

*/

pub mod client;
pub mod close_code;
pub mod engine;
pub mod error;
pub mod event;
pub mod message;
pub mod registry;
pub mod retry;
pub mod server;
pub mod socket;

pub use self::client::{Client, ClientConfig, Resolve, SubscriberMessage, Subscription};
pub use self::engine::{
    ErrorLocation, ExecutionArgs, ExecutionEngine, ExecutionResult, GraphQLError, OperationKind,
};
pub use self::error::{CloseEvent, Error, SocketError};
pub use self::event::{ConnectionEvent, EventKind, EventSource, Unregister};
pub use self::message::{ClientMessage, ServerMessage, SubscribePayload};
pub use self::registry::Registry;
pub use self::server::{
    ConnectResult, Connection, ConnectionConfig, Init, Input, NoopHooks, OperationHooks, Output,
};
pub use self::socket::{Connector, Socket, SocketEvent, SUBPROTOCOL};
