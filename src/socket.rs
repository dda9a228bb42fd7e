//! The socket adapter (C2): a minimal capability set over a WebSocket
//! endpoint, per `spec.md` §4.2 — `send`, `close`, and an event stream of
//! `onOpen`/`onMessage`/`onClose`/`onError`. Both the server engine
//! (`server`) and client engine (`client`) depend only on this trait, not
//! on any concrete transport.
//!
//! A ready-to-use implementation over `tokio-tungstenite` is provided
//! behind the `tungstenite` feature (on by default), grounded on the
//! split-socket idiom used by the corpus's own WebSocket clients — e.g.
//! the `vulcan-relay` `graphql-ws` client's `socket.split()` into a
//! tungstenite sink/stream pair, and `subxt`'s reconnecting RPC client,
//! which likewise hands a background task the sender half and drives the
//! receiver half as a `Stream` under `tokio::select!`.

use futures::stream::BoxStream;

use crate::error::SocketError;

/// One event observed on a [`Socket`]'s receive side.
#[derive(Clone, Debug, PartialEq)]
pub enum SocketEvent {
    /// The socket finished its opening handshake successfully.
    Open,
    /// A text frame was received. Binary frames are not part of this
    /// subprotocol and are ignored by callers.
    Message(String),
    /// The socket closed, cleanly or otherwise.
    Close {
        /// The close code, if one was present in the close frame.
        code: u16,
        /// The close reason, if any.
        reason: String,
        /// Whether the close handshake completed without error.
        was_clean: bool,
    },
    /// A transport-level error occurred outside of a clean close.
    Error(String),
}

/// The send/close half of a WebSocket endpoint.
///
/// Implementations are expected to be paired with a
/// `Stream<Item = SocketEvent>` obtained separately (typically by
/// splitting the same underlying connection), since a single `&mut self`
/// receiver can't be shared between the engine's send path and its
/// receive loop.
pub trait Socket: Send {
    /// Sends one text frame.
    fn send(
        &mut self,
        frame: String,
    ) -> impl std::future::Future<Output = Result<(), SocketError>> + Send;

    /// Initiates a close handshake with the given code and reason.
    fn close(
        &mut self,
        code: u16,
        reason: String,
    ) -> impl std::future::Future<Output = Result<(), SocketError>> + Send;
}

/// A connector that produces a fresh `(Socket, event stream)` pair for a
/// given URL, negotiating the `graphql-transport-ws` subprotocol during
/// the handshake per `spec.md` §6.
///
/// This is the client's `webSocketImpl`/ambient-constructor seam
/// (`spec.md` §4.4 `webSocketImpl`, §9 "Global ambient socket
/// constructor"): resolved once at client construction, with construction
/// failing fast if none is supplied and none is ambiently available.
pub trait Connector: Send + Sync + 'static {
    /// The concrete [`Socket`] half this connector produces.
    type Socket: Socket + Send + 'static;

    /// Connects to `url`, negotiating the `graphql-transport-ws`
    /// subprotocol, and returns the send half plus a stream of inbound
    /// events.
    fn connect(
        &self,
        url: &str,
    ) -> impl std::future::Future<
        Output = Result<(Self::Socket, BoxStream<'static, SocketEvent>), SocketError>,
    > + Send;
}

/// The `graphql-transport-ws` subprotocol identifier, negotiated via the
/// `Sec-WebSocket-Protocol` header per `spec.md` §6.
pub const SUBPROTOCOL: &str = "graphql-transport-ws";

#[cfg(feature = "tungstenite")]
pub use tungstenite_impl::{TungsteniteConnector, TungsteniteSocket};

#[cfg(feature = "tungstenite")]
mod tungstenite_impl {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::{
        client::IntoClientRequest,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    };

    use super::{Connector, Socket, SocketEvent, SUBPROTOCOL};
    use crate::error::SocketError;

    /// The default, off-the-shelf [`Socket`] implementation, backed by
    /// `tokio-tungstenite`.
    pub struct TungsteniteSocket {
        sink: futures::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            Message,
        >,
    }

    impl Socket for TungsteniteSocket {
        async fn send(&mut self, frame: String) -> Result<(), SocketError> {
            self.sink
                .send(Message::Text(frame))
                .await
                .map_err(SocketError::new)
        }

        async fn close(&mut self, code: u16, reason: String) -> Result<(), SocketError> {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            };
            self.sink
                .send(Message::Close(Some(frame)))
                .await
                .map_err(SocketError::new)
        }
    }

    /// Connects over plain TCP or TLS, as chosen by the URL scheme, via
    /// `tokio_tungstenite::connect_async`.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct TungsteniteConnector;

    impl Connector for TungsteniteConnector {
        type Socket = TungsteniteSocket;

        async fn connect(
            &self,
            url: &str,
        ) -> Result<(Self::Socket, futures::stream::BoxStream<'static, SocketEvent>), SocketError>
        {
            let mut request = url
                .into_client_request()
                .map_err(SocketError::new)?;
            request.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                SUBPROTOCOL.parse().expect("static header value is valid"),
            );

            let (stream, response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(SocketError::new)?;

            let negotiated = response
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok());
            if negotiated != Some(SUBPROTOCOL) {
                return Err(SocketError::new(format!(
                    "server did not select the {SUBPROTOCOL} subprotocol (got {negotiated:?})"
                )));
            }

            let (sink, stream) = stream.split();
            let events = stream
                .filter_map(|msg| async move {
                    match msg {
                        Ok(Message::Text(text)) => Some(SocketEvent::Message(text)),
                        Ok(Message::Close(frame)) => Some(SocketEvent::Close {
                            code: frame.as_ref().map_or(1005, |f| u16::from(f.code)),
                            reason: frame.map_or_else(String::new, |f| f.reason.to_string()),
                            was_clean: true,
                        }),
                        Ok(_) => None,
                        Err(e) => Some(SocketEvent::Error(e.to_string())),
                    }
                })
                .boxed();

            Ok((TungsteniteSocket { sink }, events))
        }
    }
}
