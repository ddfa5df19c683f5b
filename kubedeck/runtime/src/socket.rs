//! Adapts an upgraded websocket to the frame protocol.

use axum::extract::ws::{Message, WebSocket};
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use kubedeck_core::frame::{ClientFrame, ServerFrame, WireMessage};
use tracing::debug;

/// Splits a socket into decoded client frames and an encoding sink.
///
/// The stream yields `Close` when the peer closes or the socket fails, and
/// ends when the socket does.
pub(crate) fn split(
    socket: WebSocket,
) -> (
    impl Stream<Item = ClientFrame> + Send + Unpin,
    impl Sink<ServerFrame> + Send + Unpin,
) {
    let (tx, rx) = socket.split();
    let rx = rx.filter_map(|msg| future::ready(decode(msg)));
    let tx = tx.with(|frame: ServerFrame| future::ready(Ok::<_, axum::Error>(encode(&frame))));
    (rx, tx)
}

fn decode(msg: Result<Message, axum::Error>) -> Option<ClientFrame> {
    match msg {
        Ok(Message::Text(text)) => ClientFrame::decode(WireMessage::Text(text.as_str().to_string())),
        Ok(Message::Binary(data)) => ClientFrame::decode(WireMessage::Binary(data)),
        Ok(Message::Close(_)) => Some(ClientFrame::Close),
        // Transport-level keepalives are answered by the socket itself.
        Ok(Message::Ping(_) | Message::Pong(_)) => None,
        Err(error) => {
            debug!(%error, "Websocket failed");
            Some(ClientFrame::Close)
        }
    }
}

fn encode(frame: &ServerFrame) -> Message {
    match frame.encode() {
        WireMessage::Text(text) => Message::Text(text.into()),
        WireMessage::Binary(data) => Message::Binary(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use kubedeck_core::session::CloseReason;

    #[test]
    fn decodes_client_messages() {
        assert_eq!(
            decode(Ok(Message::Binary(Bytes::from_static(b"ls\n")))),
            Some(ClientFrame::Data(Bytes::from_static(b"ls\n")))
        );
        assert_eq!(
            decode(Ok(Message::Text(
                r#"{"type":"resize","cols":120,"rows":40}"#.into()
            ))),
            Some(ClientFrame::Resize { cols: 120, rows: 40 })
        );
        assert_eq!(decode(Ok(Message::Text("hello".into()))), None);
        assert_eq!(decode(Ok(Message::Ping(Bytes::new()))), None);
        assert_eq!(decode(Ok(Message::Close(None))), Some(ClientFrame::Close));
    }

    #[test]
    fn socket_errors_close_the_session() {
        let error = axum::Error::new(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert_eq!(decode(Err(error)), Some(ClientFrame::Close));
    }

    #[test]
    fn encodes_server_frames() {
        assert_eq!(
            encode(&ServerFrame::Data(Bytes::from_static(b"$ "))),
            Message::Binary(Bytes::from_static(b"$ "))
        );
        let Message::Text(text) = encode(&ServerFrame::Closed {
            reason: CloseReason::Idle,
            exit: None,
        }) else {
            panic!("expected a text frame");
        };
        let json = serde_json::from_str::<serde_json::Value>(text.as_str()).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "closed", "reason": "idle" }));
    }
}
