//! Websocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` that splits a connection into a
//! reader and a writer half. The bridge is the only user; nothing else in
//! the crate touches `tokio-tungstenite` directly.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

/// Error type of the websocket layer.
pub type WsError = tungstenite::Error;

type Result<T> = std::result::Result<T, WsError>;

/// Concrete websocket stream type.
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Close code sent when no code was given.
pub const CLOSE_NO_CODE: u16 = 1005;

/// Received websocket message.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Write half of a websocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
    }

    /// Send a close frame and close the sink.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.send(tungstenite::Message::Close(None)).await?;
        self.sink.close().await
    }
}

/// Read half of a websocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(e)),
            };
            let msg = match msg {
                tungstenite::Message::Text(text) => WsMessage::Text(text),
                tungstenite::Message::Binary(data) => WsMessage::Binary(data),
                tungstenite::Message::Ping(data) => WsMessage::Ping(data),
                tungstenite::Message::Pong(data) => WsMessage::Pong(data),
                tungstenite::Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((CLOSE_NO_CODE, String::new()));
                    WsMessage::Close { code, reason }
                }
                tungstenite::Message::Frame(_) => continue,
            };
            return Some(Ok(msg));
        }
    }
}

/// Open a websocket connection to `url`.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    let (stream, _response) = tokio_tungstenite::connect_async(url).await?;
    let (sink, stream) = stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// HTTP status of a failed handshake, if the server answered with one.
pub fn handshake_status(err: &WsError) -> Option<u16> {
    match err {
        tungstenite::Error::Http(response) => Some(response.status().as_u16()),
        _ => None,
    }
}
