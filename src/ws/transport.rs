//! A single open WebSocket, split into its write and read halves.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::error::WsError;
use crate::Result;
use crate::types::ClientMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the read half produced.
#[derive(Debug)]
pub(crate) enum Inbound {
    Text(String),
    /// The peer closed the socket or the stream failed
    Closed(WsError),
}

pub(crate) struct Transport {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

impl Transport {
    /// Perform the WebSocket handshake.
    pub(crate) async fn open(url: Url) -> Result<Self> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(WsError::Connection)?;
        let (write, read) = stream.split();

        Ok(Self { write, read })
    }

    /// Serialize and write one envelope.
    pub(crate) async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;

        #[cfg(feature = "tracing")]
        tracing::trace!(%text, "Sending WebSocket text message");

        self.write
            .send(Message::Text(text.into()))
            .await
            .map_err(WsError::SendFailed)?;
        Ok(())
    }

    /// Next text frame. Binary and control frames are skipped; tungstenite
    /// answers protocol-level pings on its own.
    pub(crate) async fn recv(&mut self) -> Inbound {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Inbound::Text(text.to_string()),
                Some(Ok(Message::Close(_))) | None => {
                    return Inbound::Closed(WsError::ConnectionClosed);
                }
                Some(Err(e)) => return Inbound::Closed(WsError::Connection(e)),
                Some(Ok(_)) => {}
            }
        }
    }

    /// Send a close frame and drop both halves.
    pub(crate) async fn close(mut self) {
        if let Err(e) = self.write.close().await {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %e, "Error while closing WebSocket");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }
}
