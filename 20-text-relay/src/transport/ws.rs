//! Text frames over WebSocket.
//!
//! The hub side wraps an upgraded axum socket; the client side dials with
//! `tokio-tungstenite`. Each text message carries exactly one line. Ping and
//! pong frames are answered by the libraries and never surface as lines.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{net::TcpStream, sync::Mutex, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message as WireMessage};
use tracing::debug;

use super::{Connection, Connector, FrameSink, FrameSource};
use crate::{error::TransportError, protocol::MAX_LINE_BYTES};

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

fn websocket_error(error: impl std::fmt::Display) -> TransportError {
    TransportError::WebSocket(error.to_string())
}

fn text_frame(text: &str) -> Result<String, TransportError> {
    let line = text.trim_end_matches(LINE_ENDINGS);
    if line.len() > MAX_LINE_BYTES {
        return Err(TransportError::FrameTooLong(MAX_LINE_BYTES));
    }
    Ok(line.to_string())
}

/// Splits an upgraded hub-side socket into frame halves.
pub fn split_upgraded(socket: WebSocket, write_timeout: Duration) -> (HubWsSource, HubWsSink) {
    let (sink, stream) = socket.split();
    (
        HubWsSource { stream },
        HubWsSink {
            sink: Mutex::new(Some(sink)),
            write_timeout,
        },
    )
}

pub struct HubWsSource {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for HubWsSource {
    async fn receive(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                None | Some(Ok(AxumMessage::Close(_))) => return Ok(None),
                Some(Ok(AxumMessage::Text(text))) => return text_frame(&text).map(Some),
                Some(Ok(AxumMessage::Binary(bytes))) => {
                    debug!(len = bytes.len(), "ignoring binary websocket frame");
                }
                Some(Ok(AxumMessage::Ping(_) | AxumMessage::Pong(_))) => {}
                Some(Err(error)) => return Err(websocket_error(error)),
            }
        }
    }
}

pub struct HubWsSink {
    sink: Mutex<Option<SplitSink<WebSocket, AxumMessage>>>,
    write_timeout: Duration,
}

#[async_trait]
impl FrameSink for HubWsSink {
    async fn send(&self, line: &str) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::Closed)?;
        match timeout(self.write_timeout, sink.send(AxumMessage::Text(line.to_string()))).await {
            Ok(result) => result.map_err(websocket_error),
            Err(_) => Err(TransportError::WriteTimeout(self.write_timeout)),
        }
    }

    async fn close(&self) {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return;
        };
        if let Err(error) = sink.send(AxumMessage::Close(None)).await {
            debug!(%error, "failed to send websocket close frame");
        }
        if let Err(error) = sink.close().await {
            debug!(%error, "failed to close websocket sink");
        }
    }
}

pub struct ClientWsSource {
    stream: SplitStream<ClientStream>,
}

#[async_trait]
impl FrameSource for ClientWsSource {
    async fn receive(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                None | Some(Ok(WireMessage::Close(_))) => return Ok(None),
                Some(Ok(WireMessage::Text(text))) => return text_frame(&text).map(Some),
                Some(Ok(WireMessage::Binary(bytes))) => {
                    debug!(len = bytes.len(), "ignoring binary websocket frame");
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => return Err(websocket_error(error)),
            }
        }
    }
}

pub struct ClientWsSink {
    sink: Mutex<Option<SplitSink<ClientStream, WireMessage>>>,
    write_timeout: Duration,
}

#[async_trait]
impl FrameSink for ClientWsSink {
    async fn send(&self, line: &str) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::Closed)?;
        match timeout(self.write_timeout, sink.send(WireMessage::Text(line.to_string()))).await {
            Ok(result) => result.map_err(websocket_error),
            Err(_) => Err(TransportError::WriteTimeout(self.write_timeout)),
        }
    }

    async fn close(&self) {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return;
        };
        if let Err(error) = sink.send(WireMessage::Close(None)).await {
            debug!(%error, "failed to send websocket close frame");
        }
        if let Err(error) = sink.close().await {
            debug!(%error, "failed to close websocket sink");
        }
    }
}

#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    write_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: String, write_timeout: Duration) -> Self {
        Self { url, write_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    fn endpoint(&self) -> String {
        self.url.clone()
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(websocket_error)?;
        let (sink, stream) = stream.split();
        Ok(Connection {
            source: Box::new(ClientWsSource { stream }),
            sink: Arc::new(ClientWsSink {
                sink: Mutex::new(Some(sink)),
                write_timeout: self.write_timeout,
            }),
        })
    }
}
