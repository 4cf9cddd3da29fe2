//! Newline-delimited text over TCP.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
    time::timeout,
};
use tracing::debug;

use super::{Connection, Connector, FrameSink, FrameSource};
use crate::{
    error::TransportError,
    protocol::{read_line, write_line},
};

pub struct TcpSource {
    reader: BufReader<OwnedReadHalf>,
}

#[async_trait]
impl FrameSource for TcpSource {
    async fn receive(&mut self) -> Result<Option<String>, TransportError> {
        Ok(read_line(&mut self.reader).await?)
    }
}

pub struct TcpSink {
    writer: Mutex<Option<OwnedWriteHalf>>,
    write_timeout: Duration,
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send(&self, line: &str) -> Result<(), TransportError> {
        // Writers queue on this lock, so a stalled peer only ever delays
        // the tasks writing to that peer.
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        match timeout(self.write_timeout, write_line(writer, line)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::WriteTimeout(self.write_timeout)),
        }
    }

    async fn close(&self) {
        let Some(mut writer) = self.writer.lock().await.take() else {
            return;
        };
        if let Err(error) = writer.shutdown().await {
            debug!(?error, "failed to shut down tcp writer cleanly");
        }
    }
}

/// Splits a connected stream into its two frame halves.
pub fn split(stream: TcpStream, write_timeout: Duration) -> (TcpSource, TcpSink) {
    let (reader, writer) = stream.into_split();
    (
        TcpSource {
            reader: BufReader::new(reader),
        },
        TcpSink {
            writer: Mutex::new(Some(writer)),
            write_timeout,
        },
    )
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    write_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: String, write_timeout: Duration) -> Self {
        Self {
            addr,
            write_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn endpoint(&self) -> String {
        self.addr.clone()
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| TransportError::Connect {
                endpoint: self.addr.clone(),
                source,
            })?;
        let (source, sink) = split(stream, self.write_timeout);
        Ok(Connection {
            source: Box::new(source),
            sink: Arc::new(sink),
        })
    }
}
