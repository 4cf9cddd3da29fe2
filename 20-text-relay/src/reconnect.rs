//! Client-side connection lifecycle.
//!
//! The controller task owns the phase. While connected it runs two paths:
//! a read path forwarding every inbound line to the UI, and a write path
//! forwarding submitted lines to the hub. When either path fails, both are
//! stopped, the transport is released, and the controller keeps retrying
//! after a fixed delay until the user quits. After every successful connect
//! the last known nickname is announced again so the hub restores it.
//!
//! The UI talks to the controller through a [`ClientHandle`] and receives
//! [`ClientEvent`]s through a bounded queue that never blocks the network.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    select,
    sync::{
        Mutex,
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{ClientError, TransportError},
    protocol::{self, Inbound},
    transport::{BoxedSource, Connection, Connector, SharedSink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// First connection attempt in flight.
    Connecting,
    Connected,
    /// Lost or never had a connection; waiting for or running a retry.
    Reconnecting,
    /// Quit. Terminal.
    Disconnected,
}

/// Everything the UI gets told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected { endpoint: String },
    Line(String),
    Disconnected { reason: String },
    Retrying { attempt: u32, delay: Duration, error: String },
    /// A submitted line that was not delivered because there was no
    /// connection to deliver it on.
    Rejected(String),
    /// This many events were dropped because the UI fell behind.
    Dropped(u64),
    Terminated,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub retry_delay: Duration,
    pub event_capacity: usize,
    pub outbound_capacity: usize,
    /// Nickname announced on the first connect.
    pub identity: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(3),
            event_capacity: 256,
            outbound_capacity: 64,
            identity: None,
        }
    }
}

/// The UI's side of the controller. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    outbound: mpsc::Sender<String>,
    phase: watch::Receiver<Phase>,
    shutdown: CancellationToken,
}

impl ClientHandle {
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Queues a line for the hub.
    ///
    /// Fails immediately unless connected. A line accepted here can still
    /// be rejected later with [`ClientEvent::Rejected`] if the connection
    /// drops before it is written.
    pub fn submit(&self, line: &str) -> Result<(), ClientError> {
        match self.phase() {
            Phase::Connected => {}
            Phase::Disconnected => return Err(ClientError::Closed),
            Phase::Connecting | Phase::Reconnecting => return Err(ClientError::NotConnected),
        }
        self.outbound
            .try_send(line.to_string())
            .map_err(|error| match error {
                TrySendError::Full(_) => ClientError::Backlogged,
                TrySendError::Closed(_) => ClientError::Closed,
            })
    }

    /// Stops everything, including a pending retry. Idempotent.
    pub fn quit(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once the controller is in `phase`.
    pub async fn wait_for(&self, phase: Phase) -> Result<(), ClientError> {
        let mut changes = self.phase.clone();
        changes
            .wait_for(|current| *current == phase)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Closed)
    }

    /// Resolves once the controller has shut down.
    pub async fn closed(&self) {
        let _ = self.wait_for(Phase::Disconnected).await;
    }
}

/// Starts the controller task.
pub fn spawn(
    connector: Box<dyn Connector>,
    config: ControllerConfig,
) -> (ClientHandle, mpsc::Receiver<ClientEvent>) {
    let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
    let (phase_tx, phase_rx) = watch::channel(Phase::Connecting);
    let shutdown = CancellationToken::new();

    let controller = Controller {
        connector,
        retry_delay: config.retry_delay,
        events: Arc::new(EventSink::new(event_tx)),
        phase: phase_tx,
        identity: Arc::new(Mutex::new(config.identity)),
        shutdown: shutdown.clone(),
    };
    tokio::spawn(controller.run(outbound_rx));

    let handle = ClientHandle {
        outbound: outbound_tx,
        phase: phase_rx,
        shutdown,
    };
    (handle, event_rx)
}

/// Bounded event queue that drops instead of blocking.
///
/// Drops are counted and reported with a single [`ClientEvent::Dropped`]
/// as soon as the queue has room again.
#[derive(Debug)]
pub struct EventSink {
    tx: mpsc::Sender<ClientEvent>,
    dropped: AtomicU64,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<ClientEvent>) -> Self {
        Self {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn emit(&self, event: ClientEvent) {
        let pending = self.dropped.load(Ordering::SeqCst);
        if pending > 0 {
            match self.tx.try_send(ClientEvent::Dropped(pending)) {
                Ok(()) => {
                    self.dropped.fetch_sub(pending, Ordering::SeqCst);
                }
                Err(TrySendError::Full(_)) => {
                    self.record_drop();
                    return;
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }

        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.record_drop(),
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn record_drop(&self) {
        let dropped = self.dropped.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(dropped, "ui event queue full; dropping event");
    }
}

/// How one connected stretch ended.
#[derive(Debug)]
enum PathEnd {
    Stopped,
    Lost(String),
}

struct Controller {
    connector: Box<dyn Connector>,
    retry_delay: Duration,
    events: Arc<EventSink>,
    phase: watch::Sender<Phase>,
    identity: Arc<Mutex<Option<String>>>,
    shutdown: CancellationToken,
}

impl Controller {
    async fn run(self, mut outbound: mpsc::Receiver<String>) {
        let endpoint = self.connector.endpoint();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let Some(result) = self.connect(&mut outbound).await else {
                break;
            };

            match result {
                Ok(connection) => {
                    attempt = 0;
                    info!(%endpoint, "connected");
                    let (returned, end) = self.run_connected(&endpoint, connection, outbound).await;
                    let Some(returned) = returned else {
                        self.terminate(&endpoint);
                        return;
                    };
                    outbound = returned;
                    self.reject_pending(&mut outbound);

                    match end {
                        PathEnd::Stopped => break,
                        PathEnd::Lost(reason) => {
                            warn!(%endpoint, %reason, "connection lost");
                            self.phase.send_replace(Phase::Reconnecting);
                            self.events.emit(ClientEvent::Disconnected { reason });
                        }
                    }
                }
                Err(error) => {
                    debug!(%endpoint, attempt, %error, "connect attempt failed");
                    self.phase.send_replace(Phase::Reconnecting);
                    self.events.emit(ClientEvent::Retrying {
                        attempt,
                        delay: self.retry_delay,
                        error: error.to_string(),
                    });
                }
            }

            if !self.back_off(&mut outbound).await {
                break;
            }
        }

        self.reject_pending(&mut outbound);
        self.terminate(&endpoint);
    }

    fn terminate(&self, endpoint: &str) {
        self.phase.send_replace(Phase::Disconnected);
        self.events.emit(ClientEvent::Terminated);
        info!(%endpoint, "client controller stopped");
    }

    /// One connect attempt. `None` means the user quit while waiting.
    async fn connect(
        &self,
        outbound: &mut mpsc::Receiver<String>,
    ) -> Option<Result<Connection, TransportError>> {
        let attempt = self.connector.connect();
        tokio::pin!(attempt);
        loop {
            select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                result = &mut attempt => return Some(result),
                Some(line) = outbound.recv() => self.reject(line),
            }
        }
    }

    /// Waits out the retry delay. Returns `false` if the user quit.
    async fn back_off(&self, outbound: &mut mpsc::Receiver<String>) -> bool {
        let delay = tokio::time::sleep(self.retry_delay);
        tokio::pin!(delay);
        loop {
            select! {
                biased;
                _ = self.shutdown.cancelled() => return false,
                _ = &mut delay => return true,
                Some(line) = outbound.recv() => self.reject(line),
            }
        }
    }

    /// Runs the read and write paths until one of them ends.
    ///
    /// Hands the outbound queue back, or `None` if the write path panicked
    /// and took it down with it.
    async fn run_connected(
        &self,
        endpoint: &str,
        connection: Connection,
        outbound: mpsc::Receiver<String>,
    ) -> (Option<mpsc::Receiver<String>>, PathEnd) {
        let Connection { source, sink } = connection;
        self.phase.send_replace(Phase::Connected);
        self.events.emit(ClientEvent::Connected {
            endpoint: endpoint.to_string(),
        });

        let identity = self.identity.lock().await.clone();
        if let Some(nickname) = identity {
            if let Err(error) = sink.send(&protocol::nick_command(&nickname)).await {
                sink.close().await;
                return (Some(outbound), PathEnd::Lost(error.to_string()));
            }
        }

        let stop = self.shutdown.child_token();
        let mut reader = tokio::spawn(read_path(
            source,
            Arc::clone(&self.events),
            Arc::clone(&self.identity),
            stop.clone(),
        ));
        let mut writer = tokio::spawn(write_path(
            outbound,
            Arc::clone(&sink),
            Arc::clone(&self.events),
            self.shutdown.clone(),
            stop.clone(),
        ));

        let (outbound, end) = select! {
            read_end = &mut reader => {
                stop.cancel();
                let written = writer.await;
                (written.ok().map(|(outbound, _)| outbound), joined(read_end))
            }
            written = &mut writer => {
                stop.cancel();
                let _ = reader.await;
                match written {
                    Ok((outbound, end)) => (Some(outbound), end),
                    Err(error) => (None, PathEnd::Lost(format!("write path failed: {error}"))),
                }
            }
        };

        sink.close().await;
        let end = if self.shutdown.is_cancelled() {
            PathEnd::Stopped
        } else {
            end
        };
        (outbound, end)
    }

    fn reject(&self, line: String) {
        debug!("rejecting line while not connected");
        self.events.emit(ClientEvent::Rejected(line));
    }

    fn reject_pending(&self, outbound: &mut mpsc::Receiver<String>) {
        while let Ok(line) = outbound.try_recv() {
            self.reject(line);
        }
    }
}

fn joined(result: Result<PathEnd, JoinError>) -> PathEnd {
    result.unwrap_or_else(|error| PathEnd::Lost(format!("read path failed: {error}")))
}

/// Forwards hub lines to the UI.
///
/// The identity announced on the next connect only changes once the hub
/// confirms a nickname, so a refused `/nick` never replaces the name held.
async fn read_path(
    mut source: BoxedSource,
    events: Arc<EventSink>,
    identity: Arc<Mutex<Option<String>>>,
    stop: CancellationToken,
) -> PathEnd {
    loop {
        let frame = select! {
            _ = stop.cancelled() => return PathEnd::Stopped,
            frame = source.receive() => frame,
        };
        match frame {
            Ok(Some(line)) => {
                if let Some(nickname) = protocol::confirmed_nickname(&line) {
                    *identity.lock().await = Some(nickname.to_string());
                }
                events.emit(ClientEvent::Line(line));
            }
            Ok(None) => return PathEnd::Lost("hub closed the connection".to_string()),
            Err(error) => return PathEnd::Lost(error.to_string()),
        }
    }
}

async fn write_path(
    mut outbound: mpsc::Receiver<String>,
    sink: SharedSink,
    events: Arc<EventSink>,
    quit: CancellationToken,
    stop: CancellationToken,
) -> (mpsc::Receiver<String>, PathEnd) {
    loop {
        let line = select! {
            biased;
            _ = stop.cancelled() => return (outbound, PathEnd::Stopped),
            line = outbound.recv() => line,
        };

        // Every handle is gone; nobody can type anymore.
        let Some(line) = line else {
            quit.cancel();
            return (outbound, PathEnd::Stopped);
        };

        let command = Inbound::parse(&line);
        if let Err(error) = sink.send(&line).await {
            events.emit(ClientEvent::Rejected(line));
            return (outbound, PathEnd::Lost(error.to_string()));
        }

        if command == Ok(Inbound::Exit) {
            quit.cancel();
            return (outbound, PathEnd::Stopped);
        }
    }
}
