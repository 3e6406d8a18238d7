use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::core::{ConnectionConfig, Error, ProtocolVersion, Result};
use crate::protocol::{CommandType, Message, SessionNegotiator, TuyaCodec};
use super::dispatch::{self, Route};
use super::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use super::DeviceStatusListener;

/// Data points refreshed by [`DeviceHandle::refresh_default_status`]
pub const DEFAULT_REFRESH_DP_IDS: [u32; 6] = [4, 5, 6, 18, 19, 20];

/// Capacity of the command channel between handles and the connection task
const COMMAND_CHANNEL_SIZE: usize = 32;

/// Requests sent from handles to the connection task
#[derive(Debug)]
enum Command {
    Send(Message),
    Disconnect,
}

/// Handle for sending commands to a running device connection
#[derive(Clone)]
pub struct DeviceHandle {
    device_id: String,
    version: ProtocolVersion,
    command_tx: mpsc::Sender<Command>,
}

impl DeviceHandle {
    /// Device this handle talks to
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether the connection task is still running
    pub fn is_connected(&self) -> bool {
        !self.command_tx.is_closed()
    }

    /// Sends an arbitrary command; `content` is wrapped into the device envelope
    pub async fn send_command(&self, command: CommandType, content: Map<String, Value>) -> Result<()> {
        self.send_message(Message::with_content(command, content)).await
    }

    /// Sends a prepared message as is
    pub async fn send_message(&self, message: Message) -> Result<()> {
        let command = message.command;
        self.command_tx.send(Command::Send(message)).await.map_err(|_| {
            warn!("{}: Sending {} failed. Device is not connected.", self.device_id, command);
            Error::network(format!("{}: device is not connected", self.device_id))
        })
    }

    /// Writes data points (CONTROL, or CONTROL_NEW on protocol 3.4)
    pub async fn set_data_points(&self, dps: HashMap<u32, Value>) -> Result<()> {
        let command = match self.version {
            ProtocolVersion::V3_4 => CommandType::ControlNew,
            _ => CommandType::Control,
        };
        let dps: Map<String, Value> = dps.into_iter().map(|(id, value)| (id.to_string(), value)).collect();
        let mut content = Map::new();
        content.insert("dps".to_string(), Value::Object(dps));
        self.send_command(command, content).await
    }

    /// Asks the device for all data points (DP_QUERY)
    pub async fn request_status(&self) -> Result<()> {
        self.send_message(status_request()).await
    }

    /// Asks the device to re-read the given data points (DP_REFRESH)
    pub async fn refresh_status(&self, dp_ids: &[u32]) -> Result<()> {
        let mut content = Map::new();
        content.insert(
            "dpId".to_string(),
            Value::Array(dp_ids.iter().map(|id| Value::from(*id)).collect()),
        );
        self.send_command(CommandType::DpRefresh, content).await
    }

    /// DP_REFRESH for the data points most devices report lazily
    pub async fn refresh_default_status(&self) -> Result<()> {
        self.refresh_status(&DEFAULT_REFRESH_DP_IDS).await
    }

    /// Closes the connection. Succeeds if it is already closed.
    pub async fn disconnect(&self) -> Result<()> {
        // a closed channel means the task is gone already
        let _ = self.command_tx.send(Command::Disconnect).await;
        Ok(())
    }
}

/// A connection to one device.
///
/// Owns the framed transport (and with it the codec, keys and sequence
/// counter), the session negotiator and the heartbeat monitor. Everything runs
/// on the task executing [`DeviceConnection::run`].
pub struct DeviceConnection<T> {
    config: ConnectionConfig,
    framed: Framed<T, TuyaCodec>,
    listener: Arc<dyn DeviceStatusListener>,
    negotiator: SessionNegotiator,
    heartbeat: HeartbeatMonitor,
    command_rx: mpsc::Receiver<Command>,
    last_read: Instant,
    last_write: Instant,
}

impl DeviceConnection<TcpStream> {
    /// Connects to the device over TCP.
    ///
    /// A failed attempt is reported to the listener via `on_disconnected`.
    pub async fn connect(
        config: ConnectionConfig,
        listener: Arc<dyn DeviceStatusListener>,
    ) -> Result<(Self, DeviceHandle)> {
        config.validate()?;
        let addr = config.socket_addr();

        let stream = match timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("{}: Failed to connect to {}: {}", config.device_id, addr, e);
                listener.on_disconnected(&e.to_string());
                return Err(Error::network(format!("Failed to connect to {}: {}", addr, e)));
            }
            Err(_) => {
                warn!("{}: Connecting to {} timed out", config.device_id, addr);
                listener.on_disconnected("connect timed out");
                return Err(Error::timeout(format!("connecting to {}", addr)));
            }
        };
        stream.set_nodelay(true)?;

        info!("{}: Connected to {}", config.device_id, addr);
        Ok(Self::with_transport(config, stream, listener))
    }
}

impl<T> DeviceConnection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a connection over an already established transport
    pub fn with_transport(
        config: ConnectionConfig,
        transport: T,
        listener: Arc<dyn DeviceStatusListener>,
    ) -> (Self, DeviceHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let codec = TuyaCodec::new(config.device_id.clone(), config.device_key, config.protocol_version);

        let handle = DeviceHandle {
            device_id: config.device_id.clone(),
            version: config.protocol_version,
            command_tx,
        };

        let now = Instant::now();
        let connection = DeviceConnection {
            negotiator: SessionNegotiator::new(config.device_id.clone()),
            heartbeat: HeartbeatMonitor::new(config.device_id.clone(), config.max_missed_heartbeats),
            framed: Framed::new(transport, codec),
            config,
            listener,
            command_rx,
            last_read: now,
            last_write: now,
        };
        (connection, handle)
    }

    /// Runs the connection until it is closed by either side or fails.
    ///
    /// Key material is reset and `on_disconnected` called on every exit.
    pub async fn run(mut self) -> Result<()> {
        self.listener.on_connected();

        let result = self.event_loop().await;

        self.framed.codec_mut().keys_mut().reset();
        self.negotiator.reset();
        self.heartbeat.reset();

        match result {
            Ok(reason) => {
                info!("{}: Disconnected: {}", self.config.device_id, reason);
                self.listener.on_disconnected(reason);
                Ok(())
            }
            Err(e) => {
                warn!("{}: Connection failed: {}", self.config.device_id, e);
                self.listener.on_disconnected(&e.to_string());
                Err(e)
            }
        }
    }

    async fn event_loop(&mut self) -> Result<&'static str> {
        self.on_transport_ready().await?;

        let read_idle = self.config.read_idle_timeout;
        let write_idle = self.config.write_idle_timeout;

        loop {
            let read_deadline = sleep_until(self.last_activity() + read_idle);
            let write_deadline = sleep_until(self.last_write + write_idle);

            tokio::select! {
                frame = self.framed.next() => match frame {
                    Some(Ok(message)) => {
                        self.last_read = Instant::now();
                        self.handle_message(message).await?;
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok("connection closed by device"),
                },

                command = self.command_rx.recv() => match command {
                    Some(Command::Send(message)) => self.send(message).await?,
                    Some(Command::Disconnect) | None => return Ok("disconnect requested"),
                },

                _ = read_deadline => {
                    // frames the codec dropped still count as traffic
                    if Instant::now() < self.last_activity() + read_idle {
                        continue;
                    }
                    return Err(Error::timeout(format!("no data received for {:?}", read_idle)));
                }

                _ = write_deadline => match self.heartbeat.on_write_idle() {
                    HeartbeatAction::SendHeartbeat => self.send(Message::heartbeat()).await?,
                    HeartbeatAction::Close => {
                        return Err(Error::timeout(format!(
                            "{} heartbeats missed",
                            self.heartbeat.missed()
                        )));
                    }
                },
            }
        }
    }

    /// Latest of the last delivered message and the last frame read off the wire
    fn last_activity(&self) -> Instant {
        match self.framed.codec().last_received() {
            Some(received) => received.max(self.last_read),
            None => self.last_read,
        }
    }

    /// First message after connecting: session negotiation on 3.4, a status query otherwise
    async fn on_transport_ready(&mut self) -> Result<()> {
        if self.config.protocol_version.requires_session_key() {
            let start = self.negotiator.start(self.framed.codec_mut().keys_mut())?;
            self.send(start).await
        } else {
            self.send(status_request()).await
        }
    }

    /// Handles a decoded message
    async fn handle_message(&mut self, message: Message) -> Result<()> {
        match dispatch::route(message) {
            Route::Heartbeat => {
                trace!("{}: Received heartbeat reply", self.config.device_id);
                self.heartbeat.on_heartbeat_reply();
            }

            Route::Negotiation(payload) => {
                let outcome = self.negotiator.handle_response(&payload, self.framed.codec().keys())?;
                if let Some(outcome) = outcome {
                    // FINISH still goes out under the device key
                    self.send(outcome.finish).await?;
                    self.framed.codec_mut().keys_mut().set_session_key(outcome.session_key);
                    info!("{}: Session key negotiated", self.config.device_id);
                    self.send(status_request()).await?;
                }
            }

            Route::Status { cid, dps } => {
                debug!("{}: Status update {:?} (cid {:?})", self.config.device_id, dps, cid);
                self.listener.on_device_status(cid, dps);
            }

            Route::Discovery(info) => {
                debug!("{}: Ignoring broadcast from {} on TCP", self.config.device_id, info.gw_id);
            }

            Route::Ignore(command) => {
                debug!("{}: Received {}, nothing to do", self.config.device_id, command);
            }
        }
        Ok(())
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        self.framed.send(message).await?;
        self.last_write = Instant::now();
        Ok(())
    }
}

fn status_request() -> Message {
    let mut content = Map::new();
    content.insert("dps".to_string(), Value::Object(Map::new()));
    Message::with_content(CommandType::DpQuery, content)
}
