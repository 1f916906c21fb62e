//! # Meshtastic Transport Module
//!
//! Owns the radio interface: connecting over serial, TCP or BLE, receiving
//! packets, sending text/data, health checking and reconnecting. Exactly one
//! interface exists at a time, managed by a single supervisor task so that
//! connect, reconnect and connection-lost handling can never race.
//!
//! ## Architecture
//!
//! - The supervisor task runs the connection loop. While connected it
//!   multiplexes three sources: packets from the radio, send commands from
//!   [`MeshtasticHandle`], and the periodic health probe.
//! - Incoming frames are parsed once at this boundary into tagged
//!   [`PacketEnvelope`] values and forwarded on a bounded channel; the
//!   translators never see raw protobufs.
//! - Connection availability is published on a `watch` channel as
//!   [`LinkState`], which the outbound queue consults before every send.
//!
//! ## Reconnection
//!
//! Transient errors during a connection attempt back off exponentially
//! (2^n seconds, capped at 60). Critical errors (timeout, refused,
//! out-of-memory) abort the attempt. After a lost connection the supervisor
//! waits 10 s, doubling up to 300 s per failed cycle, resetting on success.
//! Retries continue until shutdown.
//!
//! ## Health checks
//!
//! For serial and TCP a device-metadata request is issued every
//! `heartbeat_interval` seconds; a reply must carry a firmware version or
//! the connection is declared lost. BLE delivers real-time disconnects
//! through the stream itself, so the periodic probe is skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

use meshtastic::api::{ConnectedStreamApi, StreamApi};
use meshtastic::packet::{PacketDestination, PacketRouter};
use meshtastic::protobufs::{self, from_radio, mesh_packet};
use meshtastic::types::{MeshChannel, NodeId};
use meshtastic::utils;
use meshtastic::Message;

use crate::config::{Config, ConnectionType};
use crate::db::Db;
use crate::queue::LinkState;

pub use meshtastic::protobufs::PortNum;

/// Destination address meaning "all nodes".
pub const BROADCAST_NUM: u32 = 0xffffffff;

/// Capacity of the received-packet channel handed to the translator.
const EVENT_CHANNEL_CAPACITY: usize = 64;
/// Capacity of the send-command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Initial wait before a reconnect attempt.
const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_secs(10);
/// Upper bound for the reconnect wait.
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(300);
/// Upper bound for the in-attempt transient backoff.
const CONNECT_MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Wait between polls for a serial device path to appear.
const SERIAL_PORT_POLL: Duration = Duration::from_secs(5);
/// How long to wait for the radio to report its own node number.
const MY_INFO_TIMEOUT: Duration = Duration::from_secs(30);

/// Display names carried in mesh node-info frames.
#[derive(Debug, Clone, Default)]
pub struct NodeUser {
    pub long_name: String,
    pub short_name: String,
}

/// In-memory node table shared between the transport and the translators.
pub type NodeTable = Arc<RwLock<HashMap<u32, NodeUser>>>;

/// A received mesh packet, parsed once at the transport boundary.
#[derive(Debug, Clone)]
pub struct PacketEnvelope {
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub id: u32,
    pub kind: PacketKind,
}

/// Packet classification by application port and text-app metadata.
#[derive(Debug, Clone)]
pub enum PacketKind {
    Text { text: String },
    Reaction { emoji_text: String, reply_id: u32 },
    Reply { text: String, reply_id: u32 },
    DetectionSensor { text: String },
    Telemetry,
    Position,
    Other { portnum: i32 },
}

impl PacketEnvelope {
    /// The radio's string form of the sender id.
    pub fn sender_id(&self) -> String {
        format_node_id(self.from)
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_NUM
    }
}

/// Canonical `!hhhhhhhh` rendering of a node number.
pub fn format_node_id(num: u32) -> String {
    format!("!{:08x}", num)
}

/// Send commands accepted by the transport supervisor.
pub enum MeshCommand {
    SendText {
        text: String,
        channel: u32,
        reply_id: Option<u32>,
        resp: oneshot::Sender<Result<u32>>,
    },
    SendData {
        payload: Vec<u8>,
        portnum: PortNum,
        channel: u32,
        resp: oneshot::Sender<Result<u32>>,
    },
}

/// Cloneable handle for talking to the transport supervisor.
#[derive(Clone)]
pub struct MeshtasticHandle {
    command_tx: mpsc::Sender<MeshCommand>,
    link_rx: watch::Receiver<LinkState>,
    node_table: NodeTable,
    my_node_id: Arc<AtomicU32>,
}

impl MeshtasticHandle {
    pub fn new(
        command_tx: mpsc::Sender<MeshCommand>,
        link_rx: watch::Receiver<LinkState>,
        node_table: NodeTable,
        my_node_id: Arc<AtomicU32>,
    ) -> Self {
        Self { command_tx, link_rx, node_table, my_node_id }
    }

    /// Broadcast plain text on a channel. Returns the radio-assigned packet id.
    pub async fn send_text(&self, text: String, channel: u32) -> Result<u32> {
        self.send_command(|resp| MeshCommand::SendText { text, channel, reply_id: None, resp })
            .await
    }

    /// Broadcast a structured reply referencing an earlier mesh message.
    pub async fn send_text_reply(
        &self,
        text: String,
        reply_to_mesh_id: u32,
        channel: u32,
    ) -> Result<u32> {
        self.send_command(|resp| MeshCommand::SendText {
            text,
            channel,
            reply_id: Some(reply_to_mesh_id),
            resp,
        })
        .await
    }

    /// Broadcast raw payload bytes under an explicit portnum.
    pub async fn send_data(&self, payload: Vec<u8>, portnum: PortNum, channel: u32) -> Result<u32> {
        self.send_command(|resp| MeshCommand::SendData { payload, portnum, channel, resp })
            .await
    }

    async fn send_command<F>(&self, build: F) -> Result<u32>
    where
        F: FnOnce(oneshot::Sender<Result<u32>>) -> MeshCommand,
    {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(build(tx))
            .await
            .map_err(|_| anyhow!("meshtastic transport is not running"))?;
        rx.await.map_err(|_| anyhow!("meshtastic transport dropped the send"))?
    }

    /// Watch channel publishing transport availability.
    pub fn link(&self) -> watch::Receiver<LinkState> {
        self.link_rx.clone()
    }

    /// Display names for a node, when the radio has told us about it.
    pub fn node_user(&self, num: u32) -> Option<NodeUser> {
        self.node_table.read().ok()?.get(&num).cloned()
    }

    /// Our own node number, once the radio has reported it.
    pub fn my_node_id(&self) -> Option<u32> {
        match self.my_node_id.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }
}

/// Connection attempt failures, split by retry policy.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Abort this attempt immediately (timeout, refused, out-of-memory).
    #[error("critical connection error: {0}")]
    Critical(#[source] anyhow::Error),
    /// Retry with backoff.
    #[error("connection error: {0}")]
    Transient(#[source] anyhow::Error),
}

fn classify(err: anyhow::Error) -> ConnectError {
    use std::io::ErrorKind;
    let critical = err.chain().any(|cause| {
        cause.downcast_ref::<std::io::Error>().is_some_and(|io| {
            matches!(
                io.kind(),
                ErrorKind::TimedOut | ErrorKind::ConnectionRefused | ErrorKind::OutOfMemory
            )
        })
    });
    if critical {
        ConnectError::Critical(err)
    } else {
        ConnectError::Transient(err)
    }
}

/// Radio-side settings extracted from the main configuration.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub connection_type: ConnectionType,
    pub serial_port: Option<String>,
    pub host: Option<String>,
    pub ble_address: Option<String>,
    pub health_check_enabled: bool,
    pub heartbeat_interval: u64,
}

impl TransportSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let connection_type = config.connection_type()?;
        let settings = Self {
            connection_type,
            serial_port: config.meshtastic.serial_port.clone(),
            host: config.meshtastic.host.clone(),
            ble_address: config.meshtastic.ble_address.clone(),
            health_check_enabled: config.meshtastic.health_check.enabled,
            heartbeat_interval: config.heartbeat_interval(),
        };
        match connection_type {
            ConnectionType::Serial if settings.serial_port.is_none() => {
                Err(anyhow!("No serial port specified in Meshtastic configuration"))
            }
            ConnectionType::Tcp if settings.host.is_none() => {
                Err(anyhow!("No host specified in Meshtastic configuration for TCP connection"))
            }
            ConnectionType::Ble if settings.ble_address.is_none() => {
                Err(anyhow!("No BLE address provided"))
            }
            _ => Ok(settings),
        }
    }
}

/// Everything the supervisor needs to run.
struct Supervisor {
    settings: TransportSettings,
    db: Db,
    events_tx: mpsc::Sender<PacketEnvelope>,
    link_tx: watch::Sender<LinkState>,
    node_table: NodeTable,
    my_node_id: Arc<AtomicU32>,
    shutdown: watch::Receiver<bool>,
}

/// Start the transport. Returns the send handle, the receive channel the
/// translator consumes, and the supervisor task handle.
pub fn start(
    config: &Config,
    db: Db,
    shutdown: watch::Receiver<bool>,
) -> Result<(MeshtasticHandle, mpsc::Receiver<PacketEnvelope>, JoinHandle<()>)> {
    let settings = TransportSettings::from_config(config)?;
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (link_tx, link_rx) = watch::channel(LinkState::default());
    let node_table: NodeTable = Arc::new(RwLock::new(HashMap::new()));
    let my_node_id = Arc::new(AtomicU32::new(0));

    let handle = MeshtasticHandle::new(
        command_tx,
        link_rx,
        node_table.clone(),
        my_node_id.clone(),
    );

    let supervisor = Supervisor {
        settings,
        db,
        events_tx,
        link_tx,
        node_table,
        my_node_id,
        shutdown,
    };
    let task = tokio::spawn(async move { supervisor.run(command_rx).await });

    Ok((handle, events_rx, task))
}

/// Why a connected session ended.
enum Disconnect {
    Shutdown,
    Lost(&'static str),
}

struct Connection {
    packet_rx: mpsc::UnboundedReceiver<protobufs::FromRadio>,
    api: ConnectedStreamApi,
}

impl Supervisor {
    async fn run(self, mut command_rx: mpsc::Receiver<MeshCommand>) {
        let mut backoff = RECONNECT_INITIAL_BACKOFF;
        let mut first_attempt = true;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if !first_attempt {
                self.publish(LinkState { attached: false, reconnecting: true, connected: false });
                if !self.wait_backoff(backoff).await {
                    break;
                }
                backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
            }
            first_attempt = false;

            match self.connect_with_backoff().await {
                Ok(connection) => {
                    backoff = RECONNECT_INITIAL_BACKOFF;
                    self.publish(LinkState { attached: true, reconnecting: false, connected: true });
                    match self.run_connected(connection, &mut command_rx).await {
                        Disconnect::Shutdown => break,
                        Disconnect::Lost(reason) => {
                            error!("Lost connection ({}). Reconnecting...", reason);
                        }
                    }
                }
                Err(e) => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                    error!("Connection attempt failed: {:#}", e);
                }
            }
        }
        self.publish(LinkState::default());
        debug!("Meshtastic transport supervisor terminated");
    }

    fn publish(&self, state: LinkState) {
        let _ = self.link_tx.send(state);
    }

    /// Sleep through a reconnect backoff, abandoning early on shutdown.
    /// Interactive runs get a coarse countdown; service runs a single line.
    async fn wait_backoff(&self, backoff: Duration) -> bool {
        info!("Reconnection attempt starting in {} seconds...", backoff.as_secs());
        let interactive = !is_running_as_service();
        let mut remaining = backoff.as_secs();
        while remaining > 0 {
            if *self.shutdown.borrow() {
                return false;
            }
            sleep(Duration::from_secs(1)).await;
            remaining -= 1;
            if interactive && remaining > 0 && remaining % 10 == 0 {
                debug!("Reconnecting in {}s", remaining);
            }
        }
        !*self.shutdown.borrow()
    }

    /// Open the configured interface, retrying transient failures with
    /// exponential backoff until success, a critical error or shutdown.
    async fn connect_with_backoff(&self) -> Result<Connection> {
        let mut attempts: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                return Err(anyhow!("shutdown in progress"));
            }
            match self.connect_once().await {
                Ok(connection) => return Ok(connection),
                Err(ConnectError::Critical(e)) => {
                    return Err(e.context("critical connection error"));
                }
                Err(ConnectError::Transient(e)) => {
                    attempts += 1;
                    let wait =
                        Duration::from_secs(1 << attempts.min(6)).min(CONNECT_MAX_BACKOFF);
                    warn!(
                        "Connection attempt {} failed: {:#}. Retrying in {} seconds...",
                        attempts,
                        e,
                        wait.as_secs()
                    );
                    sleep(wait).await;
                }
            }
        }
    }

    async fn connect_once(&self) -> std::result::Result<Connection, ConnectError> {
        let (packet_rx, api) = match self.settings.connection_type {
            ConnectionType::Serial => {
                let port = self.settings.serial_port.clone().expect("validated");
                // Opening a missing device path fails in confusing ways; wait
                // for it to show up instead.
                loop {
                    if *self.shutdown.borrow() {
                        return Err(ConnectError::Transient(anyhow!("shutdown in progress")));
                    }
                    if serial_port_exists(&port) {
                        break;
                    }
                    warn!("Serial port {} does not exist. Waiting...", port);
                    sleep(SERIAL_PORT_POLL).await;
                }
                info!("Connecting to serial port {}", port);
                let stream = utils::stream::build_serial_stream(port, None, None, None)
                    .map_err(|e| classify(anyhow!(e)))?;
                StreamApi::new().connect(stream).await
            }
            ConnectionType::Tcp => {
                let host = self.settings.host.clone().expect("validated");
                let address = if host.contains(':') { host } else { format!("{}:4403", host) };
                info!("Connecting to host {}", address);
                let stream = utils::stream::build_tcp_stream(address)
                    .await
                    .map_err(|e| classify(anyhow!(e)))?;
                StreamApi::new().connect(stream).await
            }
            ConnectionType::Ble => {
                #[cfg(feature = "ble")]
                {
                    let address = self.settings.ble_address.clone().expect("validated");
                    info!("Connecting to BLE address {}", address);
                    let stream = utils::stream::build_ble_stream(
                        &utils::stream::BleId::from_mac_address(&address)
                            .map_err(|e| ConnectError::Critical(anyhow!(e)))?,
                        Duration::from_secs(10),
                    )
                    .await
                    .map_err(|e| classify(anyhow!(e)))?;
                    StreamApi::new().connect(stream).await
                }
                #[cfg(not(feature = "ble"))]
                {
                    return Err(ConnectError::Critical(anyhow!(
                        "BLE support not compiled in; rebuild with the 'ble' feature"
                    )));
                }
            }
        };

        let config_id = utils::generate_rand_id();
        let api = api
            .configure(config_id)
            .await
            .map_err(|e| classify(anyhow!(e)))?;
        debug!("Configured radio stream (config_id={})", config_id);

        let mut connection = Connection { packet_rx, api };
        self.wait_for_my_node_id(&mut connection).await?;
        let my_id = self.my_node_id.load(Ordering::SeqCst);
        info!("Connected to radio node {}", format_node_id(my_id));
        Ok(connection)
    }

    /// Consume frames until the radio reports our node number, folding
    /// node-info frames into the table as they stream past.
    async fn wait_for_my_node_id(
        &self,
        connection: &mut Connection,
    ) -> std::result::Result<(), ConnectError> {
        let deadline = tokio::time::Instant::now() + MY_INFO_TIMEOUT;
        loop {
            let frame = tokio::time::timeout_at(deadline, connection.packet_rx.recv())
                .await
                .map_err(|_| {
                    ConnectError::Transient(anyhow!("radio did not report node info in time"))
                })?;
            match frame {
                Some(fr) => {
                    if let Some(from_radio::PayloadVariant::MyInfo(info)) = &fr.payload_variant {
                        self.my_node_id.store(info.my_node_num, Ordering::SeqCst);
                        return Ok(());
                    }
                    self.absorb_frame(fr).await;
                }
                None => {
                    return Err(ConnectError::Transient(anyhow!(
                        "radio stream closed during configuration"
                    )))
                }
            }
        }
    }

    /// Serve a live connection until it is lost or shutdown is requested.
    async fn run_connected(
        &self,
        connection: Connection,
        command_rx: &mut mpsc::Receiver<MeshCommand>,
    ) -> Disconnect {
        let Connection { mut packet_rx, mut api } = connection;
        let my_id = self.my_node_id.load(Ordering::SeqCst);
        let mut router = RelayRouter::new(my_id);

        let probe_health = self.settings.health_check_enabled
            && self.settings.heartbeat_interval > 0
            && self.settings.connection_type != ConnectionType::Ble;
        if self.settings.connection_type == ConnectionType::Ble {
            info!("BLE connection uses real-time disconnection detection - health checks disabled");
        } else if !probe_health {
            info!("Connection health checks are disabled in configuration");
        }
        let mut health_tick = interval(Duration::from_secs(self.settings.heartbeat_interval.max(1)));
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        health_tick.reset();
        let mut probe_pending = false;
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                frame = packet_rx.recv() => {
                    match frame {
                        Some(fr) => {
                            if self.absorb_frame(fr).await {
                                probe_pending = false;
                            }
                        }
                        None => return Disconnect::Lost("radio stream closed"),
                    }
                }
                Some(command) = command_rx.recv() => {
                    handle_command(command, &mut api, &mut router).await;
                }
                _ = health_tick.tick(), if probe_health => {
                    if probe_pending {
                        error!(
                            "{:?} connection health check failed: no firmware version in metadata response",
                            self.settings.connection_type
                        );
                        return Disconnect::Lost("health check failed");
                    }
                    if let Err(e) = send_metadata_probe(&mut api, &mut router).await {
                        error!("Health probe send failed: {:#}", e);
                        return Disconnect::Lost("health probe send failed");
                    }
                    probe_pending = true;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Disconnect::Shutdown;
                    }
                }
            }
        }
    }

    /// Fold one frame into transport state, forwarding mesh packets to the
    /// translator. Returns true when the frame answered a metadata probe.
    async fn absorb_frame(&self, frame: protobufs::FromRadio) -> bool {
        let Some(variant) = frame.payload_variant else { return false };
        match variant {
            from_radio::PayloadVariant::MyInfo(info) => {
                self.my_node_id.store(info.my_node_num, Ordering::SeqCst);
                false
            }
            from_radio::PayloadVariant::NodeInfo(node_info) => {
                self.absorb_node_info(&node_info);
                false
            }
            from_radio::PayloadVariant::Packet(packet) => self.absorb_mesh_packet(packet).await,
            from_radio::PayloadVariant::Metadata(metadata) => {
                !metadata.firmware_version.is_empty()
            }
            _ => false,
        }
    }

    fn absorb_node_info(&self, node_info: &protobufs::NodeInfo) {
        let Some(user) = &node_info.user else { return };
        let node_id = format_node_id(node_info.num);
        debug!("NodeInfo: {} {} ({})", node_id, user.long_name, user.short_name);
        if let Ok(mut table) = self.node_table.write() {
            table.insert(
                node_info.num,
                NodeUser {
                    long_name: user.long_name.clone(),
                    short_name: user.short_name.clone(),
                },
            );
        }
        // Persist lazily-learned names; reply/reaction prefixes survive restarts.
        if !user.long_name.is_empty() {
            if let Err(e) = self.db.save_longname(&node_id, &user.long_name) {
                warn!("Failed to save longname for {}: {:#}", node_id, e);
            }
        }
        if !user.short_name.is_empty() {
            if let Err(e) = self.db.save_shortname(&node_id, &user.short_name) {
                warn!("Failed to save shortname for {}: {:#}", node_id, e);
            }
        }
    }

    async fn absorb_mesh_packet(&self, packet: protobufs::MeshPacket) -> bool {
        let Some(mesh_packet::PayloadVariant::Decoded(data)) = &packet.payload_variant else {
            debug!("Dropping mesh packet without decoded payload");
            return false;
        };

        // Metadata responses answer the health probe and stay internal.
        if data.portnum() == PortNum::AdminApp {
            if let Ok(admin) = protobufs::AdminMessage::decode(data.payload.as_slice()) {
                if let Some(protobufs::admin_message::PayloadVariant::GetDeviceMetadataResponse(
                    metadata,
                )) = admin.payload_variant
                {
                    if !metadata.firmware_version.is_empty() {
                        debug!("Health probe answered: firmware {}", metadata.firmware_version);
                        return true;
                    }
                }
            }
            return false;
        }

        let kind = match data.portnum() {
            PortNum::TextMessageApp => match String::from_utf8(data.payload.to_vec()) {
                Ok(text) => {
                    if data.reply_id != 0 && data.emoji != 0 {
                        PacketKind::Reaction { emoji_text: text, reply_id: data.reply_id }
                    } else if data.reply_id != 0 {
                        PacketKind::Reply { text, reply_id: data.reply_id }
                    } else {
                        PacketKind::Text { text }
                    }
                }
                Err(_) => {
                    debug!("Dropping text packet with invalid UTF-8 payload");
                    return false;
                }
            },
            PortNum::DetectionSensorApp => PacketKind::DetectionSensor {
                text: String::from_utf8_lossy(&data.payload).into_owned(),
            },
            PortNum::TelemetryApp => PacketKind::Telemetry,
            PortNum::PositionApp => PacketKind::Position,
            _ => PacketKind::Other { portnum: data.portnum },
        };

        let envelope = PacketEnvelope {
            from: packet.from,
            to: packet.to,
            channel: packet.channel,
            id: packet.id,
            kind,
        };
        if self.events_tx.send(envelope).await.is_err() {
            warn!("Packet event channel closed; dropping received packet");
        }
        false
    }
}

/// Routes sent packets back to us so the radio-assigned packet id can be
/// captured for the message map.
struct RelayRouter {
    my_id: u32,
    last_sent_id: Option<u32>,
}

#[derive(Debug)]
struct RouterError(String);

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RouterError {}

impl RelayRouter {
    fn new(my_id: u32) -> Self {
        Self { my_id, last_sent_id: None }
    }

    fn take_last_sent_id(&mut self) -> Option<u32> {
        self.last_sent_id.take()
    }
}

impl PacketRouter<(), RouterError> for RelayRouter {
    fn handle_packet_from_radio(
        &mut self,
        _packet: protobufs::FromRadio,
    ) -> std::result::Result<(), RouterError> {
        Ok(())
    }

    fn handle_mesh_packet(
        &mut self,
        packet: protobufs::MeshPacket,
    ) -> std::result::Result<(), RouterError> {
        self.last_sent_id = Some(packet.id);
        Ok(())
    }

    fn source_node_id(&self) -> NodeId {
        NodeId::from(self.my_id)
    }
}

async fn handle_command(
    command: MeshCommand,
    api: &mut ConnectedStreamApi,
    router: &mut RelayRouter,
) {
    match command {
        MeshCommand::SendText { text, channel, reply_id, resp } => {
            let result = send_text_packet(api, router, text, channel, reply_id).await;
            let _ = resp.send(result);
        }
        MeshCommand::SendData { payload, portnum, channel, resp } => {
            let result = send_data_packet(api, router, payload, portnum, channel).await;
            let _ = resp.send(result);
        }
    }
}

async fn send_text_packet(
    api: &mut ConnectedStreamApi,
    router: &mut RelayRouter,
    text: String,
    channel: u32,
    reply_id: Option<u32>,
) -> Result<u32> {
    let channel = MeshChannel::new(channel).map_err(|e| anyhow!("invalid channel: {}", e))?;
    api.send_mesh_packet(
        router,
        text.into_bytes().into(),
        PortNum::TextMessageApp,
        PacketDestination::Broadcast,
        channel,
        false,
        false,
        true,
        reply_id,
        None,
    )
    .await
    .map_err(|e| anyhow!("radio send failed: {}", e))?;
    router
        .take_last_sent_id()
        .context("radio did not echo the sent packet id")
}

async fn send_data_packet(
    api: &mut ConnectedStreamApi,
    router: &mut RelayRouter,
    payload: Vec<u8>,
    portnum: PortNum,
    channel: u32,
) -> Result<u32> {
    let channel = MeshChannel::new(channel).map_err(|e| anyhow!("invalid channel: {}", e))?;
    api.send_mesh_packet(
        router,
        payload.into(),
        portnum,
        PacketDestination::Broadcast,
        channel,
        false,
        false,
        true,
        None,
        None,
    )
    .await
    .map_err(|e| anyhow!("radio send failed: {}", e))?;
    router
        .take_last_sent_id()
        .context("radio did not echo the sent packet id")
}

/// Ask the local node for its device metadata; the reply carries the
/// firmware version the health check looks for.
async fn send_metadata_probe(
    api: &mut ConnectedStreamApi,
    router: &mut RelayRouter,
) -> Result<()> {
    let request = protobufs::AdminMessage {
        payload_variant: Some(
            protobufs::admin_message::PayloadVariant::GetDeviceMetadataRequest(true),
        ),
        ..Default::default()
    };
    let channel = MeshChannel::new(0).map_err(|e| anyhow!("invalid channel: {}", e))?;
    api.send_mesh_packet(
        router,
        request.encode_to_vec().into(),
        PortNum::AdminApp,
        PacketDestination::Local,
        channel,
        false,
        true,
        false,
        None,
        None,
    )
    .await
    .map_err(|e| anyhow!("metadata probe failed: {}", e))?;
    Ok(())
}

fn serial_port_exists(port: &str) -> bool {
    match utils::stream::available_serial_ports() {
        Ok(ports) => ports.iter().any(|p| p == port),
        // If enumeration is unavailable, fall back to a path check.
        Err(_) => std::path::Path::new(port).exists(),
    }
}

/// Whether the process is running under a service manager. Controls only
/// whether interactive reconnect countdowns are shown.
pub fn is_running_as_service() -> bool {
    if std::env::var_os("INVOCATION_ID").is_some() {
        return true;
    }
    parent_process_is_systemd().unwrap_or(false)
}

fn parent_process_is_systemd() -> Option<bool> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let ppid_line = status.lines().find(|line| line.starts_with("PPid:"))?;
    let ppid: u32 = ppid_line.split_whitespace().nth(1)?.parse().ok()?;
    let comm = std::fs::read_to_string(format!("/proc/{}/comm", ppid)).ok()?;
    Some(comm.trim() == "systemd")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_data(text: &str, reply_id: u32, emoji: u32) -> protobufs::Data {
        protobufs::Data {
            portnum: PortNum::TextMessageApp as i32,
            payload: text.as_bytes().to_vec(),
            reply_id,
            emoji,
            ..Default::default()
        }
    }

    fn envelope_from(data: protobufs::Data) -> Option<PacketKind> {
        // Mirrors the classification arm of absorb_mesh_packet for the
        // text-app cases, which is pure.
        let text = String::from_utf8(data.payload.to_vec()).ok()?;
        Some(if data.reply_id != 0 && data.emoji != 0 {
            PacketKind::Reaction { emoji_text: text, reply_id: data.reply_id }
        } else if data.reply_id != 0 {
            PacketKind::Reply { text, reply_id: data.reply_id }
        } else {
            PacketKind::Text { text }
        })
    }

    #[test]
    fn classifies_plain_text() {
        match envelope_from(text_data("hi", 0, 0)).unwrap() {
            PacketKind::Text { text } => assert_eq!(text, "hi"),
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn classifies_reaction() {
        match envelope_from(text_data("👍", 42, 1)).unwrap() {
            PacketKind::Reaction { emoji_text, reply_id } => {
                assert_eq!(emoji_text, "👍");
                assert_eq!(reply_id, 42);
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn classifies_reply() {
        match envelope_from(text_data("sure", 42, 0)).unwrap() {
            PacketKind::Reply { text, reply_id } => {
                assert_eq!(text, "sure");
                assert_eq!(reply_id, 42);
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn node_id_formatting() {
        assert_eq!(format_node_id(0xaabbccdd), "!aabbccdd");
        assert_eq!(format_node_id(0x1), "!00000001");
    }

    #[test]
    fn broadcast_detection() {
        let envelope = PacketEnvelope {
            from: 1,
            to: BROADCAST_NUM,
            channel: 0,
            id: 7,
            kind: PacketKind::Text { text: "x".into() },
        };
        assert!(envelope.is_broadcast());
    }
}
