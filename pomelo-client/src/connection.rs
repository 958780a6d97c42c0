//! Connection management: lifecycle control loop, handshake, session tasks.

use crate::error::ClientError;
use crate::pending::{self, PendingTable, RequestResult};
use crate::routes::RouteHandlers;
use crate::session::{heartbeat_quality, CloseReason, Session};
use crate::state::{ConnectionState, NetworkEvent};
use crate::stream::ClientStream;
use crate::tls::{self, TlsClientConfig};
use bytes::Bytes;
use parking_lot::RwLock;
use pomelo_protocol::{
    encode_packet, ClientHandshake, HandshakeData, Message, MessageCodec, MessageType, Packet,
    PacketDecoder, PacketType, RouteDictionary, ServerErrorPayload, DEFAULT_SERIALIZER,
    MAX_PACKET_SIZE,
};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Shortest accepted reaper sweep interval.
pub const MIN_REAPER_INTERVAL: Duration = Duration::from_millis(10);

/// Capacity of the network event channel.
const NETWORK_EVENT_CHANNEL_CAPACITY: usize = 64;

/// Upper bound on flushing the write half during teardown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Bound on the whole handshake exchange.
    pub handshake_timeout: Duration,
    /// Default deadline for requests.
    pub request_timeout: Duration,
    /// How often the reaper sweeps for timed out requests.
    pub reaper_interval: Duration,
    /// Delay between reconnect attempts. `None` disables reconnect.
    pub reconnect_backoff: Option<Duration>,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Largest packet payload accepted from the server.
    pub max_packet_size: usize,
    /// Compress outgoing request/notify bodies.
    pub data_compression: bool,
    /// Handshake body sent on every connect.
    pub handshake: ClientHandshake,
    /// TLS configuration (optional).
    pub tls: Option<TlsClientConfig>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            reaper_interval: Duration::from_secs(1),
            reconnect_backoff: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_packet_size: MAX_PACKET_SIZE,
            data_compression: false,
            handshake: ClientHandshake::default(),
            tls: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval.max(MIN_REAPER_INTERVAL);
        self
    }

    /// Enables reconnect with a fixed backoff between attempts.
    pub fn with_reconnect(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = Some(backoff);
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_PACKET_SIZE);
        self
    }

    pub fn with_data_compression(mut self, enabled: bool) -> Self {
        self.data_compression = enabled;
        self
    }

    pub fn with_handshake(mut self, handshake: ClientHandshake) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }
}

/// Values the server announced in its handshake.
#[derive(Debug, Clone)]
struct Negotiated {
    heartbeat: Option<Duration>,
    serializer: String,
}

/// Where to connect and what to say in the handshake.
#[derive(Debug, Clone)]
struct Target {
    host: String,
    port: u16,
    handshake: ClientHandshake,
}

impl Target {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Awaitable completion of one request.
#[derive(Debug)]
pub struct PendingResponse {
    pub id: u64,
    rx: oneshot::Receiver<RequestResult>,
}

impl PendingResponse {
    /// Waits for the response, a timeout or session teardown.
    pub async fn wait(self) -> Result<Bytes, ClientError> {
        self.rx.await.unwrap_or(Err(ClientError::ConnectionClosed))
    }
}

/// A connection to a Pomelo/Pitaya server.
///
/// One control loop task owns the lifecycle. Each handshaken session runs a
/// read loop, a packet handler, a heartbeat task and a reaper, all stopped
/// through the session's close signal.
pub struct Connection {
    config: ConnectionConfig,
    codec: MessageCodec,
    /// Write half of the current session's stream.
    writer: Mutex<Option<WriteHalf<ClientStream>>>,
    session: parking_lot::Mutex<Option<Arc<Session>>>,
    pending: Arc<PendingTable>,
    routes: RouteHandlers,
    next_id: AtomicU64,
    next_session: AtomicU64,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<NetworkEvent>,
    negotiated: RwLock<Negotiated>,
    quality: AtomicI64,
    /// Set by `disconnect()`; stops the control loop.
    stop: watch::Sender<bool>,
    disposed: AtomicBool,
    /// True while the control loop runs.
    running: watch::Sender<bool>,
    driver: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        let dictionary = Arc::new(RouteDictionary::new());
        let codec = MessageCodec::new(dictionary).with_data_compression(config.data_compression);
        let (state, _) = watch::channel(ConnectionState::Inited);
        let (events, _) = broadcast::channel(NETWORK_EVENT_CHANNEL_CAPACITY);
        let (stop, _) = watch::channel(false);
        let (running, _) = watch::channel(false);
        Self {
            config,
            codec,
            writer: Mutex::new(None),
            session: parking_lot::Mutex::new(None),
            pending: Arc::new(PendingTable::new()),
            routes: RouteHandlers::new(),
            next_id: AtomicU64::new(1),
            next_session: AtomicU64::new(1),
            state,
            events,
            negotiated: RwLock::new(Negotiated {
                heartbeat: None,
                serializer: DEFAULT_SERIALIZER.to_string(),
            }),
            quality: AtomicI64::new(0),
            stop,
            disposed: AtomicBool::new(false),
            running,
            driver: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe_network_events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    pub fn routes(&self) -> &RouteHandlers {
        &self.routes
    }

    pub fn dictionary(&self) -> &Arc<RouteDictionary> {
        self.codec.dictionary()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Fails every in-flight request with `Cancelled`.
    pub fn clear_pending(&self) -> usize {
        self.pending.clear()
    }

    /// Last heartbeat sample in milliseconds (sent minus received).
    pub fn quality(&self) -> i64 {
        self.quality.load(Ordering::Relaxed)
    }

    pub fn serializer(&self) -> String {
        self.negotiated.read().serializer.clone()
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.negotiated.read().heartbeat
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Whether the control loop is connecting, connected or waiting to reconnect.
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Resolves once the control loop has stopped and will not reconnect.
    pub async fn stopped(&self) {
        let mut rx = self.running.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }

    /// Connects and handshakes. Resolves with the outcome of the first
    /// successful or terminally failed attempt; with reconnect enabled the
    /// control loop keeps running afterwards.
    pub async fn connect(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        user: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), ClientError> {
        if self.is_disposed() {
            return Err(ClientError::Disposed);
        }

        let mut handshake = self.config.handshake.clone();
        handshake.user.extend(user);
        let target = Target {
            host: host.to_string(),
            port,
            handshake,
        };

        let (first_tx, first_rx) = oneshot::channel();
        {
            let mut driver = self.driver.lock();
            if driver.as_ref().is_some_and(|handle| !handle.is_finished()) {
                return Err(ClientError::AlreadyConnected);
            }
            self.stop.send_replace(false);
            self.running.send_replace(true);
            let conn = Arc::clone(self);
            *driver = Some(tokio::spawn(async move {
                conn.run(target, first_tx).await;
            }));
        }

        first_rx.await.unwrap_or(Err(ClientError::Disconnected))
    }

    /// Closes the current session and stops reconnecting. Idempotent.
    pub async fn disconnect(&self) {
        self.shutdown(CloseReason::Requested).await;
    }

    /// Disconnects for good; later `connect` calls fail with `Disposed`.
    pub async fn close(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.shutdown(CloseReason::Disposed).await;
    }

    async fn shutdown(&self, reason: CloseReason) {
        self.stop.send_replace(true);
        let session = self.session.lock().clone();
        if let Some(session) = session {
            session.close(reason);
        }
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                tracing::error!("control loop panicked: {}", e);
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.is_disposed() || *self.stop.borrow()
    }

    fn stopped_error(&self) -> ClientError {
        if self.is_disposed() {
            ClientError::Disposed
        } else {
            ClientError::Disconnected
        }
    }

    fn transition(&self, next: ConnectionState, reason: Option<String>) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            tracing::warn!(from = %previous, to = %next, "unexpected state transition");
        }
        match reason {
            Some(ref reason) => {
                tracing::info!(from = %previous, to = %next, %reason, "network state changed")
            }
            None => tracing::info!(from = %previous, to = %next, "network state changed"),
        }
        let _ = self.events.send(NetworkEvent::new(next, reason));
    }

    /// The control loop: connect, handshake, wait for the session to end,
    /// tear down, and reconnect while allowed.
    async fn run(
        self: Arc<Self>,
        target: Target,
        first: oneshot::Sender<Result<(), ClientError>>,
    ) {
        let mut first = Some(first);
        let mut stop = self.stop.subscribe();

        loop {
            if self.is_stopped() {
                break;
            }

            self.transition(ConnectionState::Connecting, None);
            let attempt = tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => Err(self.stopped_error()),
                result = self.establish(&target) => result,
            };

            match attempt {
                Ok(session) => {
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Ok(()));
                    }
                    // A shutdown that ran before the session was installed
                    // could not close it.
                    if self.is_stopped() {
                        session.close(if self.is_disposed() {
                            CloseReason::Disposed
                        } else {
                            CloseReason::Requested
                        });
                    }
                    let reason = session.closed().await;
                    self.teardown(&session, &reason).await;
                    if !reason.allows_reconnect() || self.config.reconnect_backoff.is_none() {
                        break;
                    }
                }
                Err(err) => {
                    self.transition(ConnectionState::Disconnected, Some(err.to_string()));
                    if self.is_stopped() || self.config.reconnect_backoff.is_none() {
                        tracing::error!(addr = %target.addr(), "connect failed: {}", err);
                        if let Some(tx) = first.take() {
                            let _ = tx.send(Err(err));
                        }
                        break;
                    }
                    tracing::warn!(addr = %target.addr(), "connect attempt failed: {}", err);
                }
            }

            if let Some(backoff) = self.config.reconnect_backoff {
                tracing::info!(addr = %target.addr(), ?backoff, "reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = stop_requested(&mut stop) => {}
                }
            }
        }

        if let Some(tx) = first.take() {
            let _ = tx.send(Err(self.stopped_error()));
        }
        self.running.send_replace(false);
        tracing::debug!(addr = %target.addr(), "control loop stopped");
    }

    /// One connect attempt. On success the session is installed and its
    /// tasks are running.
    async fn establish(self: &Arc<Self>, target: &Target) -> Result<Arc<Session>, ClientError> {
        let addr = target.addr();
        tracing::debug!("Connecting to {}...", addr);

        let tcp = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::ConnectTimeout {
                addr: addr.clone(),
                timeout: self.config.connect_timeout,
            })?
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?;
        tcp.set_nodelay(true).ok();
        self.transition(ConnectionState::Connected, None);

        let stream = match self.config.tls {
            Some(ref tls_config) if tls_config.enabled => {
                tls::upgrade(tcp, tls_config, &target.host).await?
            }
            _ => ClientStream::from(tcp),
        };
        tracing::debug!(
            transport = stream.transport(),
            peer = ?stream.peer_addr().ok(),
            "socket ready, starting handshake"
        );

        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut decoder = PacketDecoder::with_max_packet_size(self.config.max_packet_size);
        let handshake = tokio::time::timeout(
            self.config.handshake_timeout,
            self.handshake(&target.handshake, &mut reader, &mut writer, &mut decoder),
        )
        .await
        .map_err(|_| ClientError::Handshake("timed out waiting for server handshake".into()))??;

        let session = Arc::new(Session::new(
            self.next_session.fetch_add(1, Ordering::Relaxed),
        ));
        *self.writer.lock().await = Some(writer);
        *self.session.lock() = Some(Arc::clone(&session));
        self.quality.store(0, Ordering::Relaxed);
        self.transition(ConnectionState::Working, None);
        self.spawn_session_tasks(&session, reader, decoder, handshake.heartbeat_interval());

        tracing::info!(addr = %addr, session = session.id(), "session established");
        Ok(session)
    }

    /// Runs the handshake exchange over a fresh stream. Bytes that arrive
    /// after the server handshake stay in `decoder`.
    async fn handshake<R, W>(
        &self,
        handshake: &ClientHandshake,
        reader: &mut R,
        writer: &mut W,
        decoder: &mut PacketDecoder,
    ) -> Result<HandshakeData, ClientError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.dictionary().clear();

        let packet = encode_packet(PacketType::Handshake, &handshake.encode()?)?;
        writer.write_all(&packet).await?;
        tracing::debug!("Handshake sent ({} bytes), waiting for server...", packet.len());

        let packet = read_packet(reader, decoder, self.config.read_buffer_size).await?;
        if packet.packet_type != PacketType::Handshake {
            return Err(ClientError::Handshake(format!(
                "expected handshake packet, got {:?}",
                packet.packet_type
            )));
        }

        let data = HandshakeData::decode(&packet.payload)
            .map_err(|e| ClientError::Handshake(format!("invalid handshake payload: {}", e)))?;
        if !data.is_accepted() {
            return Err(ClientError::HandshakeRejected(data.code));
        }

        match self.dictionary().install(&data.sys.dict) {
            Ok(count) => tracing::debug!(routes = count, "route dictionary installed"),
            Err(e) => tracing::warn!("ignoring route dictionary: {}", e),
        }
        {
            let mut negotiated = self.negotiated.write();
            negotiated.heartbeat = data.heartbeat_interval();
            negotiated.serializer = data.sys.serializer.clone();
        }

        writer
            .write_all(&encode_packet(PacketType::HandshakeAck, &[])?)
            .await?;
        tracing::debug!(
            heartbeat = data.sys.heartbeat,
            serializer = %data.sys.serializer,
            "handshake complete"
        );
        Ok(data)
    }

    fn spawn_session_tasks(
        self: &Arc<Self>,
        session: &Arc<Session>,
        reader: ReadHalf<ClientStream>,
        decoder: PacketDecoder,
        heartbeat: Option<Duration>,
    ) {
        let (packets_tx, packets_rx) = mpsc::unbounded_channel();

        session.add_task(tokio::spawn(read_loop(
            reader,
            decoder,
            packets_tx,
            Arc::clone(session),
            self.config.read_buffer_size,
        )));
        session.add_task(tokio::spawn(
            Arc::clone(self).handle_packets(packets_rx, Arc::clone(session)),
        ));
        if let Some(interval) = heartbeat {
            session.add_task(tokio::spawn(
                Arc::clone(self).heartbeat_loop(Arc::clone(session), interval),
            ));
        }
        session.add_task(tokio::spawn(pending::run_reaper(
            Arc::clone(&self.pending),
            self.config.reaper_interval,
            Arc::clone(session),
        )));
    }

    /// Stops the session's tasks, closes the stream and fails in-flight
    /// requests. Called once per session by the control loop.
    async fn teardown(&self, session: &Arc<Session>, reason: &CloseReason) {
        self.transition(ConnectionState::Disconnecting, Some(reason.to_string()));
        session.abort_tasks();
        {
            let mut current = self.session.lock();
            if current.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
                *current = None;
            }
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
                Ok(Err(e)) => tracing::debug!("stream shutdown failed: {}", e),
                Err(_) => tracing::debug!("stream shutdown timed out"),
                Ok(Ok(())) => {}
            }
        }

        let failed = self.pending.fail_all(|| match reason {
            CloseReason::Kicked => ClientError::Kicked,
            _ => ClientError::ConnectionClosed,
        });
        if failed > 0 {
            tracing::debug!(session = session.id(), failed, "failed in-flight requests");
        }

        self.transition(ConnectionState::Disconnected, Some(reason.to_string()));
    }

    fn current_session(&self) -> Result<Arc<Session>, ClientError> {
        if !self.state().is_working() {
            return Err(ClientError::NotConnected);
        }
        self.session
            .lock()
            .clone()
            .filter(|s| !s.is_closed())
            .ok_or(ClientError::NotConnected)
    }

    /// Writes an encoded frame through the single writer.
    async fn write_frame(&self, frame: &[u8]) -> Result<(), ClientError> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(frame).await?;
        Ok(())
    }

    /// Sends a request. The pending entry exists before the bytes hit the
    /// socket so a fast response always finds it.
    pub async fn send_request(
        &self,
        route: &str,
        data: Bytes,
        timeout: Duration,
    ) -> Result<PendingResponse, ClientError> {
        let session = self.current_session()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = self
            .codec
            .encode_data_packet(&Message::request(id, route, data))?;

        let rx = self.pending.insert(id, route, timeout);
        if let Err(e) = self.write_frame(&frame).await {
            self.pending.take(id);
            session.close(CloseReason::WriteFailed(e.to_string()));
            return Err(e);
        }
        tracing::debug!(id, route, bytes = frame.len(), "request sent");
        Ok(PendingResponse { id, rx })
    }

    /// Sends a notify; no response is expected.
    pub async fn send_notify(&self, route: &str, data: Bytes) -> Result<(), ClientError> {
        let session = self.current_session()?;
        let frame = self.codec.encode_data_packet(&Message::notify(route, data))?;
        if let Err(e) = self.write_frame(&frame).await {
            session.close(CloseReason::WriteFailed(e.to_string()));
            return Err(e);
        }
        tracing::debug!(route, bytes = frame.len(), "notify sent");
        Ok(())
    }

    /// Consumes decoded packets in arrival order.
    async fn handle_packets(
        self: Arc<Self>,
        mut packets: mpsc::UnboundedReceiver<Packet>,
        session: Arc<Session>,
    ) {
        while let Some(packet) = packets.recv().await {
            match packet.packet_type {
                PacketType::Data => self.dispatch_data(&packet.payload),
                PacketType::Heartbeat => self.record_heartbeat(&session),
                PacketType::Kick => {
                    tracing::warn!(session = session.id(), "kicked by server");
                    session.close(CloseReason::Kicked);
                    break;
                }
                other => {
                    tracing::warn!(packet_type = ?other, "unexpected packet while working, ignoring")
                }
            }
        }
    }

    fn dispatch_data(&self, payload: &[u8]) {
        let message = match self.codec.decode(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("dropping undecodable message: {}", e);
                return;
            }
        };

        match message.message_type {
            MessageType::Response => {
                let id = message.id;
                let result = if message.error {
                    Err(ClientError::Server(ServerErrorPayload::from_bytes(
                        &message.data,
                    )))
                } else {
                    Ok(message.data)
                };
                if !self.pending.complete(id, result) {
                    tracing::debug!(id, "dropping response with no pending request");
                }
            }
            MessageType::Push => {
                self.routes.dispatch(&message.route, message.data);
            }
            other => {
                tracing::warn!(message_type = ?other, route = %message.route, "ignoring server-originated message")
            }
        }
    }

    fn record_heartbeat(&self, session: &Session) {
        let received_at = Instant::now();
        if let Some(sent_at) = session.take_heartbeat_sent() {
            let quality = heartbeat_quality(sent_at, received_at);
            self.quality.store(quality, Ordering::Relaxed);
            tracing::trace!(quality, "heartbeat received");
        }
    }

    /// Writes a heartbeat every `interval`; closes the session when the
    /// server has been silent for two intervals.
    async fn heartbeat_loop(self: Arc<Self>, session: Arc<Session>, interval: Duration) {
        let frame = match Packet::empty(PacketType::Heartbeat).encode() {
            Ok(frame) => frame.freeze(),
            Err(e) => {
                tracing::error!("cannot encode heartbeat: {}", e);
                return;
            }
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = session.closed() => return,
            }

            let silent = session.since_last_received();
            if silent > interval.saturating_mul(2) {
                tracing::warn!(session = session.id(), ?silent, "server stopped responding");
                session.close(CloseReason::HeartbeatTimeout);
                return;
            }

            session.mark_heartbeat_sent(Instant::now());
            if let Err(e) = self.write_frame(&frame).await {
                tracing::warn!(session = session.id(), "heartbeat write failed: {}", e);
                session.close(CloseReason::WriteFailed(e.to_string()));
                return;
            }
        }
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Reads until one complete packet is buffered.
async fn read_packet<R>(
    reader: &mut R,
    decoder: &mut PacketDecoder,
    buffer_size: usize,
) -> Result<Packet, ClientError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        if let Some(packet) = decoder.decode_packet()? {
            return Ok(packet);
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        decoder.extend(&buf[..n]);
    }
}

/// The single reader of a session. Decoded packets go to the handler in
/// arrival order.
async fn read_loop(
    mut reader: ReadHalf<ClientStream>,
    mut decoder: PacketDecoder,
    packets: mpsc::UnboundedSender<Packet>,
    session: Arc<Session>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    let reason = 'read: loop {
        match decoder.decode_all() {
            Ok(decoded) => {
                for packet in decoded {
                    if packets.send(packet).is_err() {
                        break 'read CloseReason::HandlerStopped;
                    }
                }
            }
            Err(e) => break 'read CloseReason::Framing(e.to_string()),
        }

        let n = tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => break 'read CloseReason::Eof,
                Ok(n) => n,
                Err(e) => break 'read CloseReason::ReadFailed(e.to_string()),
            },
            _ = session.closed() => return,
        };
        session.touch();
        decoder.extend(&buf[..n]);
    };

    tracing::warn!(session = session.id(), %reason, "read loop stopped");
    session.close(reason);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    /// Server side of a test session.
    pub(crate) struct MockPeer {
        pub stream: TcpStream,
        decoder: PacketDecoder,
        pub dictionary: RouteDictionary,
    }

    impl MockPeer {
        pub async fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
                .await
                .expect("client never connected")
                .unwrap();
            Self {
                stream,
                decoder: PacketDecoder::new(),
                dictionary: RouteDictionary::new(),
            }
        }

        pub async fn recv(&mut self) -> Packet {
            tokio::time::timeout(
                Duration::from_secs(5),
                read_packet(&mut self.stream, &mut self.decoder, 1024),
            )
            .await
            .expect("no packet from client")
            .unwrap()
        }

        pub async fn send(&mut self, packet_type: PacketType, payload: &[u8]) {
            let packet = encode_packet(packet_type, payload).unwrap();
            self.stream.write_all(&packet).await.unwrap();
        }

        /// Completes the handshake, installing `dict` on both ends.
        pub async fn handshake(&mut self, heartbeat: u64, dict: &[(&str, u16)]) -> ClientHandshake {
            let packet = self.recv().await;
            assert_eq!(packet.packet_type, PacketType::Handshake);
            let client: ClientHandshake = serde_json::from_slice(&packet.payload).unwrap();

            let dict: HashMap<String, u16> =
                dict.iter().map(|(r, c)| (r.to_string(), *c)).collect();
            self.dictionary.install(&dict).unwrap();
            let body = json!({
                "code": 200,
                "sys": { "heartbeat": heartbeat, "dict": dict, "serializer": "json" }
            });
            self.send(PacketType::Handshake, body.to_string().as_bytes())
                .await;

            let ack = self.recv().await;
            assert_eq!(ack.packet_type, PacketType::HandshakeAck);
            assert!(ack.payload.is_empty());
            client
        }

        pub async fn recv_message(&mut self) -> Message {
            let packet = self.recv().await;
            assert_eq!(packet.packet_type, PacketType::Data);
            Message::decode(&packet.payload, &self.dictionary).unwrap()
        }

        pub async fn send_message(&mut self, message: Message) {
            let body = message.encode(&self.dictionary, false).unwrap();
            self.send(PacketType::Data, &body).await;
        }
    }

    pub(crate) async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    pub(crate) fn fast_config() -> ConnectionConfig {
        ConnectionConfig::new()
            .with_connect_timeout(Duration::from_secs(2))
            .with_handshake_timeout(Duration::from_secs(2))
            .with_request_timeout(Duration::from_secs(2))
            .with_reaper_interval(Duration::from_millis(20))
    }

    async fn connected(
        config: ConnectionConfig,
        dict: &[(&str, u16)],
    ) -> (Arc<Connection>, MockPeer, TcpListener) {
        connected_with_heartbeat(config, 0, dict).await
    }

    async fn connected_with_heartbeat(
        config: ConnectionConfig,
        heartbeat: u64,
        dict: &[(&str, u16)],
    ) -> (Arc<Connection>, MockPeer, TcpListener) {
        let (listener, port) = listener().await;
        let conn = Arc::new(Connection::new(config));
        let client = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.connect("127.0.0.1", port, Default::default()).await })
        };
        let mut peer = MockPeer::accept(&listener).await;
        peer.handshake(heartbeat, dict).await;
        client.await.unwrap().unwrap();
        (conn, peer, listener)
    }

    /// Waits for the next network event announcing `state`.
    async fn next_event(
        events: &mut broadcast::Receiver<NetworkEvent>,
        state: ConnectionState,
        within: Duration,
    ) -> NetworkEvent {
        tokio::time::timeout(within, async {
            loop {
                let event = events.recv().await.unwrap();
                if event.state == state {
                    return event;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {} event", state))
    }

    /// Answers one request on `peer` with `body`.
    async fn answer_next_request(peer: &mut MockPeer, body: &'static str) {
        let request = peer.recv_message().await;
        assert_eq!(request.message_type, MessageType::Request);
        peer.send_message(Message::response(request.id, body)).await;
    }

    async fn wait_for_state(conn: &Connection, state: ConnectionState) {
        let mut rx = conn.watch_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("never reached {}", state))
            .unwrap();
    }

    #[test]
    fn test_config_builder() {
        let config = ConnectionConfig::new()
            .with_read_buffer_size(1)
            .with_max_packet_size(usize::MAX)
            .with_reconnect(Duration::from_millis(250))
            .with_reaper_interval(Duration::ZERO);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);
        assert_eq!(config.reaper_interval, MIN_REAPER_INTERVAL);
        assert_eq!(config.max_packet_size, MAX_PACKET_SIZE);
        assert_eq!(config.reconnect_backoff, Some(Duration::from_millis(250)));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_read_packet_across_reads() {
        let frame = encode_packet(PacketType::Data, b"hello").unwrap();
        let mut reader = tokio_test::io::Builder::new()
            .read(&frame[..2])
            .read(&frame[2..6])
            .read(&frame[6..])
            .build();
        let mut decoder = PacketDecoder::new();

        let packet = read_packet(&mut reader, &mut decoder, 64).await.unwrap();
        assert_eq!(packet.packet_type, PacketType::Data);
        assert_eq!(&packet.payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_read_packet_eof_mid_frame() {
        let frame = encode_packet(PacketType::Handshake, b"{}").unwrap();
        let mut reader = tokio_test::io::Builder::new().read(&frame[..3]).build();
        let mut decoder = PacketDecoder::new();

        let err = read_packet(&mut reader, &mut decoder, 64).await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_handshake_reaches_working() {
        let (listener, port) = listener().await;
        let conn = Arc::new(Connection::new(fast_config()));
        let mut events = conn.subscribe_network_events();
        assert_eq!(conn.state(), ConnectionState::Inited);

        let client = {
            let conn = Arc::clone(&conn);
            let mut user = serde_json::Map::new();
            user.insert("uid".into(), json!("u-1"));
            tokio::spawn(async move { conn.connect("127.0.0.1", port, user).await })
        };

        let mut peer = MockPeer::accept(&listener).await;
        let hello = peer.handshake(0, &[("room.join", 1)]).await;
        client.await.unwrap().unwrap();

        assert_eq!(hello.sys.platform, "mac");
        assert_eq!(hello.user.get("uid"), Some(&json!("u-1")));
        assert_eq!(conn.state(), ConnectionState::Working);
        assert_eq!(conn.serializer(), "json");
        assert_eq!(conn.heartbeat_interval(), None);
        assert_eq!(conn.dictionary().code_of("room.join"), Some(1));

        let states: Vec<ConnectionState> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.state)
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Working
            ]
        );
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let (conn, mut peer, _listener) = connected(fast_config(), &[]).await;

        let first = conn
            .send_request("room.a", Bytes::from_static(b"1"), Duration::from_secs(2))
            .await
            .unwrap();
        let second = conn
            .send_request("room.b", Bytes::from_static(b"2"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);

        let a = peer.recv_message().await;
        let b = peer.recv_message().await;
        assert_eq!((a.id, a.route.as_str()), (1, "room.a"));
        assert_eq!((b.id, b.route.as_str()), (2, "room.b"));

        peer.send_message(Message::response(2, "for-b")).await;
        peer.send_message(Message::response(1, "for-a")).await;

        assert_eq!(first.wait().await.unwrap(), Bytes::from_static(b"for-a"));
        assert_eq!(second.wait().await.unwrap(), Bytes::from_static(b"for-b"));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_server_error_response() {
        let (conn, mut peer, _listener) = connected(fast_config(), &[]).await;
        let pending = conn
            .send_request("room.fail", Bytes::new(), Duration::from_secs(2))
            .await
            .unwrap();
        let request = peer.recv_message().await;
        let body = json!({"code": "PIT-500", "msg": "boom"}).to_string();
        peer.send_message(Message::response(request.id, body).with_error())
            .await;

        match pending.wait().await {
            Err(ClientError::Server(payload)) => {
                assert_eq!(payload.code, "PIT-500");
                assert_eq!(payload.msg, "boom");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_dropped() {
        let (conn, mut peer, _listener) = connected(fast_config(), &[]).await;

        let pending = conn
            .send_request("slow.route", Bytes::new(), Duration::from_millis(100))
            .await
            .unwrap();
        let request = peer.recv_message().await;

        let started = Instant::now();
        let result = pending.wait().await;
        assert!(matches!(
            result,
            Err(ClientError::RequestTimeout { ref route, .. }) if route == "slow.route"
        ));
        assert!(started.elapsed() < Duration::from_secs(1));

        peer.send_message(Message::response(request.id, "late")).await;

        // The session keeps working after the stray response.
        let next = conn
            .send_request("fast.route", Bytes::new(), Duration::from_secs(2))
            .await
            .unwrap();
        let request = peer.recv_message().await;
        peer.send_message(Message::response(request.id, "ok")).await;
        assert_eq!(next.wait().await.unwrap(), Bytes::from_static(b"ok"));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_route_compression_both_ways() {
        let (conn, mut peer, _listener) =
            connected(fast_config(), &[("chat.send", 5), ("onChat", 6)]).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.routes().on("onChat", move |data| {
            let _ = tx.send(data);
        });

        conn.send_notify("chat.send", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let packet = peer.recv().await;
        assert_eq!(packet.payload[0] & 0x01, 0x01);
        assert_eq!(&packet.payload[1..3], &[0x00, 0x05]);
        let message = Message::decode(&packet.payload, &peer.dictionary).unwrap();
        assert_eq!(message.route, "chat.send");
        assert_eq!(message.message_type, MessageType::Notify);

        peer.send_message(Message::push("onChat", "hi there")).await;
        let pushed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pushed, Bytes::from_static(b"hi there"));
    }

    #[tokio::test]
    async fn test_kick_disconnects_without_reconnect() {
        let config = fast_config().with_reconnect(Duration::from_millis(50));
        let (conn, mut peer, listener) = connected(config, &[]).await;

        let pending = conn
            .send_request("room.stay", Bytes::new(), Duration::from_secs(5))
            .await
            .unwrap();
        peer.recv_message().await;
        peer.send(PacketType::Kick, b"").await;

        assert!(matches!(pending.wait().await, Err(ClientError::Kicked)));
        wait_for_state(&conn, ConnectionState::Disconnected).await;
        tokio::time::timeout(Duration::from_secs(2), conn.stopped())
            .await
            .unwrap();
        assert!(!conn.is_running());

        let again = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
        assert!(again.is_err(), "client reconnected after kick");
        assert!(matches!(
            conn.send_notify("x", Bytes::new()).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_after_server_drop() {
        let config = fast_config().with_reconnect(Duration::from_millis(50));
        let (conn, peer, listener) = connected(config, &[("old.route", 1)]).await;

        let pending = conn
            .send_request("room.a", Bytes::new(), Duration::from_secs(5))
            .await
            .unwrap();
        drop(peer);
        assert!(matches!(
            pending.wait().await,
            Err(ClientError::ConnectionClosed)
        ));

        let mut peer = MockPeer::accept(&listener).await;
        peer.handshake(0, &[("new.route", 1)]).await;
        wait_for_state(&conn, ConnectionState::Working).await;

        assert_eq!(conn.dictionary().code_of("new.route"), Some(1));
        assert_eq!(conn.dictionary().code_of("old.route"), None);

        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaced() {
        let (listener, port) = listener().await;
        drop(listener);

        let conn = Arc::new(Connection::new(fast_config()));
        let err = conn
            .connect("127.0.0.1", port, Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.stopped().await;
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let (listener, port) = listener().await;
        let conn = Arc::new(Connection::new(fast_config()));
        let client = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.connect("127.0.0.1", port, Default::default()).await })
        };

        let mut peer = MockPeer::accept(&listener).await;
        peer.recv().await;
        peer.send(PacketType::Handshake, br#"{"code":500}"#).await;

        let err = client.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::HandshakeRejected(500)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_handshake_requires_handshake_packet() {
        let (listener, port) = listener().await;
        let conn = Arc::new(Connection::new(fast_config()));
        let client = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.connect("127.0.0.1", port, Default::default()).await })
        };

        let mut peer = MockPeer::accept(&listener).await;
        peer.recv().await;
        peer.send(PacketType::Heartbeat, b"").await;

        let err = client.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (listener, port) = listener().await;
        let config = fast_config().with_handshake_timeout(Duration::from_millis(100));
        let conn = Arc::new(Connection::new(config));
        let client = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.connect("127.0.0.1", port, Default::default()).await })
        };

        let _peer = MockPeer::accept(&listener).await;
        let err = client.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_sent_and_answered() {
        let (listener, port) = listener().await;
        let conn = Arc::new(Connection::new(fast_config()));
        let client = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.connect("127.0.0.1", port, Default::default()).await })
        };

        let mut peer = MockPeer::accept(&listener).await;
        peer.handshake(1, &[]).await;
        client.await.unwrap().unwrap();
        assert_eq!(conn.heartbeat_interval(), Some(Duration::from_secs(1)));

        let beat = peer.recv().await;
        assert_eq!(beat.packet_type, PacketType::Heartbeat);
        peer.send(PacketType::Heartbeat, b"").await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conn.quality() <= 0);
        assert_eq!(conn.state(), ConnectionState::Working);
    }

    #[tokio::test]
    async fn test_huge_heartbeat_interval_is_clamped() {
        let (conn, mut peer, _listener) =
            connected_with_heartbeat(fast_config(), u64::MAX, &[]).await;
        assert_eq!(
            conn.heartbeat_interval(),
            Some(Duration::from_secs(pomelo_protocol::MAX_HEARTBEAT_SECS))
        );

        assert_eq!(peer.recv().await.packet_type, PacketType::Heartbeat);
        assert_eq!(conn.state(), ConnectionState::Working);
    }

    #[tokio::test]
    async fn test_silent_server_hits_heartbeat_timeout() {
        let (conn, mut peer, _listener) = connected_with_heartbeat(fast_config(), 1, &[]).await;
        let mut events = conn.subscribe_network_events();
        let pending = conn
            .send_request("room.a", Bytes::new(), Duration::from_secs(30))
            .await
            .unwrap();

        // Read what the client writes, never answer.
        let written = [peer.recv().await.packet_type, peer.recv().await.packet_type];
        assert!(written.contains(&PacketType::Heartbeat));
        assert!(written.contains(&PacketType::Data));

        let event = next_event(
            &mut events,
            ConnectionState::Disconnected,
            Duration::from_secs(6),
        )
        .await;
        assert_eq!(event.reason.as_deref(), Some("heartbeat timeout"));
        assert!(matches!(
            pending.wait().await,
            Err(ClientError::ConnectionClosed)
        ));
        tokio::time::timeout(Duration::from_secs(2), conn.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_message_is_dropped() {
        let (conn, mut peer, _listener) = connected(fast_config(), &[("room.a", 1)]).await;

        // Push with a route code missing from the dictionary.
        peer.send(PacketType::Data, &[0x07, 0x00, 0x63, b'x']).await;
        // Data packet too short to hold a message.
        peer.send(PacketType::Data, &[]).await;

        let pending = conn
            .send_request("room.a", Bytes::new(), Duration::from_secs(2))
            .await
            .unwrap();
        answer_next_request(&mut peer, "ok").await;
        assert_eq!(pending.wait().await.unwrap(), Bytes::from_static(b"ok"));
        assert_eq!(conn.state(), ConnectionState::Working);
    }

    #[tokio::test]
    async fn test_framing_error_closes_and_reconnects() {
        let config = fast_config().with_reconnect(Duration::from_millis(50));
        let (conn, mut peer, listener) = connected(config, &[]).await;
        let mut events = conn.subscribe_network_events();

        peer.stream.write_all(&[0x09, 0x00, 0x00, 0x00]).await.unwrap();
        let event = next_event(
            &mut events,
            ConnectionState::Disconnected,
            Duration::from_secs(2),
        )
        .await;
        assert!(event.reason.unwrap().starts_with("framing error"));

        let mut peer = MockPeer::accept(&listener).await;
        peer.handshake(0, &[]).await;
        wait_for_state(&conn, ConnectionState::Working).await;

        let pending = conn
            .send_request("room.a", Bytes::new(), Duration::from_secs(2))
            .await
            .unwrap();
        answer_next_request(&mut peer, "again").await;
        assert_eq!(pending.wait().await.unwrap(), Bytes::from_static(b"again"));

        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_panicking_push_handler_keeps_session() {
        let (conn, mut peer, _listener) = connected(fast_config(), &[]).await;
        conn.routes().on("boom", |_| panic!("handler failure"));

        peer.send_message(Message::push("boom", "{}")).await;
        let pending = conn
            .send_request("room.a", Bytes::new(), Duration::from_secs(2))
            .await
            .unwrap();
        answer_next_request(&mut peer, "ok").await;

        assert_eq!(pending.wait().await.unwrap(), Bytes::from_static(b"ok"));
        assert_eq!(conn.state(), ConnectionState::Working);
    }

    #[tokio::test]
    async fn test_read_loop_closes_session_when_handler_gone() {
        let (listener, port) = listener().await;
        let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut peer = MockPeer::accept(&listener).await;

        let (reader, _writer) = tokio::io::split(ClientStream::from(tcp));
        let (packets_tx, packets_rx) = mpsc::unbounded_channel();
        drop(packets_rx);
        let session = Arc::new(Session::new(1));
        let reading = tokio::spawn(read_loop(
            reader,
            PacketDecoder::new(),
            packets_tx,
            Arc::clone(&session),
            MIN_READ_BUFFER_SIZE,
        ));

        peer.send(PacketType::Heartbeat, b"").await;
        tokio::time::timeout(Duration::from_secs(2), reading)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.close_reason(), Some(CloseReason::HandlerStopped));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_as_handshake_finishes() {
        let (listener, port) = listener().await;

        for _ in 0..20 {
            let conn = Arc::new(Connection::new(fast_config()));
            let connecting = {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move { conn.connect("127.0.0.1", port, Default::default()).await })
            };

            let (mut stream, _) = listener.accept().await.unwrap();
            let (replied_tx, replied_rx) = oneshot::channel();
            tokio::spawn(async move {
                let mut decoder = PacketDecoder::new();
                if read_packet(&mut stream, &mut decoder, 1024).await.is_err() {
                    return;
                }
                let body = json!({"code": 200, "sys": {"heartbeat": 0, "serializer": "json"}});
                let frame = encode_packet(PacketType::Handshake, body.to_string().as_bytes()).unwrap();
                if stream.write_all(&frame).await.is_err() {
                    return;
                }
                let _ = replied_tx.send(());
                let mut sink = [0u8; 256];
                while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
            });

            let _ = replied_rx.await;
            tokio::time::timeout(Duration::from_secs(5), conn.disconnect())
                .await
                .expect("disconnect never returned");
            assert_eq!(conn.state(), ConnectionState::Disconnected);
            assert!(!conn.is_running());
            let _ = connecting.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (conn, _peer, _listener) = connected(fast_config(), &[]).await;
        let pending = conn
            .send_request("room.a", Bytes::new(), Duration::from_secs(5))
            .await
            .unwrap();

        conn.disconnect().await;
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(
            pending.wait().await,
            Err(ClientError::ConnectionClosed)
        ));
        assert!(matches!(
            conn.send_request("room.a", Bytes::new(), Duration::from_secs(1))
                .await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_is_noop() {
        let conn = Connection::new(fast_config());
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Inited);
    }

    #[tokio::test]
    async fn test_closed_client_refuses_connect() {
        let (conn, _peer, _listener) = connected(fast_config(), &[]).await;
        conn.close().await;
        conn.close().await;
        assert!(conn.is_disposed());

        let err = conn
            .connect("127.0.0.1", 1, Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Disposed));
    }

    #[tokio::test]
    async fn test_second_connect_rejected_while_running() {
        let (conn, _peer, _listener) = connected(fast_config(), &[]).await;
        let err = conn
            .connect("127.0.0.1", 1, Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::AlreadyConnected));
    }

    #[tokio::test]
    async fn test_request_before_connect() {
        let conn = Connection::new(fast_config());
        assert!(matches!(
            conn.send_request("r", Bytes::new(), Duration::from_secs(1))
                .await,
            Err(ClientError::NotConnected)
        ));
    }
}
