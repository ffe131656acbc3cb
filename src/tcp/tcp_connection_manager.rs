use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use async_trait::async_trait;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, trace, warn, Instrument, Span};
use crate::buffers::event_pool::Event;
use crate::config::Parameter;
use crate::connection::general_connection::GeneralConnection;
use crate::connection::physical_connection::PhysicalConnection;
use crate::connection::storage::PersistentConnectionStorage;
use crate::error::{Result, TransportError};
use crate::events::{GenuineEvent, GenuineEventKind};
use crate::host_information::HostInformation;
use crate::manager::context::TransportContext;
use crate::manager::transport::{ConnectionTypes, IncomingStreamHandler, Transport};
use crate::message::Message;
use crate::tcp::framing::{read_frame, write_frame};
use crate::tcp::handshake::Handshake;
use crate::tcp::tcp_config::TcpConfig;
use crate::timer::{TimerConsumer, TimerSubscription};

/// A TCP socket with the bookkeeping of a [PhysicalConnection]. Only the holder of the checkout
///  writes to it; its reader runs in a task of its own.
pub struct TcpPhysicalConnection {
    state: PhysicalConnection,
    outbound: bool,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TcpPhysicalConnection {
    fn new(remote: Arc<HostInformation>, outbound: bool, writer: OwnedWriteHalf) -> TcpPhysicalConnection {
        TcpPhysicalConnection {
            state: PhysicalConnection::new(remote),
            outbound,
            writer: tokio::sync::Mutex::new(writer),
            reader: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &PhysicalConnection {
        &self.state
    }

    /// outbound connections are reestablished when they break, inbound connections are closed
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    async fn write_frame(&self, content: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, content).await
    }

    /// Disposes the connection and stops its reader. The socket is closed when the last
    ///  reference is gone.
    fn close(&self, reason: TransportError) -> bool {
        if !self.state.dispose(reason) {
            return false;
        }
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
        true
    }
}

pub type TcpConnection = GeneralConnection<TcpPhysicalConnection>;

struct AcceptLoop {
    local_addr: SocketAddr,
    shutdown: Event,
    handle: JoinHandle<()>,
}

/// Persistent, reestablishing connections over TCP.
///
/// Connections are stored by (remote URI, connection name), both the ones opened by this side
///  and the accepted ones, so replies travel back over the connection the request came in on.
pub struct TcpConnectionManager {
    myself: Weak<TcpConnectionManager>,
    ctx: Arc<TransportContext>,
    config: TcpConfig,
    connections: PersistentConnectionStorage<TcpConnection>,
    connect_lock: tokio::sync::Mutex<()>,
    handler: RwLock<Option<Arc<dyn IncomingStreamHandler>>>,
    listener: Mutex<Option<AcceptLoop>>,
    sweep_subscription: Mutex<Option<TimerSubscription>>,
}

impl TcpConnectionManager {
    pub const SCHEME: &'static str = "gtcp";
    pub const DEFAULT_CONNECTION_NAME: &'static str = "default";

    /// the time [Transport::stop_listening] waits for the accept loop to terminate
    pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(120);

    pub fn new(ctx: Arc<TransportContext>, config: TcpConfig) -> Arc<TcpConnectionManager> {
        Arc::new_cyclic(|myself| {
            let sweep_subscription = ctx.timer.register(Arc::new(IdleSweeper {
                manager: myself.clone(),
            }));

            TcpConnectionManager {
                myself: myself.clone(),
                ctx,
                config,
                connections: PersistentConnectionStorage::new(),
                connect_lock: Default::default(),
                handler: RwLock::new(None),
                listener: Mutex::new(None),
                sweep_subscription: Mutex::new(Some(sweep_subscription)),
            }
        })
    }

    pub fn connections(&self) -> &PersistentConnectionStorage<TcpConnection> {
        &self.connections
    }

    fn ttl(&self) -> Duration {
        self.ctx.params.duration(Parameter::ClosePersistentConnectionAfterInactivity)
    }

    fn max_frame_len(&self) -> usize {
        // leeway for envelope and encryption overhead
        self.ctx.params.usize(Parameter::MaxContentSize) + 64 * 1024
    }

    fn local_handshake(&self, connection_name: &str) -> Handshake {
        let local_host = &self.ctx.local_host;
        Handshake {
            uri: self.local_uri(),
            host_id: local_host.host_id().unwrap_or_default(),
            unique_id: local_host.remote_unique_id().unwrap_or_default(),
            connection_name: connection_name.to_string(),
        }
    }

    fn connection_type(name: &str) -> ConnectionTypes {
        if name == Self::DEFAULT_CONNECTION_NAME {
            ConnectionTypes::PERSISTENT
        }
        else {
            ConnectionTypes::NAMED
        }
    }

    /// Records the identity a peer reported in its handshake. If the peer restarted, all
    ///  existing connections to it are stale and are released.
    async fn on_peer_identity(&self, remote: &Arc<HostInformation>, handshake: &Handshake) {
        if self.ctx.report_remote_identity(remote, handshake.host_id, handshake.unique_id) {
            let reason = TransportError::ServerRestarted { uri: remote.uri().to_string() };
            self.release_connections(Some(remote.clone()), ConnectionTypes::ALL, reason).await;
        }
    }

    /// opens a socket to the remote host and performs the handshake
    async fn connect(&self, remote: &Arc<HostInformation>, name: &str) -> Result<(Arc<TcpPhysicalConnection>, OwnedReadHalf)> {
        let connect_timeout = self.ctx.params.duration(Parameter::ConnectTimeout);
        let addr = remote.resolve_physical_address().await?;
        debug!("connecting to {} at {:?}", remote.uri(), addr);

        let stream = timeout(connect_timeout, TcpStream::connect(addr)).await
            .map_err(|_| TransportError::ConnectionClosed(format!("connecting to {} timed out", remote.uri())))??;
        stream.set_nodelay(self.config.no_delay)?;
        let (mut read, mut write) = stream.into_split();

        write_frame(&mut write, &self.local_handshake(name).to_bytes()).await?;
        let mut reply = timeout(connect_timeout, read_frame(&mut read, Handshake::MAX_LEN)).await
            .map_err(|_| TransportError::ConnectionClosed(format!("handshake with {} timed out", remote.uri())))??
            .ok_or_else(|| TransportError::ConnectionClosed(format!("{} closed the connection during the handshake", remote.uri())))?;
        let reply = Handshake::try_deser(&mut reply)?;
        if reply.connection_name != name {
            return Err(TransportError::ProtocolDesync(format!("{} acknowledged connection '{}' instead of '{}'", remote.uri(), reply.connection_name, name)));
        }

        self.on_peer_identity(remote, &reply).await;
        Ok((Arc::new(TcpPhysicalConnection::new(remote.clone(), true, write)), read))
    }

    async fn get_or_connect(&self, remote: &Arc<HostInformation>, name: Option<&str>) -> Result<Arc<TcpConnection>> {
        if let Some(connection) = self.live_connection(remote.uri(), name) {
            return Ok(connection);
        }

        let _connect_guard = self.connect_lock.lock().await;
        if let Some(connection) = self.live_connection(remote.uri(), name) {
            return Ok(connection);
        }

        let name = name.unwrap_or(Self::DEFAULT_CONNECTION_NAME);
        let (physical, read) = self.connect(remote, name).await?;
        let connection = Arc::new(GeneralConnection::new(
            name,
            remote.clone(),
            Self::connection_type(name),
            physical.clone(),
            self.ctx.params.usize(Parameter::MaxQueuedItems),
            self.ttl(),
        ));
        self.connections.insert(remote.uri(), name, connection.clone());
        self.spawn_reader(&connection, &physical, read);

        info!("connected to {} as '{}'", remote.uri(), name);
        self.ctx.events.fire(GenuineEvent::new(GenuineEventKind::ConnectionEstablished, Some(remote.clone()))
            .with_additional_info(name));
        Ok(connection)
    }

    fn live_connection(&self, uri: &str, name: Option<&str>) -> Option<Arc<TcpConnection>> {
        self.connections.get(uri, name)
            .filter(|c| !c.physical().state().is_disposed())
    }

    fn spawn_reader(&self, connection: &Arc<TcpConnection>, physical: &Arc<TcpPhysicalConnection>, read: OwnedReadHalf) {
        let handle = tokio::spawn(read_loop(
            self.myself.clone(),
            connection.clone(),
            physical.clone(),
            read,
            self.max_frame_len(),
        ).instrument(Span::current()));
        *physical.reader.lock().unwrap() = Some(handle);
    }

    fn on_frame(&self, connection: &TcpConnection, content: bytes::Bytes) {
        connection.renew(self.ttl());
        let handler = self.handler.read().unwrap().clone();
        match handler {
            Some(handler) => handler.on_stream(connection.remote().clone(), content),
            None => debug!("not listening - dropping frame from {}", connection.remote().uri()),
        }
    }

    /// Writes queued frames while holding the physical connection's checkout. Whoever finds the
    ///  connection available drains the queue, so frames leave in queue order.
    async fn drain(&self, connection: &Arc<TcpConnection>) -> Result<()> {
        loop {
            let physical = connection.physical();
            if physical.state().is_reestablishing() || !physical.state().acquire_if_available() {
                return Ok(());
            }

            let result = Self::write_queued(connection, &physical).await;
            physical.state().release();
            if let Err(e) = result {
                self.on_connection_broken(connection.clone(), physical, e.clone());
                return Err(e);
            }

            // a frame may have been queued after the last pop, but before the release
            if connection.queue().is_empty() {
                return Ok(());
            }
        }
    }

    async fn write_queued(connection: &TcpConnection, physical: &TcpPhysicalConnection) -> Result<()> {
        while let Some(frame) = connection.queue().pop() {
            if let Err(e) = physical.write_frame(&frame).await {
                connection.queue().push_front(frame);
                return Err(e);
            }
            trace!("wrote frame of {} bytes to {}", frame.len(), connection.remote().uri());
        }
        Ok(())
    }

    fn on_connection_broken(&self, connection: Arc<TcpConnection>, physical: Arc<TcpPhysicalConnection>, error: TransportError) {
        if physical.state().is_disposed() {
            return;
        }

        if !physical.is_outbound() {
            debug!("inbound connection from {} broke: {}", connection.remote().uri(), error);
            self.close_connection(&connection, error);
            return;
        }

        if !physical.state().begin_reestablishing() {
            return;
        }
        warn!("connection to {} broke, reestablishing: {}", connection.remote().uri(), error);
        self.ctx.events.fire(GenuineEvent::new(GenuineEventKind::ConnectionReestablishing, Some(connection.remote().clone()))
            .with_error(error));

        let myself = self.myself.clone();
        tokio::spawn(async move {
            if let Some(manager) = myself.upgrade() {
                manager.reestablish(connection, physical).await;
            }
        }.instrument(Span::current()));
    }

    async fn reestablish(&self, connection: Arc<TcpConnection>, broken: Arc<TcpPhysicalConnection>) {
        let uri = connection.remote().uri().to_string();
        let tries = self.ctx.params.usize(Parameter::ReconnectionTries);
        let pause = self.ctx.params.duration(Parameter::SleepBetweenReconnections);

        for attempt in 1..=tries {
            sleep(pause).await;
            if broken.state().is_disposed() {
                debug!("connection to {} was closed while reestablishing", uri);
                return;
            }

            match self.connect(connection.remote(), connection.name()).await {
                Ok((physical, read)) => {
                    if !self.is_stored(&connection) {
                        // released during the handshake, e.g. because the peer restarted
                        physical.close(TransportError::ConnectionShutDown(format!("connection to {} was released", uri)));
                        broken.close(TransportError::ConnectionShutDown(format!("connection to {} was released", uri)));
                        return;
                    }

                    let previous = connection.replace_physical(physical.clone());
                    previous.close(TransportError::ConnectionClosed(format!("connection to {} was replaced", uri)));
                    self.spawn_reader(&connection, &physical, read);

                    info!("reestablished connection to {} after {} attempt(s)", uri, attempt);
                    self.ctx.events.fire(GenuineEvent::new(GenuineEventKind::ConnectionReestablished, Some(connection.remote().clone())));
                    if let Err(e) = self.drain(&connection).await {
                        debug!("sending queued frames to {} failed: {}", uri, e);
                    }
                    return;
                }
                Err(e) => debug!("attempt {} of {} to reconnect to {} failed: {}", attempt, tries, uri, e),
            }
        }

        warn!("could not reconnect to {} after {} attempts", uri, tries);
        broken.state().end_reestablishing();
        self.close_connection(&connection, TransportError::ClientDidNotReconnectWithinTimeout { uri });
    }

    fn is_stored(&self, connection: &Arc<TcpConnection>) -> bool {
        self.connections.get(connection.remote().uri(), Some(connection.name()))
            .map(|c| Arc::ptr_eq(&c, connection))
            .unwrap_or(false)
    }

    /// Removes the connection and disposes its physical connection. Queued frames are dropped,
    ///  and requests waiting for a reply from the remote host fail with `reason`.
    fn close_connection(&self, connection: &Arc<TcpConnection>, reason: TransportError) -> bool {
        self.connections.remove_if_same(connection.remote().uri(), connection.name(), connection);
        if !connection.physical().close(reason.clone()) {
            return false;
        }

        let num_dropped = connection.queue().clear();
        if num_dropped > 0 {
            debug!("dropped {} queued frames for {}", num_dropped, connection.remote().uri());
        }
        self.ctx.responses.fail_host(connection.remote().uri(), &reason);
        self.ctx.events.fire(GenuineEvent::new(GenuineEventKind::ConnectionClosed, Some(connection.remote().clone()))
            .with_error(reason)
            .with_additional_info(connection.name()));
        true
    }

    /// closes connections that had no traffic for longer than their time to live
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let mut num_closed = 0;
        for (uri, name, connection) in self.connections.all() {
            if connection.is_expired(now) && connection.queue().is_empty() {
                debug!("closing idle connection '{}' to {}", name, uri);
                if self.close_connection(&connection, TransportError::ConnectionClosedAfterTimeout { uri }) {
                    num_closed += 1;
                }
            }
        }
        num_closed
    }

    async fn accept_loop(myself: Weak<TcpConnectionManager>, listener: TcpListener, shutdown: Event) {
        info!("accepting connections on {:?}", listener.local_addr());
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                r = listener.accept() => r,
            };

            let (stream, addr) = match accepted {
                Ok(x) => x,
                Err(e) => {
                    error!("error accepting connection: {}", e);
                    continue;
                }
            };

            let Some(manager) = myself.upgrade() else {
                break;
            };
            tokio::spawn(async move {
                if let Err(e) = manager.handle_accepted(addr, stream).await {
                    warn!("connection from {} failed: {}", addr, e);
                }
            });
        }
        info!("accept loop stopped");
    }

    #[instrument(name="accepted_connection", skip(self, stream))]
    async fn handle_accepted(&self, addr: SocketAddr, stream: TcpStream) -> Result<()> {
        debug!("received connection request");
        stream.set_nodelay(self.config.no_delay)?;
        let (mut read, mut write) = stream.into_split();

        let mut handshake = timeout(self.ctx.params.duration(Parameter::ConnectTimeout), read_frame(&mut read, Handshake::MAX_LEN)).await
            .map_err(|_| TransportError::ConnectionClosed(format!("handshake from {:?} timed out", addr)))??
            .ok_or_else(|| TransportError::ConnectionClosed(format!("{:?} closed the connection during the handshake", addr)))?;
        let handshake = Handshake::try_deser(&mut handshake)?;

        let remote = self.ctx.hosts.get_or_create(&handshake.uri);
        self.on_peer_identity(&remote, &handshake).await;
        write_frame(&mut write, &self.local_handshake(&handshake.connection_name).to_bytes()).await?;
        debug!("initial handshake with {} complete", remote.uri());

        let physical = Arc::new(TcpPhysicalConnection::new(remote.clone(), false, write));
        let name = handshake.connection_name.as_str();
        let connection = Arc::new(GeneralConnection::new(
            name,
            remote.clone(),
            Self::connection_type(name),
            physical.clone(),
            self.ctx.params.usize(Parameter::MaxQueuedItems),
            self.ttl(),
        ));

        // the newest connection wins: the peer may have reconnected before this side noticed
        //  that the old connection broke
        let previous = self.connections.insert(remote.uri(), name, connection.clone());
        self.spawn_reader(&connection, &physical, read);
        self.ctx.events.fire(GenuineEvent::new(GenuineEventKind::ConnectionEstablished, Some(remote))
            .with_additional_info(name));

        if let Some(previous) = previous {
            self.replace_connection(&previous, &connection);
            if !connection.queue().is_empty() {
                self.drain(&connection).await?;
            }
        }
        Ok(())
    }

    /// Closes a connection that was superseded by a newer one to the same peer, handing its
    ///  queued frames over to the newer connection.
    fn replace_connection(&self, previous: &Arc<TcpConnection>, replacement: &Arc<TcpConnection>) {
        while let Some(frame) = previous.queue().pop() {
            if let Err(e) = replacement.queue().push(frame) {
                debug!("dropping frame for {}: {}", replacement.remote().uri(), e);
            }
        }

        let uri = previous.remote().uri();
        let reason = TransportError::ConnectionClosed(format!("connection '{}' to {} was replaced", previous.name(), uri));
        if previous.physical().close(reason.clone()) {
            debug!("closed connection '{}' to {}, it was replaced", previous.name(), uri);
            self.ctx.events.fire(GenuineEvent::new(GenuineEventKind::ConnectionClosed, Some(previous.remote().clone()))
                .with_error(reason)
                .with_additional_info(previous.name()));
        }
    }
}

async fn read_loop(
    manager: Weak<TcpConnectionManager>,
    connection: Arc<TcpConnection>,
    physical: Arc<TcpPhysicalConnection>,
    mut read: OwnedReadHalf,
    max_frame_len: usize,
) {
    let error = loop {
        match read_frame(&mut read, max_frame_len).await {
            Ok(Some(frame)) => {
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                manager.on_frame(&connection, frame);
            }
            Ok(None) => break TransportError::ConnectionClosed(format!("{} closed the connection", connection.remote().uri())),
            Err(e) => break e,
        }
    };

    if let Some(manager) = manager.upgrade() {
        manager.on_connection_broken(connection, physical, error);
    }
}

#[async_trait]
impl Transport for TcpConnectionManager {
    fn local_uri(&self) -> String {
        match self.listener.lock().unwrap().as_ref() {
            Some(listener) => format!("{}://{}", Self::SCHEME, listener.local_addr),
            None => format!("_{}_{}", Self::SCHEME, self.ctx.local_host.host_id().unwrap_or_default()),
        }
    }

    async fn internal_send(&self, message: &Message) -> Result<usize> {
        let serialized = message.serialized()
            .ok_or_else(|| TransportError::Logic(format!("message {} was not serialized", message.id())))?;
        if serialized.len() > self.max_frame_len() {
            return Err(TransportError::Logic(format!("message {} of {} bytes exceeds the maximum frame length", message.id(), serialized.len())));
        }

        let connection = self.get_or_connect(message.recipient(), message.connection_name()).await?;
        connection.renew(self.ttl());
        connection.queue().push(serialized.clone())?;

        let outbound = connection.physical().is_outbound();
        match self.drain(&connection).await {
            Ok(()) => Ok(serialized.len() + 4),
            // the frame stays queued until the connection is reestablished
            Err(e) if outbound => {
                debug!("message {} is queued while the connection to {} is reestablished: {}", message.id(), message.recipient().uri(), e);
                Ok(serialized.len() + 4)
            }
            Err(e) => Err(e),
        }
    }

    async fn start_listening(&self, handler: Arc<dyn IncomingStreamHandler>) -> Result<()> {
        let Some(listen_addr) = self.config.listen_addr else {
            *self.handler.write().unwrap() = Some(handler);
            return Ok(());
        };
        if self.listener.lock().unwrap().is_some() {
            return Err(TransportError::Logic(format!("{} is already listening", self.local_uri())));
        }

        let listener = TcpListener::bind(listen_addr).await
            .map_err(|e| TransportError::Configuration(format!("cannot listen on {}: {}", listen_addr, e)))?;
        let local_addr = listener.local_addr()?;
        *self.handler.write().unwrap() = Some(handler);

        let shutdown = Event::new();
        let handle = tokio::spawn(Self::accept_loop(self.myself.clone(), listener, shutdown.clone()));
        *self.listener.lock().unwrap() = Some(AcceptLoop {
            local_addr,
            shutdown,
            handle,
        });
        Ok(())
    }

    async fn stop_listening(&self) -> Result<()> {
        *self.handler.write().unwrap() = None;
        let listener = self.listener.lock().unwrap().take();
        let Some(AcceptLoop { shutdown, handle, .. }) = listener else {
            return Ok(());
        };

        shutdown.set();
        if timeout(Self::STOP_GRACE_PERIOD, handle).await.is_err() {
            error!("TCP accept loop did not terminate within {:?}", Self::STOP_GRACE_PERIOD);
            return Err(TransportError::Logic(format!("TCP accept loop did not terminate within {:?}", Self::STOP_GRACE_PERIOD)));
        }
        info!("stopped listening");
        Ok(())
    }

    async fn release_connections(&self, host: Option<Arc<HostInformation>>, types: ConnectionTypes, reason: TransportError) -> usize {
        let mut num_released = 0;
        for (uri, _, connection) in self.connections.all() {
            if let Some(host) = &host {
                if host.uri() != uri {
                    continue;
                }
            }
            if !types.intersects(connection.connection_type()) {
                continue;
            }
            if self.close_connection(&connection, reason.clone()) {
                num_released += 1;
            }
        }
        debug!("released {} connections: {}", num_released, reason);
        num_released
    }

    async fn internal_dispose(&self, reason: TransportError) {
        self.sweep_subscription.lock().unwrap().take();
        self.release_connections(None, ConnectionTypes::ALL, reason).await;
    }
}


struct IdleSweeper {
    manager: Weak<TcpConnectionManager>,
}

impl TimerConsumer for IdleSweeper {
    fn on_timer(&self, now: Instant) {
        if let Some(manager) = self.manager.upgrade() {
            manager.sweep_idle(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc;
    use uuid::Uuid;
    use crate::config::{DefaultParameterProvider, ParameterValue};
    use crate::manager::transport::MockIncomingStreamHandler;

    fn ctx() -> Arc<TransportContext> {
        let params = DefaultParameterProvider::new()
            .with(Parameter::ReconnectionTries, ParameterValue::Usize(3))
            .with(Parameter::SleepBetweenReconnections, ParameterValue::Duration(Duration::from_millis(10)))
            .with(Parameter::MaxQueuedItems, ParameterValue::Usize(2));
        TransportContext::new(Arc::new(params), Default::default())
    }

    fn channel_handler() -> (Arc<MockIncomingStreamHandler>, mpsc::UnboundedReceiver<(Arc<HostInformation>, Bytes)>) {
        let (send, recv) = mpsc::unbounded_channel();
        let mut handler = MockIncomingStreamHandler::new();
        handler.expect_on_stream()
            .returning(move |host, content| send.send((host, content)).unwrap());
        (Arc::new(handler), recv)
    }

    fn serialized_message(ctx: &TransportContext, to: &str, content: &'static [u8]) -> Message {
        let mut msg = Message::new(ctx.hosts.get_or_create(to), "svc", Bytes::new());
        msg.set_serialized(Bytes::from_static(content));
        msg
    }

    async fn server() -> (Arc<TcpConnectionManager>, mpsc::UnboundedReceiver<(Arc<HostInformation>, Bytes)>) {
        let manager = TcpConnectionManager::new(ctx(), TcpConfig::listening_on("127.0.0.1:0".parse().unwrap()));
        let (handler, recv) = channel_handler();
        manager.start_listening(handler).await.unwrap();
        (manager, recv)
    }

    #[tokio::test]
    async fn test_request_and_reply_over_one_connection() {
        let (server, mut server_streams) = server().await;

        let client_ctx = ctx();
        let client = TcpConnectionManager::new(client_ctx.clone(), TcpConfig::client());
        let (handler, mut client_streams) = channel_handler();
        client.start_listening(handler).await.unwrap();
        assert!(client.local_uri().starts_with("_gtcp_"));

        let mut events = client_ctx.events.subscribe();
        client.internal_send(&serialized_message(&client_ctx, &server.local_uri(), b"request")).await.unwrap();
        assert_eq!(events.recv().await.unwrap().kind, GenuineEventKind::ConnectionEstablished);

        let (client_host, content) = server_streams.recv().await.unwrap();
        assert_eq!(content.as_ref(), b"request");
        assert_eq!(client_host.uri(), client.local_uri());
        assert_eq!(client_host.host_id(), client_ctx.local_host.host_id());

        // the reply goes back over the accepted connection
        let mut reply = Message::new(client_host.clone(), "svc", Bytes::new());
        reply.set_serialized(Bytes::from_static(b"reply"));
        server.internal_send(&reply).await.unwrap();

        let (server_host, content) = client_streams.recv().await.unwrap();
        assert_eq!(content.as_ref(), b"reply");
        assert_eq!(server_host.uri(), server.local_uri());

        assert_eq!(client.connections().len(), 1);
        assert_eq!(server.connections().len(), 1);
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (server, mut server_streams) = server().await;
        let client_ctx = ctx();
        let client = TcpConnectionManager::new(client_ctx.clone(), TcpConfig::client());

        let payloads: [&'static [u8]; 5] = [b"1", b"2", b"3", b"4", b"5"];
        for p in payloads {
            client.internal_send(&serialized_message(&client_ctx, &server.local_uri(), p)).await.unwrap();
        }
        for p in payloads {
            assert_eq!(server_streams.recv().await.unwrap().1.as_ref(), p);
        }
    }

    #[tokio::test]
    async fn test_named_connections() {
        let (server, mut server_streams) = server().await;
        let client_ctx = ctx();
        let client = TcpConnectionManager::new(client_ctx.clone(), TcpConfig::client());

        client.internal_send(&serialized_message(&client_ctx, &server.local_uri(), b"a")).await.unwrap();
        client.internal_send(&serialized_message(&client_ctx, &server.local_uri(), b"b").with_connection_name("bulk")).await.unwrap();
        server_streams.recv().await.unwrap();
        server_streams.recv().await.unwrap();

        assert_eq!(client.connections().len(), 2);
        let released = client.release_connections(None, ConnectionTypes::NAMED, TransportError::ConnectionShutDown("test".to_string())).await;
        assert_eq!(released, 1);
        assert!(client.connections().get(&server.local_uri(), Some("bulk")).is_none());
        assert!(client.connections().get(&server.local_uri(), None).is_some());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let client_ctx = ctx();
        let client = TcpConnectionManager::new(client_ctx.clone(), TcpConfig::client());

        // bind and drop to get a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let to = format!("gtcp://127.0.0.1:{}", port);
        assert!(client.internal_send(&serialized_message(&client_ctx, &to, b"x")).await.is_err());
        assert!(client.connections().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_after_server_closed_connection() {
        let (server, mut server_streams) = server().await;
        let client_ctx = ctx();
        let client = TcpConnectionManager::new(client_ctx.clone(), TcpConfig::client());
        let mut events = client_ctx.events.subscribe();

        client.internal_send(&serialized_message(&client_ctx, &server.local_uri(), b"first")).await.unwrap();
        server_streams.recv().await.unwrap();
        let original = client.connections().get(&server.local_uri(), None).unwrap().physical().state().id();

        let released = server.release_connections(None, ConnectionTypes::ALL, TransportError::ConnectionShutDown("test".to_string())).await;
        assert_eq!(released, 1);

        let mut kinds = Vec::new();
        while kinds.last() != Some(&GenuineEventKind::ConnectionReestablished) {
            kinds.push(events.recv().await.unwrap().kind);
        }
        assert!(kinds.contains(&GenuineEventKind::ConnectionReestablishing));

        client.internal_send(&serialized_message(&client_ctx, &server.local_uri(), b"second")).await.unwrap();
        assert_eq!(server_streams.recv().await.unwrap().1.as_ref(), b"second");
        assert_ne!(client.connections().get(&server.local_uri(), None).unwrap().physical().state().id(), original);
    }

    #[tokio::test]
    async fn test_gives_up_reconnecting() {
        let (server, mut server_streams) = server().await;
        let client_ctx = ctx();
        let client = TcpConnectionManager::new(client_ctx.clone(), TcpConfig::client());
        let mut events = client_ctx.events.subscribe();
        let uri = server.local_uri();

        client.internal_send(&serialized_message(&client_ctx, &uri, b"first")).await.unwrap();
        server_streams.recv().await.unwrap();

        server.stop_listening().await.unwrap();
        server.release_connections(None, ConnectionTypes::ALL, TransportError::ConnectionShutDown("test".to_string())).await;

        loop {
            let event = events.recv().await.unwrap();
            if event.kind == GenuineEventKind::ConnectionClosed {
                assert!(matches!(event.error, Some(TransportError::ClientDidNotReconnectWithinTimeout { .. })));
                break;
            }
        }
        assert!(client.connections().is_empty());
    }

    #[tokio::test]
    async fn test_idle_sweep() {
        let (server, mut server_streams) = server().await;
        let client_ctx = ctx();
        let client = TcpConnectionManager::new(client_ctx.clone(), TcpConfig::client());

        client.internal_send(&serialized_message(&client_ctx, &server.local_uri(), b"x")).await.unwrap();
        server_streams.recv().await.unwrap();

        assert_eq!(client.sweep_idle(Instant::now()), 0);
        let later = Instant::now() + client.ttl() + Duration::from_secs(1);
        assert_eq!(client.sweep_idle(later), 1);
        assert!(client.connections().is_empty());
    }

    #[tokio::test]
    async fn test_restarted_peer_releases_connections() {
        let ctx = ctx();
        let manager = TcpConnectionManager::new(ctx.clone(), TcpConfig::client());
        let host = ctx.hosts.get_or_create("gtcp://127.0.0.1:1");
        let mut events = ctx.events.subscribe();

        let handshake = |host_id| Handshake {
            uri: host.uri().to_string(),
            host_id,
            unique_id: 1,
            connection_name: TcpConnectionManager::DEFAULT_CONNECTION_NAME.to_string(),
        };
        manager.on_peer_identity(&host, &handshake(Uuid::new_v4())).await;
        manager.on_peer_identity(&host, &handshake(Uuid::new_v4())).await;

        assert_eq!(events.recv().await.unwrap().kind, GenuineEventKind::ServerRestartDetected);
    }

    /// connects to `to` the way a peer with the given identity would, and completes the handshake
    async fn raw_peer(to: &str, host_id: Uuid) -> TcpStream {
        let mut stream = TcpStream::connect(to.trim_start_matches("gtcp://")).await.unwrap();
        let handshake = Handshake {
            uri: "gtcp://127.0.0.1:1".to_string(),
            host_id,
            unique_id: 7,
            connection_name: TcpConnectionManager::DEFAULT_CONNECTION_NAME.to_string(),
        };
        write_frame(&mut stream, &handshake.to_bytes()).await.unwrap();
        read_frame(&mut stream, Handshake::MAX_LEN).await.unwrap().unwrap();
        stream
    }

    async fn assert_closed_by_peer(stream: &mut TcpStream) {
        let closed = timeout(Duration::from_secs(5), read_frame(stream, 1024)).await.unwrap();
        assert!(matches!(closed, Ok(None)));
    }

    #[tokio::test]
    async fn test_newer_inbound_connection_replaces_older() {
        let (server, _server_streams) = server().await;
        let host_id = Uuid::new_v4();

        let mut first = raw_peer(&server.local_uri(), host_id).await;
        let mut second = raw_peer(&server.local_uri(), host_id).await;

        assert_closed_by_peer(&mut first).await;
        assert_eq!(server.connections().len(), 1);

        let released = server.release_connections(None, ConnectionTypes::ALL, TransportError::ConnectionShutDown("test".to_string())).await;
        assert_eq!(released, 1);
        assert!(server.connections().is_empty());
        assert_closed_by_peer(&mut second).await;
    }

    #[tokio::test]
    async fn test_unserialized_message_is_rejected() {
        let ctx = ctx();
        let manager = TcpConnectionManager::new(ctx.clone(), TcpConfig::client());
        let msg = Message::new(ctx.hosts.get_or_create("gtcp://127.0.0.1:1"), "svc", Bytes::new());
        assert!(matches!(manager.internal_send(&msg).await, Err(TransportError::Logic(_))));
    }

    #[tokio::test]
    async fn test_listen_failure_is_configuration_error() {
        let manager = TcpConnectionManager::new(ctx(), TcpConfig::listening_on("192.0.2.1:0".parse().unwrap()));
        assert!(matches!(manager.start_listening(channel_handler().0).await, Err(TransportError::Configuration(_))));
    }
}
