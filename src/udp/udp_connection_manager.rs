use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::event_pool::Event;
use crate::config::Parameter;
use crate::error::{Result, TransportError};
use crate::events::{GenuineEvent, GenuineEventKind};
use crate::host_information::HostInformation;
use crate::manager::context::TransportContext;
use crate::manager::transport::{ConnectionTypes, IncomingStreamHandler, Transport};
use crate::message::Message;
use crate::timer::TimerSubscription;
use crate::udp::stream_assembled::{Chunk, StreamTable};
use crate::udp::udp_config::UdpConfig;
use crate::udp::udp_header::{CompatibilityPrefix, UdpHeader};

struct ReceiveLoop {
    shutdown: Event,
    handle: JoinHandle<()>,
}

/// Sends each serialized message as a stream of datagrams and reassembles inbound streams.
///
/// UDP is connectionless: there are no physical connections to manage, and a remote host is
///  identified by its socket address - or, in compatibility mode, by the host id it sends at
///  the start of every stream.
pub struct UdpConnectionManager {
    ctx: Arc<TransportContext>,
    config: UdpConfig,
    compatibility_mode: bool,
    chunk_payload_len: usize,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    receive_pool: Arc<BufferPool>,
    streams: Arc<StreamTable>,
    /// serializes sends so that a stream's datagrams are never interleaved with another's
    send_buffer: tokio::sync::Mutex<Vec<u8>>,
    receiver: Mutex<Option<ReceiveLoop>>,
    sweep_subscription: Mutex<Option<TimerSubscription>>,
}

impl UdpConnectionManager {
    pub const SCHEME: &'static str = "gudp";

    /// messages to this URI go to the configured multicast target
    pub const MULTICAST_URI: &'static str = "gudp://multicast";

    /// the time [Transport::stop_listening] waits for the receive loop to terminate
    pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(120);

    pub fn new(ctx: Arc<TransportContext>, config: UdpConfig) -> Result<Arc<UdpConnectionManager>> {
        config.validate()
            .map_err(|e| TransportError::Configuration(e.to_string()))?;

        let mtu = ctx.params.usize(Parameter::UdpMtu);
        if mtu <= UdpHeader::SERIALIZED_LEN {
            return Err(TransportError::Configuration(format!("UDP MTU of {} bytes does not leave room for payload", mtu)));
        }
        let chunk_payload_len = mtu - UdpHeader::SERIALIZED_LEN;

        // a datagram longer than the receive buffer is truncated without notice
        let receive_buffer_size = ctx.params.usize(Parameter::UdpReceiveBufferSize);
        if receive_buffer_size < mtu {
            return Err(TransportError::Configuration(format!("UDP receive buffer of {} bytes cannot hold a datagram of {} bytes", receive_buffer_size, mtu)));
        }

        let receive_pool = Arc::new(BufferPool::new(
            receive_buffer_size,
            ctx.params.usize(Parameter::BufferPoolSize),
        ));
        // leeway for envelope, encryption overhead and compatibility prefix
        let max_chunks_per_stream = ctx.params.usize(Parameter::MaxContentSize) / chunk_payload_len + 2;
        let streams = Arc::new(StreamTable::new(
            receive_pool.clone(),
            ctx.params.duration(Parameter::UdpAssemblyTimeout),
            max_chunks_per_stream,
        ));
        let sweep_subscription = ctx.timer.register(streams.clone());

        Ok(Arc::new(UdpConnectionManager {
            compatibility_mode: ctx.params.bool(Parameter::CompatibilityMode),
            ctx,
            config,
            chunk_payload_len,
            socket: Mutex::new(None),
            receive_pool,
            streams,
            send_buffer: tokio::sync::Mutex::new(Vec::with_capacity(mtu)),
            receiver: Mutex::new(None),
            sweep_subscription: Mutex::new(Some(sweep_subscription)),
        }))
    }

    pub fn streams(&self) -> &StreamTable {
        &self.streams
    }

    pub fn is_listening(&self) -> bool {
        self.receiver.lock().unwrap().is_some()
    }

    /// the socket is bound on first use, by sending or by listening
    fn socket(&self) -> Result<Arc<UdpSocket>> {
        let mut socket = self.socket.lock().unwrap();
        if let Some(socket) = socket.as_ref() {
            return Ok(socket.clone());
        }

        let std_socket = self.config.create_socket()
            .map_err(|e| TransportError::Configuration(format!("cannot bind UDP socket to {}: {}", self.config.bind_addr, e)))?;
        let bound = Arc::new(UdpSocket::from_std(std_socket)?);
        *socket = Some(bound.clone());
        Ok(bound)
    }

    async fn resolve_target(&self, recipient: &HostInformation) -> Result<SocketAddr> {
        if recipient.uri() == Self::MULTICAST_URI {
            return self.config.multicast_target
                .ok_or_else(|| TransportError::Configuration("no multicast target is configured".to_string()));
        }
        recipient.resolve_physical_address().await
    }

    fn compatibility_prefix(&self) -> CompatibilityPrefix {
        let local_host = &self.ctx.local_host;
        CompatibilityPrefix::new(
            local_host.host_id().unwrap_or_default(),
            local_host.remote_unique_id().unwrap_or_default(),
        )
    }
}

#[async_trait]
impl Transport for UdpConnectionManager {
    fn local_uri(&self) -> String {
        let addr = self.socket.lock().unwrap()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .unwrap_or(self.config.bind_addr);
        format!("{}://{}", Self::SCHEME, addr)
    }

    async fn internal_send(&self, message: &Message) -> Result<usize> {
        let serialized = message.serialized()
            .ok_or_else(|| TransportError::Logic(format!("message {} was not serialized", message.id())))?;

        let content = if self.compatibility_mode {
            let mut buf = BytesMut::with_capacity(CompatibilityPrefix::MIN_SERIALIZED_LEN + serialized.len());
            self.compatibility_prefix().ser(&mut buf);
            buf.extend_from_slice(serialized);
            buf.freeze()
        }
        else {
            serialized.clone()
        };

        let to = self.resolve_target(message.recipient()).await?;
        let socket = self.socket()?;

        let stream_id = Uuid::new_v4();
        let num_chunks = UdpHeader::num_chunks(content.len(), self.chunk_payload_len)?;
        trace!("sending message {} to {:?} as stream {} with {} chunks", message.id(), to, stream_id, num_chunks);

        let mut send_buffer = self.send_buffer.lock().await;
        let mut num_sent = 0;
        for index in 0..num_chunks {
            let start = index * self.chunk_payload_len;
            let end = (start + self.chunk_payload_len).min(content.len());

            send_buffer.clear();
            UdpHeader::new(stream_id, index, index + 1 == num_chunks)?
                .ser(&mut *send_buffer);
            send_buffer.extend_from_slice(&content[start..end]);

            num_sent += socket.send_to(&send_buffer, to).await?;
        }
        Ok(num_sent)
    }

    async fn start_listening(&self, handler: Arc<dyn IncomingStreamHandler>) -> Result<()> {
        let mut receiver = self.receiver.lock().unwrap();
        if receiver.is_some() {
            return Err(TransportError::Logic(format!("{} is already listening", self.local_uri())));
        }

        let socket = self.socket()?;
        let shutdown = Event::new();
        let receive_context = ReceiveContext {
            ctx: self.ctx.clone(),
            streams: self.streams.clone(),
            pool: self.receive_pool.clone(),
            compatibility_mode: self.compatibility_mode,
            compatibility_senders: Default::default(),
            handler,
        };
        let handle = tokio::spawn(receive_context.recv_loop(socket, shutdown.clone()));

        *receiver = Some(ReceiveLoop {
            shutdown,
            handle,
        });
        Ok(())
    }

    async fn stop_listening(&self) -> Result<()> {
        let receiver = self.receiver.lock().unwrap().take();
        let Some(ReceiveLoop { shutdown, handle }) = receiver else {
            return Ok(());
        };

        shutdown.set();
        if tokio::time::timeout(Self::STOP_GRACE_PERIOD, handle).await.is_err() {
            error!("UDP receive loop did not terminate within {:?}", Self::STOP_GRACE_PERIOD);
            return Err(TransportError::Logic(format!("UDP receive loop did not terminate within {:?}", Self::STOP_GRACE_PERIOD)));
        }

        *self.socket.lock().unwrap() = None;
        self.streams.clear();
        info!("stopped listening");
        Ok(())
    }

    async fn release_connections(&self, _host: Option<Arc<HostInformation>>, _types: ConnectionTypes, _reason: TransportError) -> usize {
        0
    }

    async fn internal_dispose(&self, reason: TransportError) {
        debug!("disposing UDP transport: {}", reason);
        self.sweep_subscription.lock().unwrap().take();
        self.streams.clear();
        *self.socket.lock().unwrap() = None;
    }
}


/// everything the receive loop needs, detached from the manager so the loop does not keep it alive
struct ReceiveContext {
    ctx: Arc<TransportContext>,
    streams: Arc<StreamTable>,
    pool: Arc<BufferPool>,
    compatibility_mode: bool,
    /// in compatibility mode, the hosts that completed a stream from a given address
    compatibility_senders: Mutex<FxHashMap<SocketAddr, Weak<HostInformation>>>,
    handler: Arc<dyn IncomingStreamHandler>,
}

impl ReceiveContext {
    async fn recv_loop(self, socket: Arc<UdpSocket>, shutdown: Event) {
        info!("starting receive loop on {:?}", socket.local_addr());

        loop {
            let mut buf = self.pool.obtain();
            let received = tokio::select! {
                biased;
                _ = shutdown.wait() => None,
                r = socket.recv_from(&mut buf) => Some(r),
            };
            let Some(received) = received else {
                self.pool.recycle(buf);
                break;
            };

            let (num_read, from) = match received {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    self.pool.recycle(buf);
                    self.ctx.events.fire(GenuineEvent::new(GenuineEventKind::SocketException, None)
                        .with_error(e.into()));
                    continue;
                }
            };

            let span = span!(Level::TRACE, "datagram_received", ?from);
            span.in_scope(|| self.on_datagram(from, buf, num_read));
        }

        info!("receive loop stopped");
    }

    fn on_datagram(&self, from: SocketAddr, buf: Vec<u8>, num_read: usize) {
        let header = match UdpHeader::try_deser(&mut &buf[..num_read]) {
            Ok(header) => header,
            Err(e) => {
                warn!("dropping datagram from {:?}: {}", from, e);
                self.pool.recycle(buf);
                return;
            }
        };

        self.renew_sender(from);

        let chunk = Chunk::new(buf, UdpHeader::SERIALIZED_LEN, num_read - UdpHeader::SERIALIZED_LEN);
        let Some(content) = self.streams.on_chunk(from, &header, chunk, Instant::now()) else {
            return;
        };
        trace!("stream {} from {:?} is complete with {} bytes", header.stream_id, from, content.len());

        match self.sender_host(from, content) {
            Ok((host, content)) => {
                host.renew(self.ctx.hosts.renewing_span());
                self.handler.on_stream(host, content);
            }
            Err(e) => warn!("dropping stream {} from {:?}: {}", header.stream_id, from, e),
        }
    }

    /// Every well-formed datagram counts as activity of its sender, so a slow stream does not
    ///  let the host expire before it is complete. In compatibility mode a sender is only known
    ///  after its first complete stream.
    fn renew_sender(&self, from: SocketAddr) {
        let host = if self.compatibility_mode {
            let mut senders = self.compatibility_senders.lock().unwrap();
            let host = senders.get(&from).and_then(Weak::upgrade);
            if host.is_none() {
                senders.remove(&from);
            }
            host
        }
        else {
            Some(self.ctx.hosts.get_or_create(&format!("{}://{}", UdpConnectionManager::SCHEME, from)))
        };

        if let Some(host) = host {
            host.renew(self.ctx.hosts.renewing_span());
        }
    }

    fn sender_host(&self, from: SocketAddr, content: Bytes) -> Result<(Arc<HostInformation>, Bytes)> {
        if !self.compatibility_mode {
            let host = self.ctx.hosts.get_or_create(&format!("{}://{}", UdpConnectionManager::SCHEME, from));
            host.set_physical_address(from);
            return Ok((host, content));
        }

        let mut content = content;
        let prefix = CompatibilityPrefix::try_deser(&mut content)?;
        let host = self.ctx.hosts.get_or_create(&format!("_{}_{}", UdpConnectionManager::SCHEME, prefix.host_id));
        host.set_physical_address(from);
        self.ctx.report_remote_identity(&host, prefix.host_id, prefix.unique_id);
        self.compatibility_senders.lock().unwrap().insert(from, Arc::downgrade(&host));
        Ok((host, content))
    }
}
