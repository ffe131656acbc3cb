use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, trace, warn};
use crate::buffers::event_pool::Event;
use crate::config::Parameter;
use crate::error::{Result, TransportError};
use crate::host_information::HostInformation;
use crate::manager::context::TransportContext;
use crate::manager::dispatcher::InboundDispatcher;
use crate::manager::response_processor::ResponseCallback;
use crate::manager::service::{ServerServiceEntry, ServiceRegistry};
use crate::manager::traffic::TrafficSnapshot;
use crate::manager::transport::{ConnectionTypes, Transport};
use crate::message::{Envelope, IncomingMessage, Message, MessageMode};
use crate::security::parameters::{SecuritySessionAttributes, SecuritySessionParameters};
use crate::security::provider::{SecuritySessionProvider, SecuritySessionProviders};
use crate::security::session::{Enqueued, EstablishmentProbe, SecuritySession};
use crate::util::buf::put_string;

/// Orchestrates sending and receiving for one transport: security sessions, deadlines, inbound
///  dispatch and disposal. Everything wire specific is delegated to the [Transport].
pub struct ConnectionManager {
    ctx: Arc<TransportContext>,
    transport: Arc<dyn Transport>,
    transport_security_parameters: Option<Arc<SecuritySessionParameters>>,
    providers: SecuritySessionProviders,
    services: ServiceRegistry,
    disposed: RwLock<Option<Arc<TransportError>>>,
    resend: mpsc::UnboundedSender<Message>,
    resend_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Must be called from inside a tokio runtime. `transport_security_parameters` apply to
    ///  messages that neither carry parameters of their own nor have parameters set on their
    ///  recipient.
    pub fn new(
        ctx: Arc<TransportContext>,
        transport: Arc<dyn Transport>,
        transport_security_parameters: Option<Arc<SecuritySessionParameters>>,
    ) -> Arc<ConnectionManager> {
        ctx.timer.start(crate::timer::TimerService::DEFAULT_PERIOD);

        let (resend, mut resend_recv) = mpsc::unbounded_channel::<Message>();
        Arc::new_cyclic(|weak: &Weak<ConnectionManager>| {
            // messages that were queued on a security session come back here once it is established
            let weak = weak.clone();
            let resend_task = tokio::spawn(async move {
                while let Some(message) = resend_recv.recv().await {
                    let Some(manager) = weak.upgrade() else {
                        break;
                    };
                    let id = message.id();
                    if let Err(e) = manager.send(message).await {
                        warn!("sending queued message {} failed: {}", id, e);
                    }
                }
            });

            ConnectionManager {
                ctx,
                transport,
                transport_security_parameters,
                providers: Default::default(),
                services: Default::default(),
                disposed: RwLock::new(None),
                resend,
                resend_task: Mutex::new(Some(resend_task)),
            }
        })
    }

    pub fn ctx(&self) -> &Arc<TransportContext> {
        &self.ctx
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn register_security_provider(&self, name: impl Into<String>, provider: Arc<dyn SecuritySessionProvider>) {
        self.providers.register(name, provider);
    }

    pub fn register_service(&self, name: impl Into<String>, service: Arc<dyn ServerServiceEntry>) -> Option<Arc<dyn ServerServiceEntry>> {
        self.services.register(name, service)
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn traffic(&self) -> TrafficSnapshot {
        self.ctx.traffic.snapshot()
    }

    pub async fn start_listening(self: &Arc<Self>) -> Result<()> {
        self.check_not_disposed()?;
        self.transport.start_listening(Arc::new(InboundDispatcher::new(Arc::downgrade(self)))).await
    }

    pub async fn stop_listening(&self) -> Result<()> {
        self.transport.stop_listening().await
    }

    pub fn check_not_disposed(&self) -> Result<()> {
        match self.disposed.read().unwrap().as_ref() {
            Some(reason) => Err(TransportError::Disposed { reason: reason.clone() }),
            None => Ok(()),
        }
    }

    pub fn dispose_reason(&self) -> Option<Arc<TransportError>> {
        self.disposed.read().unwrap().clone()
    }

    /// Sends a message. Returns when the message was handed to the transport, or - for
    ///  asynchronous messages - was queued until its security session is established. A
    ///  synchronous send that is cancelled while waiting for its security session returns `Ok`.
    pub async fn send(&self, message: Message) -> Result<()> {
        let id = message.id();
        let uri = message.recipient().uri().to_string();
        match self.do_send(message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("sending message {} to {} failed: {}", id, uri, e);
                Err(e)
            }
        }
    }

    async fn do_send(&self, mut message: Message) -> Result<()> {
        self.check_not_disposed()?;

        let parameters = self.effective_parameters(&message);
        message.set_security_session_parameters(parameters.clone());

        let attributes = parameters.attributes();
        if attributes.contains(SecuritySessionAttributes::FORCE_SYNC) && message.mode() == MessageMode::Asynchronous {
            message.set_mode(MessageMode::Synchronous);
        }
        else if attributes.contains(SecuritySessionAttributes::FORCE_ASYNC) && message.mode() == MessageMode::Synchronous {
            message.set_mode(MessageMode::Asynchronous);
        }

        let deadline = message.init_finish_deadline(self.effective_timeout(&parameters));

        if message.serialized().is_none() {
            let recipient = message.recipient().clone();
            let session = self.session_for(&recipient, parameters.name())?;

            match session.begin_establishment() {
                EstablishmentProbe::Established => {}
                EstablishmentProbe::Failed(e) => return Err(e),
                EstablishmentProbe::Pending => {
                    if message.mode() == MessageMode::Synchronous {
                        let cancel = message.cancel().cloned();
                        if !self.wait_for_session(&session, cancel, deadline, recipient.uri()).await? {
                            debug!("message {} was cancelled while waiting for security session {}", message.id(), session.name());
                            return Ok(());
                        }
                    }
                    else {
                        match session.enqueue_pending(message) {
                            Enqueued::Queued => {
                                trace!("queued message until security session {} with {} is established", session.name(), recipient.uri());
                                return Ok(());
                            }
                            Enqueued::AlreadyEstablished(m) => message = m,
                            Enqueued::Failed(_, e) => return Err(e),
                        }
                    }
                }
            }

            let serialized = self.serialize(&message, &session, attributes)?;
            message.set_serialized(serialized);
        }

        message.set_sender(self.ctx.local_host.clone());
        let num_bytes = self.transport.internal_send(&message).await?;
        self.ctx.traffic.on_sent(num_bytes);
        trace!("sent message {} ({} bytes)", message.id(), num_bytes);
        Ok(())
    }

    fn effective_parameters(&self, message: &Message) -> Arc<SecuritySessionParameters> {
        SecuritySessionParameters::resolve(
            message.security_session_parameters(),
            message.recipient(),
            self.transport_security_parameters.as_ref(),
        )
    }

    fn effective_timeout(&self, parameters: &SecuritySessionParameters) -> Duration {
        parameters.timeout()
            .unwrap_or_else(|| self.ctx.params.duration(Parameter::InvocationTimeout))
    }

    /// returns the host's session with the given name, replacing a failed one
    pub(crate) fn session_for(&self, host: &Arc<HostInformation>, name: &str) -> Result<Arc<SecuritySession>> {
        if let Some(session) = host.security_session(name) {
            if !session.is_failed() {
                return Ok(session);
            }
        }

        let provider = self.providers.get(name)?;
        Ok(host.get_or_create_security_session(name, || SecuritySession::new(
            name,
            host.uri(),
            provider,
            self.ctx.event_pool.clone(),
            self.resend.clone(),
        )))
    }

    /// Waits for an establishment that is in flight. Returns `false` if the wait was cancelled.
    pub(crate) async fn wait_for_session(&self, session: &SecuritySession, cancel: Option<Event>, deadline: Instant, uri: &str) -> Result<bool> {
        let cancelled = async {
            match &cancel {
                Some(cancel) => cancel.wait().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Ok(false),
            _ = session.established().wait() => Ok(true),
            _ = session.failed().wait() => Err(session.failure_or_generic()),
            _ = sleep_until(deadline) => Err(TransportError::ServerDidNotReply { uri: uri.to_string() }),
        }
    }

    /// session name (varint string) followed by the session-transformed envelope and payload
    fn serialize(&self, message: &Message, session: &SecuritySession, attributes: SecuritySessionAttributes) -> Result<Bytes> {
        let mut body = BytesMut::new();
        Envelope::for_message(message)
            .write_body(message.payload(), attributes.contains(SecuritySessionAttributes::ENABLE_COMPRESSION), &mut body)?;
        session.encrypt(&mut body)?;

        let mut buf = BytesMut::with_capacity(body.len() + session.name().len() + 2);
        put_string(&mut buf, session.name());
        buf.extend_from_slice(&body);
        Ok(buf.freeze())
    }

    /// Sends a request and waits for its reply, up to the message's deadline.
    pub async fn send_request(&self, mut message: Message) -> Result<IncomingMessage> {
        if message.mode() == MessageMode::OneWay {
            return Err(TransportError::Logic("one-way messages have no reply".to_string()));
        }

        let parameters = self.effective_parameters(&message);
        let deadline = message.init_finish_deadline(self.effective_timeout(&parameters));
        let id = message.id();
        let uri = message.recipient().uri().to_string();

        let reply = self.ctx.responses.register_sync(id, &uri, deadline);
        if let Err(e) = self.send(message).await {
            self.ctx.responses.remove(id);
            return Err(e);
        }

        match timeout_at(deadline, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ServerDidNotReply { uri }),
            Err(_) => {
                self.ctx.responses.remove(id);
                Err(TransportError::ServerDidNotReply { uri })
            }
        }
    }

    /// Sends a request; `callback` is called with the reply, or with the failure if there is no
    ///  reply before the message's deadline. If sending fails, the callback is never called.
    pub async fn send_request_with_callback(&self, mut message: Message, callback: ResponseCallback) -> Result<()> {
        if message.mode() == MessageMode::OneWay {
            return Err(TransportError::Logic("one-way messages have no reply".to_string()));
        }

        let parameters = self.effective_parameters(&message);
        let deadline = message.init_finish_deadline(self.effective_timeout(&parameters));
        let id = message.id();

        self.ctx.responses.register_async(id, message.recipient().uri(), deadline, callback);
        if let Err(e) = self.send(message).await {
            self.ctx.responses.remove(id);
            return Err(e);
        }
        Ok(())
    }

    /// Closes connections matching the host filter and type mask. Outstanding requests to the
    ///  affected hosts fail with `reason`.
    pub async fn release_connections(&self, host: Option<Arc<HostInformation>>, types: ConnectionTypes, reason: TransportError) -> Result<usize> {
        self.check_not_disposed()?;

        match &host {
            Some(host) => self.ctx.responses.fail_host(host.uri(), &reason),
            None => self.ctx.responses.fail_all(&reason),
        };
        Ok(self.transport.release_connections(host, types, reason).await)
    }

    /// Tears the manager down. Only the first call has an effect and returns `true`; its reason
    ///  is reported to every later operation.
    pub async fn dispose(&self, reason: TransportError) -> bool {
        {
            let mut disposed = self.disposed.write().unwrap();
            if disposed.is_some() {
                return false;
            }
            *disposed = Some(Arc::new(reason.clone()));
        }

        info!("disposing connection manager: {}", reason);
        if let Some(task) = self.resend_task.lock().unwrap().take() {
            task.abort();
        }

        if let Err(e) = self.transport.stop_listening().await {
            warn!("error stopping listener during disposal: {}", e);
        }
        self.transport.release_connections(None, ConnectionTypes::ALL, reason.clone()).await;
        self.transport.internal_dispose(reason.clone()).await;

        self.ctx.responses.fail_all(&TransportError::Disposed { reason: Arc::new(reason) });
        true
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.resend_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use mockall::predicate::always;
    use crate::config::{DefaultParameterProvider, ParameterValue};
    use crate::manager::transport::MockTransport;
    use crate::security::provider::{MockSecuritySessionProvider, NoTransform, SessionTransform};

    const SESSION: &str = "/slow";

    fn ctx() -> Arc<TransportContext> {
        let params = DefaultParameterProvider::new()
            .with(Parameter::InvocationTimeout, ParameterValue::Duration(Duration::from_secs(10)));
        TransportContext::new(Arc::new(params), Default::default())
    }

    fn counting_transport(sent: Arc<AtomicUsize>) -> MockTransport {
        let mut transport = MockTransport::new();
        transport.expect_internal_send()
            .returning(move |msg| {
                assert!(msg.serialized().is_some());
                assert!(msg.sender().is_some());
                sent.fetch_add(1, Ordering::AcqRel);
                Ok(msg.serialized().map(|s| s.len()).unwrap_or(0))
            });
        transport
    }

    /// a provider that counts establishment attempts
    fn counting_provider(attempts: Arc<AtomicUsize>, succeed: bool) -> MockSecuritySessionProvider {
        let mut provider = MockSecuritySessionProvider::new();
        provider.expect_establish()
            .returning(move |_| {
                attempts.fetch_add(1, Ordering::AcqRel);
                if succeed {
                    Ok(Arc::new(NoTransform) as Arc<dyn SessionTransform>)
                }
                else {
                    Err(TransportError::SecurityFailure { name: SESSION.to_string(), cause: "rejected".to_string() })
                }
            });
        provider
    }

    fn message_to(ctx: &TransportContext, session: &str) -> Message {
        let host = ctx.hosts.get_or_create("gudp://127.0.0.1:9");
        Message::new(host, "svc", Bytes::from_static(b"payload"))
            .with_security_session_parameters(Arc::new(SecuritySessionParameters::new(session, Default::default(), None)))
    }

    #[tokio::test]
    async fn test_send_with_default_session() {
        let ctx = ctx();
        let sent = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::new(ctx.clone(), Arc::new(counting_transport(sent.clone())), None);

        let host = ctx.hosts.get_or_create("gudp://127.0.0.1:9");
        manager.send(Message::new(host.clone(), "svc", Bytes::from_static(b"abc"))).await.unwrap();
        manager.send(Message::new(host.clone(), "svc", Bytes::from_static(b"abc"))).await.unwrap();

        assert_eq!(sent.load(Ordering::Acquire), 2);
        assert_eq!(manager.traffic().messages_sent, 2);
        assert!(manager.traffic().bytes_sent > 6);
        assert!(host.security_session(SecuritySessionParameters::DEFAULT_NAME).unwrap().is_established());
    }

    #[tokio::test]
    async fn test_concurrent_sync_sends_share_one_establishment() {
        let ctx = ctx();
        let sent = Arc::new(AtomicUsize::new(0));
        let attempts = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::new(ctx.clone(), Arc::new(counting_transport(sent.clone())), None);
        manager.register_security_provider(SESSION, Arc::new(counting_provider(attempts.clone(), true)));

        let handles = (0..10)
            .map(|_| {
                let manager = manager.clone();
                let msg = message_to(&ctx, SESSION);
                tokio::spawn(async move { manager.send(msg).await })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(attempts.load(Ordering::Acquire), 1);
        assert_eq!(sent.load(Ordering::Acquire), 10);
    }

    #[tokio::test]
    async fn test_failed_establishment_is_propagated() {
        let ctx = ctx();
        let sent = Arc::new(AtomicUsize::new(0));
        let attempts = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::new(ctx.clone(), Arc::new(counting_transport(sent.clone())), None);
        manager.register_security_provider(SESSION, Arc::new(counting_provider(attempts.clone(), false)));

        match manager.send(message_to(&ctx, SESSION)).await {
            Err(TransportError::SecurityFailure { cause, .. }) => assert_eq!(cause, "rejected"),
            other => panic!("unexpected {:?}", other),
        }

        // the failed session is replaced, so the next send retries
        assert!(manager.send(message_to(&ctx, SESSION)).await.is_err());
        assert_eq!(attempts.load(Ordering::Acquire), 2);
        assert_eq!(sent.load(Ordering::Acquire), 0);
    }

    /// a provider whose establishment never completes
    struct HangingProvider;
    #[async_trait::async_trait]
    impl SecuritySessionProvider for HangingProvider {
        async fn establish(&self, _remote_uri: &str) -> Result<Arc<dyn SessionTransform>> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_send_times_out() {
        let ctx = ctx();
        let manager = ConnectionManager::new(ctx.clone(), Arc::new(MockTransport::new()), None);
        manager.register_security_provider(SESSION, Arc::new(HangingProvider));

        let started = Instant::now();
        let result = manager.send(message_to(&ctx, SESSION)).await;
        assert!(matches!(result, Err(TransportError::ServerDidNotReply { .. })));
        assert_eq!(Instant::now() - started, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_timeout_overrides_invocation_timeout() {
        let ctx = ctx();
        let manager = ConnectionManager::new(ctx.clone(), Arc::new(MockTransport::new()), None);
        manager.register_security_provider(SESSION, Arc::new(HangingProvider));

        let host = ctx.hosts.get_or_create("gudp://127.0.0.1:9");
        let msg = Message::new(host, "svc", Bytes::new())
            .with_security_session_parameters(Arc::new(SecuritySessionParameters::new(SESSION, Default::default(), Some(Duration::from_secs(3)))));

        let started = Instant::now();
        assert!(manager.send(msg).await.is_err());
        assert_eq!(Instant::now() - started, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_sync_send_returns_ok() {
        let ctx = ctx();
        let manager = ConnectionManager::new(ctx.clone(), Arc::new(MockTransport::new()), None);
        manager.register_security_provider(SESSION, Arc::new(HangingProvider));

        let cancel = Event::new();
        let msg = message_to(&ctx, SESSION).with_cancel(cancel.clone());

        let c2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            c2.set();
        });

        let started = Instant::now();
        manager.send(msg).await.unwrap();
        assert_eq!(Instant::now() - started, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_async_send_is_queued_and_drained() {
        let ctx = ctx();
        let sent = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::new(ctx.clone(), Arc::new(counting_transport(sent.clone())), None);

        let (release, released) = tokio::sync::oneshot::channel::<()>();
        let released = Arc::new(tokio::sync::Mutex::new(Some(released)));
        struct GatedProvider(Arc<tokio::sync::Mutex<Option<tokio::sync::oneshot::Receiver<()>>>>);
        #[async_trait::async_trait]
        impl SecuritySessionProvider for GatedProvider {
            async fn establish(&self, _remote_uri: &str) -> Result<Arc<dyn SessionTransform>> {
                if let Some(gate) = self.0.lock().await.take() {
                    let _ = gate.await;
                }
                Ok(Arc::new(NoTransform))
            }
        }
        manager.register_security_provider(SESSION, Arc::new(GatedProvider(released)));

        let msg = message_to(&ctx, SESSION).with_mode(MessageMode::Asynchronous);
        manager.send(msg).await.unwrap();
        assert_eq!(sent.load(Ordering::Acquire), 0);

        release.send(()).unwrap();
        while sent.load(Ordering::Acquire) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(sent.load(Ordering::Acquire), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_async_does_not_block() {
        let ctx = ctx();
        let manager = ConnectionManager::new(ctx.clone(), Arc::new(MockTransport::new()), None);
        manager.register_security_provider(SESSION, Arc::new(HangingProvider));

        let host = ctx.hosts.get_or_create("gudp://127.0.0.1:9");
        let msg = Message::new(host.clone(), "svc", Bytes::new())
            .with_security_session_parameters(Arc::new(SecuritySessionParameters::new(SESSION, SecuritySessionAttributes::FORCE_ASYNC, None)));

        let started = Instant::now();
        manager.send(msg).await.unwrap();
        assert_eq!(Instant::now(), started);
        assert_eq!(host.security_session(SESSION).unwrap().num_pending(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session_name() {
        let ctx = ctx();
        let manager = ConnectionManager::new(ctx.clone(), Arc::new(MockTransport::new()), None);
        assert!(matches!(manager.send(message_to(&ctx, "/unregistered")).await, Err(TransportError::SecurityFailure { .. })));
    }

    #[tokio::test]
    async fn test_transport_error_is_returned_unchanged() {
        let ctx = ctx();
        let mut transport = MockTransport::new();
        transport.expect_internal_send()
            .returning(|_| Err(TransportError::ConnectionClosed("broken pipe".to_string())));
        let manager = ConnectionManager::new(ctx.clone(), Arc::new(transport), None);

        let host = ctx.hosts.get_or_create("gudp://127.0.0.1:9");
        match manager.send(Message::new(host, "svc", Bytes::new())).await {
            Err(TransportError::ConnectionClosed(msg)) => assert_eq!(msg, "broken pipe"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(manager.traffic().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let ctx = ctx();
        let mut transport = MockTransport::new();
        transport.expect_stop_listening().times(1).returning(|| Ok(()));
        transport.expect_release_connections()
            .with(always(), mockall::predicate::eq(ConnectionTypes::ALL), always())
            .times(1)
            .returning(|_, _, _| 0);
        transport.expect_internal_dispose().times(1).return_const(());
        let manager = ConnectionManager::new(ctx.clone(), Arc::new(transport), None);

        let handles = (0..5)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.dispose(TransportError::ConnectionShutDown(format!("{}", i))).await })
            })
            .collect::<Vec<_>>();
        let mut num_first = 0;
        for h in handles {
            if h.await.unwrap() {
                num_first += 1;
            }
        }
        assert_eq!(num_first, 1);

        let host = ctx.hosts.get_or_create("gudp://127.0.0.1:9");
        let reason = manager.dispose_reason().unwrap().to_string();
        match manager.send(Message::new(host, "svc", Bytes::new())).await {
            Err(TransportError::Disposed { reason: r }) => assert_eq!(r.to_string(), reason),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!manager.dispose(TransportError::ChannelClosed).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_request_times_out() {
        let ctx = ctx();
        let sent = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::new(ctx.clone(), Arc::new(counting_transport(sent.clone())), None);

        let host = ctx.hosts.get_or_create("gudp://127.0.0.1:9");
        let result = manager.send_request(Message::new(host, "svc", Bytes::new())).await;
        assert!(matches!(result, Err(TransportError::ServerDidNotReply { .. })));
        assert_eq!(sent.load(Ordering::Acquire), 1);
        assert!(ctx.responses.is_empty());
    }

    #[tokio::test]
    async fn test_send_request_rejects_one_way() {
        let ctx = ctx();
        let manager = ConnectionManager::new(ctx.clone(), Arc::new(MockTransport::new()), None);
        let host = ctx.hosts.get_or_create("gudp://127.0.0.1:9");
        let msg = Message::new(host, "svc", Bytes::new()).with_mode(MessageMode::OneWay);
        assert!(matches!(manager.send_request(msg).await, Err(TransportError::Logic(_))));
    }

    #[tokio::test]
    async fn test_release_connections_fails_requests() {
        let ctx = ctx();
        let mut transport = MockTransport::new();
        transport.expect_release_connections()
            .times(1)
            .returning(|host, _, _| if host.is_some() { 1 } else { 0 });
        let manager = ConnectionManager::new(ctx.clone(), Arc::new(transport), None);

        let host = ctx.hosts.get_or_create("gudp://127.0.0.1:9");
        let reply = ctx.responses.register_sync(77, host.uri(), Instant::now() + Duration::from_secs(10));

        let n = manager.release_connections(Some(host), ConnectionTypes::PERSISTENT, TransportError::ConnectionClosed("x".to_string())).await.unwrap();
        assert_eq!(n, 1);
        assert!(matches!(reply.await.unwrap(), Err(TransportError::ConnectionClosed(_))));
    }
}
