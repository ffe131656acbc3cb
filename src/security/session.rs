use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use bytes::BytesMut;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use crate::buffers::event_pool::{Event, EventPool};
use crate::error::{Result, TransportError};
use crate::message::Message;
use crate::security::provider::{SecuritySessionProvider, SessionTransform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecuritySessionState {
    NotEstablished,
    Establishing,
    Established,
    Failed,
}

/// The outcome of a non-blocking check whether a session can be used
#[derive(Debug, Clone)]
pub enum EstablishmentProbe {
    Established,
    /// establishment is in flight - wait for [SecuritySession::established] or [SecuritySession::failed]
    Pending,
    Failed(TransportError),
}

/// Result of handing an asynchronous message to a session that is not established yet
#[derive(Debug)]
pub enum Enqueued {
    Queued,
    /// the session became established in the meantime: the caller sends the message right away
    AlreadyEstablished(Message),
    Failed(Message, TransportError),
}

struct SessionInner {
    state: SecuritySessionState,
    failure: Option<TransportError>,
    transform: Option<Arc<dyn SessionTransform>>,
    pending: VecDeque<Message>,
}

/// A named security session with one remote host.
///
/// Establishment is single-flight: the first caller of [SecuritySession::begin_establishment]
///  starts it, everybody else waits for the same attempt to finish. Asynchronous messages that
///  are sent before establishment completes are queued here and handed to `pending_sink` once
///  the session is established.
pub struct SecuritySession {
    name: String,
    remote_uri: String,
    provider: Arc<dyn SecuritySessionProvider>,
    inner: Mutex<SessionInner>,
    established: Event,
    failed: Event,
    event_pool: Arc<EventPool>,
    pending_sink: mpsc::UnboundedSender<Message>,
    num_establishment_attempts: AtomicUsize,
}

impl Debug for SecuritySession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecuritySession{{{}@{}: {:?}}}", self.name, self.remote_uri, self.state())
    }
}

impl SecuritySession {
    pub fn new(
        name: impl Into<String>,
        remote_uri: impl Into<String>,
        provider: Arc<dyn SecuritySessionProvider>,
        event_pool: Arc<EventPool>,
        pending_sink: mpsc::UnboundedSender<Message>,
    ) -> Arc<SecuritySession> {
        Arc::new(SecuritySession {
            name: name.into(),
            remote_uri: remote_uri.into(),
            provider,
            inner: Mutex::new(SessionInner {
                state: SecuritySessionState::NotEstablished,
                failure: None,
                transform: None,
                pending: Default::default(),
            }),
            established: event_pool.obtain(),
            failed: event_pool.obtain(),
            event_pool,
            pending_sink,
            num_establishment_attempts: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remote_uri(&self) -> &str {
        &self.remote_uri
    }

    pub fn state(&self) -> SecuritySessionState {
        self.inner.lock().unwrap().state
    }

    pub fn is_established(&self) -> bool {
        self.state() == SecuritySessionState::Established
    }

    pub fn is_establishing(&self) -> bool {
        self.state() == SecuritySessionState::Establishing
    }

    pub fn is_failed(&self) -> bool {
        self.state() == SecuritySessionState::Failed
    }

    pub fn failure(&self) -> Option<TransportError> {
        self.inner.lock().unwrap().failure.clone()
    }

    /// set once the session is established; never reset
    pub fn established(&self) -> &Event {
        &self.established
    }

    /// set once establishment failed; never reset
    pub fn failed(&self) -> &Event {
        &self.failed
    }

    pub fn num_establishment_attempts(&self) -> usize {
        self.num_establishment_attempts.load(Ordering::Acquire)
    }

    /// The error reported to senders waiting for this session after it failed
    pub fn failure_or_generic(&self) -> TransportError {
        self.failure()
            .unwrap_or_else(|| TransportError::SecurityContextNotEstablished { name: self.name.clone() })
    }

    /// Non-blocking: reports the session's state, starting establishment if nobody did so yet.
    pub fn begin_establishment(self: &Arc<Self>) -> EstablishmentProbe {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                SecuritySessionState::Established => return EstablishmentProbe::Established,
                SecuritySessionState::Establishing => return EstablishmentProbe::Pending,
                SecuritySessionState::Failed => return EstablishmentProbe::Failed(
                    inner.failure.clone().unwrap_or_else(|| TransportError::SecurityContextNotEstablished { name: self.name.clone() })
                ),
                SecuritySessionState::NotEstablished => {
                    inner.state = SecuritySessionState::Establishing;
                }
            }
        }

        self.num_establishment_attempts.fetch_add(1, Ordering::AcqRel);
        debug!("establishing security session {} with {}", self.name, self.remote_uri);

        let session = self.clone();
        tokio::spawn(async move {
            let result = session.provider.establish(&session.remote_uri).await;
            session.on_establishment_finished(result);
        });
        EstablishmentProbe::Pending
    }

    fn on_establishment_finished(&self, result: Result<Arc<dyn SessionTransform>>) {
        let (pending, failure) = {
            let mut inner = self.inner.lock().unwrap();
            let pending = std::mem::take(&mut inner.pending);
            match result {
                Ok(transform) => {
                    inner.state = SecuritySessionState::Established;
                    inner.transform = Some(transform);
                    (pending, None)
                }
                Err(e) => {
                    inner.state = SecuritySessionState::Failed;
                    inner.failure = Some(e.clone());
                    (pending, Some(e))
                }
            }
        };

        match failure {
            None => {
                info!("security session {} with {} established", self.name, self.remote_uri);
                self.established.set();
                for msg in pending {
                    if let Err(e) = self.pending_sink.send(msg) {
                        warn!("connection manager is gone, dropping queued message {:?}", e.0);
                    }
                }
            }
            Some(e) => {
                warn!("security session {} with {} failed: {}", self.name, self.remote_uri, e);
                self.failed.set();
                for msg in pending {
                    debug!("dropping queued message {:?}: security session failed", msg);
                }
            }
        }
    }

    /// Queues an asynchronous message until establishment completes. The state is checked under
    ///  the same lock that establishment uses to drain the queue, so a message is never stranded.
    pub fn enqueue_pending(&self, msg: Message) -> Enqueued {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            SecuritySessionState::Established => Enqueued::AlreadyEstablished(msg),
            SecuritySessionState::Failed => {
                let failure = inner.failure.clone()
                    .unwrap_or_else(|| TransportError::SecurityContextNotEstablished { name: self.name.clone() });
                Enqueued::Failed(msg, failure)
            }
            SecuritySessionState::NotEstablished | SecuritySessionState::Establishing => {
                inner.pending.push_back(msg);
                Enqueued::Queued
            }
        }
    }

    pub fn num_pending(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    fn transform(&self) -> Result<Arc<dyn SessionTransform>> {
        self.inner.lock().unwrap().transform.clone()
            .ok_or_else(|| TransportError::SecurityContextNotEstablished { name: self.name.clone() })
    }

    pub fn encrypt(&self, buf: &mut BytesMut) -> Result<()> {
        self.transform()?.encrypt(buf)
    }

    pub fn decrypt(&self, buf: &mut BytesMut) -> Result<()> {
        self.transform()?.decrypt(buf)
    }
}

impl Drop for SecuritySession {
    fn drop(&mut self) {
        self.event_pool.recycle(std::mem::take(&mut self.established));
        self.event_pool.recycle(std::mem::take(&mut self.failed));
    }
}
