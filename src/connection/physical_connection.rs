use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};
use crate::buffers::event_pool::Event;
use crate::error::TransportError;
use crate::host_information::HostInformation;
use crate::security::session::SecuritySession;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

struct CheckoutState {
    checked_out: bool,
    dispose_reason: Option<TransportError>,
}

/// Bookkeeping for one socket-backed channel: who currently writes to it, whether it is being
///  reestablished, and whether (and why) it was disposed. The socket itself is owned by the
///  transport.
///
/// Checkout and disposal share one lock: a disposed connection never becomes available again.
pub struct PhysicalConnection {
    id: u64,
    remote: Arc<HostInformation>,
    state: Mutex<CheckoutState>,
    reestablishing: AtomicBool,
    security_session: Mutex<Option<Arc<SecuritySession>>>,
    disposed: Event,
}

impl Debug for PhysicalConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PhysicalConnection{{#{} to {}}}", self.id, self.remote.uri())
    }
}

impl PhysicalConnection {
    pub fn new(remote: Arc<HostInformation>) -> PhysicalConnection {
        PhysicalConnection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            state: Mutex::new(CheckoutState {
                checked_out: false,
                dispose_reason: None,
            }),
            reestablishing: AtomicBool::new(false),
            security_session: Mutex::new(None),
            disposed: Event::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> &Arc<HostInformation> {
        &self.remote
    }

    /// Checks the connection out for exclusive use. Returns `false` if somebody else has it, or
    ///  if it was disposed.
    pub fn acquire_if_available(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.checked_out || state.dispose_reason.is_some() {
            return false;
        }
        state.checked_out = true;
        trace!("{:?} checked out", self);
        true
    }

    pub fn release(&self) {
        self.state.lock().unwrap().checked_out = false;
    }

    pub fn is_available(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.checked_out && state.dispose_reason.is_none()
    }

    pub fn is_reestablishing(&self) -> bool {
        self.reestablishing.load(Ordering::Acquire)
    }

    /// returns `false` if reestablishment was in progress already
    pub fn begin_reestablishing(&self) -> bool {
        !self.reestablishing.swap(true, Ordering::AcqRel)
    }

    pub fn end_reestablishing(&self) {
        self.reestablishing.store(false, Ordering::Release);
    }

    pub fn security_session(&self) -> Option<Arc<SecuritySession>> {
        self.security_session.lock().unwrap().clone()
    }

    pub fn set_security_session(&self, session: Option<Arc<SecuritySession>>) {
        *self.security_session.lock().unwrap() = session;
    }

    /// Marks the connection as disposed. Only the first call has an effect and returns `true`;
    ///  its reason is the one reported from then on.
    pub fn dispose(&self, reason: TransportError) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.dispose_reason.is_some() {
                return false;
            }
            debug!("disposing {:?}: {}", self, reason);
            state.dispose_reason = Some(reason);
            state.checked_out = false;
        }
        self.security_session.lock().unwrap().take();
        self.disposed.set();
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().unwrap().dispose_reason.is_some()
    }

    pub fn dispose_reason(&self) -> Option<TransportError> {
        self.state.lock().unwrap().dispose_reason.clone()
    }

    /// completes once the connection is disposed
    pub async fn wait_disposed(&self) {
        self.disposed.wait().await
    }
}
