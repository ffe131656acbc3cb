use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use uuid::Uuid;
use crate::error::{Result, TransportError};
use crate::security::parameters::SecuritySessionParameters;
use crate::security::session::SecuritySession;
use crate::timer::TimerConsumer;

pub const NICKNAME_PROPERTY: &str = "Nickname";

struct HostState {
    physical_address: Option<SocketAddr>,
    host_id: Option<Uuid>,
    remote_unique_id: Option<u32>,
    properties: FxHashMap<String, String>,
    security_session_parameters: Option<Arc<SecuritySessionParameters>>,
    renew_deadline: Instant,
}

/// Everything that is known about one remote endpoint. A single instance per URI is shared by
///  all threads talking to that host, so all mutable state is behind internal locks.
pub struct HostInformation {
    uri: String,
    state: Mutex<HostState>,
    security_sessions: Mutex<FxHashMap<String, Arc<SecuritySession>>>,
}

impl Debug for HostInformation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostInformation{{{}}}", self.uri)
    }
}

impl HostInformation {
    pub fn new(uri: impl Into<String>, renewing_span: Duration) -> HostInformation {
        HostInformation {
            uri: uri.into(),
            state: Mutex::new(HostState {
                physical_address: None,
                host_id: None,
                remote_unique_id: None,
                properties: Default::default(),
                security_session_parameters: None,
                renew_deadline: Instant::now() + renewing_span,
            }),
            security_sessions: Default::default(),
        }
    }

    /// the local host has a fixed identity
    pub fn new_local(uri: impl Into<String>) -> HostInformation {
        let result = HostInformation::new(uri, Duration::from_secs(365 * 24 * 3600));
        {
            let mut state = result.state.lock().unwrap();
            state.host_id = Some(Uuid::new_v4());
            state.remote_unique_id = Some(rand::random());
        }
        result
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn physical_address(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().physical_address
    }

    pub fn set_physical_address(&self, addr: SocketAddr) {
        self.state.lock().unwrap().physical_address = Some(addr);
    }

    /// forces re-resolution on the next call to [HostInformation::resolve_physical_address]
    pub fn invalidate_physical_address(&self) {
        self.state.lock().unwrap().physical_address = None;
    }

    /// Returns the cached physical address, resolving it from the URI (`scheme://host:port/...`)
    ///  if there is none.
    pub async fn resolve_physical_address(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.physical_address() {
            return Ok(addr);
        }

        let authority = Self::authority(&self.uri)
            .ok_or_else(|| TransportError::Configuration(format!("URI {} has no host:port part", self.uri)))?;

        trace!("resolving {}", authority);
        let addr = tokio::net::lookup_host(authority).await?
            .next()
            .ok_or_else(|| TransportError::Configuration(format!("URI {} does not resolve to an address", self.uri)))?;

        self.set_physical_address(addr);
        Ok(addr)
    }

    fn authority(uri: &str) -> Option<&str> {
        let without_scheme = match uri.find("://") {
            Some(idx) => &uri[idx + 3..],
            None => uri,
        };
        let authority = without_scheme.split('/').next()?;
        if authority.contains(':') {
            Some(authority)
        }
        else {
            None
        }
    }

    pub fn host_id(&self) -> Option<Uuid> {
        self.state.lock().unwrap().host_id
    }

    pub fn remote_unique_id(&self) -> Option<u32> {
        self.state.lock().unwrap().remote_unique_id
    }

    /// Records the identity a remote host reported about itself. Returns `true` if the host
    ///  reported a different identity before, i.e. it restarted - all its security sessions are
    ///  dropped in that case since the remote side lost them.
    pub fn update_remote_identity(&self, host_id: Uuid, unique_id: u32) -> bool {
        let restarted = {
            let mut state = self.state.lock().unwrap();
            let restarted = match (state.host_id, state.remote_unique_id) {
                (Some(prev_host_id), Some(prev_unique_id)) => prev_host_id != host_id || prev_unique_id != unique_id,
                _ => false,
            };
            state.host_id = Some(host_id);
            state.remote_unique_id = Some(unique_id);
            restarted
        };

        if restarted {
            info!("remote host {} restarted - dropping its security sessions", self.uri);
            self.clear_security_sessions();
        }
        restarted
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().properties.get(key).cloned()
    }

    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state.lock().unwrap().properties.insert(key.into(), value.into());
    }

    pub fn nickname(&self) -> Option<String> {
        self.property(NICKNAME_PROPERTY)
    }

    pub fn security_session_parameters(&self) -> Option<Arc<SecuritySessionParameters>> {
        self.state.lock().unwrap().security_session_parameters.clone()
    }

    pub fn set_security_session_parameters(&self, parameters: Option<Arc<SecuritySessionParameters>>) {
        self.state.lock().unwrap().security_session_parameters = parameters;
    }

    /// Pushes the renewal deadline to `now + span` - but never moves it back.
    pub fn renew(&self, span: Duration) {
        let mut state = self.state.lock().unwrap();
        let new_deadline = Instant::now() + span;
        if new_deadline > state.renew_deadline {
            state.renew_deadline = new_deadline;
        }
    }

    pub fn renew_deadline(&self) -> Instant {
        self.state.lock().unwrap().renew_deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.renew_deadline() < now
    }

    pub fn security_session(&self, name: &str) -> Option<Arc<SecuritySession>> {
        self.security_sessions.lock().unwrap().get(name).cloned()
    }

    /// Returns the session with the given name, creating it if there is none. A failed session
    ///  is replaced by a fresh one so that later sends can retry establishment.
    pub fn get_or_create_security_session(&self, name: &str, create: impl FnOnce() -> Arc<SecuritySession>) -> Arc<SecuritySession> {
        let mut sessions = self.security_sessions.lock().unwrap();
        if let Some(existing) = sessions.get(name) {
            if !existing.is_failed() {
                return existing.clone();
            }
            debug!("replacing failed security session {} for {}", name, self.uri);
        }

        let session = create();
        sessions.insert(name.to_string(), session.clone());
        session
    }

    pub fn clear_security_sessions(&self) {
        self.security_sessions.lock().unwrap().clear();
    }

    pub fn has_establishing_security_sessions(&self) -> bool {
        self.security_sessions.lock().unwrap()
            .values()
            .any(|s| s.is_establishing())
    }
}

/// The process wide (or rather: transport stack wide) registry of known remote hosts.
pub struct HostRegistry {
    renewing_span: Duration,
    hosts: Mutex<FxHashMap<String, Arc<HostInformation>>>,
}

impl HostRegistry {
    pub fn new(renewing_span: Duration) -> HostRegistry {
        HostRegistry {
            renewing_span,
            hosts: Default::default(),
        }
    }

    pub fn get(&self, uri: &str) -> Option<Arc<HostInformation>> {
        self.hosts.lock().unwrap().get(uri).cloned()
    }

    pub fn get_or_create(&self, uri: &str) -> Arc<HostInformation> {
        self.hosts.lock().unwrap()
            .entry(uri.to_string())
            .or_insert_with(|| {
                debug!("registering remote host {}", uri);
                Arc::new(HostInformation::new(uri, self.renewing_span))
            })
            .clone()
    }

    pub fn remove(&self, uri: &str) -> Option<Arc<HostInformation>> {
        self.hosts.lock().unwrap().remove(uri)
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Arc<HostInformation>> {
        self.hosts.lock().unwrap().values().cloned().collect()
    }

    pub fn renewing_span(&self) -> Duration {
        self.renewing_span
    }

    /// Removes hosts that were not renewed in time. A host is kept while it is in the middle of
    ///  establishing a security session, or while anything outside the registry (a connection,
    ///  a message in flight) still holds it.
    pub fn remove_expired(&self, now: Instant) -> usize {
        let mut hosts = self.hosts.lock().unwrap();
        let before = hosts.len();
        hosts.retain(|uri, host| {
            let keep = !host.is_expired(now)
                || host.has_establishing_security_sessions()
                || Arc::strong_count(host) > 1;
            if !keep {
                debug!("remote host {} expired", uri);
            }
            keep
        });
        before - hosts.len()
    }
}

impl TimerConsumer for HostRegistry {
    fn on_timer(&self, now: Instant) {
        self.remove_expired(now);
    }
}
