use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;
use crate::connection::message_container::MessageContainer;
use crate::host_information::HostInformation;
use crate::manager::transport::ConnectionTypes;

struct Activity {
    last_activity: Instant,
    shutdown_time: Instant,
    ttl: Duration,
}

/// A persistent connection: it outlives the individual physical connection it wraps, which is
///  replaced when the connection is reestablished. Messages are queued in a [MessageContainer]
///  while the physical connection is busy or being replaced.
///
/// `P` is the transport's physical connection type.
pub struct GeneralConnection<P> {
    name: String,
    remote: Arc<HostInformation>,
    connection_type: ConnectionTypes,
    physical: Mutex<Arc<P>>,
    queue: MessageContainer,
    activity: Mutex<Activity>,
}

impl<P> Debug for GeneralConnection<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "GeneralConnection{{{}@{}}}", self.name, self.remote.uri())
    }
}

impl<P> GeneralConnection<P> {
    pub fn new(name: impl Into<String>, remote: Arc<HostInformation>, connection_type: ConnectionTypes, physical: Arc<P>, max_queued_items: usize, ttl: Duration) -> GeneralConnection<P> {
        let now = Instant::now();
        GeneralConnection {
            name: name.into(),
            queue: MessageContainer::new(remote.uri(), max_queued_items),
            remote,
            connection_type,
            physical: Mutex::new(physical),
            activity: Mutex::new(Activity {
                last_activity: now,
                shutdown_time: now + ttl,
                ttl,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remote(&self) -> &Arc<HostInformation> {
        &self.remote
    }

    pub fn connection_type(&self) -> ConnectionTypes {
        self.connection_type
    }

    pub fn physical(&self) -> Arc<P> {
        self.physical.lock().unwrap().clone()
    }

    /// installs a reestablished physical connection, returning the previous one
    pub fn replace_physical(&self, physical: Arc<P>) -> Arc<P> {
        std::mem::replace(&mut *self.physical.lock().unwrap(), physical)
    }

    pub fn queue(&self) -> &MessageContainer {
        &self.queue
    }

    /// Records activity and recomputes the shutdown time as `now + ttl`. The shutdown time only
    ///  moves forward, unless the new ttl is smaller than the previous one.
    pub fn renew(&self, ttl: Duration) {
        let now = Instant::now();
        let mut activity = self.activity.lock().unwrap();
        let candidate = now + ttl;

        activity.last_activity = now;
        if ttl < activity.ttl || candidate > activity.shutdown_time {
            activity.shutdown_time = candidate;
        }
        activity.ttl = ttl;
        trace!("{:?} renewed until {:?}", self, activity.shutdown_time);
    }

    pub fn last_activity(&self) -> Instant {
        self.activity.lock().unwrap().last_activity
    }

    pub fn shutdown_time(&self) -> Instant {
        self.activity.lock().unwrap().shutdown_time
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.shutdown_time()
    }
}
