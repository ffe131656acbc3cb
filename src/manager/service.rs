use std::sync::{Arc, RwLock};
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::debug;
use crate::message::IncomingMessage;

/// Application code handling inbound messages for one service name. Handlers run on the
///  generic thread pool, so they may block.
///
/// Returning a payload sends it back as the reply - unless the message was one-way.
#[cfg_attr(test, automock)]
pub trait ServerServiceEntry: Send + Sync + 'static {
    fn handle(&self, message: &IncomingMessage) -> Option<Bytes>;
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<FxHashMap<String, Arc<dyn ServerServiceEntry>>>,
}

impl ServiceRegistry {
    /// returns the service previously registered under the name
    pub fn register(&self, name: impl Into<String>, service: Arc<dyn ServerServiceEntry>) -> Option<Arc<dyn ServerServiceEntry>> {
        let name = name.into();
        debug!("registering service '{}'", name);
        self.services.write().unwrap().insert(name, service)
    }

    pub fn deregister(&self, name: &str) -> Option<Arc<dyn ServerServiceEntry>> {
        self.services.write().unwrap().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServerServiceEntry>> {
        self.services.read().unwrap().get(name).cloned()
    }
}
