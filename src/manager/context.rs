use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;
use crate::buffers::event_pool::EventPool;
use crate::config::{Parameter, ParameterProvider};
use crate::error::TransportError;
use crate::events::{GenuineEvent, GenuineEventKind, GenuineEventProvider};
use crate::host_information::{HostInformation, HostRegistry};
use crate::manager::response_processor::ResponseProcessors;
use crate::manager::traffic::TrafficCounters;
use crate::thread_pool::{GenericThreadPool, ThreadPoolConfig};
use crate::timer::{TimerService, TimerSubscription};

/// The services shared by a connection manager and its transport. One context can be shared by
///  several connection managers (e.g. a UDP and a TCP manager in the same process), which then
///  share their view of remote hosts.
pub struct TransportContext {
    pub local_host: Arc<HostInformation>,
    pub hosts: Arc<HostRegistry>,
    pub params: Arc<dyn ParameterProvider>,
    pub events: GenuineEventProvider,
    pub event_pool: Arc<EventPool>,
    pub timer: Arc<TimerService>,
    pub thread_pool: Arc<GenericThreadPool>,
    pub responses: Arc<ResponseProcessors>,
    pub traffic: TrafficCounters,
    subscriptions: Mutex<Vec<TimerSubscription>>,
}

impl TransportContext {
    pub fn new(params: Arc<dyn ParameterProvider>, thread_pool_config: ThreadPoolConfig) -> Arc<TransportContext> {
        let hosts = Arc::new(HostRegistry::new(params.duration(Parameter::HostRenewingSpan)));
        let responses = Arc::new(ResponseProcessors::default());
        let timer = TimerService::new();

        let subscriptions = vec![
            timer.register(hosts.clone()),
            timer.register(responses.clone()),
        ];

        Arc::new(TransportContext {
            local_host: Arc::new(HostInformation::new_local(format!("_genuine_{}", Uuid::new_v4()))),
            hosts,
            event_pool: Arc::new(EventPool::new(params.usize(Parameter::EventPoolSize))),
            params,
            events: GenuineEventProvider::new(),
            timer,
            thread_pool: Arc::new(GenericThreadPool::new(thread_pool_config)),
            responses,
            traffic: TrafficCounters::default(),
            subscriptions: Mutex::new(subscriptions),
        })
    }

    /// Records the identity a remote host reported. If it changed, the host restarted: its
    ///  security sessions are gone, outstanding requests to it fail and `ServerRestartDetected`
    ///  is fired. The caller is responsible for releasing the host's connections.
    pub fn report_remote_identity(&self, host: &Arc<HostInformation>, host_id: Uuid, unique_id: u32) -> bool {
        if !host.update_remote_identity(host_id, unique_id) {
            return false;
        }

        warn!("remote host {} restarted", host.uri());
        let error = TransportError::ServerRestarted { uri: host.uri().to_string() };
        self.responses.fail_host(host.uri(), &error);
        self.events.fire(GenuineEvent::new(GenuineEventKind::ServerRestartDetected, Some(host.clone()))
            .with_error(error));
        true
    }

    /// stops periodic housekeeping for the context's own registries
    pub fn shutdown(&self) {
        self.subscriptions.lock().unwrap().clear();
    }
}
