use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;
use crate::error::TransportError;
use crate::host_information::HostInformation;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GenuineEventKind {
    ConnectionEstablished,
    ConnectionClosed,
    /// a persistent connection broke and is being reestablished - messages are queued meanwhile
    ConnectionReestablishing,
    ConnectionReestablished,
    ServerRestartDetected,
    SocketException,
    /// an inbound message was addressed to a service that is not registered
    UnknownService,
}

#[derive(Clone, Debug)]
pub struct GenuineEvent {
    pub kind: GenuineEventKind,
    pub error: Option<TransportError>,
    pub host: Option<Arc<HostInformation>>,
    pub additional_info: Option<String>,
}

impl GenuineEvent {
    pub fn new(kind: GenuineEventKind, host: Option<Arc<HostInformation>>) -> GenuineEvent {
        GenuineEvent {
            kind,
            error: None,
            host,
            additional_info: None,
        }
    }

    pub fn with_error(mut self, error: TransportError) -> GenuineEvent {
        self.error = Some(error);
        self
    }

    pub fn with_additional_info(mut self, info: impl Into<String>) -> GenuineEvent {
        self.additional_info = Some(info.into());
        self
    }
}


/// Fans lifecycle events out to all subscribers. Firing never blocks, and events are lost for
///  subscribers that lag behind by more than the channel capacity.
pub struct GenuineEventProvider {
    sender: broadcast::Sender<GenuineEvent>,
}

impl Default for GenuineEventProvider {
    fn default() -> Self {
        GenuineEventProvider::new()
    }
}

impl GenuineEventProvider {
    pub fn new() -> GenuineEventProvider {
        let (sender, _) = broadcast::channel(256);

        GenuineEventProvider {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GenuineEvent> {
        self.sender.subscribe()
    }

    pub fn fire(&self, event: GenuineEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
