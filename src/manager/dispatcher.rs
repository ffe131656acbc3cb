use std::sync::{Arc, Weak};
use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, span, trace, warn, Instrument, Level};
use crate::config::Parameter;
use crate::error::{Result, TransportError};
use crate::events::{GenuineEvent, GenuineEventKind};
use crate::host_information::HostInformation;
use crate::manager::connection_manager::ConnectionManager;
use crate::manager::service::ServerServiceEntry;
use crate::manager::transport::IncomingStreamHandler;
use crate::message::{Envelope, IncomingMessage, Message, MessageMode};
use crate::security::session::EstablishmentProbe;
use crate::util::buf::try_get_string;

/// Handles complete inbound streams: security session, envelope, and routing to either the
///  waiting requester or a registered service.
pub struct InboundDispatcher {
    manager: Weak<ConnectionManager>,
}

impl InboundDispatcher {
    pub fn new(manager: Weak<ConnectionManager>) -> InboundDispatcher {
        InboundDispatcher {
            manager,
        }
    }
}

impl IncomingStreamHandler for InboundDispatcher {
    fn on_stream(&self, sender: Arc<HostInformation>, content: Bytes) {
        let Some(manager) = self.manager.upgrade() else {
            debug!("connection manager is gone - dropping inbound stream from {}", sender.uri());
            return;
        };

        let span = span!(Level::TRACE, "inbound", from = sender.uri());
        tokio::spawn(async move {
            let uri = sender.uri().to_string();
            if let Err(e) = dispatch(&manager, sender, content).await {
                warn!("dropping inbound message from {}: {}", uri, e);
            }
        }.instrument(span));
    }
}

async fn dispatch(manager: &ConnectionManager, sender: Arc<HostInformation>, content: Bytes) -> Result<()> {
    manager.check_not_disposed()?;
    let ctx = manager.ctx();

    let total_len = content.len();
    let mut content = content;
    let session_name = try_get_string(&mut content)?;

    let session = manager.session_for(&sender, &session_name)?;
    match session.begin_establishment() {
        EstablishmentProbe::Established => {}
        EstablishmentProbe::Failed(e) => return Err(e),
        EstablishmentProbe::Pending => {
            let deadline = Instant::now() + ctx.params.duration(Parameter::InvocationTimeout);
            manager.wait_for_session(&session, None, deadline, sender.uri()).await?;
        }
    }

    let mut body = BytesMut::from(content.as_ref());
    session.decrypt(&mut body)?;
    let mut body = body.freeze();

    let envelope = Envelope::try_deser(&mut body)?;
    let payload = envelope.read_payload(body, ctx.params.usize(Parameter::MaxContentSize))?;

    ctx.traffic.on_received(total_len);
    sender.renew(ctx.hosts.renewing_span());

    let incoming = IncomingMessage {
        id: envelope.message_id,
        reply_to_id: envelope.reply_to_id,
        mode: envelope.mode,
        service_name: envelope.service_name,
        session_name,
        sender,
        payload,
    };
    trace!("received message {} for service '{}'", incoming.id, incoming.service_name);

    if let Some(reply_to_id) = incoming.reply_to_id {
        ctx.responses.complete(reply_to_id, incoming);
        return Ok(());
    }

    let Some(service) = manager.services().get(&incoming.service_name) else {
        ctx.events.fire(GenuineEvent::new(GenuineEventKind::UnknownService, Some(incoming.sender.clone()))
            .with_additional_info(incoming.service_name.clone()));
        return Err(TransportError::UnknownService(incoming.service_name));
    };

    let is_one_way = incoming.mode == MessageMode::OneWay;
    let (incoming, reply) = invoke(manager, service, incoming).await?;
    match reply {
        Some(payload) if !is_one_way => manager.send(Message::reply_to(&incoming, payload)).await,
        Some(_) => {
            debug!("service '{}' returned a reply to one-way message {} - discarding", incoming.service_name, incoming.id);
            Ok(())
        }
        None => Ok(()),
    }
}

/// runs the service on the generic thread pool: it may block
async fn invoke(manager: &ConnectionManager, service: Arc<dyn ServerServiceEntry>, incoming: IncomingMessage) -> Result<(IncomingMessage, Option<Bytes>)> {
    let service_name = incoming.service_name.clone();
    let (send, recv) = oneshot::channel();
    manager.ctx().thread_pool.queue_user_work_item(move || {
        let reply = service.handle(&incoming);
        let _ = send.send((incoming, reply));
    }, false)?;

    recv.await
        .map_err(|_| TransportError::Logic(format!("service '{}' panicked", service_name)))
}
