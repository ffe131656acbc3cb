use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::time::Instant;
use tracing::trace;
use crate::buffers::event_pool::Event;
use crate::error::{Result, TransportError};
use crate::host_information::HostInformation;
use crate::security::parameters::SecuritySessionParameters;
use crate::util::buf::{put_string, try_get_string};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageMode {
    /// the sender waits for session establishment (and, for requests, for the reply)
    Synchronous = 0,
    Asynchronous = 1,
    /// fire and forget: there is never a reply
    OneWay = 2,
}

/// One logical unit of outbound communication.
///
/// A message is created per call, and consumed by [crate::manager::connection_manager::ConnectionManager::send].
///  Once it is serialized, its content is fixed: re-sending it (e.g. after a security session
///  was established, or on a reestablished connection) re-uses the serialized bytes.
pub struct Message {
    id: u64,
    recipient: Arc<HostInformation>,
    sender: Option<Arc<HostInformation>>,
    service_name: String,
    payload: Bytes,
    reply_to_id: Option<u64>,
    mode: MessageMode,
    security_session_parameters: Option<Arc<SecuritySessionParameters>>,
    finish_deadline: Option<Instant>,
    serialized: Option<Bytes>,
    cancel: Option<Event>,
    tag: Option<Arc<dyn Any + Send + Sync>>,
    connection_name: Option<String>,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message{{id:{}, to:{}, service:{}, mode:{:?}, {} bytes}}", self.id, self.recipient.uri(), self.service_name, self.mode, self.payload.len())
    }
}

impl Message {
    pub fn new(recipient: Arc<HostInformation>, service_name: impl Into<String>, payload: impl Into<Bytes>) -> Message {
        Message {
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            recipient,
            sender: None,
            service_name: service_name.into(),
            payload: payload.into(),
            reply_to_id: None,
            mode: MessageMode::Synchronous,
            security_session_parameters: None,
            finish_deadline: None,
            serialized: None,
            cancel: None,
            tag: None,
            connection_name: None,
        }
    }

    /// A reply goes back to the request's sender, through the same security session.
    pub fn reply_to(request: &IncomingMessage, payload: impl Into<Bytes>) -> Message {
        let mut result = Message::new(request.sender.clone(), request.service_name.clone(), payload);
        result.reply_to_id = Some(request.id);
        result.mode = MessageMode::OneWay;
        result.security_session_parameters = Some(Arc::new(SecuritySessionParameters::new(
            request.session_name.clone(),
            Default::default(),
            None,
        )));
        result
    }

    pub fn with_mode(mut self, mode: MessageMode) -> Message {
        self.mode = mode;
        self
    }

    pub fn with_security_session_parameters(mut self, parameters: Arc<SecuritySessionParameters>) -> Message {
        self.security_session_parameters = Some(parameters);
        self
    }

    pub fn with_cancel(mut self, cancel: Event) -> Message {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_tag(mut self, tag: Arc<dyn Any + Send + Sync>) -> Message {
        self.tag = Some(tag);
        self
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Message {
        self.connection_name = Some(name.into());
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn recipient(&self) -> &Arc<HostInformation> {
        &self.recipient
    }

    pub fn sender(&self) -> Option<&Arc<HostInformation>> {
        self.sender.as_ref()
    }

    pub fn set_sender(&mut self, sender: Arc<HostInformation>) {
        self.sender = Some(sender);
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn reply_to_id(&self) -> Option<u64> {
        self.reply_to_id
    }

    pub fn mode(&self) -> MessageMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: MessageMode) {
        self.mode = mode;
    }

    pub fn security_session_parameters(&self) -> Option<&Arc<SecuritySessionParameters>> {
        self.security_session_parameters.as_ref()
    }

    pub fn set_security_session_parameters(&mut self, parameters: Arc<SecuritySessionParameters>) {
        self.security_session_parameters = Some(parameters);
    }

    /// Computes the deadline on the first call only, so that a re-sent message keeps the
    ///  deadline of its first attempt.
    pub fn init_finish_deadline(&mut self, timeout: Duration) -> Instant {
        *self.finish_deadline.get_or_insert_with(|| Instant::now() + timeout)
    }

    pub fn finish_deadline(&self) -> Option<Instant> {
        self.finish_deadline
    }

    pub fn serialized(&self) -> Option<&Bytes> {
        self.serialized.as_ref()
    }

    pub fn set_serialized(&mut self, serialized: Bytes) {
        self.serialized = Some(serialized);
    }

    pub fn cancel(&self) -> Option<&Event> {
        self.cancel.as_ref()
    }

    pub fn tag(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.tag.as_ref()
    }

    pub fn connection_name(&self) -> Option<&str> {
        self.connection_name.as_deref()
    }
}


/// The per-message header inside the session-transformed part of a serialized message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_id: u64,
    pub reply_to_id: Option<u64>,
    pub mode: MessageMode,
    pub service_name: String,
    pub compressed: bool,
}

impl Envelope {
    const FLAG_COMPRESSED: u8 = 0x01;
    const MODE_SHIFT: u8 = 1;
    const MODE_MASK: u8 = 0x06;

    pub const COMPRESSION_LEVEL: i32 = 3;

    pub fn for_message(message: &Message) -> Envelope {
        Envelope {
            message_id: message.id,
            reply_to_id: message.reply_to_id,
            mode: message.mode,
            service_name: message.service_name.clone(),
            compressed: false,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let mut flags = u8::from(self.mode) << Self::MODE_SHIFT;
        if self.compressed {
            flags |= Self::FLAG_COMPRESSED;
        }
        buf.put_u8(flags);
        buf.put_u64(self.message_id);
        buf.put_u64(self.reply_to_id.unwrap_or(0));
        put_string(buf, &self.service_name);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<Envelope> {
        let flags = buf.try_get_u8()?;
        if flags & !(Self::FLAG_COMPRESSED | Self::MODE_MASK) != 0 {
            return Err(TransportError::malformed(format!("unsupported envelope flags {:x}", flags)));
        }
        let mode = MessageMode::try_from_primitive((flags & Self::MODE_MASK) >> Self::MODE_SHIFT)
            .map_err(|e| TransportError::malformed(format!("invalid message mode {}", e.number)))?;
        let message_id = buf.try_get_u64()?;
        let reply_to_id = match buf.try_get_u64()? {
            0 => None,
            id => Some(id),
        };
        let service_name = try_get_string(buf)?;

        Ok(Envelope {
            message_id,
            reply_to_id,
            mode,
            service_name,
            compressed: flags & Self::FLAG_COMPRESSED != 0,
        })
    }

    /// Writes envelope and payload, compressing the payload if requested and if compression
    ///  actually saves space.
    pub fn write_body(mut self, payload: &[u8], compress: bool, buf: &mut BytesMut) -> Result<()> {
        let compressed = if compress {
            let compressed = zstd::encode_all(payload, Self::COMPRESSION_LEVEL)?;
            if compressed.len() < payload.len() {
                Some(compressed)
            }
            else {
                trace!("compression does not save space - sending uncompressed");
                None
            }
        }
        else {
            None
        };

        self.compressed = compressed.is_some();
        self.ser(buf);
        match compressed {
            Some(compressed) => buf.put_slice(&compressed),
            None => buf.put_slice(payload),
        }
        Ok(())
    }

    /// Returns the (decompressed) payload following the envelope in `buf`.
    pub fn read_payload(&self, buf: Bytes, max_content_size: usize) -> Result<Bytes> {
        if !self.compressed {
            return Ok(buf);
        }

        let mut result = Vec::new();
        zstd::Decoder::new(buf.as_ref())
            .and_then(|decoder| decoder.take(max_content_size as u64 + 1).read_to_end(&mut result))
            .map_err(|e| TransportError::malformed(format!("invalid compressed payload: {}", e)))?;
        if result.len() > max_content_size {
            return Err(TransportError::malformed(format!("decompressed payload exceeds the maximum content size of {} bytes", max_content_size)));
        }
        Ok(result.into())
    }
}


/// A decoded inbound message, as it is handed to services and response processors
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: u64,
    pub reply_to_id: Option<u64>,
    pub mode: MessageMode,
    pub service_name: String,
    pub session_name: String,
    pub sender: Arc<HostInformation>,
    pub payload: Bytes,
}
