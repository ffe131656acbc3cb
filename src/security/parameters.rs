use std::sync::Arc;
use std::time::Duration;
use bitflags::bitflags;
use crate::host_information::HostInformation;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SecuritySessionAttributes: u8 {
        /// treat every message as synchronous, regardless of the message's own preference
        const FORCE_SYNC = 0x01;
        /// treat every message as asynchronous, regardless of the message's own preference
        const FORCE_ASYNC = 0x02;
        const ENABLE_COMPRESSION = 0x04;
    }
}

/// Declarative description of the security session a message is sent through. Immutable once
///  attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecuritySessionParameters {
    name: String,
    attributes: SecuritySessionAttributes,
    timeout: Option<Duration>,
}

impl SecuritySessionParameters {
    /// The name under which the pass-through session is registered with every connection manager
    pub const DEFAULT_NAME: &'static str = "/none";

    pub fn new(name: impl Into<String>, attributes: SecuritySessionAttributes, timeout: Option<Duration>) -> SecuritySessionParameters {
        SecuritySessionParameters {
            name: name.into(),
            attributes,
            timeout,
        }
    }

    pub fn global_default() -> Arc<SecuritySessionParameters> {
        Arc::new(SecuritySessionParameters::new(Self::DEFAULT_NAME, SecuritySessionAttributes::empty(), None))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> SecuritySessionAttributes {
        self.attributes
    }

    /// `None` means the transport's configured invocation timeout applies
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The cascade for a message's parameters: the message's own, then the recipient's, then
    ///  the transport context's, then the global default.
    pub fn resolve(
        on_message: Option<&Arc<SecuritySessionParameters>>,
        recipient: &HostInformation,
        transport_context: Option<&Arc<SecuritySessionParameters>>,
    ) -> Arc<SecuritySessionParameters> {
        if let Some(p) = on_message {
            return p.clone();
        }
        if let Some(p) = recipient.security_session_parameters() {
            return p;
        }
        if let Some(p) = transport_context {
            return p.clone();
        }
        Self::global_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn params(name: &str) -> Arc<SecuritySessionParameters> {
        Arc::new(SecuritySessionParameters::new(name, SecuritySessionAttributes::empty(), None))
    }

    #[rstest]
    #[case::message_wins(Some("msg"), Some("host"), Some("ctx"), "msg")]
    #[case::recipient(None, Some("host"), Some("ctx"), "host")]
    #[case::transport_context(None, None, Some("ctx"), "ctx")]
    #[case::global_default(None, None, None, SecuritySessionParameters::DEFAULT_NAME)]
    fn test_resolve(#[case] on_message: Option<&str>, #[case] on_host: Option<&str>, #[case] on_context: Option<&str>, #[case] expected: &str) {
        let host = HostInformation::new("gudp://127.0.0.1:1", Duration::from_secs(1));
        host.set_security_session_parameters(on_host.map(params));

        let on_message = on_message.map(params);
        let on_context = on_context.map(params);

        let resolved = SecuritySessionParameters::resolve(on_message.as_ref(), &host, on_context.as_ref());
        assert_eq!(resolved.name(), expected);
    }
}
