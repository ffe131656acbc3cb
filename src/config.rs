use std::time::Duration;
use anyhow::bail;
use rustc_hash::FxHashMap;
use crate::udp::udp_header::{CompatibilityPrefix, UdpHeader};

/// The fixed set of configuration keys the transport core reads. Each key has a documented
///  default and a fixed value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    /// default deadline for a message, applied unless its security session parameters specify
    ///  a timeout of their own
    InvocationTimeout,
    /// incomplete UDP streams older than this are discarded by the expiry sweep
    UdpAssemblyTimeout,
    /// payload bytes per UDP datagram, including the chunk header
    UdpMtu,
    UdpReceiveBufferSize,
    /// prefix every UDP stream with the sender's host id and unique id
    CompatibilityMode,
    ClosePersistentConnectionAfterInactivity,
    MaxQueuedItems,
    MaxContentSize,
    ConnectTimeout,
    ReconnectionTries,
    SleepBetweenReconnections,
    HostRenewingSpan,
    BufferPoolSize,
    EventPoolSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterValue {
    Duration(Duration),
    Usize(usize),
    Bool(bool),
}

impl Parameter {
    pub const ALL: [Parameter; 14] = [
        Parameter::InvocationTimeout,
        Parameter::UdpAssemblyTimeout,
        Parameter::UdpMtu,
        Parameter::UdpReceiveBufferSize,
        Parameter::CompatibilityMode,
        Parameter::ClosePersistentConnectionAfterInactivity,
        Parameter::MaxQueuedItems,
        Parameter::MaxContentSize,
        Parameter::ConnectTimeout,
        Parameter::ReconnectionTries,
        Parameter::SleepBetweenReconnections,
        Parameter::HostRenewingSpan,
        Parameter::BufferPoolSize,
        Parameter::EventPoolSize,
    ];

    pub fn default_value(&self) -> ParameterValue {
        match self {
            Parameter::InvocationTimeout => ParameterValue::Duration(Duration::from_secs(120)),
            Parameter::UdpAssemblyTimeout => ParameterValue::Duration(Duration::from_secs(30)),
            Parameter::UdpMtu => ParameterValue::Usize(4500),
            Parameter::UdpReceiveBufferSize => ParameterValue::Usize(64 * 1024),
            Parameter::CompatibilityMode => ParameterValue::Bool(false),
            Parameter::ClosePersistentConnectionAfterInactivity => ParameterValue::Duration(Duration::from_secs(100)),
            Parameter::MaxQueuedItems => ParameterValue::Usize(100),
            Parameter::MaxContentSize => ParameterValue::Usize(16 * 1024 * 1024),
            Parameter::ConnectTimeout => ParameterValue::Duration(Duration::from_secs(20)),
            Parameter::ReconnectionTries => ParameterValue::Usize(5),
            Parameter::SleepBetweenReconnections => ParameterValue::Duration(Duration::from_millis(500)),
            Parameter::HostRenewingSpan => ParameterValue::Duration(Duration::from_secs(180)),
            Parameter::BufferPoolSize => ParameterValue::Usize(128),
            Parameter::EventPoolSize => ParameterValue::Usize(64),
        }
    }
}

/// Keyed configuration lookup. Populating a provider is the caller's job; the core only reads.
///
/// Implementations must return a value of the key's type - the typed accessors fall back to
///  the key's default otherwise.
pub trait ParameterProvider: Send + Sync + 'static {
    fn get(&self, key: Parameter) -> ParameterValue;

    fn duration(&self, key: Parameter) -> Duration {
        match self.get(key) {
            ParameterValue::Duration(d) => d,
            _ => match key.default_value() {
                ParameterValue::Duration(d) => d,
                other => panic!("parameter {:?} is not a duration: {:?}", key, other),
            }
        }
    }

    fn usize(&self, key: Parameter) -> usize {
        match self.get(key) {
            ParameterValue::Usize(n) => n,
            _ => match key.default_value() {
                ParameterValue::Usize(n) => n,
                other => panic!("parameter {:?} is not a number: {:?}", key, other),
            }
        }
    }

    fn bool(&self, key: Parameter) -> bool {
        match self.get(key) {
            ParameterValue::Bool(b) => b,
            _ => match key.default_value() {
                ParameterValue::Bool(b) => b,
                other => panic!("parameter {:?} is not a flag: {:?}", key, other),
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DefaultParameterProvider {
    overrides: FxHashMap<Parameter, ParameterValue>,
}

impl DefaultParameterProvider {
    pub fn new() -> DefaultParameterProvider {
        Default::default()
    }

    pub fn with(mut self, key: Parameter, value: ParameterValue) -> DefaultParameterProvider {
        self.overrides.insert(key, value);
        self
    }

    pub fn set(&mut self, key: Parameter, value: ParameterValue) {
        self.overrides.insert(key, value);
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (key, value) in &self.overrides {
            if std::mem::discriminant(value) != std::mem::discriminant(&key.default_value()) {
                bail!("parameter {:?} has a value of the wrong type: {:?}", key, value);
            }
            if let ParameterValue::Duration(d) = value {
                if d.is_zero() {
                    bail!("parameter {:?} must not be zero", key);
                }
            }
        }

        let min_mtu = UdpHeader::SERIALIZED_LEN + CompatibilityPrefix::MIN_SERIALIZED_LEN + 1;
        if self.usize(Parameter::UdpMtu) < min_mtu {
            bail!("UDP MTU must be at least {} bytes", min_mtu);
        }
        if self.usize(Parameter::UdpReceiveBufferSize) < self.usize(Parameter::UdpMtu) {
            bail!("UDP receive buffer must be able to hold a full datagram");
        }
        if self.usize(Parameter::MaxQueuedItems) == 0 {
            bail!("the send queue must hold at least one message");
        }
        Ok(())
    }
}

impl ParameterProvider for DefaultParameterProvider {
    fn get(&self, key: Parameter) -> ParameterValue {
        self.overrides.get(&key)
            .copied()
            .unwrap_or_else(|| key.default_value())
    }
}
