use std::net::{Ipv4Addr, SocketAddr};
use anyhow::bail;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};

pub struct UdpConfig {
    pub bind_addr: SocketAddr,

    /// If set, the socket joins this IPv4 multicast group on `multicast_interface`. The bind
    ///  address must be an IPv4 address then, typically `0.0.0.0` with the group's port.
    pub multicast_group: Option<Ipv4Addr>,
    pub multicast_interface: Ipv4Addr,

    /// messages to [crate::udp::udp_connection_manager::UdpConnectionManager::MULTICAST_URI]
    ///  are sent here
    pub multicast_target: Option<SocketAddr>,
}

impl UdpConfig {
    pub fn new(bind_addr: SocketAddr) -> UdpConfig {
        UdpConfig {
            bind_addr,
            multicast_group: None,
            multicast_interface: Ipv4Addr::UNSPECIFIED,
            multicast_target: None,
        }
    }

    pub fn with_multicast_group(mut self, group: Ipv4Addr, interface: Ipv4Addr) -> UdpConfig {
        self.multicast_group = Some(group);
        self.multicast_interface = interface;
        self
    }

    pub fn with_multicast_target(mut self, target: SocketAddr) -> UdpConfig {
        self.multicast_target = Some(target);
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(group) = &self.multicast_group {
            if !group.is_multicast() {
                bail!("{} is not a multicast address", group);
            }
            if !self.bind_addr.is_ipv4() {
                bail!("joining an IPv4 multicast group requires an IPv4 bind address, was {}", self.bind_addr);
            }
        }
        if let Some(target) = &self.multicast_target {
            if !target.ip().is_multicast() {
                bail!("multicast target {} is not a multicast address", target);
            }
        }
        Ok(())
    }

    /// Creates the bound, non-blocking socket, joining the multicast group if one is configured.
    pub fn create_socket(&self) -> anyhow::Result<std::net::UdpSocket> {
        self.validate()?;

        let domain = match self.bind_addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&self.bind_addr.into())?;

        if let Some(group) = &self.multicast_group {
            debug!("joining multicast group {} on interface {}", group, self.multicast_interface);
            socket.join_multicast_v4(group, &self.multicast_interface)?;
            socket.set_multicast_loop_v4(true)?;
        }

        let socket: std::net::UdpSocket = socket.into();
        info!("bound UDP socket to {:?}", socket.local_addr()?);
        Ok(socket)
    }
}
