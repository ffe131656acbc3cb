use std::net::SocketAddr;

#[derive(Debug, Clone, Default)]
pub struct TcpConfig {
    /// Inbound connections are accepted on this address. Without it, the manager only connects
    ///  out, and remote hosts reach it over those connections.
    pub listen_addr: Option<SocketAddr>,
    pub no_delay: bool,
}

impl TcpConfig {
    pub fn client() -> TcpConfig {
        TcpConfig {
            listen_addr: None,
            no_delay: true,
        }
    }

    pub fn listening_on(listen_addr: SocketAddr) -> TcpConfig {
        TcpConfig {
            listen_addr: Some(listen_addr),
            no_delay: true,
        }
    }
}
