pub mod framing;
pub mod handshake;
pub mod tcp_config;
pub mod tcp_connection_manager;
