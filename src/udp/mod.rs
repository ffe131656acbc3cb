pub mod stream_assembled;
pub mod udp_config;
pub mod udp_connection_manager;
pub mod udp_header;
