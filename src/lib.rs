pub mod buffers;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod host_information;
pub mod manager;
pub mod message;
pub mod security;
pub mod tcp;
pub mod thread_pool;
pub mod timer;
pub mod udp;
pub mod util;
