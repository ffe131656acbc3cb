pub mod connection_manager;
pub mod context;
pub mod dispatcher;
pub mod response_processor;
pub mod service;
pub mod traffic;
pub mod transport;
