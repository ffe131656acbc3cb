pub mod general_connection;
pub mod message_container;
pub mod physical_connection;
pub mod storage;
