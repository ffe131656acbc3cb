pub mod buffer_pool;
pub mod event_pool;
