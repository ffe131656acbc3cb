pub mod parameters;
pub mod provider;
pub mod session;
