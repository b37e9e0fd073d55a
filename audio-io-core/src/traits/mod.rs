pub mod backend;
pub mod consumer;
pub mod session_delegate;
