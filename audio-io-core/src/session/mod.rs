pub mod audio_session;
pub(crate) mod callback;
pub mod fanout;
pub mod guard;

pub use callback::FAULT_QUEUE_CAPACITY;
