pub mod negotiator;
pub mod plan;
pub mod stream;
