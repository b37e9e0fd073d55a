pub mod audio_models;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod fault;
pub mod sample;
pub mod state;
