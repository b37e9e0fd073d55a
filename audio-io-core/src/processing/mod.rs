pub mod audio_buffer;
pub mod codec;
