use crate::models::audio_models::ProcessFormat;
use crate::processing::audio_buffer::AudioBuffer;

/// A processing unit driven by the session's realtime callback.
///
/// `process` runs on the realtime thread: it must not block or allocate.
/// `prepare` and `stopped` run on control threads and may do both.
/// Consumers that keep per-run state use interior mutability.
pub trait AudioConsumer: Send + Sync {
    /// Called before the first `process` of a run with the format in effect.
    fn prepare(&self, format: &ProcessFormat);

    /// Render one period. `output` arrives zeroed and is summed with the
    /// output of every other consumer.
    fn process(&self, input: &AudioBuffer, output: &mut AudioBuffer);

    /// The run ended, or the consumer was unregistered.
    fn stopped(&self);
}
