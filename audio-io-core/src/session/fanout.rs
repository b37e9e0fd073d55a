use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::audio_models::ProcessFormat;
use crate::processing::audio_buffer::AudioBuffer;
use crate::traits::consumer::AudioConsumer;

type ConsumerList = Arc<Vec<Arc<dyn AudioConsumer>>>;

/// Result of driving the consumers for one callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutOutcome {
    /// No consumers; output is silence.
    Silent,
    /// Output holds the sum of every consumer.
    Processed,
    /// Consumer at this position panicked; output is silence.
    Fault { consumer: usize },
}

/// Drives every registered consumer from one realtime callback and sums
/// their output.
///
/// The consumer list is copy-on-write. Edits build a new list and swap it
/// in; the realtime side only clones the current `Arc` under a short lock.
/// Replaced lists are kept in `retired` until no callback holds them, so the
/// realtime thread never frees a list.
pub struct CallbackFanout {
    /// Serialises edits and prepare/stop notifications.
    edit: Mutex<()>,
    current: Mutex<ConsumerList>,
    retired: Mutex<Vec<ConsumerList>>,
    /// Set while the session is running.
    format: Mutex<Option<ProcessFormat>>,
}

fn same_consumer(a: &Arc<dyn AudioConsumer>, b: &Arc<dyn AudioConsumer>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl Default for CallbackFanout {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackFanout {
    pub fn new() -> Self {
        Self {
            edit: Mutex::new(()),
            current: Mutex::new(Arc::new(Vec::new())),
            retired: Mutex::new(Vec::new()),
            format: Mutex::new(None),
        }
    }

    /// Register a consumer. If a run is in progress it is prepared first, so
    /// its first `process` already sees the current format.
    ///
    /// Returns `false` if it was already registered.
    pub fn add_consumer(&self, consumer: Arc<dyn AudioConsumer>) -> bool {
        let _edit = self.edit.lock();
        let list = Arc::clone(&self.current.lock());
        if list.iter().any(|c| same_consumer(c, &consumer)) {
            return false;
        }
        if let Some(format) = *self.format.lock() {
            consumer.prepare(&format);
        }
        let mut next = Vec::with_capacity(list.len() + 1);
        next.extend(list.iter().cloned());
        next.push(consumer);
        drop(list);
        self.publish(next);
        true
    }

    /// Unregister a consumer and notify it "stopped". The change takes
    /// effect from the next callback. Returns `false` if it was not registered.
    pub fn remove_consumer(&self, consumer: &Arc<dyn AudioConsumer>) -> bool {
        let _edit = self.edit.lock();
        let list = Arc::clone(&self.current.lock());
        let Some(position) = list.iter().position(|c| same_consumer(c, consumer)) else {
            return false;
        };
        let mut next: Vec<_> = list.iter().cloned().collect();
        let removed = next.remove(position);
        drop(list);
        self.publish(next);
        removed.stopped();
        true
    }

    pub fn consumer_count(&self) -> usize {
        self.current.lock().len()
    }

    pub fn format(&self) -> Option<ProcessFormat> {
        *self.format.lock()
    }

    /// Begin a run: record the format and prepare every consumer.
    pub fn prepare_all(&self, format: ProcessFormat) {
        let _edit = self.edit.lock();
        *self.format.lock() = Some(format);
        let list = Arc::clone(&self.current.lock());
        for consumer in list.iter() {
            consumer.prepare(&format);
        }
    }

    /// End a run: notify every consumer and free retired lists.
    pub fn stop_all(&self) {
        let _edit = self.edit.lock();
        *self.format.lock() = None;
        let list = Arc::clone(&self.current.lock());
        for consumer in list.iter() {
            consumer.stopped();
        }
        self.purge_retired();
    }

    fn publish(&self, next: Vec<Arc<dyn AudioConsumer>>) {
        let previous = std::mem::replace(&mut *self.current.lock(), Arc::new(next));
        let mut retired = self.retired.lock();
        retired.push(previous);
        // Only `retired` holds these, so no callback can reach them any more.
        retired.retain(|list| Arc::strong_count(list) > 1);
    }

    fn purge_retired(&self) {
        self.retired.lock().retain(|list| Arc::strong_count(list) > 1);
    }

    /// Lists replaced but possibly still held by an in-flight callback.
    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Run every consumer for one callback.
    ///
    /// The first consumer renders straight into `output`; each further one
    /// renders into `scratch` (at least one channel, `output`'s frame count),
    /// which is summed into `output`. A panicking consumer silences the whole
    /// callback. Realtime safe as long as `scratch` already has capacity.
    pub fn process(
        &self,
        input: &AudioBuffer,
        output: &mut AudioBuffer,
        scratch: &mut AudioBuffer,
    ) -> FanoutOutcome {
        let consumers = Arc::clone(&self.current.lock());
        output.clear();

        let Some((first, rest)) = consumers.split_first() else {
            return FanoutOutcome::Silent;
        };

        if !run_consumer(first, input, output) {
            output.clear();
            return FanoutOutcome::Fault { consumer: 0 };
        }

        for (index, consumer) in rest.iter().enumerate() {
            scratch.resize(output.channel_count().max(1), output.frame_count());
            scratch.clear();
            if !run_consumer(consumer, input, scratch) {
                output.clear();
                return FanoutOutcome::Fault {
                    consumer: index + 1,
                };
            }
            output.accumulate(scratch);
        }
        FanoutOutcome::Processed
    }
}

fn run_consumer(consumer: &Arc<dyn AudioConsumer>, input: &AudioBuffer, output: &mut AudioBuffer) -> bool {
    panic::catch_unwind(AssertUnwindSafe(|| consumer.process(input, output))).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Constant {
        value: f32,
        prepared: AtomicUsize,
        stopped: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Constant {
        fn new(value: f32) -> Arc<Self> {
            Arc::new(Self {
                value,
                ..Default::default()
            })
        }
    }

    impl AudioConsumer for Constant {
        fn prepare(&self, _format: &ProcessFormat) {
            self.prepared.fetch_add(1, Ordering::SeqCst);
        }

        fn process(&self, _input: &AudioBuffer, output: &mut AudioBuffer) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            output.fill(self.value);
        }

        fn stopped(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panics;

    impl AudioConsumer for Panics {
        fn prepare(&self, _format: &ProcessFormat) {}
        fn process(&self, _input: &AudioBuffer, _output: &mut AudioBuffer) {
            panic!("consumer failure");
        }
        fn stopped(&self) {}
    }

    fn format() -> ProcessFormat {
        ProcessFormat {
            sample_rate: 48000,
            max_frames: 16,
            input_channels: 0,
            output_channels: 2,
        }
    }

    fn run(fanout: &CallbackFanout) -> (FanoutOutcome, AudioBuffer) {
        let input = AudioBuffer::new(0, 16);
        let mut output = AudioBuffer::new(2, 16);
        output.fill(7.0);
        let mut scratch = AudioBuffer::new(2, 16);
        let outcome = fanout.process(&input, &mut output, &mut scratch);
        (outcome, output)
    }

    #[test]
    fn zero_consumers_produce_silence() {
        let fanout = CallbackFanout::new();
        let (outcome, output) = run(&fanout);
        assert_eq!(outcome, FanoutOutcome::Silent);
        assert_eq!(output.peak(), 0.0);
    }

    #[test]
    fn single_consumer_writes_directly() {
        let fanout = CallbackFanout::new();
        fanout.add_consumer(Constant::new(0.25));
        let (outcome, output) = run(&fanout);
        assert_eq!(outcome, FanoutOutcome::Processed);
        assert!(output.channels().all(|c| c.iter().all(|s| *s == 0.25)));
    }

    #[test]
    fn n_consumers_sum_to_n() {
        for n in 2..=5 {
            let fanout = CallbackFanout::new();
            for _ in 0..n {
                fanout.add_consumer(Constant::new(1.0));
            }
            let (outcome, output) = run(&fanout);
            assert_eq!(outcome, FanoutOutcome::Processed);
            assert!(output.channels().all(|c| c.iter().all(|s| *s == n as f32)));
        }
    }

    #[test]
    fn panicking_consumer_silences_callback() {
        let fanout = CallbackFanout::new();
        fanout.add_consumer(Constant::new(1.0));
        fanout.add_consumer(Arc::new(Panics));
        let (outcome, output) = run(&fanout);
        assert_eq!(outcome, FanoutOutcome::Fault { consumer: 1 });
        assert_eq!(output.peak(), 0.0);
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let fanout = CallbackFanout::new();
        let consumer: Arc<dyn AudioConsumer> = Constant::new(1.0);
        assert!(fanout.add_consumer(Arc::clone(&consumer)));
        assert!(!fanout.add_consumer(Arc::clone(&consumer)));
        assert_eq!(fanout.consumer_count(), 1);
    }

    #[test]
    fn registering_during_a_run_prepares_immediately() {
        let fanout = CallbackFanout::new();
        let early = Constant::new(1.0);
        fanout.add_consumer(early.clone());
        assert_eq!(early.prepared.load(Ordering::SeqCst), 0);

        fanout.prepare_all(format());
        assert_eq!(early.prepared.load(Ordering::SeqCst), 1);

        let late = Constant::new(1.0);
        fanout.add_consumer(late.clone());
        assert_eq!(late.prepared.load(Ordering::SeqCst), 1);

        fanout.stop_all();
        assert_eq!(early.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(late.stopped.load(Ordering::SeqCst), 1);
        assert!(fanout.format().is_none());
    }

    #[test]
    fn removal_notifies_and_applies_to_next_callback() {
        let fanout = CallbackFanout::new();
        let a = Constant::new(1.0);
        let b = Constant::new(1.0);
        let handle_b: Arc<dyn AudioConsumer> = b.clone();
        fanout.add_consumer(a.clone());
        fanout.add_consumer(Arc::clone(&handle_b));

        assert!(fanout.remove_consumer(&handle_b));
        assert!(!fanout.remove_consumer(&handle_b));
        assert_eq!(b.stopped.load(Ordering::SeqCst), 1);

        let (_, output) = run(&fanout);
        assert_eq!(output.channel(0)[0], 1.0);
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn retired_lists_are_freed_off_the_callback() {
        let fanout = CallbackFanout::new();
        fanout.add_consumer(Constant::new(1.0));
        fanout.add_consumer(Constant::new(1.0));
        // Nothing held them, so each edit already dropped the previous list.
        assert_eq!(fanout.retired_count(), 0);

        let held = Arc::clone(&fanout.current.lock());
        fanout.add_consumer(Constant::new(1.0));
        assert_eq!(fanout.retired_count(), 1);

        drop(held);
        fanout.stop_all();
        assert_eq!(fanout.retired_count(), 0);
    }

    #[test]
    fn removed_consumer_is_released_immediately() {
        let fanout = CallbackFanout::new();
        let consumer = Constant::new(1.0);
        let handle: Arc<dyn AudioConsumer> = consumer.clone();

        fanout.add_consumer(Arc::clone(&handle));
        assert!(fanout.remove_consumer(&handle));
        drop(handle);

        assert_eq!(fanout.retired_count(), 0);
        assert_eq!(Arc::strong_count(&consumer), 1);
    }
}
