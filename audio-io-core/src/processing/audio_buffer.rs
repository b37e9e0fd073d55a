/// Planar multi-channel f32 buffer.
///
/// All channels share one allocation and always have the same frame count.
/// `resize` and `clear` reuse the existing allocation whenever it is large
/// enough, so a buffer sized up front never allocates on the audio thread.
#[derive(Debug, Clone, Default)]
pub struct AudioBuffer {
    data: Vec<f32>,
    channels: usize,
    frames: usize,
}

impl AudioBuffer {
    /// Create a zeroed buffer.
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            data: vec![0.0; channels * frames],
            channels,
            frames,
        }
    }

    /// Create an empty buffer that can later be resized up to
    /// `channels * frames` samples without allocating.
    pub fn with_capacity(channels: usize, frames: usize) -> Self {
        let mut buffer = Self::new(channels, frames);
        buffer.channels = 0;
        buffer.frames = 0;
        buffer
    }

    pub fn channel_count(&self) -> usize {
        self.channels
    }

    pub fn frame_count(&self) -> usize {
        self.frames
    }

    /// Samples storable without reallocating.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels == 0 || self.frames == 0
    }

    /// Whether `channels * frames` fits the current allocation.
    pub fn fits(&self, channels: usize, frames: usize) -> bool {
        channels * frames <= self.data.len()
    }

    /// Change the shape. Allocates only when the new shape exceeds capacity;
    /// never shrinks the allocation. Contents are unspecified afterwards.
    ///
    /// Returns `true` if the allocation grew.
    pub fn resize(&mut self, channels: usize, frames: usize) -> bool {
        let needed = channels * frames;
        let grew = needed > self.data.len();
        if grew {
            self.data.resize(needed, 0.0);
        }
        self.channels = channels;
        self.frames = frames;
        grew
    }

    /// Zero every active sample.
    pub fn clear(&mut self) {
        let len = self.channels * self.frames;
        self.data[..len].fill(0.0);
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        let start = index * self.frames;
        &self.data[start..start + self.frames]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        let start = index * self.frames;
        &mut self.data[start..start + self.frames]
    }

    pub fn channels(&self) -> impl Iterator<Item = &[f32]> {
        let frames = self.frames.max(1);
        self.data[..self.channels * self.frames]
            .chunks_exact(frames)
            .take(self.channels)
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        let frames = self.frames.max(1);
        let channels = self.channels;
        self.data[..channels * self.frames]
            .chunks_exact_mut(frames)
            .take(channels)
    }

    pub fn fill(&mut self, value: f32) {
        let len = self.channels * self.frames;
        self.data[..len].fill(value);
    }

    /// Copy the overlapping region of `other` into `self`, zeroing the rest.
    pub fn copy_from(&mut self, other: &AudioBuffer) {
        self.clear();
        let channels = self.channels.min(other.channels);
        let frames = self.frames.min(other.frames);
        for ch in 0..channels {
            self.channel_mut(ch)[..frames].copy_from_slice(&other.channel(ch)[..frames]);
        }
    }

    /// Sum `other` into `self` sample by sample over the overlapping region.
    pub fn accumulate(&mut self, other: &AudioBuffer) {
        let channels = self.channels.min(other.channels);
        let frames = self.frames.min(other.frames);
        for ch in 0..channels {
            let src = &other.channel(ch)[..frames];
            for (d, s) in self.channel_mut(ch)[..frames].iter_mut().zip(src) {
                *d += *s;
            }
        }
    }

    /// Largest absolute sample across all channels.
    pub fn peak(&self) -> f32 {
        self.data[..self.channels * self.frames]
            .iter()
            .map(|s| s.abs())
            .fold(0.0f32, f32::max)
    }
}
