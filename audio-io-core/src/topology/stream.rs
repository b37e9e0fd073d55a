use std::sync::Arc;

use crate::backend::registry::{DeviceLease, DeviceRegistry};
use crate::models::audio_models::{Latency, TopologyKind};
use crate::models::error::{EngineError, EngineResult};
use crate::topology::plan::{LegPlan, TopologyPlan};
use crate::traits::backend::{NativeFormat, NativeStream, StreamCallbacks};

/// One opened native stream.
pub struct TopologyLeg {
    plan: LegPlan,
    stream: Box<dyn NativeStream>,
    frames: usize,
    running: bool,
    // Dropped after `stream` so the device outlives its stream.
    _lease: DeviceLease,
}

impl TopologyLeg {
    pub fn plan(&self) -> &LegPlan {
        &self.plan
    }

    /// Frames per callback: the larger of negotiated and realised.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn latency(&self) -> Option<Latency> {
        self.stream.latency()
    }
}

/// The opened streams of a [`TopologyPlan`].
///
/// Dropping it disposes every native stream and releases the device leases,
/// whether or not it was ever started.
pub struct StreamTopology {
    kind: TopologyKind,
    legs: Vec<TopologyLeg>,
    driver: usize,
}

impl StreamTopology {
    /// Open every leg of `plan`, leasing devices from `registry`.
    ///
    /// `callbacks_for` supplies the realtime callbacks of each leg, by index.
    /// If any leg fails to open, the legs already opened are disposed.
    pub fn open<F>(
        plan: &TopologyPlan,
        registry: &DeviceRegistry,
        mut callbacks_for: F,
    ) -> EngineResult<Self>
    where
        F: FnMut(usize, &LegPlan) -> Arc<dyn StreamCallbacks>,
    {
        let mut legs = Vec::with_capacity(plan.legs.len());
        for (index, leg) in plan.legs.iter().enumerate() {
            let lease = registry.lease(&leg.config.device_id)?;
            leg.config.validate_against(lease.capabilities())?;

            let format = NativeFormat::from_config(&leg.config);
            if !lease.handle().supports_format(&format) {
                return Err(EngineError::UnsupportedFormat(format!(
                    "'{}' does not accept {:?}",
                    lease.id(),
                    format
                )));
            }
            let range = lease.handle().buffer_size(&format);
            if !range.contains(format.frames) {
                return Err(EngineError::UnsupportedFormat(format!(
                    "'{}' cannot run {} frames per callback at {} Hz (range [{}, {}])",
                    lease.id(),
                    format.frames,
                    format.sample_rate,
                    range.min,
                    range.max
                )));
            }

            let stream = lease
                .handle()
                .open_stream(&format, callbacks_for(index, leg))
                .map_err(|e| match e {
                    EngineError::StreamOpenFailure(_) => e,
                    other => EngineError::StreamOpenFailure(other.to_string()),
                })?;

            let realized = stream.frames_per_buffer();
            if realized != format.frames {
                log::info!(
                    "'{}' realised {} frames per callback (negotiated {})",
                    lease.id(),
                    realized,
                    format.frames
                );
            }

            legs.push(TopologyLeg {
                plan: leg.clone(),
                stream,
                frames: realized.max(format.frames) as usize,
                running: false,
                _lease: lease,
            });
        }

        Ok(Self {
            kind: plan.kind,
            legs,
            driver: plan.driver_index(),
        })
    }

    pub fn kind(&self) -> TopologyKind {
        self.kind
    }

    pub fn legs(&self) -> &[TopologyLeg] {
        &self.legs
    }

    pub fn driver(&self) -> &TopologyLeg {
        &self.legs[self.driver]
    }

    /// Largest frames-per-callback across legs.
    pub fn max_frames(&self) -> usize {
        self.legs.iter().map(|leg| leg.frames).max().unwrap_or(0)
    }

    /// Start feeder legs first so input is flowing when the driver runs.
    pub fn start(&mut self) -> EngineResult<()> {
        let driver = self.driver;
        let order = (0..self.legs.len())
            .filter(|i| *i != driver)
            .chain(std::iter::once(driver));
        for index in order {
            let leg = &mut self.legs[index];
            if leg.running {
                continue;
            }
            if let Err(e) = leg.stream.start() {
                log::error!("failed to start stream on '{}': {}", leg.plan.config.device_id, e);
                let _ = self.stop();
                return Err(e);
            }
            leg.running = true;
        }
        Ok(())
    }

    /// Stop the driver first, then the feeders. Every leg is stopped even if
    /// one fails; the first error is returned.
    pub fn stop(&mut self) -> EngineResult<()> {
        let driver = self.driver;
        let order = std::iter::once(driver).chain((0..self.legs.len()).filter(|i| *i != driver));
        let mut first_error = None;
        for index in order {
            let leg = &mut self.legs[index];
            if !leg.running {
                continue;
            }
            leg.running = false;
            if let Err(e) = leg.stream.stop() {
                log::error!("failed to stop stream on '{}': {}", leg.plan.config.device_id, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Input latency is the worst of the input legs; output latency is the driver's.
    /// `None` until the driver has reported.
    pub fn latency(&self) -> Option<Latency> {
        let driver = self.driver().latency()?;
        let input_frames = self
            .legs
            .iter()
            .filter(|leg| leg.plan.config.has_input())
            .filter_map(|leg| leg.latency())
            .map(|l| l.input_frames)
            .max()
            .unwrap_or(driver.input_frames);
        Some(Latency {
            input_frames,
            output_frames: driver.output_frames,
        })
    }
}

impl Drop for StreamTopology {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Open `plan` against `registry`. See [`StreamTopology::open`].
pub fn open_topology<F>(
    plan: &TopologyPlan,
    registry: &DeviceRegistry,
    callbacks_for: F,
) -> EngineResult<StreamTopology>
where
    F: FnMut(usize, &LegPlan) -> Arc<dyn StreamCallbacks>,
{
    StreamTopology::open(plan, registry, callbacks_for)
}
