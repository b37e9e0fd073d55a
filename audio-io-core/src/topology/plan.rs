use serde::Serialize;

use crate::models::audio_models::TopologyKind;
use crate::models::capabilities::DeviceCapabilities;
use crate::models::config::StreamConfig;
use crate::models::error::{EngineError, EngineResult};

/// A negotiated config together with the device it was negotiated against.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDevice {
    pub config: StreamConfig,
    pub capabilities: DeviceCapabilities,
}

impl ResolvedDevice {
    pub fn new(config: StreamConfig, capabilities: DeviceCapabilities) -> Self {
        Self {
            config,
            capabilities,
        }
    }

    fn id(&self) -> &str {
        &self.config.device_id
    }
}

/// What a leg's callback does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LegRole {
    /// Runs the consumers. Exactly one per topology.
    Driver,
    /// Only delivers input into the shared staging buffer.
    Feeder,
}

/// One native stream of a topology.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegPlan {
    pub config: StreamConfig,
    pub role: LegRole,
    /// First channel of the unified input buffer this leg's inputs occupy.
    pub input_offset: usize,
}

/// Topology decided from negotiated configs, before anything is opened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyPlan {
    pub kind: TopologyKind,
    pub legs: Vec<LegPlan>,
    pub sample_rate: u32,
    /// Channels of the unified input buffer.
    pub input_channels: usize,
    pub output_channels: usize,
}

impl TopologyPlan {
    pub fn driver_index(&self) -> usize {
        self.legs
            .iter()
            .position(|leg| leg.role == LegRole::Driver)
            .unwrap_or(0)
    }

    pub fn configs(&self) -> Vec<StreamConfig> {
        self.legs.iter().map(|leg| leg.config.clone()).collect()
    }

    /// `(device id, first channel, channel count)` for every leg with inputs,
    /// in channel order.
    pub fn input_map(&self) -> Vec<(String, usize, usize)> {
        let mut map: Vec<_> = self
            .legs
            .iter()
            .filter(|leg| leg.config.has_input())
            .map(|leg| {
                (
                    leg.config.device_id.clone(),
                    leg.input_offset,
                    leg.config.input_channels as usize,
                )
            })
            .collect();
        map.sort_by_key(|(_, offset, _)| *offset);
        map
    }

    fn single(kind: TopologyKind, config: StreamConfig) -> Self {
        Self {
            kind,
            sample_rate: config.sample_rate,
            input_channels: config.input_channels as usize,
            output_channels: config.output_channels as usize,
            legs: vec![LegPlan {
                config,
                role: LegRole::Driver,
                input_offset: 0,
            }],
        }
    }
}

/// Decide the topology for a primary device and zero or more secondary
/// input devices.
///
/// In order: no inputs gives `Output`; no outputs and no secondaries gives
/// `Input`; inputs and outputs on one full-duplex device gives `FullDuplex`;
/// a single secondary on the primary's full-duplex device also gives
/// `FullDuplex`; devices that all support aggregation give `Aggregate`.
/// Anything else is [`EngineError::NoCompatibleTopology`].
///
/// Aggregate input channels are laid out with the primary device first,
/// then each secondary in the order given.
pub fn plan_topology(
    primary: &ResolvedDevice,
    secondaries: &[ResolvedDevice],
) -> EngineResult<TopologyPlan> {
    if let Some(bad) = secondaries.iter().find(|s| s.config.has_output()) {
        return Err(EngineError::NoCompatibleTopology(format!(
            "secondary device '{}' requests outputs; only the primary device renders output",
            bad.id()
        )));
    }

    let primary_inputs = primary.config.input_channels as usize;
    let secondary_inputs: usize = secondaries
        .iter()
        .map(|s| s.config.input_channels as usize)
        .sum();
    let has_outputs = primary.config.has_output();

    if primary_inputs + secondary_inputs == 0 {
        return Ok(TopologyPlan::single(TopologyKind::Output, primary.config.clone()));
    }

    if !has_outputs && secondaries.is_empty() {
        return Ok(TopologyPlan::single(TopologyKind::Input, primary.config.clone()));
    }

    let full_duplex = primary.capabilities.supports_full_duplex;

    if secondaries.is_empty() && full_duplex {
        return Ok(TopologyPlan::single(TopologyKind::FullDuplex, primary.config.clone()));
    }

    if let [secondary] = secondaries {
        if has_outputs && full_duplex && secondary.id() == primary.id() {
            let inputs = primary.config.input_channels + secondary.config.input_channels;
            if inputs > primary.capabilities.max_input_channels {
                return Err(EngineError::UnsupportedFormat(format!(
                    "{} input channels requested on '{}', which has {}",
                    inputs,
                    primary.id(),
                    primary.capabilities.max_input_channels
                )));
            }
            let config = StreamConfig {
                input_channels: inputs,
                ..primary.config.clone()
            };
            return Ok(TopologyPlan::single(TopologyKind::FullDuplex, config));
        }
    }

    let all_aggregate = std::iter::once(primary)
        .chain(secondaries)
        .all(|d| d.capabilities.supports_aggregation);
    if !all_aggregate {
        let missing: Vec<&str> = std::iter::once(primary)
            .chain(secondaries)
            .filter(|d| !d.capabilities.supports_aggregation)
            .map(|d| d.id())
            .collect();
        return Err(EngineError::NoCompatibleTopology(format!(
            "full duplex unavailable and aggregation unsupported by {}",
            missing.join(", ")
        )));
    }

    plan_aggregate(primary, secondaries, primary_inputs + secondary_inputs)
}

fn plan_aggregate(
    primary: &ResolvedDevice,
    secondaries: &[ResolvedDevice],
    input_channels: usize,
) -> EngineResult<TopologyPlan> {
    let sample_rate = primary.config.sample_rate;
    if let Some(other) = secondaries.iter().find(|s| s.config.sample_rate != sample_rate) {
        return Err(EngineError::NoCompatibleTopology(format!(
            "'{}' runs at {} Hz but '{}' at {} Hz",
            other.id(),
            other.config.sample_rate,
            primary.id(),
            sample_rate
        )));
    }

    let mut legs = Vec::with_capacity(secondaries.len() + 2);
    let mut offset = 0;
    let primary_inputs = primary.config.input_channels;

    if primary.config.has_output() {
        if primary_inputs > 0 && primary.capabilities.supports_full_duplex {
            legs.push(LegPlan {
                config: primary.config.clone(),
                role: LegRole::Driver,
                input_offset: 0,
            });
        } else {
            legs.push(LegPlan {
                config: StreamConfig {
                    input_channels: 0,
                    ..primary.config.clone()
                },
                role: LegRole::Driver,
                input_offset: 0,
            });
            if primary_inputs > 0 {
                legs.push(LegPlan {
                    config: StreamConfig {
                        output_channels: 0,
                        ..primary.config.clone()
                    },
                    role: LegRole::Feeder,
                    input_offset: 0,
                });
            }
        }
        offset += primary_inputs as usize;
    } else if primary_inputs > 0 {
        legs.push(LegPlan {
            config: primary.config.clone(),
            role: LegRole::Driver,
            input_offset: 0,
        });
        offset += primary_inputs as usize;
    }

    for secondary in secondaries.iter().filter(|s| s.config.has_input()) {
        let role = if legs.is_empty() {
            LegRole::Driver
        } else {
            LegRole::Feeder
        };
        legs.push(LegPlan {
            config: secondary.config.clone(),
            role,
            input_offset: offset,
        });
        offset += secondary.config.input_channels as usize;
    }

    Ok(TopologyPlan {
        kind: TopologyKind::Aggregate,
        legs,
        sample_rate,
        input_channels,
        output_channels: primary.config.output_channels as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::virtual_device::VirtualDeviceSpec;
    use crate::models::config::StreamRequest;
    use crate::topology::negotiator::negotiate;

    fn resolve(caps: DeviceCapabilities, request: StreamRequest) -> ResolvedDevice {
        let config = negotiate(&caps, &request).unwrap();
        ResolvedDevice::new(config, caps)
    }

    #[test]
    fn no_inputs_is_output_only() {
        let caps = VirtualDeviceSpec::duplex("card", 2, 2).build();
        let plan = plan_topology(&resolve(caps, StreamRequest::output("card", 2)), &[]).unwrap();
        assert_eq!(plan.kind, TopologyKind::Output);
        assert_eq!(plan.legs.len(), 1);
        assert_eq!(plan.input_channels, 0);
    }

    #[test]
    fn no_outputs_without_secondaries_is_input_only() {
        let caps = VirtualDeviceSpec::input("mic", 2).aggregation(false).build();
        let plan = plan_topology(&resolve(caps, StreamRequest::input("mic", 2)), &[]).unwrap();
        assert_eq!(plan.kind, TopologyKind::Input);
        assert_eq!(plan.input_channels, 2);
        assert_eq!(plan.output_channels, 0);
    }

    #[test]
    fn single_full_duplex_device() {
        let caps = VirtualDeviceSpec::duplex("card", 2, 2).aggregation(false).build();
        let plan =
            plan_topology(&resolve(caps, StreamRequest::duplex("card", 2, 2)), &[]).unwrap();
        assert_eq!(plan.kind, TopologyKind::FullDuplex);
        assert_eq!(plan.legs.len(), 1);
        assert_eq!(plan.legs[0].role, LegRole::Driver);
    }

    #[test]
    fn secondary_on_same_full_duplex_device_merges() {
        let caps = VirtualDeviceSpec::duplex("card", 4, 2).aggregation(false).build();
        let primary = resolve(caps.clone(), StreamRequest::output("card", 2));
        let secondary = resolve(caps, StreamRequest::input("card", 2));

        let plan = plan_topology(&primary, &[secondary]).unwrap();

        assert_eq!(plan.kind, TopologyKind::FullDuplex);
        assert_eq!(plan.legs[0].config.input_channels, 2);
        assert_eq!(plan.legs[0].config.output_channels, 2);
    }

    #[test]
    fn two_devices_without_aggregation_fail() {
        let out = VirtualDeviceSpec::output("speakers", 2).aggregation(false).build();
        let mic = VirtualDeviceSpec::input("mic", 1).aggregation(false).build();
        let primary = resolve(out, StreamRequest::output("speakers", 2));
        let secondary = resolve(mic, StreamRequest::input("mic", 1));

        let err = plan_topology(&primary, &[secondary]).unwrap_err();

        assert!(matches!(err, EngineError::NoCompatibleTopology(_)));
    }

    #[test]
    fn half_duplex_device_without_aggregation_fails() {
        let caps = VirtualDeviceSpec::duplex("card", 2, 2)
            .full_duplex(false)
            .aggregation(false)
            .build();
        let err = plan_topology(&resolve(caps, StreamRequest::duplex("card", 2, 2)), &[])
            .unwrap_err();
        assert!(matches!(err, EngineError::NoCompatibleTopology(_)));
    }

    #[test]
    fn aggregate_assigns_offsets_in_caller_order() {
        let out = VirtualDeviceSpec::duplex("interface", 2, 2).full_duplex(false).build();
        let mic_a = VirtualDeviceSpec::input("mic-a", 1).build();
        let mic_b = VirtualDeviceSpec::input("mic-b", 2).build();
        let primary = resolve(out, StreamRequest::duplex("interface", 2, 2));
        let secondaries = [
            resolve(mic_b, StreamRequest::input("mic-b", 2)),
            resolve(mic_a, StreamRequest::input("mic-a", 1)),
        ];

        let plan = plan_topology(&primary, &secondaries).unwrap();

        assert_eq!(plan.kind, TopologyKind::Aggregate);
        assert_eq!(plan.input_channels, 5);
        assert_eq!(plan.output_channels, 2);
        assert_eq!(plan.legs[plan.driver_index()].config.device_id, "interface");
        assert_eq!(plan.legs[plan.driver_index()].config.input_channels, 0);
        assert_eq!(
            plan.input_map(),
            vec![
                ("interface".to_string(), 0, 2),
                ("mic-b".to_string(), 2, 2),
                ("mic-a".to_string(), 4, 1),
            ]
        );
        assert_eq!(
            plan.legs.iter().filter(|l| l.role == LegRole::Driver).count(),
            1
        );
    }

    #[test]
    fn aggregate_of_inputs_drives_from_first_input() {
        let mic_a = VirtualDeviceSpec::input("mic-a", 1).build();
        let mic_b = VirtualDeviceSpec::input("mic-b", 1).build();
        let primary = resolve(mic_a, StreamRequest::input("mic-a", 1));
        let secondary = resolve(mic_b, StreamRequest::input("mic-b", 1));

        let plan = plan_topology(&primary, &[secondary]).unwrap();

        assert_eq!(plan.kind, TopologyKind::Aggregate);
        assert_eq!(plan.legs[0].role, LegRole::Driver);
        assert_eq!(plan.legs[0].config.device_id, "mic-a");
        assert_eq!(plan.legs[1].input_offset, 1);
    }

    #[test]
    fn aggregate_rejects_mismatched_rates() {
        let out = VirtualDeviceSpec::output("speakers", 2).build();
        let mic = VirtualDeviceSpec::input("mic", 1).sample_rates(&[44100]).build();
        let primary = resolve(out, StreamRequest::output("speakers", 2));
        let secondary = resolve(mic, StreamRequest::input("mic", 1));

        assert!(matches!(
            plan_topology(&primary, &[secondary]),
            Err(EngineError::NoCompatibleTopology(_))
        ));
    }

    #[test]
    fn secondary_outputs_are_rejected() {
        let out = VirtualDeviceSpec::output("speakers", 2).build();
        let other = VirtualDeviceSpec::output("headphones", 2).build();
        let primary = resolve(out, StreamRequest::output("speakers", 2));
        let secondary = resolve(other, StreamRequest::output("headphones", 2));

        assert!(matches!(
            plan_topology(&primary, &[secondary]),
            Err(EngineError::NoCompatibleTopology(_))
        ));
    }
}
