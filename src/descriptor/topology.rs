//! The parsed device model: control and streaming interfaces and their entities.

use tracing::{debug, warn};

use super::request::{parse_range_response, ControlSetup, SampleRateRange};
use super::{CS_SAM_FREQ_CONTROL, RANGE};
use crate::transport::UsbTransport;

/// Channel count used when the topology does not say.
pub(crate) const DEFAULT_CHANNELS: u8 = 2;

/// Subslot size in bytes used when no format descriptor is present.
pub(crate) const DEFAULT_SUBSLOT_SIZE: u8 = 4;

/// Transfer direction of an endpoint, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

/// Isochronous synchronization type (bmAttributes bits 3:2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    /// No synchronization.
    None,
    /// Asynchronous; the device clock is master.
    Async,
    /// Adaptive.
    Adaptive,
    /// Synchronous.
    Sync,
}

/// Isochronous usage type (bmAttributes bits 5:4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageType {
    /// Data endpoint.
    Data,
    /// Explicit feedback endpoint.
    Feedback,
    /// Data endpoint that also carries implicit feedback.
    ImplicitFeedback,
    /// Reserved encoding.
    Reserved,
}

/// Class-specific endpoint-general descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointGeneral {
    /// bmAttributes.
    pub attributes: u8,
    /// bmControls.
    pub controls: u8,
    /// bLockDelayUnits.
    pub lock_delay_units: u8,
    /// wLockDelay.
    pub lock_delay: u16,
}

/// A streaming endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// bEndpointAddress (bit 7 set for IN).
    pub address: u8,
    /// bmAttributes.
    pub attributes: u8,
    /// wMaxPacketSize in bytes.
    pub max_packet_size: u16,
    /// bInterval, as a power-of-two exponent in microframes.
    pub interval: u8,
    /// The class-specific endpoint descriptor, if present.
    pub general: Option<EndpointGeneral>,
}

impl Endpoint {
    /// Direction from the address' top bit.
    pub fn direction(&self) -> Direction {
        if self.address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Returns true for IN endpoints.
    pub fn is_in(&self) -> bool {
        self.direction() == Direction::In
    }

    /// Returns true if the transfer type is isochronous.
    pub fn is_isochronous(&self) -> bool {
        self.attributes & 0x03 == 0x01
    }

    /// Synchronization type.
    pub fn sync_type(&self) -> SyncType {
        match (self.attributes >> 2) & 0x03 {
            0 => SyncType::None,
            1 => SyncType::Async,
            2 => SyncType::Adaptive,
            _ => SyncType::Sync,
        }
    }

    /// Usage type.
    pub fn usage_type(&self) -> UsageType {
        match (self.attributes >> 4) & 0x03 {
            0 => UsageType::Data,
            1 => UsageType::Feedback,
            2 => UsageType::ImplicitFeedback,
            _ => UsageType::Reserved,
        }
    }

    /// Returns true if this looks like a feedback endpoint.
    ///
    /// Besides the explicit usage bits, an IN endpoint declared with no sync
    /// type and data usage is also taken as feedback. Some devices describe
    /// their feedback endpoint that way.
    pub fn is_feedback(&self) -> bool {
        match self.usage_type() {
            UsageType::Feedback => true,
            UsageType::Data => self.is_in() && self.sync_type() == SyncType::None,
            _ => false,
        }
    }

    /// Returns true if this endpoint carries audio samples.
    pub fn is_data(&self) -> bool {
        !self.is_feedback()
    }

    /// Number of microframes between packets: 2^(bInterval - 1).
    pub fn packet_interval(&self) -> u32 {
        let exponent = u32::from(self.interval.clamp(1, 16)) - 1;
        1 << exponent
    }
}

/// Class-specific AC interface header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcHeader {
    /// bcdADC.
    pub adc_release: u16,
    /// bCategory.
    pub category: u8,
    /// wTotalLength of the class-specific descriptors.
    pub total_length: u16,
    /// bmControls.
    pub controls: u8,
}

/// A clock source entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockSource {
    /// bClockID.
    pub id: u8,
    /// bmAttributes.
    pub attributes: u8,
    /// bmControls.
    pub controls: u8,
    /// bAssocTerminal.
    pub assoc_terminal: u8,
    /// Interface number of the owning control interface.
    pub interface: u8,
}

impl ClockSource {
    /// Setup packet for a RANGE request on this clock's sample rate control.
    pub fn range_request(&self) -> ControlSetup {
        ControlSetup::class_in(RANGE, CS_SAM_FREQ_CONTROL, self.id, self.interface)
    }

    /// Queries the sample-rate ranges this clock source supports.
    ///
    /// Claims the owning interface around the request.
    pub fn query_ranges(
        &self,
        transport: &dyn UsbTransport,
    ) -> Result<Vec<SampleRateRange>, crate::Uac2Error> {
        transport.claim_interface(self.interface)?;
        let mut buf = [0u8; 64];
        let result = transport.control_in(self.range_request(), &mut buf);
        if let Err(e) = transport.release_interface(self.interface) {
            warn!(interface = self.interface, error = %e, "failed to release interface");
        }
        let length = result?.min(buf.len());
        Ok(parse_range_response(&buf[..length])?)
    }
}

/// An input terminal entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputTerminal {
    /// bTerminalID.
    pub id: u8,
    /// wTerminalType.
    pub terminal_type: u16,
    /// bAssocTerminal.
    pub assoc_terminal: u8,
    /// bCSourceID.
    pub clock_id: u8,
    /// bNrChannels.
    pub nr_channels: u8,
    /// bmChannelConfig.
    pub channel_config: u32,
    /// bmControls.
    pub controls: u16,
}

/// An output terminal entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTerminal {
    /// bTerminalID.
    pub id: u8,
    /// wTerminalType.
    pub terminal_type: u16,
    /// bAssocTerminal.
    pub assoc_terminal: u8,
    /// bSourceID.
    pub source_id: u8,
    /// bCSourceID.
    pub clock_id: u8,
    /// bmControls.
    pub controls: u16,
}

/// A feature unit entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureUnit {
    /// bUnitID.
    pub id: u8,
    /// bSourceID.
    pub source_id: u8,
    /// bmaControls, master channel first.
    pub controls: Vec<u32>,
}

/// A unit the topology records but does not model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsupportedUnit {
    /// bDescriptorSubtype.
    pub subtype: u8,
    /// The unit or clock ID (byte 3), if the record had one.
    pub id: Option<u8>,
}

/// An audio control interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlInterface {
    /// bInterfaceNumber.
    pub number: u8,
    /// bAlternateSetting.
    pub alternate: u8,
    /// The class-specific header, if present.
    pub header: Option<AcHeader>,
    /// Clock sources in descriptor order.
    pub clock_sources: Vec<ClockSource>,
    /// Input terminals in descriptor order.
    pub input_terminals: Vec<InputTerminal>,
    /// Output terminals in descriptor order.
    pub output_terminals: Vec<OutputTerminal>,
    /// Feature units in descriptor order.
    pub feature_units: Vec<FeatureUnit>,
    /// Mixers, selectors and other units that are not modelled.
    pub unsupported: Vec<UnsupportedUnit>,
}

/// Class-specific AS general descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AsGeneral {
    /// bTerminalLink.
    pub terminal_link: u8,
    /// bmControls.
    pub controls: u8,
    /// bFormatType.
    pub format_type: u8,
    /// bmFormats.
    pub formats: u32,
    /// bNrChannels.
    pub nr_channels: u8,
    /// bmChannelConfig.
    pub channel_config: u32,
}

/// Type I format descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatTypeI {
    /// bFormatType.
    pub format_type: u8,
    /// bSubslotSize in bytes.
    pub subslot_size: u8,
    /// bBitResolution.
    pub bit_resolution: u8,
}

/// One alternate setting of an audio streaming interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingInterface {
    /// bInterfaceNumber.
    pub number: u8,
    /// bAlternateSetting.
    pub alternate: u8,
    /// bNumEndpoints as declared.
    pub num_endpoints: u8,
    /// The class-specific general descriptor, if present.
    pub general: Option<AsGeneral>,
    /// The format descriptor, if present.
    pub format: Option<FormatTypeI>,
    /// Endpoints in descriptor order.
    pub endpoints: Vec<Endpoint>,
}

impl StreamingInterface {
    /// The terminal this interface streams to or from, if known.
    pub fn terminal_link(&self) -> Option<u8> {
        self.general.map(|g| g.terminal_link)
    }

    /// Bytes per sample per channel (default 4).
    pub fn subslot_size(&self) -> u8 {
        self.format
            .map(|f| f.subslot_size)
            .filter(|&s| s > 0)
            .unwrap_or(DEFAULT_SUBSLOT_SIZE)
    }

    /// Valid bits per sample, if known.
    pub fn bit_resolution(&self) -> Option<u8> {
        self.format.map(|f| f.bit_resolution)
    }
}

/// The parsed audio function of a configuration descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    /// Audio control interfaces in descriptor order.
    pub control_interfaces: Vec<ControlInterface>,
    /// Audio streaming interfaces (every alternate setting) in descriptor order.
    pub streaming_interfaces: Vec<StreamingInterface>,
}

impl Topology {
    /// Audio class version from the first control header's bcdADC.
    pub fn audio_class_version(&self) -> u8 {
        let release = self
            .control_interfaces
            .iter()
            .find_map(|c| c.header)
            .map(|h| h.adc_release);
        match release {
            Some(0x0200) => 2,
            _ => 1,
        }
    }

    /// All clock sources across all control interfaces.
    pub fn clock_sources(&self) -> impl Iterator<Item = &ClockSource> {
        self.control_interfaces
            .iter()
            .flat_map(|c| c.clock_sources.iter())
    }

    /// Looks up an input terminal by ID.
    pub fn find_input_terminal(&self, id: u8) -> Option<&InputTerminal> {
        self.control_interfaces
            .iter()
            .flat_map(|c| c.input_terminals.iter())
            .find(|t| t.id == id)
    }

    /// Looks up an output terminal by ID.
    pub fn find_output_terminal(&self, id: u8) -> Option<&OutputTerminal> {
        self.control_interfaces
            .iter()
            .flat_map(|c| c.output_terminals.iter())
            .find(|t| t.id == id)
    }

    /// Looks up a feature unit by ID.
    pub fn find_feature_unit(&self, id: u8) -> Option<&FeatureUnit> {
        self.control_interfaces
            .iter()
            .flat_map(|c| c.feature_units.iter())
            .find(|u| u.id == id)
    }

    /// Returns true if any control interface has units that are not modelled.
    pub fn has_unsupported_units(&self) -> bool {
        self.control_interfaces
            .iter()
            .any(|c| !c.unsupported.is_empty())
    }

    /// The zero-bandwidth alternate setting of an interface, if declared.
    pub fn idle_alternate(&self, interface: u8) -> Option<u8> {
        self.streaming_interfaces
            .iter()
            .find(|s| s.number == interface && s.num_endpoints == 0)
            .map(|s| s.alternate)
    }

    /// Channel count of a playback interface.
    ///
    /// Follows the terminal link to an input terminal; defaults to 2.
    pub fn output_channel_count(&self, streaming: &StreamingInterface) -> u8 {
        streaming
            .terminal_link()
            .and_then(|id| self.find_input_terminal(id))
            .map(|t| t.nr_channels)
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_CHANNELS)
    }

    /// Channel count of a capture interface.
    ///
    /// Follows output terminal → feature unit → input terminal, one hop past
    /// the feature unit and no further; defaults to 2.
    pub fn input_channel_count(&self, streaming: &StreamingInterface) -> u8 {
        streaming
            .terminal_link()
            .and_then(|id| self.find_output_terminal(id))
            .and_then(|out| self.find_feature_unit(out.source_id))
            .and_then(|fu| self.find_input_terminal(fu.source_id))
            .map(|t| t.nr_channels)
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_CHANNELS)
    }

    /// Finds the first clock source that supports `rate`.
    ///
    /// Clock sources whose RANGE request fails are logged and skipped.
    pub fn find_clock_source(
        &self,
        transport: &dyn UsbTransport,
        rate: u32,
    ) -> Option<&ClockSource> {
        self.clock_sources().find(|clock| match clock.query_ranges(transport) {
            Ok(ranges) => {
                let supported = ranges.iter().any(|r| r.contains(rate));
                debug!(clock = clock.id, rate, supported, "checked clock source");
                supported
            }
            Err(e) => {
                warn!(clock = clock.id, error = %e, "failed to enumerate sample rates");
                false
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{parse, ConfigDescriptorBuilder};
    use crate::transport::MockTransport;

    fn endpoint(address: u8, attributes: u8) -> Endpoint {
        Endpoint {
            address,
            attributes,
            max_packet_size: 64,
            interval: 1,
            general: None,
        }
    }

    #[test]
    fn test_endpoint_attributes() {
        let ep = endpoint(0x01, 0x05);
        assert_eq!(ep.direction(), Direction::Out);
        assert!(ep.is_isochronous());
        assert_eq!(ep.sync_type(), SyncType::Async);
        assert_eq!(ep.usage_type(), UsageType::Data);
        assert!(ep.is_data());
    }

    #[test]
    fn test_explicit_feedback_endpoint() {
        let ep = endpoint(0x81, 0x11);
        assert!(ep.is_in());
        assert!(ep.is_feedback());
    }

    #[test]
    fn test_in_endpoint_without_sync_is_feedback() {
        let ep = endpoint(0x82, 0x01);
        assert!(ep.is_feedback());
        // Same attributes on an OUT endpoint carry data
        let out = endpoint(0x02, 0x01);
        assert!(out.is_data());
    }

    #[test]
    fn test_async_in_endpoint_is_data() {
        let ep = endpoint(0x82, 0x05);
        assert!(ep.is_data());
    }

    #[test]
    fn test_packet_interval() {
        let mut ep = endpoint(0x01, 0x05);
        ep.interval = 1;
        assert_eq!(ep.packet_interval(), 1);
        ep.interval = 4;
        assert_eq!(ep.packet_interval(), 8);
        ep.interval = 0;
        assert_eq!(ep.packet_interval(), 1);
    }

    #[test]
    fn test_subslot_default() {
        let iface = StreamingInterface::default();
        assert_eq!(iface.subslot_size(), 4);
    }

    #[test]
    fn test_channel_defaults_without_terminals() {
        let topology = Topology::default();
        let iface = StreamingInterface {
            general: Some(AsGeneral {
                terminal_link: 9,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(topology.output_channel_count(&iface), 2);
        assert_eq!(topology.input_channel_count(&iface), 2);
    }

    #[test]
    fn test_input_channel_one_hop() {
        let topology = Topology {
            control_interfaces: vec![ControlInterface {
                input_terminals: vec![InputTerminal {
                    id: 1,
                    terminal_type: 0x0201,
                    assoc_terminal: 0,
                    clock_id: 5,
                    nr_channels: 1,
                    channel_config: 0,
                    controls: 0,
                }],
                feature_units: vec![FeatureUnit {
                    id: 2,
                    source_id: 1,
                    controls: vec![0, 0],
                }],
                output_terminals: vec![OutputTerminal {
                    id: 3,
                    terminal_type: 0x0101,
                    assoc_terminal: 0,
                    source_id: 2,
                    clock_id: 5,
                    controls: 0,
                }],
                ..Default::default()
            }],
            streaming_interfaces: Vec::new(),
        };
        let iface = StreamingInterface {
            general: Some(AsGeneral {
                terminal_link: 3,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(topology.input_channel_count(&iface), 1);
    }

    #[test]
    fn test_audio_class_version() {
        let mut topology = Topology::default();
        assert_eq!(topology.audio_class_version(), 1);
        topology.control_interfaces.push(ControlInterface {
            header: Some(AcHeader {
                adc_release: 0x0200,
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(topology.audio_class_version(), 2);
    }

    #[test]
    fn test_find_clock_source_picks_matching_clock() {
        let bytes = ConfigDescriptorBuilder::new()
            .control_interface(0)
            .header(0x0200)
            .clock_source(3, 0x01, 0x07)
            .clock_source(5, 0x01, 0x07)
            .clock_source(7, 0x01, 0x07)
            .build();
        let topology = parse(&bytes).unwrap();
        // Clock 3 has no ranges, so its RANGE request stalls
        let mock = MockTransport::new(bytes)
            .with_clock(5, vec![SampleRateRange::discrete(44100)], 44100)
            .with_clock(7, vec![SampleRateRange::discrete(48000)], 48000);

        assert_eq!(topology.find_clock_source(&mock, 48000).map(|c| c.id), Some(7));
        assert_eq!(topology.find_clock_source(&mock, 44100).map(|c| c.id), Some(5));
        assert!(topology.find_clock_source(&mock, 96000).is_none());
        assert!(mock.claimed_interfaces().is_empty());
    }
}
