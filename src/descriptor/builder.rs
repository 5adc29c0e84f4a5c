//! Builder for well-formed configuration descriptors.

use super::*;

/// A standard endpoint descriptor to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSpec {
    /// bEndpointAddress.
    pub address: u8,
    /// bmAttributes.
    pub attributes: u8,
    /// wMaxPacketSize.
    pub max_packet_size: u16,
    /// bInterval.
    pub interval: u8,
}

impl EndpointSpec {
    /// Isochronous asynchronous data endpoint, OUT.
    pub fn iso_out(number: u8, max_packet_size: u16, interval: u8) -> Self {
        Self {
            address: number & 0x0F,
            attributes: 0x05,
            max_packet_size,
            interval,
        }
    }

    /// Isochronous asynchronous data endpoint, IN.
    pub fn iso_in(number: u8, max_packet_size: u16, interval: u8) -> Self {
        Self {
            address: 0x80 | (number & 0x0F),
            attributes: 0x05,
            max_packet_size,
            interval,
        }
    }

    /// Isochronous explicit feedback endpoint, IN.
    pub fn feedback(number: u8, max_packet_size: u16, interval: u8) -> Self {
        Self {
            address: 0x80 | (number & 0x0F),
            attributes: 0x11,
            max_packet_size,
            interval,
        }
    }

    /// Replaces bmAttributes.
    pub fn with_attributes(mut self, attributes: u8) -> Self {
        self.attributes = attributes;
        self
    }
}

/// Emits configuration descriptor bytes for an audio function.
///
/// Class-specific records attach to whatever interface or endpoint was added
/// last, mirroring how the parser reads them back. Interface endpoint counts,
/// the configuration's wTotalLength and bNumInterfaces, and the AC header's
/// wTotalLength are filled in by [`ConfigDescriptorBuilder::build`].
///
/// # Example
///
/// ```
/// use uac2_stream::descriptor::{parse, ConfigDescriptorBuilder, EndpointSpec};
///
/// let bytes = ConfigDescriptorBuilder::new()
///     .control_interface(0)
///     .header(0x0200)
///     .clock_source(5, 0x01, 0x07)
///     .streaming_interface(1, 1)
///     .endpoint(EndpointSpec::iso_out(1, 392, 1))
///     .build();
///
/// let topology = parse(&bytes).unwrap();
/// assert_eq!(topology.clock_sources().count(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ConfigDescriptorBuilder {
    bytes: Vec<u8>,
    /// Offset of the most recent interface record.
    interface: Option<usize>,
    /// Offset of the AC header being accumulated.
    header: Option<usize>,
    interface_numbers: Vec<u8>,
}

impl Default for ConfigDescriptorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigDescriptorBuilder {
    /// Starts a configuration with value 1, bus powered.
    pub fn new() -> Self {
        Self {
            bytes: vec![9, DT_CONFIGURATION, 0, 0, 0, 1, 0, 0x80, 50],
            interface: None,
            header: None,
            interface_numbers: Vec::new(),
        }
    }

    fn close_header(&mut self) {
        if let Some(pos) = self.header.take() {
            let total = (self.bytes.len() - pos) as u16;
            self.bytes[pos + 6..pos + 8].copy_from_slice(&total.to_le_bytes());
        }
    }

    fn push_interface(&mut self, number: u8, alternate: u8, class: u8, subclass: u8) {
        self.close_header();
        self.interface = Some(self.bytes.len());
        if !self.interface_numbers.contains(&number) {
            self.interface_numbers.push(number);
        }
        self.bytes.extend_from_slice(&[
            9,
            DT_INTERFACE,
            number,
            alternate,
            0,
            class,
            subclass,
            IP_VERSION_02_00,
            0,
        ]);
    }

    /// Appends a raw record verbatim.
    pub fn raw(mut self, record: &[u8]) -> Self {
        self.bytes.extend_from_slice(record);
        self
    }

    /// Starts an audio control interface.
    pub fn control_interface(mut self, number: u8) -> Self {
        self.push_interface(number, 0, AUDIO, AUDIOCONTROL);
        self
    }

    /// Starts an audio streaming interface alternate setting.
    pub fn streaming_interface(mut self, number: u8, alternate: u8) -> Self {
        self.push_interface(number, alternate, AUDIO, AUDIOSTREAMING);
        self
    }

    /// Starts an interface of some other class.
    pub fn other_interface(mut self, number: u8, class: u8, subclass: u8) -> Self {
        self.push_interface(number, 0, class, subclass);
        self
    }

    /// AC header with the given bcdADC.
    pub fn header(mut self, adc_release: u16) -> Self {
        self.header = Some(self.bytes.len());
        let [lo, hi] = adc_release.to_le_bytes();
        self.bytes
            .extend_from_slice(&[9, CS_INTERFACE, HEADER, lo, hi, 0x08, 0, 0, 0]);
        self
    }

    /// Clock source.
    pub fn clock_source(mut self, id: u8, attributes: u8, controls: u8) -> Self {
        self.bytes
            .extend_from_slice(&[8, CS_INTERFACE, CLOCK_SOURCE, id, attributes, controls, 0, 0]);
        self
    }

    /// Input terminal with the given channel count.
    pub fn input_terminal(mut self, id: u8, terminal_type: u16, clock_id: u8, channels: u8) -> Self {
        let [tlo, thi] = terminal_type.to_le_bytes();
        let config = channel_config(channels).to_le_bytes();
        self.bytes.extend_from_slice(&[
            17,
            CS_INTERFACE,
            INPUT_TERMINAL,
            id,
            tlo,
            thi,
            0,
            clock_id,
            channels,
            config[0],
            config[1],
            config[2],
            config[3],
            0,
            0,
            0,
            0,
        ]);
        self
    }

    /// Output terminal fed by `source_id`.
    pub fn output_terminal(mut self, id: u8, terminal_type: u16, source_id: u8, clock_id: u8) -> Self {
        let [tlo, thi] = terminal_type.to_le_bytes();
        self.bytes.extend_from_slice(&[
            12,
            CS_INTERFACE,
            OUTPUT_TERMINAL,
            id,
            tlo,
            thi,
            0,
            source_id,
            clock_id,
            0,
            0,
            0,
        ]);
        self
    }

    /// Feature unit with mute and volume on the master and each channel.
    pub fn feature_unit(mut self, id: u8, source_id: u8, channels: u8) -> Self {
        let controls = usize::from(channels) + 1;
        let length = 6 + controls * 4;
        self.bytes
            .extend_from_slice(&[length as u8, CS_INTERFACE, FEATURE_UNIT, id, source_id]);
        for _ in 0..controls {
            self.bytes.extend_from_slice(&0x0000_000Fu32.to_le_bytes());
        }
        self.bytes.push(0);
        self
    }

    /// A unit the parser records but does not model (mixer, selector, ...).
    pub fn unit(mut self, subtype: u8, id: u8) -> Self {
        self.bytes
            .extend_from_slice(&[7, CS_INTERFACE, subtype, id, 1, 0, 0]);
        self
    }

    /// AS general descriptor for PCM.
    pub fn as_general(mut self, terminal_link: u8, channels: u8) -> Self {
        let config = channel_config(channels).to_le_bytes();
        self.bytes.extend_from_slice(&[
            16,
            CS_INTERFACE,
            AS_GENERAL,
            terminal_link,
            0,
            FORMAT_TYPE_I,
            0x01,
            0,
            0,
            0,
            channels,
            config[0],
            config[1],
            config[2],
            config[3],
            0,
        ]);
        self
    }

    /// Type I format descriptor.
    pub fn format_type_i(mut self, subslot_size: u8, bit_resolution: u8) -> Self {
        self.bytes.extend_from_slice(&[
            6,
            CS_INTERFACE,
            FORMAT_TYPE,
            FORMAT_TYPE_I,
            subslot_size,
            bit_resolution,
        ]);
        self
    }

    /// Standard endpoint descriptor on the current interface.
    pub fn endpoint(mut self, spec: EndpointSpec) -> Self {
        self.close_header();
        if let Some(pos) = self.interface {
            self.bytes[pos + 4] += 1;
        }
        let [lo, hi] = spec.max_packet_size.to_le_bytes();
        self.bytes.extend_from_slice(&[
            7,
            DT_ENDPOINT,
            spec.address,
            spec.attributes,
            lo,
            hi,
            spec.interval,
        ]);
        self
    }

    /// Class-specific endpoint-general descriptor on the current endpoint.
    pub fn endpoint_general(mut self) -> Self {
        self.bytes
            .extend_from_slice(&[8, CS_ENDPOINT, EP_GENERAL, 0, 0, 0, 0, 0]);
        self
    }

    /// Finishes the descriptor.
    pub fn build(mut self) -> Vec<u8> {
        self.close_header();
        let total = self.bytes.len() as u16;
        self.bytes[2..4].copy_from_slice(&total.to_le_bytes());
        self.bytes[4] = self.interface_numbers.len() as u8;
        self.bytes
    }
}

/// Front-left/front-right style bitmap for the first `channels` positions.
fn channel_config(channels: u8) -> u32 {
    if channels >= 32 {
        u32::MAX
    } else {
        (1u32 << channels) - 1
    }
}
