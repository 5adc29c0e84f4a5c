//! USB Audio Class 2 descriptor parsing and topology.
//!
//! [`parse`] turns a raw configuration descriptor into a [`Topology`]: the
//! audio control interfaces (clock sources, terminals, feature units) and the
//! audio streaming interfaces (endpoints and formats). Entities reference each
//! other by numeric ID and are looked up by scanning.
//!
//! [`ConfigDescriptorBuilder`] does the reverse and is what the mock transport
//! and the tests use to describe a device.

mod builder;
mod parser;
mod request;
mod topology;

pub use builder::{ConfigDescriptorBuilder, EndpointSpec};
pub use parser::parse;
pub use request::{
    encode_range_response, parse_range_response, ControlSetup, SampleRateRange,
    REQUEST_TYPE_CLASS_INTERFACE_IN, REQUEST_TYPE_CLASS_INTERFACE_OUT,
};
pub use topology::{
    AcHeader, AsGeneral, ClockSource, ControlInterface, Direction, Endpoint, EndpointGeneral,
    FeatureUnit, FormatTypeI, InputTerminal, OutputTerminal, StreamingInterface, SyncType,
    Topology, UnsupportedUnit, UsageType,
};

/// Standard descriptor type: interface.
pub const DT_INTERFACE: u8 = 0x04;
/// Standard descriptor type: endpoint.
pub const DT_ENDPOINT: u8 = 0x05;
/// Standard descriptor type: configuration.
pub const DT_CONFIGURATION: u8 = 0x02;
/// Standard descriptor type: interface association.
pub const DT_INTERFACE_ASSOCIATION: u8 = 0x0B;
/// Class-specific interface descriptor.
pub const CS_INTERFACE: u8 = 0x24;
/// Class-specific endpoint descriptor.
pub const CS_ENDPOINT: u8 = 0x25;

/// Interface class code for audio.
pub const AUDIO: u8 = 0x01;
/// Audio interface subclass: control.
pub const AUDIOCONTROL: u8 = 0x01;
/// Audio interface subclass: streaming.
pub const AUDIOSTREAMING: u8 = 0x02;
/// Interface protocol for Audio Class 2.0.
pub const IP_VERSION_02_00: u8 = 0x20;

/// AC descriptor subtype: header.
pub const HEADER: u8 = 0x01;
/// AC descriptor subtype: input terminal.
pub const INPUT_TERMINAL: u8 = 0x02;
/// AC descriptor subtype: output terminal.
pub const OUTPUT_TERMINAL: u8 = 0x03;
/// AC descriptor subtype: mixer unit.
pub const MIXER_UNIT: u8 = 0x04;
/// AC descriptor subtype: selector unit.
pub const SELECTOR_UNIT: u8 = 0x05;
/// AC descriptor subtype: feature unit.
pub const FEATURE_UNIT: u8 = 0x06;
/// AC descriptor subtype: effect unit.
pub const EFFECT_UNIT: u8 = 0x07;
/// AC descriptor subtype: processing unit.
pub const PROCESSING_UNIT: u8 = 0x08;
/// AC descriptor subtype: extension unit.
pub const EXTENSION_UNIT: u8 = 0x09;
/// AC descriptor subtype: clock source.
pub const CLOCK_SOURCE: u8 = 0x0A;
/// AC descriptor subtype: clock selector.
pub const CLOCK_SELECTOR: u8 = 0x0B;
/// AC descriptor subtype: clock multiplier.
pub const CLOCK_MULTIPLIER: u8 = 0x0C;
/// AC descriptor subtype: sample rate converter.
pub const SAMPLE_RATE_CONVERTER: u8 = 0x0D;

/// AS descriptor subtype: general.
pub const AS_GENERAL: u8 = 0x01;
/// AS descriptor subtype: format type.
pub const FORMAT_TYPE: u8 = 0x02;
/// Format type code I (PCM).
pub const FORMAT_TYPE_I: u8 = 0x01;

/// CS endpoint descriptor subtype: general.
pub const EP_GENERAL: u8 = 0x01;

/// Class request: current setting.
pub const CUR: u8 = 0x01;
/// Class request: supported range.
pub const RANGE: u8 = 0x02;
/// Clock source control selector: sampling frequency.
pub const CS_SAM_FREQ_CONTROL: u8 = 0x01;

/// USB terminal type: streaming.
pub const TERMINAL_USB_STREAMING: u16 = 0x0101;
/// Output terminal type: speaker.
pub const TERMINAL_SPEAKER: u16 = 0x0301;
/// Input terminal type: microphone.
pub const TERMINAL_MICROPHONE: u16 = 0x0201;
