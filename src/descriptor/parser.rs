//! Sequential configuration-descriptor walker.

use tracing::{trace, warn};

use super::topology::{
    AcHeader, AsGeneral, ClockSource, ControlInterface, Endpoint, EndpointGeneral, FeatureUnit,
    FormatTypeI, InputTerminal, OutputTerminal, StreamingInterface, Topology, UnsupportedUnit,
};
use super::*;
use crate::error::DescriptorError;

/// Where class-specific records attach.
#[derive(Debug, Clone, Copy)]
enum Cursor {
    None,
    Control(usize),
    Streaming(usize),
}

struct Parser {
    topology: Topology,
    cursor: Cursor,
    /// (streaming interface index, endpoint index)
    endpoint: Option<(usize, usize)>,
}

/// Parses a configuration descriptor into a [`Topology`].
///
/// Records are walked by their bLength, so unrecognized records are skipped
/// whole. A record too short to advance past, or one running past the end of
/// the buffer, aborts the parse. A known record shorter than its fixed layout
/// is skipped with a warning.
pub fn parse(bytes: &[u8]) -> Result<Topology, DescriptorError> {
    let mut parser = Parser {
        topology: Topology::default(),
        cursor: Cursor::None,
        endpoint: None,
    };

    let mut offset = 0;
    while offset < bytes.len() {
        let remaining = bytes.len() - offset;
        let length = bytes[offset];
        if length < 2 {
            return Err(DescriptorError::ZeroLength { offset, length });
        }
        let length = usize::from(length);
        if length > remaining {
            return Err(DescriptorError::Truncated {
                offset,
                length,
                remaining,
            });
        }
        parser.record(&bytes[offset..offset + length], offset);
        offset += length;
    }

    Ok(parser.topology)
}

fn u16_at(r: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([r[i], r[i + 1]])
}

fn u32_at(r: &[u8], i: usize) -> u32 {
    u32::from_le_bytes([r[i], r[i + 1], r[i + 2], r[i + 3]])
}

fn too_short(record: &[u8], need: usize, what: &str, offset: usize) -> bool {
    if record.len() < need {
        warn!(
            offset,
            length = record.len(),
            need,
            what,
            "descriptor shorter than its layout, skipped"
        );
        true
    } else {
        false
    }
}

impl Parser {
    fn record(&mut self, r: &[u8], offset: usize) {
        let kind = r[1];
        trace!(offset, length = r.len(), kind, "descriptor");
        match kind {
            DT_INTERFACE => self.interface(r, offset),
            DT_ENDPOINT => self.endpoint(r, offset),
            CS_INTERFACE => match self.cursor {
                Cursor::Control(i) => self.control_record(i, r, offset),
                Cursor::Streaming(i) => self.streaming_record(i, r, offset),
                Cursor::None => {}
            },
            CS_ENDPOINT => self.endpoint_record(r, offset),
            _ => {}
        }
    }

    fn interface(&mut self, r: &[u8], offset: usize) {
        self.endpoint = None;
        if too_short(r, 9, "interface", offset) {
            self.cursor = Cursor::None;
            return;
        }
        let (number, alternate, num_endpoints) = (r[2], r[3], r[4]);
        let (class, subclass) = (r[5], r[6]);
        self.cursor = match (class, subclass) {
            (AUDIO, AUDIOCONTROL) => {
                self.topology.control_interfaces.push(ControlInterface {
                    number,
                    alternate,
                    ..Default::default()
                });
                Cursor::Control(self.topology.control_interfaces.len() - 1)
            }
            (AUDIO, AUDIOSTREAMING) => {
                self.topology.streaming_interfaces.push(StreamingInterface {
                    number,
                    alternate,
                    num_endpoints,
                    ..Default::default()
                });
                Cursor::Streaming(self.topology.streaming_interfaces.len() - 1)
            }
            _ => Cursor::None,
        };
    }

    fn endpoint(&mut self, r: &[u8], offset: usize) {
        let Cursor::Streaming(i) = self.cursor else {
            self.endpoint = None;
            return;
        };
        if too_short(r, 7, "endpoint", offset) {
            return;
        }
        let endpoints = &mut self.topology.streaming_interfaces[i].endpoints;
        endpoints.push(Endpoint {
            address: r[2],
            attributes: r[3],
            max_packet_size: u16_at(r, 4),
            interval: r[6],
            general: None,
        });
        self.endpoint = Some((i, endpoints.len() - 1));
    }

    fn endpoint_record(&mut self, r: &[u8], offset: usize) {
        let Some((i, e)) = self.endpoint else {
            return;
        };
        if r.len() < 3 || r[2] != EP_GENERAL || too_short(r, 8, "endpoint general", offset) {
            return;
        }
        self.topology.streaming_interfaces[i].endpoints[e].general = Some(EndpointGeneral {
            attributes: r[3],
            controls: r[4],
            lock_delay_units: r[5],
            lock_delay: u16_at(r, 6),
        });
    }

    fn control_record(&mut self, i: usize, r: &[u8], offset: usize) {
        if r.len() < 3 {
            return;
        }
        let iface = &mut self.topology.control_interfaces[i];
        match r[2] {
            HEADER => {
                if too_short(r, 9, "ac header", offset) {
                    return;
                }
                iface.header = Some(AcHeader {
                    adc_release: u16_at(r, 3),
                    category: r[5],
                    total_length: u16_at(r, 6),
                    controls: r[8],
                });
            }
            CLOCK_SOURCE => {
                if too_short(r, 8, "clock source", offset) {
                    return;
                }
                iface.clock_sources.push(ClockSource {
                    id: r[3],
                    attributes: r[4],
                    controls: r[5],
                    assoc_terminal: r[6],
                    interface: iface.number,
                });
            }
            INPUT_TERMINAL => {
                if too_short(r, 17, "input terminal", offset) {
                    return;
                }
                iface.input_terminals.push(InputTerminal {
                    id: r[3],
                    terminal_type: u16_at(r, 4),
                    assoc_terminal: r[6],
                    clock_id: r[7],
                    nr_channels: r[8],
                    channel_config: u32_at(r, 9),
                    controls: u16_at(r, 14),
                });
            }
            OUTPUT_TERMINAL => {
                if too_short(r, 12, "output terminal", offset) {
                    return;
                }
                iface.output_terminals.push(OutputTerminal {
                    id: r[3],
                    terminal_type: u16_at(r, 4),
                    assoc_terminal: r[6],
                    source_id: r[7],
                    clock_id: r[8],
                    controls: u16_at(r, 9),
                });
            }
            FEATURE_UNIT => {
                if too_short(r, 6, "feature unit", offset) {
                    return;
                }
                let count = (r.len() - 6) / 4;
                let controls = (0..count).map(|c| u32_at(r, 5 + c * 4)).collect();
                iface.feature_units.push(FeatureUnit {
                    id: r[3],
                    source_id: r[4],
                    controls,
                });
            }
            subtype @ (MIXER_UNIT | SELECTOR_UNIT | EFFECT_UNIT | PROCESSING_UNIT
            | EXTENSION_UNIT | CLOCK_SELECTOR | CLOCK_MULTIPLIER | SAMPLE_RATE_CONVERTER) => {
                trace!(subtype, "unsupported unit recorded");
                iface.unsupported.push(UnsupportedUnit {
                    subtype,
                    id: r.get(3).copied(),
                });
            }
            _ => {}
        }
    }

    fn streaming_record(&mut self, i: usize, r: &[u8], offset: usize) {
        if r.len() < 3 {
            return;
        }
        let iface = &mut self.topology.streaming_interfaces[i];
        match r[2] {
            AS_GENERAL => {
                if too_short(r, 16, "as general", offset) {
                    return;
                }
                iface.general = Some(AsGeneral {
                    terminal_link: r[3],
                    controls: r[4],
                    format_type: r[5],
                    formats: u32_at(r, 6),
                    nr_channels: r[10],
                    channel_config: u32_at(r, 11),
                });
            }
            FORMAT_TYPE => {
                if too_short(r, 6, "format type", offset) {
                    return;
                }
                iface.format = Some(FormatTypeI {
                    format_type: r[3],
                    subslot_size: r[4],
                    bit_resolution: r[5],
                });
            }
            _ => {}
        }
    }
}
