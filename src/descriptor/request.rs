//! Class-specific control requests and their payloads.

use crate::error::DescriptorError;

/// bmRequestType for a class request to an interface, device to host.
pub const REQUEST_TYPE_CLASS_INTERFACE_IN: u8 = 0xA1;
/// bmRequestType for a class request to an interface, host to device.
pub const REQUEST_TYPE_CLASS_INTERFACE_OUT: u8 = 0x21;

/// The setup stage of a control transfer (without wLength, which is the
/// buffer length).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    /// bmRequestType.
    pub request_type: u8,
    /// bRequest.
    pub request: u8,
    /// wValue.
    pub value: u16,
    /// wIndex.
    pub index: u16,
}

impl ControlSetup {
    /// A class request addressed to `entity` on `interface`, device to host.
    ///
    /// wValue carries the control selector in its high byte; wIndex carries
    /// the entity in its high byte and the interface in its low byte.
    pub fn class_in(request: u8, selector: u8, entity: u8, interface: u8) -> Self {
        Self {
            request_type: REQUEST_TYPE_CLASS_INTERFACE_IN,
            request,
            value: u16::from(selector) << 8,
            index: (u16::from(entity) << 8) | u16::from(interface),
        }
    }

    /// Same as [`ControlSetup::class_in`], host to device.
    pub fn class_out(request: u8, selector: u8, entity: u8, interface: u8) -> Self {
        Self {
            request_type: REQUEST_TYPE_CLASS_INTERFACE_OUT,
            ..Self::class_in(request, selector, entity, interface)
        }
    }

    /// Returns true for device-to-host requests.
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    /// The control selector from wValue.
    pub fn selector(&self) -> u8 {
        (self.value >> 8) as u8
    }

    /// The entity ID from wIndex.
    pub fn entity(&self) -> u8 {
        (self.index >> 8) as u8
    }

    /// The interface number from wIndex.
    pub fn interface(&self) -> u8 {
        (self.index & 0xFF) as u8
    }
}

/// One (min, max, step) triplet of a sample-rate RANGE response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRateRange {
    /// Lowest rate in Hz.
    pub min: u32,
    /// Highest rate in Hz.
    pub max: u32,
    /// Spacing between rates; 0 means `min` is the only rate.
    pub step: u32,
}

impl SampleRateRange {
    /// A single discrete rate.
    pub fn discrete(rate: u32) -> Self {
        Self {
            min: rate,
            max: rate,
            step: 0,
        }
    }

    /// Returns true if `rate` is one of the rates this triplet describes.
    pub fn contains(&self, rate: u32) -> bool {
        if self.step == 0 {
            return rate == self.min;
        }
        rate >= self.min && rate <= self.max && (rate - self.min) % self.step == 0
    }

    /// Serialized size of one triplet.
    pub const WIRE_SIZE: usize = 12;
}

/// Decodes a RANGE response: a u16 count then `count` u32 triplets, all LE.
///
/// A count larger than the payload holds is clamped to the triplets present.
pub fn parse_range_response(bytes: &[u8]) -> Result<Vec<SampleRateRange>, DescriptorError> {
    if bytes.len() <= 2 {
        return Err(DescriptorError::BadRangeResponse {
            length: bytes.len(),
        });
    }
    let count = usize::from(u16::from_le_bytes([bytes[0], bytes[1]]));
    let ranges = bytes[2..]
        .chunks_exact(SampleRateRange::WIRE_SIZE)
        .take(count)
        .map(|t| SampleRateRange {
            min: u32::from_le_bytes([t[0], t[1], t[2], t[3]]),
            max: u32::from_le_bytes([t[4], t[5], t[6], t[7]]),
            step: u32::from_le_bytes([t[8], t[9], t[10], t[11]]),
        })
        .collect();
    Ok(ranges)
}

/// Encodes a RANGE response.
pub fn encode_range_response(ranges: &[SampleRateRange]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + ranges.len() * SampleRateRange::WIRE_SIZE);
    out.extend_from_slice(&(ranges.len() as u16).to_le_bytes());
    for r in ranges {
        out.extend_from_slice(&r.min.to_le_bytes());
        out.extend_from_slice(&r.max.to_le_bytes());
        out.extend_from_slice(&r.step.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{CS_SAM_FREQ_CONTROL, CUR, RANGE};

    #[test]
    fn test_setup_addressing() {
        let setup = ControlSetup::class_in(RANGE, CS_SAM_FREQ_CONTROL, 0x29, 0);
        assert_eq!(setup.request_type, 0xA1);
        assert_eq!(setup.request, 2);
        assert_eq!(setup.value, 0x0100);
        assert_eq!(setup.index, 0x2900);
        assert_eq!(setup.entity(), 0x29);
        assert_eq!(setup.interface(), 0);

        let set = ControlSetup::class_out(CUR, CS_SAM_FREQ_CONTROL, 5, 1);
        assert_eq!(set.request_type, 0x21);
        assert!(!set.is_in());
        assert_eq!(set.index, 0x0501);
    }

    #[test]
    fn test_discrete_range() {
        let r = SampleRateRange::discrete(48000);
        assert!(r.contains(48000));
        assert!(!r.contains(44100));
    }

    #[test]
    fn test_stepped_range() {
        let r = SampleRateRange {
            min: 44100,
            max: 192000,
            step: 44100,
        };
        assert!(r.contains(88200));
        assert!(r.contains(176400));
        assert!(!r.contains(96000));
        assert!(!r.contains(220500));
    }

    #[test]
    fn test_parse_range_response() {
        let ranges = vec![
            SampleRateRange::discrete(44100),
            SampleRateRange::discrete(48000),
            SampleRateRange {
                min: 88200,
                max: 96000,
                step: 7800,
            },
        ];
        let bytes = encode_range_response(&ranges);
        assert_eq!(bytes.len(), 2 + 3 * 12);
        assert_eq!(parse_range_response(&bytes).unwrap(), ranges);
    }

    #[test]
    fn test_short_range_response_is_error() {
        assert_eq!(
            parse_range_response(&[1, 0]),
            Err(DescriptorError::BadRangeResponse { length: 2 })
        );
    }

    #[test]
    fn test_overstated_count_is_clamped() {
        let mut bytes = encode_range_response(&[SampleRateRange::discrete(48000)]);
        bytes[0] = 5;
        assert_eq!(parse_range_response(&bytes).unwrap().len(), 1);
    }
}
