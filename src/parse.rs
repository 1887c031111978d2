//! Binary decoders for sensor notification payloads.
//!
//! Every function here is pure: bytes in, typed reading out. A payload that
//! is too short for its format yields [`Error::MalformedFrame`]; nothing in
//! this module indexes past the end of its input.
//!
//! | Function | Family | Format |
//! |---|---|---|
//! | [`parse_temperature`] | CC2650 IR temperature | 2 × i16 LE, ÷ 128 → °C |
//! | [`parse_humidity`] | CC2650 humidity | 2 × u16 LE, HDC1000 transfer functions |
//! | [`parse_heart_rate`] | HRS measurement | flags byte + u8/u16 BPM + optional energy + RR list |
//! | [`unpack_eeg_channel`] | Muse EEG | u16 BE index + 12 × 12-bit BE packed, 0.48828125 µV/LSB |

use std::time::SystemTime;

use log::warn;

use crate::error::{Error, Result};
use crate::protocol::{EEG_PACKET_LEN, EEG_SAMPLES_PER_READING, EEG_SCALE};
use crate::types::ChannelSamples;

// ── Environmental sensor ─────────────────────────────────────────────────────

/// Object (IR) and die (ambient) temperature from a CC2650.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureReading {
    pub object_celsius: f64,
    pub ambient_celsius: f64,
}

/// Relative humidity plus the humidity sensor's own temperature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HumidityReading {
    pub temperature_celsius: f64,
    pub humidity_percent: f64,
}

fn require_len(data: &[u8], expected: usize) -> Result<()> {
    if data.len() < expected {
        return Err(Error::MalformedFrame {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Decode a 4-byte IR temperature frame.
///
/// Both raw values are little-endian with a signed high byte; each converts
/// as `raw / 128.0`.
pub fn parse_temperature(data: &[u8]) -> Result<TemperatureReading> {
    require_len(data, 4)?;
    let object_raw = i16::from_le_bytes([data[0], data[1]]);
    let ambient_raw = i16::from_le_bytes([data[2], data[3]]);
    Ok(TemperatureReading {
        object_celsius: f64::from(object_raw) / 128.0,
        ambient_celsius: f64::from(ambient_raw) / 128.0,
    })
}

/// Decode a 4-byte humidity frame.
///
/// `temp = raw / 65536 × 165 − 40`, `hum = raw / 65536 × 100`.
pub fn parse_humidity(data: &[u8]) -> Result<HumidityReading> {
    require_len(data, 4)?;
    let temp_raw = u16::from_le_bytes([data[0], data[1]]);
    let hum_raw = u16::from_le_bytes([data[2], data[3]]);
    Ok(HumidityReading {
        temperature_celsius: (f64::from(temp_raw) / 65536.0) * 165.0 - 40.0,
        humidity_percent: (f64::from(hum_raw) / 65536.0) * 100.0,
    })
}

// ── Heart rate ───────────────────────────────────────────────────────────────

/// Flags bit 0: BPM is a u16 instead of a u8.
pub const HR_FORMAT_MASK: u8 = 0x01;
/// Flags bit 3: energy-expended field present.
pub const ENERGY_EXPENDED_MASK: u8 = 0x08;
/// Flags bit 4: RR intervals fill the rest of the frame.
pub const RR_INTERVAL_MASK: u8 = 0x10;

/// A decoded Heart Rate Measurement notification.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartRateMeasurement {
    pub beats_per_minute: u16,
    /// kJ, present only when the flags announce it and the bytes are there.
    pub energy_expended: Option<u16>,
    /// RR intervals in milliseconds, in arrival order.
    pub rr_intervals_ms: Vec<f64>,
    /// Set when an optional section was cut short (odd trailing RR byte,
    /// missing energy bytes). What could be decoded is still returned.
    pub truncated: bool,
}

fn take_u8(cursor: &mut &[u8]) -> Option<u8> {
    let (&b, rest) = cursor.split_first()?;
    *cursor = rest;
    Some(b)
}

fn take_u16_le(cursor: &mut &[u8]) -> Option<u16> {
    if cursor.len() < 2 {
        return None;
    }
    let v = u16::from_le_bytes([cursor[0], cursor[1]]);
    *cursor = &cursor[2..];
    Some(v)
}

/// Decode a Heart Rate Measurement frame.
///
/// The BPM is mandatory: a frame without it is [`Error::MalformedFrame`].
/// Optional sections that run past the end of the buffer are dropped and
/// flagged via [`HeartRateMeasurement::truncated`].
pub fn parse_heart_rate(data: &[u8]) -> Result<HeartRateMeasurement> {
    let Some((&flags, body)) = data.split_first() else {
        return Err(Error::MalformedFrame {
            expected: 2,
            actual: 0,
        });
    };
    let mut cursor = body;

    let (bpm, width) = if flags & HR_FORMAT_MASK == 0 {
        (take_u8(&mut cursor).map(u16::from), 1)
    } else {
        (take_u16_le(&mut cursor), 2)
    };
    let beats_per_minute = bpm.ok_or(Error::MalformedFrame {
        expected: 1 + width,
        actual: data.len(),
    })?;

    let mut truncated = false;

    let energy_expended = if flags & ENERGY_EXPENDED_MASK != 0 {
        let v = take_u16_le(&mut cursor);
        truncated |= v.is_none();
        v
    } else {
        None
    };

    let mut rr_intervals_ms = Vec::new();
    if flags & RR_INTERVAL_MASK != 0 {
        while let Some(rr) = take_u16_le(&mut cursor) {
            rr_intervals_ms.push(f64::from(rr) / 1024.0 * 1000.0);
        }
        truncated |= !cursor.is_empty();
    }

    Ok(HeartRateMeasurement {
        beats_per_minute,
        energy_expended,
        rr_intervals_ms,
        truncated,
    })
}

// ── EEG ──────────────────────────────────────────────────────────────────────

/// Unpack 12-bit big-endian values, two per three bytes:
///
/// ```text
/// [AA BB CC] → v0 = (AA << 4) | (BB >> 4)
///              v1 = ((BB & 0x0F) << 8) | CC
/// ```
///
/// A trailing group shorter than three bytes is ignored.
pub fn decode_unsigned_12bit(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(3)
        .flat_map(|c| {
            let (a, b, c) = (u16::from(c[0]), u16::from(c[1]), u16::from(c[2]));
            [
                0xFFF & ((a << 4) | (b >> 4)),
                0xFFF & (((b << 8) & 0xF00) | c),
            ]
        })
        .collect()
}

/// Convert raw 12-bit samples to µV: `0.48828125 × (raw − 2048)`.
pub fn decode_eeg_samples(data: &[u8]) -> Vec<f64> {
    decode_unsigned_12bit(data)
        .into_iter()
        .map(|n| EEG_SCALE * (f64::from(n) - 2048.0))
        .collect()
}

/// Decode one single-channel EEG notification.
///
/// The first two bytes are the big-endian packet index; the next 18 bytes
/// hold the 12 samples. Anything after that is ignored.
pub fn unpack_eeg_channel(packet: &[u8], arrival: SystemTime) -> Result<ChannelSamples> {
    require_len(packet, EEG_PACKET_LEN)?;
    let sequence_index = u16::from_be_bytes([packet[0], packet[1]]);
    let mut values = decode_eeg_samples(&packet[2..EEG_PACKET_LEN]);
    values.truncate(EEG_SAMPLES_PER_READING);
    Ok(ChannelSamples {
        sequence_index,
        values,
        arrival,
    })
}

// ── Control channel ──────────────────────────────────────────────────────────

/// Collects control-channel fragments until one of them closes the JSON
/// object with `}`.
///
/// ```
/// # use ble_exporter::parse::ControlAccumulator;
/// let mut acc = ControlAccumulator::new();
/// assert!(acc.push(r#"{"hn":"Muse-"#).is_none());
/// assert_eq!(acc.push(r#"355A","rc":0}"#).unwrap(), r#"{"hn":"Muse-355A","rc":0}"#);
/// ```
/// Status blobs are a few hundred bytes; anything longer is garbage.
pub const CONTROL_BUFFER_LIMIT: usize = 4096;

#[derive(Debug, Default)]
pub struct ControlAccumulator {
    buffer: String,
}

impl ControlAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment. Returns the accumulated message, starting at its
    /// first `{`, once a fragment containing `}` arrives; the buffer is then
    /// reset. An unterminated message longer than [`CONTROL_BUFFER_LIMIT`]
    /// is discarded.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        self.buffer.push_str(fragment);
        if !fragment.contains('}') {
            if self.buffer.len() > CONTROL_BUFFER_LIMIT {
                warn!(
                    "control message exceeded {CONTROL_BUFFER_LIMIT} bytes without closing, discarding {} bytes",
                    self.buffer.len()
                );
                self.buffer.clear();
            }
            return None;
        }
        let message = std::mem::take(&mut self.buffer);
        let start = message.find('{').unwrap_or(0);
        Some(message[start..].to_owned())
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-5;

    #[test]
    fn temperature_known_frame() {
        let t = parse_temperature(&[0x00, 0x00, 0x00, 0x01]).unwrap();
        assert_eq!(t.object_celsius, 0.0);
        assert_eq!(t.ambient_celsius, 2.0);
    }

    #[test]
    fn temperature_high_byte_is_signed() {
        // 0xFF80 as i16 = -128 → -1.0 °C
        let t = parse_temperature(&[0x80, 0xFF, 0x00, 0x0C]).unwrap();
        assert_eq!(t.object_celsius, -1.0);
        assert_eq!(t.ambient_celsius, 24.0);
    }

    #[test]
    fn humidity_known_frame() {
        let h = parse_humidity(&[0x00, 0x00, 0x00, 0x80]).unwrap();
        assert!((h.temperature_celsius - -40.0).abs() < EPS);
        assert!((h.humidity_percent - 50.0).abs() < EPS);
    }

    #[test]
    fn environmental_short_frames_are_malformed() {
        assert!(matches!(
            parse_temperature(&[0x00, 0x01, 0x02]),
            Err(Error::MalformedFrame { expected: 4, actual: 3 })
        ));
        assert!(matches!(
            parse_humidity(&[]),
            Err(Error::MalformedFrame { expected: 4, actual: 0 })
        ));
    }

    #[test]
    fn heart_rate_u8_bpm_only() {
        let hr = parse_heart_rate(&[0x00, 0x3C]).unwrap();
        assert_eq!(hr.beats_per_minute, 60);
        assert_eq!(hr.energy_expended, None);
        assert!(hr.rr_intervals_ms.is_empty());
        assert!(!hr.truncated);
    }

    #[test]
    fn heart_rate_u16_bpm() {
        let hr = parse_heart_rate(&[HR_FORMAT_MASK, 0x2C, 0x01]).unwrap();
        assert_eq!(hr.beats_per_minute, 300);
    }

    #[test]
    fn heart_rate_u8_bpm_above_127_is_unsigned() {
        let hr = parse_heart_rate(&[0x00, 0xB4]).unwrap();
        assert_eq!(hr.beats_per_minute, 180);
    }

    #[test]
    fn heart_rate_energy_and_rr() {
        let frame = [
            ENERGY_EXPENDED_MASK | RR_INTERVAL_MASK,
            72,
            0x10, 0x00, // energy 16
            0x00, 0x04, // rr 1024 → 1000 ms
            0x00, 0x02, // rr 512 → 500 ms
        ];
        let hr = parse_heart_rate(&frame).unwrap();
        assert_eq!(hr.beats_per_minute, 72);
        assert_eq!(hr.energy_expended, Some(16));
        assert_eq!(hr.rr_intervals_ms, vec![1000.0, 500.0]);
        assert!(!hr.truncated);
    }

    #[test]
    fn heart_rate_odd_rr_tail_is_bounded() {
        let hr = parse_heart_rate(&[RR_INTERVAL_MASK, 60, 0x00, 0x04, 0x05]).unwrap();
        assert_eq!(hr.rr_intervals_ms, vec![1000.0]);
        assert!(hr.truncated);
    }

    #[test]
    fn heart_rate_missing_energy_bytes() {
        let hr = parse_heart_rate(&[ENERGY_EXPENDED_MASK, 60, 0x01]).unwrap();
        assert_eq!(hr.energy_expended, None);
        assert!(hr.truncated);
    }

    #[test]
    fn heart_rate_without_bpm_is_malformed() {
        assert!(matches!(parse_heart_rate(&[]), Err(Error::MalformedFrame { .. })));
        assert!(matches!(parse_heart_rate(&[0x00]), Err(Error::MalformedFrame { .. })));
        assert!(matches!(
            parse_heart_rate(&[HR_FORMAT_MASK, 0x3C]),
            Err(Error::MalformedFrame { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn eeg_known_packet() {
        // muselsl capture, base64 "FQYW2p8AAavp7mcdoACPUYBzoAA="
        let packet = [
            0x15, 0x06, 0x16, 0xda, 0x9f, 0x00, 0x01, 0xab, 0xe9, 0xee, 0x67, 0x1d, 0xa0, 0x00,
            0x8f, 0x51, 0x80, 0x73, 0xa0, 0x00,
        ];
        let samples = unpack_eeg_channel(&packet, SystemTime::now()).unwrap();
        assert_eq!(samples.sequence_index, 5382);

        let expected = [
            -821.77734375,
            327.63671875,
            -1000.0,
            -791.50390625,
            827.1484375,
            800.29296875,
            -768.5546875,
            -1000.0,
            119.62890625,
            -812.5,
            -96.6796875,
            -1000.0,
        ];
        assert_eq!(samples.values.len(), 12);
        for (got, want) in samples.values.iter().zip(expected) {
            assert!((got - want).abs() < EPS, "{got} != {want}");
        }
    }

    #[test]
    fn eeg_short_packet_is_malformed() {
        assert!(matches!(
            unpack_eeg_channel(&[0x00, 0x01, 0x02], SystemTime::now()),
            Err(Error::MalformedFrame { expected: 20, actual: 3 })
        ));
    }

    #[test]
    fn unsigned_12bit_masks_and_ignores_partial_group() {
        assert_eq!(decode_unsigned_12bit(&[0xFF, 0xFF, 0xFF, 0x01]), vec![0xFFF, 0xFFF]);
        assert_eq!(decode_unsigned_12bit(&[0x80, 0x08, 0x00]), vec![0x800, 0x800]);
    }

    #[test]
    fn control_accumulator_joins_fragments() {
        let mut acc = ControlAccumulator::new();
        assert!(acc.push("{\"ap\":\"headset\",").is_none());
        assert!(acc.push("\"fw\":\"1.0.17\",").is_none());
        let msg = acc.push("\"rc\":0}").unwrap();
        assert_eq!(msg, "{\"ap\":\"headset\",\"fw\":\"1.0.17\",\"rc\":0}");
        assert!(acc.is_empty());
    }

    #[test]
    fn control_accumulator_discards_unterminated_garbage() {
        let mut acc = ControlAccumulator::new();
        let noise = "x".repeat(100);
        for _ in 0..CONTROL_BUFFER_LIMIT / 100 {
            assert!(acc.push(&noise).is_none());
        }
        assert!(!acc.is_empty());
        assert!(acc.push(&noise).is_none());
        assert!(acc.is_empty());

        assert_eq!(acc.push(r#"{"rc":0}"#).as_deref(), Some(r#"{"rc":0}"#));
    }

    #[test]
    fn control_accumulator_drops_leading_noise() {
        let mut acc = ControlAccumulator::new();
        assert!(acc.push("xx{\"rc\":").is_none());
        assert_eq!(acc.push("0}").unwrap(), "{\"rc\":0}");
    }
}
