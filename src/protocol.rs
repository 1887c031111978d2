//! GATT UUIDs, sampling constants, and wire-format helpers for the supported
//! sensor families.
//!
//! These values are fixed by the hardware; they are reproduced exactly so the
//! exporter interoperates with real devices.

use uuid::Uuid;

// ── Environmental sensor (TI CC2650 SensorTag) ───────────────────────────────

/// Humidity service. Its presence identifies a CC2650.
pub const HUMIDITY_SERVICE: Uuid = Uuid::from_u128(0xf000aa20_0451_4000_b000_000000000000);
pub const HUMIDITY_VALUE_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xf000aa21_0451_4000_b000_000000000000);
/// Write `0x01` to enable the humidity sensor.
pub const HUMIDITY_CONFIG_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xf000aa22_0451_4000_b000_000000000000);
pub const HUMIDITY_PERIOD_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xf000aa23_0451_4000_b000_000000000000);

/// IR temperature service.
pub const TEMPERATURE_SERVICE: Uuid = Uuid::from_u128(0xf000aa00_0451_4000_b000_000000000000);
pub const TEMPERATURE_VALUE_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xf000aa01_0451_4000_b000_000000000000);
/// Write `0x01` to enable the temperature sensor.
pub const TEMPERATURE_CONFIG_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xf000aa02_0451_4000_b000_000000000000);
pub const TEMPERATURE_PERIOD_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xf000aa03_0451_4000_b000_000000000000);

/// Payload written to a CC2650 configuration characteristic to start sampling.
pub const SENSOR_ENABLE: [u8; 1] = [0x01];

// ── Heart-rate strap (Polar H7, standard HRS profile) ────────────────────────

/// Bluetooth SIG Heart Rate service (0x180D).
pub const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
/// Heart Rate Measurement characteristic (0x2A37).
pub const HEART_RATE_MEASUREMENT_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

// ── EEG headset (Interaxon Muse, classic firmware) ───────────────────────────

/// Primary GATT service advertised by Muse headsets.
pub const HEADSET_SERVICE: Uuid = Uuid::from_u128(0x0000fe8d_0000_1000_8000_00805f9b34fb);

/// Bidirectional control channel: length-prefixed ASCII commands out,
/// JSON status fragments in. See [`encode_command`] and [`decode_response`].
pub const CONTROL_CHARACTERISTIC: Uuid = Uuid::from_u128(0x273e0001_4c4d_454d_96be_f03bac821358);
pub const GYROSCOPE_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x273e0009_4c4d_454d_96be_f03bac821358);
pub const ACCELEROMETER_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x273e000a_4c4d_454d_96be_f03bac821358);
pub const TELEMETRY_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x273e000b_4c4d_454d_96be_f03bac821358);

/// PPG characteristics (ambient, infrared, red).
pub const PPG_CHARACTERISTICS: [Uuid; 3] = [
    Uuid::from_u128(0x273e000f_4c4d_454d_96be_f03bac821358),
    Uuid::from_u128(0x273e0010_4c4d_454d_96be_f03bac821358),
    Uuid::from_u128(0x273e0011_4c4d_454d_96be_f03bac821358),
];

/// EEG characteristics with their ATT handle numbers.
///
/// | UUID suffix | Handle | Channel | Electrode |
/// |-------------|--------|---------|-----------|
/// | 0003        | 32     | 0       | TP9       |
/// | 0004        | 35     | 1       | AF7       |
/// | 0005        | 38     | 2       | AF8       |
/// | 0006        | 41     | 3       | TP10      |
/// | 0007        | 44     | 4       | right AUX |
pub const EEG_CHARACTERISTICS: [(Uuid, u16); 5] = [
    (Uuid::from_u128(0x273e0003_4c4d_454d_96be_f03bac821358), 32),
    (Uuid::from_u128(0x273e0004_4c4d_454d_96be_f03bac821358), 35),
    (Uuid::from_u128(0x273e0005_4c4d_454d_96be_f03bac821358), 38),
    (Uuid::from_u128(0x273e0006_4c4d_454d_96be_f03bac821358), 41),
    (Uuid::from_u128(0x273e0007_4c4d_454d_96be_f03bac821358), 44),
];

/// Order in which the headset notifies the EEG handles within one window.
pub const EEG_ARRIVAL_ORDER: [u16; 5] = [44, 41, 38, 32, 35];

/// Handle 35 (AF7) always comes last and closes the window.
pub const EEG_BARRIER_HANDLE: u16 = 35;

/// Metric field name per logical EEG channel.
pub const EEG_FIELD_NAMES: [&str; 5] = ["tp9", "af7", "af8", "tp10", "right_aux"];

/// EEG sample rate in Hz.
pub const EEG_FREQUENCY: f64 = 256.0;

/// 12-bit samples per EEG notification; also the size of one reassembly window.
pub const EEG_SAMPLES_PER_READING: usize = 12;

/// Minimum EEG packet length: 2-byte index + 12 × 12 bits.
pub const EEG_PACKET_LEN: usize = 2 + EEG_SAMPLES_PER_READING * 3 / 2;

/// µV per LSB; raw values are centred at 2048 (2 mVpp over 12 bits).
pub const EEG_SCALE: f64 = 0.48828125;

/// Map an ATT handle to its logical EEG channel (`(handle - 32) / 3`).
pub fn eeg_channel_for_handle(handle: u16) -> Option<usize> {
    EEG_CHARACTERISTICS
        .iter()
        .position(|&(_, h)| h == handle)
}

/// Look up the ATT handle the headset uses for an EEG characteristic.
pub fn eeg_handle_for_characteristic(uuid: Uuid) -> Option<u16> {
    EEG_CHARACTERISTICS
        .iter()
        .find(|&&(u, _)| u == uuid)
        .map(|&(_, h)| h)
}

/// Inverse of [`eeg_handle_for_characteristic`].
pub fn eeg_characteristic_for_handle(handle: u16) -> Option<Uuid> {
    EEG_CHARACTERISTICS
        .iter()
        .find(|&&(_, h)| h == handle)
        .map(|&(u, _)| u)
}

// ── Metric names ─────────────────────────────────────────────────────────────

pub const ENVIRONMENTAL_METRIC: &str = "cc2650";
pub const HEART_RATE_METRIC: &str = "polar-h7";
pub const EEG_METRIC: &str = "eeg";

// ── Control commands ─────────────────────────────────────────────────────────

/// Resume streaming.
pub const CMD_RESUME: &str = "d";
/// Request a control status blob.
pub const CMD_STATUS: &str = "s";
/// Request device/firmware info.
pub const CMD_DEVICE_INFO: &str = "v1";

/// Encode a text command for the headset control characteristic.
///
/// ```text
/// byte 0     : command.len() + 1 (counts the trailing '\n')
/// bytes 1..N : ASCII command
/// byte N+1   : '\n'
/// ```
///
/// ```
/// # use ble_exporter::protocol::encode_command;
/// assert_eq!(encode_command("v1"), &[0x03, b'v', b'1', b'\n']);
/// ```
pub fn encode_command(cmd: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(cmd.len() + 2);
    bytes.push((cmd.len() + 1) as u8);
    bytes.extend_from_slice(cmd.as_bytes());
    bytes.push(b'\n');
    bytes
}

/// Decode one control-characteristic notification into its text fragment.
///
/// Byte 0 is the number of meaningful characters that follow; the rest of
/// the 20-byte packet is padding. A length larger than the packet is clamped.
pub fn decode_response(bytes: &[u8]) -> String {
    let Some((&len, rest)) = bytes.split_first() else {
        return String::new();
    };
    let end = (len as usize).min(rest.len());
    String::from_utf8_lossy(&rest[..end]).into_owned()
}
