use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures::future::join_all;
use log::{info, warn};

use ble_exporter::export::{to_event_json, to_time_series_json};
use ble_exporter::hub::EventHub;
use ble_exporter::protocol::*;
use ble_exporter::tracker::SensorTracker;
use ble_exporter::transport::btle::BtleplugTransport;
use ble_exporter::transport::mock::{MockDevice, MockTransport};
use ble_exporter::transport::{same_address, BleTransport};
use ble_exporter::types::{Event, FieldValue};

const USAGE: &str = "usage: ble-exporter [--simulate] [--json | --raw] <ADDRESS>...";

const SIM_ENVIRONMENTAL: &str = "B0:B4:48:C9:1A:02";
const SIM_HEART_RATE: &str = "00:22:D0:AA:1F:3B";
const SIM_HEADSET: &str = "00:55:DA:B5:35:5A";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Output {
    /// One human-readable line per event.
    #[default]
    Summary,
    /// Time-series records (`--json`).
    TimeSeries,
    /// Full events as decoded (`--raw`).
    Raw,
}

#[derive(Debug)]
struct Args {
    addresses: Vec<String>,
    simulate: bool,
    output: Output,
}

fn parse_args(argv: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut args = Args {
        addresses: Vec::new(),
        simulate: false,
        output: Output::Summary,
    };
    for arg in argv {
        match arg.as_str() {
            "--simulate" => args.simulate = true,
            "--json" => args.output = Output::TimeSeries,
            "--raw" => args.output = Output::Raw,
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            flag if flag.starts_with('-') => bail!("unknown option {flag}\n{USAGE}"),
            address if address.trim().is_empty() => bail!("empty sensor address\n{USAGE}"),
            address => {
                let address = address.trim();
                if args.addresses.iter().any(|seen| same_address(seen, address)) {
                    warn!("{address} given more than once, tracking it once");
                } else {
                    args.addresses.push(address.to_owned());
                }
            }
        }
    }
    if args.simulate && args.addresses.is_empty() {
        args.addresses = [SIM_ENVIRONMENTAL, SIM_HEART_RATE, SIM_HEADSET]
            .map(String::from)
            .to_vec();
    }
    if args.addresses.is_empty() {
        bail!("no sensor addresses given\n{USAGE}");
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=ble_exporter=debug cargo run -- --simulate
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args(std::env::args().skip(1))?;

    // ── Transport ─────────────────────────────────────────────────────────────
    let transport: Arc<dyn BleTransport> = if args.simulate {
        info!("Simulating sensors; no Bluetooth adapter used.");
        let mock = Arc::new(MockTransport::new());
        let devices = [
            Arc::new(MockDevice::environmental(SIM_ENVIRONMENTAL)),
            Arc::new(MockDevice::heart_rate(SIM_HEART_RATE)),
            Arc::new(MockDevice::headset(SIM_HEADSET)),
        ];
        for device in &devices {
            mock.add(Arc::clone(device));
        }
        tokio::spawn(simulate(devices));
        mock
    } else {
        Arc::new(BtleplugTransport::new().await?)
    };

    // ── Fan-out ───────────────────────────────────────────────────────────────
    let hub = Arc::new(EventHub::new());
    let (_printer, mut rx) = hub.subscribe_channel();
    let output = args.output;
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let line = match output {
                Output::Summary => Ok(summarize(&event)),
                Output::TimeSeries => to_time_series_json(&event),
                Output::Raw => to_event_json(&event),
            };
            match line {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("could not serialize event: {e}"),
            }
        }
    });

    // ── Trackers ──────────────────────────────────────────────────────────────
    let trackers = args
        .addresses
        .iter()
        .map(|address| {
            SensorTracker::new(address.clone(), Arc::clone(&transport), hub.sink()).map(|t| t.spawn())
        })
        .collect::<ble_exporter::error::Result<Vec<_>>>()?;
    info!("Tracking {} sensor(s). Press Ctrl-C to quit.", trackers.len());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down …");

    let stopped = join_all(trackers.into_iter().map(|t| t.stop())).await;
    let stuck = stopped.iter().filter(|clean| !**clean).count();
    if stuck > 0 {
        warn!("{stuck} tracker(s) did not stop cleanly");
    }
    info!("Exiting.");
    Ok(())
}

/// One line per event: address, metric name, and the first metric's fields.
fn summarize(event: &Event) -> String {
    let Some(first) = event.metrics.first() else {
        return format!("[{}] (empty)", event.sensor.hw_address);
    };
    let fields: Vec<String> = first
        .fields
        .iter()
        .map(|(name, value)| match value {
            FieldValue::Int(v) => format!("{name}={v}"),
            FieldValue::Float(v) => format!("{name}={v:.3}"),
            FieldValue::Bool(v) => format!("{name}={v}"),
            FieldValue::Str(v) => format!("{name}={v:?}"),
            FieldValue::Unset => format!("{name}=∅"),
        })
        .collect();
    let more = match event.metrics.len() {
        1 => String::new(),
        n => format!("  (+{} more)", n - 1),
    };
    format!(
        "[{}] {} ts={}  {}{more}",
        event.sensor.hw_address,
        first.name,
        first.timestamp,
        fields.join(" ")
    )
}

// ── Simulation ────────────────────────────────────────────────────────────────

/// Pack 12 raw 12-bit samples behind a big-endian packet index.
fn eeg_packet(index: u16, raw: &[u16; EEG_SAMPLES_PER_READING]) -> Vec<u8> {
    let mut packet = index.to_be_bytes().to_vec();
    for pair in raw.chunks_exact(2) {
        let (a, b) = (pair[0] & 0xFFF, pair[1] & 0xFFF);
        packet.extend_from_slice(&[(a >> 4) as u8, (((a & 0xF) << 4) | (b >> 8)) as u8, b as u8]);
    }
    packet
}

/// Feed plausible frames to the simulated devices until the process exits.
///
/// EEG windows go out at the headset's native rate (12 samples per
/// 1000 × 12 / 256 ms); the strap and the tag once per second.
async fn simulate([environmental, heart_rate, headset]: [Arc<MockDevice>; 3]) {
    let window = Duration::from_micros(1_000_000 * EEG_SAMPLES_PER_READING as u64 / EEG_FREQUENCY as u64);
    let windows_per_second = (EEG_FREQUENCY as usize / EEG_SAMPLES_PER_READING).max(1);
    let mut ticker = tokio::time::interval(window);
    let mut index: u16 = 0;
    let mut sample: u64 = 0;

    loop {
        ticker.tick().await;

        for handle in EEG_ARRIVAL_ORDER {
            let Some(uuid) = eeg_characteristic_for_handle(handle) else {
                continue;
            };
            let channel = eeg_channel_for_handle(handle).unwrap_or(0) as f64;
            let mut raw = [0u16; EEG_SAMPLES_PER_READING];
            for (i, r) in raw.iter_mut().enumerate() {
                let t = (sample + i as u64) as f64 / EEG_FREQUENCY;
                let uv = 40.0 * (2.0 * std::f64::consts::PI * (8.0 + channel) * t).sin();
                *r = (2048.0 + uv / EEG_SCALE).round().clamp(0.0, 4095.0) as u16;
            }
            headset.notify(uuid, eeg_packet(index, &raw));
        }
        index = index.wrapping_add(1);
        sample += EEG_SAMPLES_PER_READING as u64;

        if index as usize % windows_per_second == 0 {
            let second = sample as f64 / EEG_FREQUENCY;
            let bpm = (70.0 + 8.0 * (second / 10.0).sin()) as u8;
            let rr = (60_000.0 / f64::from(bpm) * 1.024) as u16;
            let rr = rr.to_le_bytes();
            heart_rate.notify(
                HEART_RATE_MEASUREMENT_CHARACTERISTIC,
                [0x10, bpm, rr[0], rr[1]],
            );

            let ambient = ((22.5 + (second / 60.0).sin()) * 128.0) as i16;
            let object = ((30.0 + (second / 30.0).sin()) * 128.0) as i16;
            let mut temperature = object.to_le_bytes().to_vec();
            temperature.extend_from_slice(&ambient.to_le_bytes());
            environmental.set_value(TEMPERATURE_VALUE_CHARACTERISTIC, temperature.clone());
            environmental.notify(TEMPERATURE_VALUE_CHARACTERISTIC, temperature);

            let raw_temp = ((22.5 + 40.0) / 165.0 * 65536.0) as u16;
            let raw_hum = ((45.0 + 5.0 * (second / 45.0).sin()) / 100.0 * 65536.0) as u16;
            let mut humidity = raw_temp.to_le_bytes().to_vec();
            humidity.extend_from_slice(&raw_hum.to_le_bytes());
            environmental.set_value(HUMIDITY_VALUE_CHARACTERISTIC, humidity.clone());
            environmental.notify(HUMIDITY_VALUE_CHARACTERISTIC, humidity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        parse_args(args.iter().map(|a| a.to_string()))
    }

    #[test]
    fn repeated_address_is_tracked_once() {
        let args = parse(&["00:22:D0:AA:1F:3B", "00:22:d0:aa:1f:3b", "B0:B4:48:C9:1A:02"]).unwrap();
        assert_eq!(args.addresses, ["00:22:D0:AA:1F:3B", "B0:B4:48:C9:1A:02"]);
    }

    #[test]
    fn empty_address_is_rejected() {
        assert!(parse(&["00:22:D0:AA:1F:3B", ""]).is_err());
        assert!(parse(&[" "]).is_err());
        assert!(parse(&[]).is_err());
    }

    #[test]
    fn simulate_defaults_to_three_sensors() {
        let args = parse(&["--simulate", "--raw"]).unwrap();
        assert!(args.simulate);
        assert_eq!(args.output, Output::Raw);
        assert_eq!(args.addresses.len(), 3);
    }
}
