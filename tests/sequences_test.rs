//! Integration tests for the measurement sequences.
//!
//! Sequences are driven through in-test capability implementations that
//! record every call, and once end-to-end through the real switch box and
//! Keithley 2461 drivers talking to scripted device peers.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_instruments::hardware::capabilities::{
    BufferedSource, BufferedVoltmeter, ProbeSource, PulseSource, SwitchMatrix,
};
use rust_instruments::hardware::channel_port::{self, DevicePeer};
use rust_instruments::hardware::keithley_2461::Keithley2461;
use rust_instruments::hardware::switchbox::SwitchBox;
use rust_instruments::hardware::ScpiPort;
use rust_instruments::measurement_types::{ProbeReading, TimeSeries, VoltageRange, Wiring};
use rust_instruments::sequences::four_wire::{self, FourWireConfig};
use rust_instruments::sequences::hall_pulse::{self, HallInstruments, HallPulseConfig};
use rust_instruments::sequences::Assignment;
use std::sync::{Arc, Mutex};
use tokio_test::{assert_err, assert_ok};

type Log = Arc<Mutex<Vec<String>>>;

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

struct LoggingSwitch {
    log: Log,
}

#[async_trait]
impl SwitchMatrix for LoggingSwitch {
    async fn route(&self, assignment: &Assignment) -> Result<()> {
        self.log.lock().unwrap().push(format!("route {}", assignment));
        Ok(())
    }
}

/// Probe source whose voltage is 10 mV per reading taken so far.
struct LoggingProbe {
    log: Log,
    fail_on_read: Option<usize>,
}

#[async_trait]
impl ProbeSource for LoggingProbe {
    async fn enable_probe(&self, current: f64, wiring: Wiring, _nplc: f64) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("enable {} {:?}", current, wiring));
        Ok(())
    }

    async fn read_probe(&self) -> Result<ProbeReading> {
        let mut log = self.log.lock().unwrap();
        let reads = log.iter().filter(|e| e.starts_with("read")).count();
        log.push("read".to_string());
        if self.fail_on_read == Some(reads) {
            return Err(anyhow!("instrument timed out"));
        }
        Ok(ProbeReading {
            current: 1e-3,
            voltage: 0.01 * (reads + 1) as f64,
        })
    }

    async fn disable_probe(&self) -> Result<()> {
        self.log.lock().unwrap().push("disable".to_string());
        Ok(())
    }
}

fn fast_four_wire() -> FourWireConfig {
    FourWireConfig {
        switch_settle_ms: 0,
        probe_settle_ms: 0,
        ..Default::default()
    }
}

#[tokio::test]
async fn four_wire_steps_through_all_rotations() {
    let log: Log = Arc::default();
    let switch = LoggingSwitch { log: log.clone() };
    let probe = LoggingProbe {
        log: log.clone(),
        fail_on_read: None,
    };

    let report = four_wire::run(&switch, &probe, &fast_four_wire())
        .await
        .unwrap();

    assert_eq!(report.readings.len(), 8);
    let resistances = report.resistances();
    assert!((resistances[0] - 10.0).abs() < 1e-9);
    assert!((resistances[7] - 80.0).abs() < 1e-9);
    assert_eq!(
        report.readings[1].assignment.to_string(),
        "I+=B, I-=F, V1+=C, V1-=E"
    );

    let log = entries(&log);
    assert_eq!(
        &log[..4],
        [
            "route I+=A, I-=E, V1+=B, V1-=D",
            "enable 0.001 FourWire",
            "read",
            "disable"
        ]
    );
    assert_eq!(log.len(), 32);
}

#[tokio::test]
async fn four_wire_disables_probe_when_reading_fails() {
    let log: Log = Arc::default();
    let switch = LoggingSwitch { log: log.clone() };
    let probe = LoggingProbe {
        log: log.clone(),
        fail_on_read: Some(1),
    };

    let err = four_wire::run(&switch, &probe, &fast_four_wire())
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("instrument timed out"));

    let log = entries(&log);
    assert_eq!(log.last().map(String::as_str), Some("disable"));
    assert_eq!(log.iter().filter(|e| *e == "disable").count(), 2);
}

#[tokio::test]
async fn four_wire_rejects_invalid_config_before_routing() {
    let log: Log = Arc::default();
    let switch = LoggingSwitch { log: log.clone() };
    let probe = LoggingProbe {
        log: log.clone(),
        fail_on_read: None,
    };
    let config = FourWireConfig {
        current: -1e-3,
        ..fast_four_wire()
    };

    assert_err!(four_wire::run(&switch, &probe, &config).await);
    assert!(entries(&log).is_empty());
}

struct HallRig {
    log: Log,
    source_fails: bool,
    voltmeter_points: usize,
}

#[async_trait]
impl PulseSource for HallRig {
    async fn pulse_current(&self, amps: f64, width: f64) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("pulse {} {}", amps, width));
        Ok(())
    }
}

#[async_trait]
impl BufferedSource for HallRig {
    async fn configure_buffer(&self, current: f64, num: usize, _nplc: f64) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("source buffer {} x{}", current, num));
        Ok(())
    }

    async fn trigger(&self) -> Result<()> {
        self.log.lock().unwrap().push("source trigger".to_string());
        Ok(())
    }

    async fn read_buffer(&self, num: usize) -> Result<TimeSeries> {
        if self.source_fails {
            return Err(anyhow!("buffer read timed out"));
        }
        Ok(TimeSeries {
            time: (0..num).map(|i| i as f64 * 0.2).collect(),
            values: vec![2e-3; num],
        })
    }
}

struct HallVoltmeter {
    log: Log,
    points: usize,
}

#[async_trait]
impl BufferedVoltmeter for HallVoltmeter {
    async fn configure_buffer(&self, num: usize, range: VoltageRange, _nplc: f64) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("voltmeter buffer x{} {:?}", num, range));
        Ok(())
    }

    async fn trigger(&self) -> Result<()> {
        self.log.lock().unwrap().push("voltmeter trigger".to_string());
        Ok(())
    }

    async fn read_buffer(&self) -> Result<Vec<f64>> {
        Ok(vec![-5e-4; self.points])
    }
}

fn fast_hall(points: usize) -> HallPulseConfig {
    HallPulseConfig {
        points,
        point_time_ms: 1,
        settle_ms: 0,
        ..Default::default()
    }
}

#[tokio::test]
async fn hall_pulse_pairs_source_and_voltmeter_readings() {
    let log: Log = Arc::default();
    let switch = LoggingSwitch { log: log.clone() };
    let rig = HallRig {
        log: log.clone(),
        source_fails: false,
        voltmeter_points: 4,
    };
    let voltmeter = HallVoltmeter {
        log: log.clone(),
        points: rig.voltmeter_points,
    };
    let instruments = HallInstruments {
        switch: &switch,
        pulser: &rig,
        source: &rig,
        voltmeter: &voltmeter,
    };

    let report = hall_pulse::run(instruments, &fast_hall(4)).await.unwrap();
    assert_eq!(report.pulses.len(), 2);

    let first = &report.pulses[0];
    assert_eq!(first.assignment.to_string(), "I+=B, I-=F");
    assert_eq!(first.rxx.len(), 4);
    assert!((first.rxx[0] - 2.0).abs() < 1e-9);
    assert!((first.rxy[0] + 0.5).abs() < 1e-9);
    assert!((first.time[1] - first.time[0] - 0.2).abs() < 1e-9);
    assert!(first.time[0] >= first.pulse_time);
    assert!(report.pulses[1].pulse_time >= first.pulse_time);
    assert_eq!(report.rows().len(), 8);

    let log = entries(&log);
    assert_eq!(
        &log[..8],
        [
            "route I+=B, I-=F",
            "pulse 0.037 0.001",
            "route V1+=C, V1-=G, V2+=B, V2-=D, I+=A, I-=E",
            "source buffer 0.001 x4",
            "voltmeter buffer x4 Auto",
            "voltmeter trigger",
            "source trigger",
            "route I+=D, I-=H",
        ]
    );
}

#[tokio::test]
async fn hall_pulse_survives_source_buffer_failure() {
    let log: Log = Arc::default();
    let switch = LoggingSwitch { log: log.clone() };
    let rig = HallRig {
        log: log.clone(),
        source_fails: true,
        voltmeter_points: 3,
    };
    let voltmeter = HallVoltmeter {
        log: log.clone(),
        points: 3,
    };
    let instruments = HallInstruments {
        switch: &switch,
        pulser: &rig,
        source: &rig,
        voltmeter: &voltmeter,
    };

    let report = assert_ok!(hall_pulse::run(instruments, &fast_hall(3)).await);
    assert_eq!(report.pulses.len(), 2);

    let rows = report.rows();
    assert_eq!(rows.len(), 6);
    assert!(rows.iter().all(|row| row.rxx_ohm.is_nan()));
    assert!(rows.iter().all(|row| (row.rxy_ohm + 0.5).abs() < 1e-9));

    let first = &report.pulses[0];
    assert_eq!(first.rxy.len(), 3);
    assert!((first.time[1] - first.time[0] - 0.001).abs() < 1e-9);
    assert!(first.time[0] >= first.pulse_time);
}

fn port(stream: channel_port::ChannelPort) -> ScpiPort {
    ScpiPort::new("test", Box::new(stream))
}

async fn answer_switch(device: &mut DevicePeer, closes: &[&str]) {
    device.expect_command("ROUT:OPEN:ALL").await;
    for close in closes {
        device.expect_command(close).await;
    }
    device.expect_query("*OPC?", "1\n").await;
}

#[tokio::test]
async fn four_wire_over_real_drivers() {
    let (switch_stream, mut switch_device) = channel_port::pair();
    let (smu_stream, mut smu_device) = channel_port::pair();
    let switchbox = SwitchBox::from_port(port(switch_stream));
    let smu = Keithley2461::from_port(port(smu_stream));

    let config = FourWireConfig {
        assignments: vec!["I+=A, I-=E, V1+=B, V1-=D".parse().unwrap()],
        ..fast_four_wire()
    };

    let (report, _, _) = tokio::join!(
        four_wire::run(&switchbox, &smu, &config),
        answer_switch(
            &mut switch_device,
            &["ROUT:CLOS I+,A", "ROUT:CLOS I-,E", "ROUT:CLOS V1+,B", "ROUT:CLOS V1-,D"],
        ),
        async {
            smu_device
                .expect_commands(&[
                    "sour:func curr",
                    "sour:curr 0.001",
                    "sour:curr:vlim 2",
                    "sens:func \"volt\"",
                    "sens:volt:rang:auto on",
                    "sens:volt:rsen on",
                    "sens:volt:nplc 2",
                    "outp on",
                ])
                .await;
            smu_device
                .expect_query(":READ? \"defbuffer1\", sour, read", "1.000000E-03,2.500000E-02\n")
                .await;
            smu_device.expect_command("outp off").await;
        }
    );

    let report = report.unwrap();
    assert_eq!(report.readings.len(), 1);
    assert!((report.readings[0].resistance - 25.0).abs() < 1e-9);
}
