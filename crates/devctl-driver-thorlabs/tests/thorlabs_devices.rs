//! Thorlabs drivers against simulated hardware on the far end of a duplex
//! stream, driven through `MotionDevice`.

use devctl_core::{
    DeviceIdentity, DriverConfig, DriverRegistry, DriverSection, ErrorKind, MotionDevice, MotionSettings, PortArbiter,
    PortRegistry, ResourceId, RetryPolicy, SerialSettings, Transport,
};
use devctl_driver_thorlabs::flip_mount::{JOG_DOWN, JOG_UP, REQ_STATUS};
use devctl_driver_thorlabs::{ElliptecDriver, FilterWheelFactory, FlipMountDriver};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

fn transport(name: &str, device: DuplexStream) -> Arc<Transport> {
    Arc::new(Transport::new(
        ResourceId::new(name),
        Box::new(device),
        Arc::new(PortArbiter::process_local()),
        Duration::from_millis(500),
    ))
}

fn motion(name: &str, driver: Arc<dyn devctl_core::Driver>) -> MotionDevice {
    MotionDevice::new(DeviceIdentity::new(name), driver)
        .with_retry(RetryPolicy::once())
        .with_motion_settings(MotionSettings {
            poll_interval_ms: 1,
            wait_timeout_ms: Some(5_000),
        })
}

// =============================================================================
// Filter wheel
// =============================================================================

struct SimWheel {
    position: u32,
    count: u32,
    received: Vec<String>,
}

async fn run_wheel(host: DuplexStream, sim: Arc<Mutex<SimWheel>>) {
    let (read, mut write) = tokio::io::split(host);
    let mut read = BufReader::new(read);
    loop {
        let mut raw = Vec::new();
        match read.read_until(b'\r', &mut raw).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let command = String::from_utf8_lossy(&raw).trim().to_string();
        let reply = {
            let mut sim = sim.lock();
            sim.received.push(command.clone());
            match command.as_str() {
                "pos?" => format!("{}\r{}\r> ", command, sim.position),
                "pcount?" => format!("{}\r{}\r> ", command, sim.count),
                "*idn?" => format!("{}\rTHORLABS FW102C/FW212C Filter Wheel version 1.07\r> ", command),
                other => {
                    if let Some(slot) = other.strip_prefix("pos=").and_then(|s| s.parse().ok()) {
                        sim.position = slot;
                    }
                    format!("{}\r> ", command)
                }
            }
        };
        if write.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn wheel_sim(count: u32) -> (DuplexStream, Arc<Mutex<SimWheel>>) {
    let (host, device) = tokio::io::duplex(1024);
    let sim = Arc::new(Mutex::new(SimWheel {
        position: 1,
        count,
        received: Vec::new(),
    }));
    tokio::spawn(run_wheel(host, sim.clone()));
    (device, sim)
}

#[tokio::test]
async fn test_wheel_slot_count_probed_at_build() {
    let (device, sim) = wheel_sim(12);
    let ports = Arc::new(PortRegistry::process_local());
    ports.attach(ResourceId::from_port_path("/sim/fw102c"), Box::new(device), Duration::from_millis(500));
    let mut drivers = DriverRegistry::new(ports);
    drivers.register_factory(FilterWheelFactory);

    let config = DriverConfig::new(
        "filter",
        DriverSection::new("thorlabs_wheel"),
        Some(SerialSettings::new("/sim/fw102c", 115200)),
    );
    let wheel = motion("filter", drivers.build(config).await.unwrap());

    wheel.move_absolute(11.0, true).await.unwrap();
    assert_eq!(wheel.get_position().await.unwrap(), 11.0);
    assert_eq!(sim.lock().received[0], "pcount?");
    assert!(wheel.identify().await.unwrap().contains("FW102C"));
}

#[tokio::test]
async fn test_wheel_rejects_slot_before_writing() {
    let (device, sim) = wheel_sim(6);
    let driver = Arc::new(devctl_driver_thorlabs::FilterWheelDriver::new(transport("fw", device), 6));
    let wheel = motion("filter", driver);

    for bad in [0.0, 7.0, 2.5] {
        let err = wheel.move_absolute(bad, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput, "{bad}");
    }
    assert!(sim.lock().received.is_empty());

    wheel.move_relative(2.0, true).await.unwrap();
    assert_eq!(wheel.get_position().await.unwrap(), 3.0);
    assert_eq!(wheel.home(true).await.unwrap_err().kind(), ErrorKind::Unsupported);
}

// =============================================================================
// Flip mount
// =============================================================================

struct SimFlip {
    at: u32,
    target: u32,
    transit_polls: u32,
    jogs: u32,
}

impl SimFlip {
    fn status_frame(&mut self) -> Vec<u8> {
        let bits = if self.transit_polls > 0 {
            self.transit_polls -= 1;
            if self.transit_polls == 0 {
                self.at = self.target;
            }
            0x10
        } else {
            self.at
        };
        let mut frame = vec![0x2A, 0x04, 0x06, 0x00, 0x81, 0x50, 0x01, 0x00];
        frame.extend_from_slice(&bits.to_le_bytes());
        frame
    }
}

async fn run_flip(mut host: DuplexStream, sim: Arc<Mutex<SimFlip>>) {
    let mut frame = [0u8; 6];
    while host.read_exact(&mut frame).await.is_ok() {
        let reply = {
            let mut sim = sim.lock();
            match frame {
                REQ_STATUS => Some(sim.status_frame()),
                JOG_UP | JOG_DOWN => {
                    sim.target = if frame == JOG_UP { 1 } else { 2 };
                    sim.transit_polls = 3;
                    sim.jogs += 1;
                    None
                }
                _ => None,
            }
        };
        if let Some(reply) = reply {
            if host.write_all(&reply).await.is_err() {
                break;
            }
        }
    }
}

#[tokio::test]
async fn test_flip_mount_waits_through_transit() {
    let (host, device) = tokio::io::duplex(1024);
    let sim = Arc::new(Mutex::new(SimFlip {
        at: 1,
        target: 1,
        transit_polls: 0,
        jogs: 0,
    }));
    tokio::spawn(run_flip(host, sim.clone()));

    let driver = Arc::new(FlipMountDriver::new(transport("flip", device)));
    let flipper = motion("flipper", driver.clone());

    assert_eq!(flipper.get_position().await.unwrap(), 1.0);
    flipper.move_absolute(2.0, true).await.unwrap();
    assert_eq!(flipper.get_position().await.unwrap(), 2.0);
    assert!(flipper.get_state().await.unwrap().is_ready());

    flipper.move_absolute(1.0, false).await.unwrap();
    assert_eq!(driver.status().await.unwrap().position(), 1.5);

    let err = flipper.move_absolute(3.0, true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(sim.lock().jogs, 2);
}

// =============================================================================
// Elliptec
// =============================================================================

struct SimEll {
    address: u8,
    pulses: i32,
    target: i32,
    busy_polls: u32,
}

impl SimEll {
    fn po(&self) -> String {
        format!("{}PO{:08X}\r\n", self.address as char, self.pulses)
    }

    fn start(&mut self, target: i32) {
        self.target = target;
        self.busy_polls = 3;
    }
}

async fn run_elliptec(host: DuplexStream, sim: Arc<Mutex<SimEll>>) {
    let (read, mut write) = tokio::io::split(host);
    let mut read = BufReader::new(read);
    let mut head = [0u8; 3];
    while read.read_exact(&mut head).await.is_ok() {
        let command = [head[1], head[2]];
        let mut data = vec![0u8; match &command { b"ma" | b"mr" => 8, b"ho" => 1, _ => 0 }];
        if read.read_exact(&mut data).await.is_err() {
            break;
        }
        let value = u32::from_str_radix(&String::from_utf8_lossy(&data), 16).unwrap_or(0) as i32;

        let reply = {
            let mut sim = sim.lock();
            if head[0] != sim.address {
                continue;
            }
            match &command {
                b"ma" => {
                    sim.start(value);
                    String::new()
                }
                b"mr" => {
                    let target = sim.pulses + value;
                    sim.start(target);
                    String::new()
                }
                b"ho" => {
                    sim.start(0);
                    String::new()
                }
                b"st" => {
                    sim.busy_polls = 0;
                    String::new()
                }
                b"gp" => sim.po(),
                b"in" => format!("{}IN0E1140051720231701016800023000\r\n", sim.address as char),
                b"gs" => {
                    let mut out = String::new();
                    if sim.busy_polls > 0 {
                        sim.busy_polls -= 1;
                        if sim.busy_polls == 0 {
                            // Completion report of the move, unsolicited.
                            sim.pulses = sim.target;
                            out.push_str(&sim.po());
                        }
                    }
                    let code = if sim.busy_polls > 0 { "09" } else { "00" };
                    out.push_str(&format!("{}GS{}\r\n", sim.address as char, code));
                    out
                }
                _ => format!("{}GS03\r\n", sim.address as char),
            }
        };
        if !reply.is_empty() && write.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn test_elliptec_move_and_wait() {
    let (host, device) = tokio::io::duplex(1024);
    let sim = Arc::new(Mutex::new(SimEll {
        address: b'2',
        pulses: 0,
        target: 0,
        busy_polls: 0,
    }));
    tokio::spawn(run_elliptec(host, sim.clone()));

    let driver = ElliptecDriver::calibrated(transport("ell", device), '2').await.unwrap();
    assert!((driver.pulses_per_unit() - 398.2222).abs() < 1e-3);
    let rotator = motion("rotator", Arc::new(driver));

    rotator.move_absolute(90.0, true).await.unwrap();
    assert!((rotator.get_position().await.unwrap() - 90.0).abs() < 1e-2);
    assert_eq!(sim.lock().pulses, 35840);

    rotator.move_relative(-45.0, true).await.unwrap();
    assert!((rotator.get_position().await.unwrap() - 45.0).abs() < 1e-2);

    rotator.home(true).await.unwrap();
    assert_eq!(rotator.get_position().await.unwrap(), 0.0);
}
