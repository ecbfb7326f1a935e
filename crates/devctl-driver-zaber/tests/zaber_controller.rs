//! Zaber driver against a simulated binary-protocol device on the far end of
//! a duplex stream, driven through `MotionDevice`.

use devctl_core::{
    DeviceIdentity, DriverConfig, DriverRegistry, DriverSection, ErrorKind, MotionDevice, MotionSettings, PortArbiter,
    PortRegistry, ResourceId, RetryPolicy, SerialSettings, Transport,
};
use devctl_driver_zaber::{Frame, ZaberCommand, ZaberDriver, ZaberFactory};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const DEVICE: u8 = 1;

struct SimZaber {
    position: i32,
    target: i32,
    status: i32,
    polls: u32,
    settle: u32,
    max: i32,
    received: Vec<u8>,
}

impl SimZaber {
    fn new(settle: u32) -> Self {
        Self {
            position: 0,
            target: 0,
            status: 0,
            polls: 0,
            settle,
            max: 10_000,
            received: Vec::new(),
        }
    }

    fn reply(command: u8, data: i32) -> Vec<u8> {
        Frame {
            device: DEVICE,
            command,
            data,
        }
        .encode()
        .to_vec()
    }

    fn start(&mut self, status: i32, target: i32) -> Vec<u8> {
        if !(0..=self.max).contains(&target) {
            return Self::reply(ZaberCommand::Error.code(), i32::from(status as u8));
        }
        self.status = status;
        self.target = target;
        self.polls = self.settle;
        Vec::new()
    }

    fn handle(&mut self, request: Frame) -> Vec<u8> {
        self.received.push(request.command);
        match request.command {
            0 => {
                self.position = 0;
                self.status = 0;
                Vec::new()
            }
            1 => self.start(1, 0),
            20 => self.start(20, request.data),
            21 => self.start(21, self.position + request.data),
            23 => {
                if self.status != 0 {
                    self.position = (self.position + self.target) / 2;
                    self.status = 0;
                }
                Self::reply(23, self.position)
            }
            50 => Self::reply(50, 30222),
            51 => Self::reply(51, 628),
            53 if request.data == 44 => Self::reply(44, self.max),
            54 => {
                let mut out = Vec::new();
                if self.status != 0 {
                    self.polls = self.polls.saturating_sub(1);
                    if self.polls == 0 {
                        // Completion reply of the move itself.
                        self.position = self.target;
                        out.extend(Self::reply(self.status as u8, self.position));
                        self.status = 0;
                    }
                }
                out.extend(Self::reply(54, self.status));
                out
            }
            60 => Self::reply(60, self.position),
            _ => Self::reply(255, 64),
        }
    }

    fn saw(&self, command: ZaberCommand) -> bool {
        self.received.contains(&command.code())
    }
}

async fn run_device(mut host: DuplexStream, sim: Arc<Mutex<SimZaber>>) {
    let mut bytes = [0u8; 6];
    while host.read_exact(&mut bytes).await.is_ok() {
        let Ok(request) = Frame::decode(&bytes) else {
            break;
        };
        if request.device != DEVICE {
            continue;
        }
        let reply = sim.lock().handle(request);
        if !reply.is_empty() && host.write_all(&reply).await.is_err() {
            break;
        }
    }
}

fn spawn_sim(sim: SimZaber) -> (DuplexStream, Arc<Mutex<SimZaber>>) {
    let (host, device) = tokio::io::duplex(1024);
    let sim = Arc::new(Mutex::new(sim));
    tokio::spawn(run_device(host, sim.clone()));
    (device, sim)
}

fn motion(driver: Arc<dyn devctl_core::Driver>, poll_interval_ms: u64) -> MotionDevice {
    MotionDevice::new(DeviceIdentity::new("camfocus").with_unit("mm"), driver)
        .with_retry(RetryPolicy::once())
        .with_motion_settings(MotionSettings {
            poll_interval_ms,
            wait_timeout_ms: Some(5_000),
        })
}

fn direct(sim: SimZaber, poll_interval_ms: u64) -> (MotionDevice, Arc<Mutex<SimZaber>>) {
    let (stream, sim) = spawn_sim(sim);
    let transport = Arc::new(Transport::new(
        ResourceId::new("/dev/ttyZABER"),
        Box::new(stream),
        Arc::new(PortArbiter::process_local()),
        Duration::from_millis(500),
    ));
    let driver = Arc::new(ZaberDriver::new(transport, DEVICE, 1000.0));
    (motion(driver, poll_interval_ms), sim)
}

#[tokio::test]
async fn test_factory_build_reads_range_and_moves() {
    let (stream, sim) = spawn_sim(SimZaber::new(3));
    let ports = Arc::new(PortRegistry::process_local());
    ports.attach(ResourceId::from_port_path("/sim/zaber0"), Box::new(stream), Duration::from_millis(500));
    let mut drivers = DriverRegistry::new(ports);
    drivers.register_factory(ZaberFactory);

    let config = DriverConfig::new(
        "camfocus",
        DriverSection::new("zaber_binary").with_option("steps_per_unit", 1000.0),
        Some(SerialSettings::new("/sim/zaber0", 9600)),
    );
    let stage = motion(drivers.build(config).await.unwrap(), 1);
    assert_eq!(stage.identify().await.unwrap(), "Zaber device 30222 firmware 6.28");

    stage.move_absolute(2.5, true).await.unwrap();
    assert_eq!(stage.get_position().await.unwrap(), 2.5);
    assert_eq!(stage.get_target_position().await.unwrap(), 2.5);
    assert_eq!(sim.lock().position, 2500);

    // Range is 0..=10 mm once the maximum position has been read.
    let err = stage.move_absolute(20.0, true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(sim.lock().received.iter().filter(|&&c| c == 20).count(), 1);
}

#[tokio::test]
async fn test_rejected_move_surfaces_while_waiting() {
    let (stage, sim) = direct(SimZaber::new(1), 1);

    let err = stage.move_absolute(20.0, true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert!(err.to_string().contains("Absolute position invalid"), "{err}");
    assert!(sim.lock().saw(ZaberCommand::MoveAbsolute));
    assert_eq!(stage.get_position().await.unwrap(), 0.0);
}

#[tokio::test]
async fn test_relative_move_and_home() {
    let (stage, _sim) = direct(SimZaber::new(2), 1);

    stage.move_absolute(4.0, true).await.unwrap();
    stage.move_relative(-1.5, true).await.unwrap();
    assert_eq!(stage.get_position().await.unwrap(), 2.5);
    assert_eq!(stage.get_target_position().await.unwrap(), 2.5);

    stage.home(true).await.unwrap();
    assert_eq!(stage.get_position().await.unwrap(), 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_interrupts_waiting_move() {
    let poll = Duration::from_millis(100);
    let (stage, sim) = direct(SimZaber::new(10_000), poll.as_millis() as u64);
    let stage = Arc::new(stage);

    let mover = {
        let stage = stage.clone();
        tokio::spawn(async move { stage.move_absolute(8.0, true).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let started = Instant::now();
    stage.stop().await.unwrap();
    assert!(started.elapsed() < poll);

    tokio::time::timeout(poll * 5, mover).await.unwrap().unwrap().unwrap();
    assert_eq!(stage.get_position().await.unwrap(), 4.0);
    // Target forgotten after a stop: falls back to the live position.
    assert_eq!(stage.get_target_position().await.unwrap(), 4.0);
    assert!(sim.lock().saw(ZaberCommand::Stop));
}

#[tokio::test]
async fn test_reset_returns_to_zero() {
    let (stage, sim) = direct(SimZaber::new(1), 1);
    stage.move_absolute(1.0, true).await.unwrap();

    stage.reset().await.unwrap();
    assert_eq!(stage.get_position().await.unwrap(), 0.0);
    assert!(sim.lock().saw(ZaberCommand::Reset));
}
