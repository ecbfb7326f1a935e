//! CONEX driver against a simulated controller on the far end of a duplex
//! stream, driven through a `MotionDevice`.

use devctl_core::{
    DeviceIdentity, ErrorKind, MotionDevice, MotionSettings, PortArbiter, ResourceId, RetryPolicy, Transport,
};
use devctl_driver_newport::ConexDriver;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

struct SimConex {
    position: f64,
    target: f64,
    code: &'static str,
    polls: u32,
    settle: u32,
    error: char,
    limits: (f64, f64),
    /// Error queries left unanswered before `TE` replies resume
    silent_error_checks: u32,
    log: Vec<String>,
}

impl SimConex {
    fn new(code: &'static str, settle: u32) -> Self {
        Self {
            position: 0.0,
            target: 0.0,
            code,
            polls: 0,
            settle,
            error: '@',
            limits: (-10.0, 10.0),
            silent_error_checks: 0,
            log: Vec::new(),
        }
    }

    fn is_ready(&self) -> bool {
        matches!(self.code, "32" | "33" | "34")
    }

    fn poll(&mut self) {
        if !matches!(self.code, "28" | "1E") {
            return;
        }
        self.polls = self.polls.saturating_sub(1);
        if self.polls == 0 {
            self.position = self.target;
            self.code = if self.code == "28" { "33" } else { "32" };
        }
    }

    fn start_move(&mut self, target: f64) {
        if !self.is_ready() {
            self.error = 'D';
        } else if target < self.limits.0 || target > self.limits.1 {
            self.error = 'C';
        } else {
            self.target = target;
            self.code = "28";
            self.polls = self.settle;
        }
    }

    fn handle(&mut self, command: &str) -> Option<String> {
        self.log.push(command.to_string());
        match command {
            "TP" => return Some(format!("TP{}", self.position)),
            "TH" => return Some(format!("TH{}", self.target)),
            "ID?" => return Some("IDCONEX-CC SIM".to_string()),
            "SL?" => return Some(format!("SL{}", self.limits.0)),
            "SR?" => return Some(format!("SR{}", self.limits.1)),
            "TE" if self.silent_error_checks > 0 => self.silent_error_checks -= 1,
            "TE" => return Some(format!("TE{}", std::mem::replace(&mut self.error, '@'))),
            "TBC" => return Some("TBC, Parameter out of limits".to_string()),
            "TBD" => return Some("TBD, Not allowed in current state".to_string()),
            "MM?" => {
                self.poll();
                return Some(format!("MM{}", self.code));
            }
            "OR" => {
                self.target = 0.0;
                self.code = "1E";
                self.polls = self.settle;
            }
            "ST" => {
                if self.code == "28" {
                    self.position = (self.position + self.target) / 2.0;
                    self.target = self.position;
                    self.code = "33";
                }
            }
            "RS" => self.code = "0A",
            _ => match command.get(..2) {
                Some("PA") => match command[2..].parse() {
                    Ok(target) => self.start_move(target),
                    Err(_) => self.error = 'A',
                },
                Some("PR") => match command[2..].parse::<f64>() {
                    Ok(delta) => self.start_move(self.position + delta),
                    Err(_) => self.error = 'A',
                },
                _ => self.error = 'A',
            },
        }
        None
    }

    fn saw(&self, prefix: &str) -> bool {
        self.log.iter().any(|c| c.starts_with(prefix))
    }

    fn count(&self, prefix: &str) -> usize {
        self.log.iter().filter(|c| c.starts_with(prefix)).count()
    }
}

async fn run_controller(host: DuplexStream, sim: Arc<Mutex<SimConex>>) {
    let (read, mut write) = tokio::io::split(host);
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Some(command) = line.strip_prefix('1') else {
            continue;
        };
        let reply = sim.lock().handle(command);
        if let Some(reply) = reply {
            if write.write_all(format!("1{}\r\n", reply).as_bytes()).await.is_err() {
                break;
            }
        }
    }
}

fn setup(sim: SimConex, poll_interval_ms: u64) -> (MotionDevice, Arc<ConexDriver>, Arc<Mutex<SimConex>>) {
    setup_with_retry(sim, poll_interval_ms, RetryPolicy::once(), Duration::from_millis(500))
}

fn setup_with_retry(
    sim: SimConex,
    poll_interval_ms: u64,
    retry: RetryPolicy,
    timeout: Duration,
) -> (MotionDevice, Arc<ConexDriver>, Arc<Mutex<SimConex>>) {
    let (host, device) = tokio::io::duplex(1024);
    let sim = Arc::new(Mutex::new(sim));
    tokio::spawn(run_controller(host, sim.clone()));

    let transport = Arc::new(Transport::new(
        ResourceId::new("/dev/ttyCONEX"),
        Box::new(device),
        Arc::new(PortArbiter::process_local()),
        timeout,
    ));
    let driver = Arc::new(ConexDriver::new(transport, 1, None));
    let device = MotionDevice::new(DeviceIdentity::new("beamsplitter").with_unit("deg"), driver.clone())
        .with_retry(retry)
        .with_motion_settings(MotionSettings {
            poll_interval_ms,
            wait_timeout_ms: Some(5_000),
        });
    (device, driver, sim)
}

#[tokio::test]
async fn test_unreferenced_controller_requires_home() {
    let (device, _driver, sim) = setup(SimConex::new("0A", 2), 1);

    let err = device.move_absolute(1.0, true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert!(!sim.lock().saw("PA"));

    device.home(true).await.unwrap();
    device.move_absolute(3.0, true).await.unwrap();
    assert_eq!(device.get_position().await.unwrap(), 3.0);
    assert_eq!(device.get_target_position().await.unwrap(), 3.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_interrupts_waiting_move() {
    let poll = Duration::from_millis(100);
    let (device, _driver, sim) = setup(SimConex::new("32", 10_000), poll.as_millis() as u64);
    let device = Arc::new(device);

    let mover = {
        let device = device.clone();
        tokio::spawn(async move { device.move_absolute(8.0, true).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let started = Instant::now();
    device.stop().await.unwrap();
    assert!(started.elapsed() < poll);

    tokio::time::timeout(poll * 5, mover).await.unwrap().unwrap().unwrap();
    assert_eq!(device.get_position().await.unwrap(), 4.0);
    assert!(sim.lock().saw("ST"));
}

#[tokio::test]
async fn test_out_of_limits_target_never_sent() {
    let (device, driver, sim) = setup(SimConex::new("32", 1), 1);
    assert_eq!(driver.load_limits().await.unwrap(), (-10.0, 10.0));

    let err = device.move_absolute(50.0, true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(!sim.lock().saw("PA"));
}

#[tokio::test]
async fn test_controller_rejection_is_reported() {
    let (device, driver, _sim) = setup(SimConex::new("32", 1), 1);

    let err = device.move_absolute(50.0, true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert!(err.to_string().contains("Parameter out of limits"), "{err}");
    assert_eq!(driver.last_error().await.unwrap(), None);
}

#[tokio::test]
async fn test_identify_and_reset() {
    let (device, _driver, sim) = setup(SimConex::new("33", 1), 1);
    assert_eq!(device.identify().await.unwrap(), "CONEX-CC SIM");

    device.reset().await.unwrap();
    assert!(device.get_state().await.unwrap().needs_homing());
    assert!(sim.lock().saw("RS"));
}

#[tokio::test]
async fn test_lost_error_reply_does_not_repeat_relative_move() {
    let mut sim = SimConex::new("32", 1);
    sim.silent_error_checks = 1;
    let (device, _driver, sim) =
        setup_with_retry(sim, 1, RetryPolicy::immediate(3), Duration::from_millis(50));

    device.move_relative(0.5, true).await.unwrap();
    assert_eq!(sim.lock().count("PR"), 1);
    assert_eq!(device.get_position().await.unwrap(), 0.5);
}

#[tokio::test]
async fn test_unconfirmed_move_is_not_retried() {
    let mut sim = SimConex::new("32", 1);
    sim.silent_error_checks = u32::MAX;
    let (device, _driver, sim) =
        setup_with_retry(sim, 1, RetryPolicy::immediate(3), Duration::from_millis(50));

    let err = device.move_relative(0.5, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connectivity);
    assert!(err.to_string().contains("after 1 attempt(s)"), "{err}");
    assert_eq!(sim.lock().count("PR"), 1);
    assert_eq!(sim.lock().count("TE"), 3);
}
