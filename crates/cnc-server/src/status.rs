//! 硬件状态轮询
//!
//! 状态机只有两个状态：空闲和轮询中。轮询线程每个周期查询位置和限位，成功时调用回调；
//! 传输失败只记录日志并等待退避时间，不会结束轮询。
//!
//! 停止通过关闭停止通道实现：通道断开会立即唤醒线程中所有 `recv_timeout` 等待。
//! 正在进行的传输调用会先完成。

use crate::lock;
use cnc_core::config::MachineParameters;
use cnc_core::math::Vector3;
use cnc_core::transport::{query_endstops, query_position, Endstops, RtSender};
use cnc_core::TransportError;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 一次轮询的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusReport {
    /// 硬件坐标
    pub hardware: Vector3,
    pub endstops: Endstops,
}

pub type StatusCallback = Arc<dyn Fn(StatusReport) + Send + Sync>;

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// 状态轮询机
pub struct StatusMachine {
    sender: Arc<dyn RtSender>,
    interval: Duration,
    backoff: Duration,
    callback: StatusCallback,
    worker: Mutex<Option<Worker>>,
}

impl StatusMachine {
    pub fn new(sender: Arc<dyn RtSender>, config: &MachineParameters, callback: StatusCallback) -> Self {
        Self {
            sender,
            interval: config.status_poll_interval(),
            backoff: config.retry_backoff(),
            callback,
            worker: Mutex::new(None),
        }
    }

    /// 启动轮询线程（已在运行时不做任何事）
    pub fn start(&self) {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return;
        }

        let (stop, stopped) = channel::bounded::<()>(0);
        let sender = Arc::clone(&self.sender);
        let callback = Arc::clone(&self.callback);
        let (interval, backoff) = (self.interval, self.backoff);

        let handle = thread::spawn(move || poll_loop(&*sender, &*callback, interval, backoff, &stopped));
        *worker = Some(Worker { stop, handle });
        info!("Status polling started");
    }

    pub fn resume(&self) {
        self.start();
    }

    /// 停止并等待线程退出，重复调用无副作用
    pub fn stop(&self) {
        let Some(Worker { stop, handle }) = lock(&self.worker).take() else {
            return;
        };
        drop(stop);
        if handle.join().is_err() {
            warn!("Status polling thread panicked");
        }
        info!("Status polling stopped");
    }

    pub fn pause(&self) {
        self.stop();
    }

    pub fn abort(&self) {
        self.stop();
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// 阻塞读取硬件坐标，失败时按退避时间重试直到成功
    ///
    /// 只应在轮询停止时调用。
    pub fn read_hardware_coordinates(&self) -> Vector3 {
        loop {
            match query_position(&*self.sender) {
                Ok(position) => return position,
                Err(e) => {
                    warn!("Failed to read hardware coordinates, retrying: {}", e);
                    thread::sleep(self.backoff);
                }
            }
        }
    }
}

impl Drop for StatusMachine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_once(sender: &dyn RtSender) -> Result<StatusReport, TransportError> {
    Ok(StatusReport {
        hardware: query_position(sender)?,
        endstops: query_endstops(sender)?,
    })
}

/// 等待指定时间；返回 true 表示收到停止信号
fn wait_stopped(stopped: &Receiver<()>, timeout: Duration) -> bool {
    !matches!(stopped.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}

fn poll_loop(
    sender: &dyn RtSender,
    callback: &(dyn Fn(StatusReport) + Send + Sync),
    interval: Duration,
    backoff: Duration,
    stopped: &Receiver<()>,
) {
    loop {
        match poll_once(sender) {
            Ok(report) => callback(report),
            Err(e) => {
                debug!("Status poll failed: {}", e);
                if wait_stopped(stopped, backoff) {
                    break;
                }
            }
        }
        if wait_stopped(stopped, interval) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnc_core::transport::RtResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// 前 `failures` 次调用失败，之后返回固定位置
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    impl RtSender for Flaky {
        fn send_command(&self, command: &str) -> Result<RtResponse, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(TransportError::Failure("link down".into()));
            }
            let pairs: &[(&str, &str)] = match command {
                "M114" => &[("X", "1"), ("Y", "2"), ("Z", "3")],
                _ => &[("EX", "0"), ("EY", "0"), ("EZ", "1"), ("EP", "0")],
            };
            Ok(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
        }
    }

    fn fast_config() -> MachineParameters {
        MachineParameters {
            status_poll_interval_ms: 5,
            retry_backoff_ms: 5,
            ..Default::default()
        }
    }

    fn collecting() -> (StatusCallback, Arc<Mutex<Vec<StatusReport>>>) {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let callback: StatusCallback = Arc::new(move |r| sink.lock().unwrap().push(r));
        (callback, reports)
    }

    #[test]
    fn test_polling_survives_failures() {
        let sender = Arc::new(Flaky { failures: 5, calls: AtomicUsize::new(0) });
        let (callback, reports) = collecting();
        let machine = StatusMachine::new(sender, &fast_config(), callback);

        machine.start();
        let deadline = Instant::now() + Duration::from_secs(5);
        while reports.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        machine.stop();

        let reports = reports.lock().unwrap();
        assert!(!reports.is_empty());
        assert_eq!(reports[0].hardware, Vector3::new(1.0, 2.0, 3.0));
        assert!(reports[0].endstops.z);
        assert!(!reports[0].endstops.x);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let sender = Arc::new(Flaky { failures: 0, calls: AtomicUsize::new(0) });
        let (callback, _) = collecting();
        let machine = StatusMachine::new(sender, &fast_config(), callback);

        machine.stop();
        machine.start();
        machine.start();
        assert!(machine.is_running());
        machine.pause();
        machine.stop();
        assert!(!machine.is_running());

        machine.resume();
        assert!(machine.is_running());
    }

    #[test]
    fn test_stop_interrupts_long_interval() {
        let sender = Arc::new(Flaky { failures: 0, calls: AtomicUsize::new(0) });
        let (callback, _) = collecting();
        let config = MachineParameters {
            status_poll_interval_ms: 60_000,
            ..Default::default()
        };
        let machine = StatusMachine::new(sender, &config, callback);

        machine.start();
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        machine.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_read_hardware_coordinates_retries() {
        let sender = Arc::new(Flaky { failures: 3, calls: AtomicUsize::new(0) });
        let (callback, _) = collecting();
        let machine = StatusMachine::new(sender.clone(), &fast_config(), callback);

        assert_eq!(machine.read_hardware_coordinates(), Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(sender.calls.load(Ordering::SeqCst), 4);
    }
}
