//! Virtual network interface
//!
//! The OS tunnel device exposes blocking read/write primitives that
//! cannot be driven by the socket reactor, so the NIC runs two dedicated
//! OS threads: RX blocks on device readiness (bounded at 5 ms) and hands
//! each frame to the packet callback; TX drains a condvar-signalled queue
//! and writes frames to the device in order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{NetError, NetResult};

pub mod ip;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::UnixTun;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::WindowsTun;

/// Bound on the RX thread's wait for device readiness
const RX_WAIT: Duration = Duration::from_millis(5);

/// Bound on the TX thread's wait on the outgoing queue
const TX_WAIT: Duration = Duration::from_millis(1);

/// Platform-agnostic tunnel device.
///
/// Frames are raw IPv4 packets with no link-layer header. All methods
/// may be called from plain OS threads; `recv_timeout` and `send` block.
pub trait TunDevice: Send + Sync {
    /// Wait up to `max_wait` for a frame; `None` means nothing arrived
    fn recv_timeout(&self, max_wait: Duration) -> NetResult<Option<Vec<u8>>>;

    /// Write one frame to the device
    fn send(&self, frame: &[u8]) -> NetResult<()>;

    /// OS-visible interface alias, used to key configuration commands
    fn alias(&self) -> String;

    /// Release the device; must be safe to call more than once
    fn close(&self);
}

/// Open the platform tunnel device
pub fn open_device(name: &str) -> NetResult<Box<dyn TunDevice>> {
    #[cfg(unix)]
    {
        Ok(Box::new(UnixTun::open(name)?))
    }

    #[cfg(windows)]
    {
        Ok(Box::new(WindowsTun::open(name)?))
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = name;
        Err(NetError::Device("platform not supported".into()))
    }
}

/// Callback invoked with each frame read from the device
pub type PacketCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Virtual NIC driving the tunnel device with RX/TX worker threads
pub struct VirtualNic {
    device: Arc<dyn TunDevice>,
    running: Arc<AtomicBool>,
    outgoing: Arc<(Mutex<VecDeque<Vec<u8>>>, Condvar)>,
    callback: Arc<Mutex<Option<PacketCallback>>>,
    rx_worker: Mutex<Option<JoinHandle<()>>>,
    tx_worker: Mutex<Option<JoinHandle<()>>>,
}

impl VirtualNic {
    /// Open the platform device under the given name
    pub fn open(name: &str) -> NetResult<Self> {
        let device: Arc<dyn TunDevice> = Arc::from(open_device(name)?);
        info!("virtual interface '{}' initialized", device.alias());
        Ok(Self::with_device(device))
    }

    /// Wrap an already opened device (tests substitute a fake here)
    pub fn with_device(device: Arc<dyn TunDevice>) -> Self {
        Self {
            device,
            running: Arc::new(AtomicBool::new(false)),
            outgoing: Arc::new((Mutex::new(VecDeque::new()), Condvar::new())),
            callback: Arc::new(Mutex::new(None)),
            rx_worker: Mutex::new(None),
            tx_worker: Mutex::new(None),
        }
    }

    /// Register the sink for frames read from the device
    pub fn set_packet_callback(&self, callback: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        *self.callback.lock().expect("callback mutex poisoned") = Some(Arc::new(callback));
    }

    /// OS alias of the underlying adapter
    pub fn alias(&self) -> String {
        self.device.alias()
    }

    /// Whether the workers are running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the RX and TX workers
    pub fn start(&self) -> NetResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(NetError::AlreadyRunning);
        }

        let rx = {
            let device = Arc::clone(&self.device);
            let running = Arc::clone(&self.running);
            let callback = Arc::clone(&self.callback);
            std::thread::Builder::new()
                .name("nic-rx".into())
                .spawn(move || rx_loop(device, running, callback))
                .map_err(|e| NetError::Device(format!("failed to spawn rx worker: {}", e)))?
        };

        let tx = {
            let device = Arc::clone(&self.device);
            let running = Arc::clone(&self.running);
            let outgoing = Arc::clone(&self.outgoing);
            std::thread::Builder::new()
                .name("nic-tx".into())
                .spawn(move || tx_loop(device, running, outgoing))
                .map_err(|e| NetError::Device(format!("failed to spawn tx worker: {}", e)))?
        };

        *self.rx_worker.lock().expect("worker mutex poisoned") = Some(rx);
        *self.tx_worker.lock().expect("worker mutex poisoned") = Some(tx);

        info!("packet processing started on '{}'", self.alias());
        Ok(())
    }

    /// Stop both workers, then drop any queued outgoing frames.
    /// Safe to call more than once.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let (_, condvar) = &*self.outgoing;
        condvar.notify_all();

        if let Some(worker) = self.rx_worker.lock().expect("worker mutex poisoned").take() {
            let _ = worker.join();
        }
        if let Some(worker) = self.tx_worker.lock().expect("worker mutex poisoned").take() {
            let _ = worker.join();
        }

        let (queue, _) = &*self.outgoing;
        queue.lock().expect("queue mutex poisoned").clear();

        info!("packet processing stopped");
    }

    /// Queue one frame for injection into the device.
    ///
    /// No delivery guarantee; the queue is drained by the TX worker.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        if !self.is_running() {
            debug!("dropping frame: packet processing not running");
            return false;
        }

        let (queue, condvar) = &*self.outgoing;
        queue.lock().expect("queue mutex poisoned").push_back(frame);
        condvar.notify_one();
        true
    }

    /// Stop the workers and release the device. Idempotent.
    pub fn close(&self) {
        self.stop();
        self.device.close();
        info!("virtual interface closed");
    }
}

fn rx_loop(
    device: Arc<dyn TunDevice>,
    running: Arc<AtomicBool>,
    callback: Arc<Mutex<Option<PacketCallback>>>,
) {
    while running.load(Ordering::Acquire) {
        match device.recv_timeout(RX_WAIT) {
            Ok(Some(frame)) => {
                let callback = callback.lock().expect("callback mutex poisoned").clone();
                if let Some(callback) = callback {
                    callback(frame);
                }
            }
            Ok(None) => continue,
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    error!("device read error: {}", e);
                }
                break;
            }
        }
    }
    debug!("rx worker stopped");
}

fn tx_loop(
    device: Arc<dyn TunDevice>,
    running: Arc<AtomicBool>,
    outgoing: Arc<(Mutex<VecDeque<Vec<u8>>>, Condvar)>,
) {
    let (queue, condvar) = &*outgoing;

    while running.load(Ordering::Acquire) {
        let frame = {
            let mut queue = queue.lock().expect("queue mutex poisoned");
            if queue.is_empty() {
                let (guard, _) = condvar
                    .wait_timeout(queue, TX_WAIT)
                    .expect("queue mutex poisoned");
                queue = guard;
            }
            queue.pop_front()
        };

        if let Some(frame) = frame {
            if let Err(e) = device.send(&frame) {
                warn!("device write error: {}", e);
            }
        }
    }
    debug!("tx worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// In-memory device: frames pushed into `incoming` appear on RX,
    /// frames written by TX land in `written`.
    struct FakeDevice {
        incoming: Mutex<VecDeque<Vec<u8>>>,
        written: Mutex<Vec<Vec<u8>>>,
        closed: AtomicBool,
    }

    impl FakeDevice {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                incoming: Mutex::new(VecDeque::new()),
                written: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }

        fn push_incoming(&self, frame: Vec<u8>) {
            self.incoming.lock().unwrap().push_back(frame);
        }

        fn written(&self) -> Vec<Vec<u8>> {
            self.written.lock().unwrap().clone()
        }
    }

    impl TunDevice for FakeDevice {
        fn recv_timeout(&self, max_wait: Duration) -> NetResult<Option<Vec<u8>>> {
            if let Some(frame) = self.incoming.lock().unwrap().pop_front() {
                return Ok(Some(frame));
            }
            std::thread::sleep(max_wait);
            Ok(None)
        }

        fn send(&self, frame: &[u8]) -> NetResult<()> {
            self.written.lock().unwrap().push(frame.to_vec());
            Ok(())
        }

        fn alias(&self) -> String {
            "fake0".into()
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_rx_worker_delivers_frames() {
        let device = FakeDevice::new();
        let nic = VirtualNic::with_device(device.clone());

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        nic.set_packet_callback(move |frame| {
            tx.send(frame).unwrap();
        });

        device.push_incoming(vec![1, 2, 3]);
        device.push_incoming(vec![4, 5, 6]);
        nic.start().unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), vec![1, 2, 3]);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), vec![4, 5, 6]);

        nic.stop();
    }

    #[test]
    fn test_tx_worker_writes_in_order() {
        let device = FakeDevice::new();
        let nic = VirtualNic::with_device(device.clone());
        nic.start().unwrap();

        assert!(nic.send(vec![1]));
        assert!(nic.send(vec![2]));
        assert!(nic.send(vec![3]));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while device.written().len() < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(device.written(), vec![vec![1], vec![2], vec![3]]);
        nic.stop();
    }

    #[test]
    fn test_send_rejected_when_stopped() {
        let device = FakeDevice::new();
        let nic = VirtualNic::with_device(device);
        assert!(!nic.send(vec![1]));
    }

    #[test]
    fn test_stop_clears_queue_and_is_idempotent() {
        let device = FakeDevice::new();
        let nic = VirtualNic::with_device(device.clone());
        nic.start().unwrap();

        nic.stop();
        nic.stop();

        assert!(!nic.is_running());
        assert!(!nic.send(vec![9]));
    }

    #[test]
    fn test_double_start_rejected() {
        let device = FakeDevice::new();
        let nic = VirtualNic::with_device(device);
        nic.start().unwrap();
        assert!(nic.start().is_err());
        nic.stop();
    }

    #[test]
    fn test_close_is_idempotent_and_closes_device() {
        let device = FakeDevice::new();
        let nic = VirtualNic::with_device(device.clone());
        nic.start().unwrap();

        nic.close();
        nic.close();
        assert!(device.closed.load(Ordering::SeqCst));
    }
}
