//! Unix TUN device backed by the `tun` crate
//!
//! The device stays in blocking mode; readiness is observed with
//! `poll(2)` on the raw fd so the RX worker's wait is bounded without
//! putting the fd into non-blocking mode.

use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info};

use super::TunDevice;
use crate::error::{NetError, NetResult};

/// Buffer large enough for any tunnelled IPv4 frame
const READ_BUFFER_SIZE: usize = 65_535 + 4;

/// Unix TUN device
pub struct UnixTun {
    device: Mutex<tun::platform::Device>,
    fd: RawFd,
    name: String,
    closed: AtomicBool,
}

impl UnixTun {
    /// Create (or attach to) the named TUN device and bring it up.
    ///
    /// The address is assigned later through the network configurator so
    /// the adapter can be re-addressed per connection.
    pub fn open(name: &str) -> NetResult<Self> {
        let mut config = tun::Configuration::default();
        config.name(name).up();

        #[cfg(target_os = "linux")]
        config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create(&config)
            .map_err(|e| NetError::Device(format!("failed to create TUN device: {}", e)))?;
        let fd = device.as_raw_fd();

        info!("created TUN device '{}'", name);

        Ok(Self {
            device: Mutex::new(device),
            fd,
            name: name.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    /// Wait for the fd to become readable, bounded by `max_wait`
    fn poll_readable(&self, max_wait: Duration) -> NetResult<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };

        let timeout_ms = max_wait.as_millis().min(i32::MAX as u128) as libc::c_int;
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(NetError::Io(err));
        }

        Ok(rc > 0 && pollfd.revents & libc::POLLIN != 0)
    }
}

impl TunDevice for UnixTun {
    fn recv_timeout(&self, max_wait: Duration) -> NetResult<Option<Vec<u8>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Device("device closed".into()));
        }

        if !self.poll_readable(max_wait)? {
            return Ok(None);
        }

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let n = self
            .device
            .lock()
            .expect("device mutex poisoned")
            .read(&mut buf)
            .map_err(|e| NetError::Device(format!("failed to read from TUN: {}", e)))?;

        buf.truncate(n);
        Ok(Some(buf))
    }

    fn send(&self, frame: &[u8]) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Device("device closed".into()));
        }

        self.device
            .lock()
            .expect("device mutex poisoned")
            .write_all(frame)
            .map_err(|e| NetError::Device(format!("failed to write to TUN: {}", e)))
    }

    fn alias(&self) -> String {
        self.name.clone()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("closing TUN device '{}'", self.name);
            // The fd itself is released when the device is dropped
        }
    }
}
