//! Windows TUN device backed by WinTun
//!
//! Requires wintun.dll next to the executable and Administrator rights
//! for adapter creation. The session's read-wait event is the readiness
//! primitive; the RX worker waits on it with a bounded timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use windows_sys::Win32::Foundation::WAIT_OBJECT_0;
use windows_sys::Win32::System::Threading::WaitForSingleObject;

use super::TunDevice;
use crate::error::{NetError, NetResult};

/// WinTun ring capacity (8 MiB, must be a power of two)
const RING_CAPACITY: u32 = 0x80_0000;

/// Windows TUN device
pub struct WindowsTun {
    session: Arc<wintun::Session>,
    _adapter: Arc<wintun::Adapter>,
    name: String,
    closed: AtomicBool,
}

impl WindowsTun {
    /// Open an existing WinTun adapter by name, creating it if missing,
    /// and start a session on it.
    pub fn open(name: &str) -> NetResult<Self> {
        let wintun = unsafe { wintun::load() }.map_err(|e| {
            NetError::Device(format!(
                "failed to load wintun.dll: {} (place it next to the executable)",
                e
            ))
        })?;

        let adapter = match wintun::Adapter::open(&wintun, name) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("adapter '{}' not found ({}), creating a new one", name, e);
                wintun::Adapter::create(&wintun, name, "PeerLink", None).map_err(|e| {
                    NetError::Device(format!(
                        "failed to create WinTun adapter (run as Administrator): {}",
                        e
                    ))
                })?
            }
        };

        let session = adapter
            .start_session(RING_CAPACITY)
            .map_err(|e| NetError::Device(format!("failed to start WinTun session: {}", e)))?;

        info!("WinTun adapter '{}' initialized", name);

        Ok(Self {
            session: Arc::new(session),
            _adapter: adapter,
            name: name.to_string(),
            closed: AtomicBool::new(false),
        })
    }
}

impl TunDevice for WindowsTun {
    fn recv_timeout(&self, max_wait: Duration) -> NetResult<Option<Vec<u8>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Device("session closed".into()));
        }

        if let Some(packet) = self
            .session
            .try_receive()
            .map_err(|e| NetError::Device(format!("WinTun receive error: {}", e)))?
        {
            return Ok(Some(packet.bytes().to_vec()));
        }

        // Nothing buffered: wait on the session's read event
        let event = self.session.get_read_wait_event().map_err(|e| {
            NetError::Device(format!("failed to get WinTun read wait event: {}", e))
        })?;

        let timeout_ms = max_wait.as_millis().min(u32::MAX as u128) as u32;
        let wait = unsafe { WaitForSingleObject(event as _, timeout_ms) };
        if wait != WAIT_OBJECT_0 {
            return Ok(None);
        }

        let packet = self
            .session
            .try_receive()
            .map_err(|e| NetError::Device(format!("WinTun receive error: {}", e)))?;
        Ok(packet.map(|p| p.bytes().to_vec()))
    }

    fn send(&self, frame: &[u8]) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Device("session closed".into()));
        }

        let mut packet = self
            .session
            .allocate_send_packet(frame.len() as u16)
            .map_err(|e| NetError::Device(format!("failed to allocate send packet: {}", e)))?;
        packet.bytes_mut().copy_from_slice(frame);
        self.session.send_packet(packet);
        Ok(())
    }

    fn alias(&self) -> String {
        self.name.clone()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("shutting down WinTun session on '{}'", self.name);
            let _ = self.session.shutdown();
        }
    }
}
