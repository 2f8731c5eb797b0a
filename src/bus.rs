//! Field-bus publication of focus values.
//!
//! The wire format is an 8-byte payload: bytes 0-3 carry the focus value as
//! a little-endian IEEE-754 single-precision float, bytes 4-7 are reserved
//! and zero. Outbound frames use the TX arbitration id; an inbound frame on
//! the RX id triggers an immediate reply with the cached value.
//!
//! Transport is abstracted behind [`BusTransport`]. The SocketCAN
//! implementation lives behind the `can-hardware` cargo feature, the same
//! way vendor SDKs are gated elsewhere in this codebase; [`MockBus`] is an
//! in-memory transport for tests and hardware-free development.
//!
//! A publisher constructed without a transport is a permanent no-op: every
//! publish reports [`BusError::Unavailable`] and the rest of the pipeline
//! keeps running. Transmit failures are never retried; the next push cycle
//! naturally carries a fresher value than any retry could.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cache::LatestValueCache;
use crate::config::BusSettings;
use crate::error::BusError;

/// Payload size of every bus frame.
pub const BUS_FRAME_LEN: usize = 8;

/// Default arbitration id for outbound focus frames.
pub const DEFAULT_TX_ID: u16 = 0x123;

/// Default arbitration id that triggers an on-demand reply.
pub const DEFAULT_RX_ID: u16 = 0x124;

/// Largest standard (11-bit) arbitration id.
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// Bounded blocking interval of the pull-listener receive call. Also the
/// upper bound on how long shutdown waits for the listener to notice.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Encode a focus value into the 8-byte wire payload.
///
/// The value is narrowed to f32; `NaN` and `Infinity` survive the
/// narrowing and are transmitted as-is.
#[must_use]
pub fn encode_focus(value: f64) -> [u8; BUS_FRAME_LEN] {
    let mut payload = [0u8; BUS_FRAME_LEN];
    payload[..4].copy_from_slice(&(value as f32).to_le_bytes());
    payload
}

/// Decode the focus value from a wire payload.
#[must_use]
pub fn decode_focus(payload: &[u8]) -> Option<f32> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some(f32::from_le_bytes(bytes))
}

/// Blocking frame transport.
///
/// Implementations must be cheap to share across threads: `send` is called
/// from the capture tick and the pull listener concurrently.
pub trait BusTransport: Send + Sync {
    /// Transmit one frame. No retry semantics; one attempt, one result.
    fn send(&self, id: u16, payload: &[u8; BUS_FRAME_LEN]) -> Result<(), BusError>;

    /// Wait up to `timeout` for an inbound frame. `Ok(None)` on timeout.
    fn recv(&self, timeout: Duration) -> Result<Option<(u16, [u8; BUS_FRAME_LEN])>, BusError>;

    /// Human-readable transport description for logs.
    fn describe(&self) -> String;
}

// ============================================================================
// SocketCAN transport (feature-gated)
// ============================================================================

#[cfg(feature = "can-hardware")]
mod socketcan_transport {
    use super::*;
    use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Socket, StandardId};

    /// SocketCAN-backed transport for a real `canX` interface.
    pub struct SocketCanTransport {
        socket: CanSocket,
        interface: String,
    }

    impl SocketCanTransport {
        /// Open the interface; fails when the driver or interface is
        /// missing, at which point the publisher degrades to a no-op.
        pub fn open(interface: &str) -> Result<Self, BusError> {
            let socket = CanSocket::open(interface)
                .map_err(|e| BusError::Transmit(format!("open {interface}: {e}")))?;
            Ok(Self {
                socket,
                interface: interface.to_string(),
            })
        }
    }

    impl BusTransport for SocketCanTransport {
        fn send(&self, id: u16, payload: &[u8; BUS_FRAME_LEN]) -> Result<(), BusError> {
            let id = StandardId::new(id).ok_or(BusError::InvalidArbitrationId(u32::from(id)))?;
            let frame = CanFrame::new(id, payload)
                .ok_or_else(|| BusError::Transmit("payload rejected".to_string()))?;
            self.socket
                .write_frame(&frame)
                .map_err(|e| BusError::Transmit(e.to_string()))
        }

        fn recv(
            &self,
            timeout: Duration,
        ) -> Result<Option<(u16, [u8; BUS_FRAME_LEN])>, BusError> {
            self.socket
                .set_read_timeout(timeout)
                .map_err(|e| BusError::Receive(e.to_string()))?;
            match self.socket.read_frame() {
                Ok(frame) => {
                    let id = match frame.id() {
                        socketcan::Id::Standard(id) => id.as_raw(),
                        // extended ids are not part of this protocol
                        socketcan::Id::Extended(_) => return Ok(None),
                    };
                    let mut payload = [0u8; BUS_FRAME_LEN];
                    let data = frame.data();
                    let len = data.len().min(BUS_FRAME_LEN);
                    payload[..len].copy_from_slice(&data[..len]);
                    Ok(Some((id, payload)))
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    Ok(None)
                }
                Err(e) => Err(BusError::Receive(e.to_string())),
            }
        }

        fn describe(&self) -> String {
            format!("socketcan:{}", self.interface)
        }
    }
}

#[cfg(feature = "can-hardware")]
pub use socketcan_transport::SocketCanTransport;

// ============================================================================
// In-memory transport for tests and hardware-free development
// ============================================================================

/// In-memory bus: frames sent by the publisher are recorded, frames
/// injected by a test appear on the receive side.
#[derive(Default)]
pub struct MockBus {
    inbound: Mutex<VecDeque<(u16, [u8; BUS_FRAME_LEN])>>,
    outbound: Mutex<Vec<(u16, [u8; BUS_FRAME_LEN])>>,
    fail_sends: AtomicBool,
}

impl MockBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame for the listener to receive.
    pub fn inject(&self, id: u16, payload: [u8; BUS_FRAME_LEN]) {
        self.inbound.lock().push_back((id, payload));
    }

    /// Everything sent so far, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<(u16, [u8; BUS_FRAME_LEN])> {
        self.outbound.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.outbound.lock().clear();
    }

    /// Make subsequent sends fail (transient transmit errors).
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

impl BusTransport for MockBus {
    fn send(&self, id: u16, payload: &[u8; BUS_FRAME_LEN]) -> Result<(), BusError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(BusError::Transmit("simulated transmit failure".to_string()));
        }
        self.outbound.lock().push((id, *payload));
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<(u16, [u8; BUS_FRAME_LEN])>, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.inbound.lock().pop_front() {
                return Ok(Some(frame));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// Push/pull publisher of focus values.
///
/// Push and pull are independently toggleable: disabling push stops the
/// periodic broadcast, but pull requests keep being answered from the
/// cache.
pub struct BusPublisher {
    transport: Option<Arc<dyn BusTransport>>,
    tx_id: u16,
    rx_id: u16,
    push_enabled: AtomicBool,
    pull_enabled: AtomicBool,
    tx_count: AtomicU64,
    tx_failures: AtomicU64,
    pull_requests: AtomicU64,
}

impl BusPublisher {
    /// Build on an explicit transport (or none, for the degraded no-op).
    #[must_use]
    pub fn new(transport: Option<Arc<dyn BusTransport>>, settings: &BusSettings) -> Self {
        match &transport {
            Some(transport) => info!(
                transport = %transport.describe(),
                tx_id = settings.tx_id,
                rx_id = settings.rx_id,
                "bus publisher ready"
            ),
            None => warn!("bus unavailable, publishing disabled for this run"),
        }
        Self {
            transport,
            tx_id: settings.tx_id,
            rx_id: settings.rx_id,
            push_enabled: AtomicBool::new(settings.enable_push),
            pull_enabled: AtomicBool::new(settings.enable_pull),
            tx_count: AtomicU64::new(0),
            tx_failures: AtomicU64::new(0),
            pull_requests: AtomicU64::new(0),
        }
    }

    /// Connect to the configured bus. With the `can-hardware` feature this
    /// opens SocketCAN and degrades to the no-op publisher when the
    /// interface is missing; without it the publisher is always degraded.
    #[must_use]
    pub fn connect(settings: &BusSettings) -> Self {
        #[cfg(feature = "can-hardware")]
        {
            match SocketCanTransport::open(&settings.interface) {
                Ok(transport) => {
                    return Self::new(Some(Arc::new(transport)), settings);
                }
                Err(err) => {
                    warn!(
                        interface = %settings.interface,
                        error = %err,
                        "CAN interface unavailable, continuing without bus"
                    );
                }
            }
        }
        #[cfg(not(feature = "can-hardware"))]
        {
            debug!(
                interface = %settings.interface,
                "built without can-hardware, bus publishing disabled"
            );
        }
        Self::new(None, settings)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    #[must_use]
    pub fn tx_id(&self) -> u16 {
        self.tx_id
    }

    #[must_use]
    pub fn rx_id(&self) -> u16 {
        self.rx_id
    }

    /// Encode and transmit one focus value on the TX id. One attempt, no
    /// retry; the caller decides what a failure means.
    pub fn publish(&self, value: f64) -> Result<(), BusError> {
        let Some(transport) = &self.transport else {
            return Err(BusError::Unavailable);
        };
        let payload = encode_focus(value);
        match transport.send(self.tx_id, &payload) {
            Ok(()) => {
                self.tx_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.tx_failures.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    pub fn set_push_enabled(&self, enabled: bool) {
        self.push_enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "push mode toggled");
    }

    #[must_use]
    pub fn push_enabled(&self) -> bool {
        self.push_enabled.load(Ordering::SeqCst)
    }

    pub fn set_pull_enabled(&self, enabled: bool) {
        self.pull_enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "pull mode toggled");
    }

    #[must_use]
    pub fn pull_enabled(&self) -> bool {
        self.pull_enabled.load(Ordering::SeqCst)
    }

    /// Frames transmitted successfully.
    #[must_use]
    pub fn tx_count(&self) -> u64 {
        self.tx_count.load(Ordering::Relaxed)
    }

    /// Failed transmit attempts.
    #[must_use]
    pub fn tx_failures(&self) -> u64 {
        self.tx_failures.load(Ordering::Relaxed)
    }

    /// Pull requests answered.
    #[must_use]
    pub fn pull_requests(&self) -> u64 {
        self.pull_requests.load(Ordering::Relaxed)
    }

    /// Service inbound pull requests until `stop` is raised.
    ///
    /// Blocks in bounded-timeout receives; a request is answered with the
    /// value currently in the cache, within the same latency budget as a
    /// push. This sits on the requester's critical path, so nothing heavier
    /// than a cache read and one send happens here.
    pub fn serve_pull_requests(
        &self,
        cache: &LatestValueCache,
        stop: &std::sync::atomic::AtomicBool,
    ) {
        let Some(transport) = &self.transport else {
            debug!("no bus transport, pull listener not running");
            return;
        };
        info!(transport = %transport.describe(), "pull listener running");

        while !stop.load(Ordering::SeqCst) {
            match transport.recv(RECV_TIMEOUT) {
                Ok(Some((id, _payload))) if id == self.rx_id => {
                    if !self.pull_enabled() {
                        continue;
                    }
                    self.pull_requests.fetch_add(1, Ordering::Relaxed);
                    let value = cache.latest_focus().focus;
                    match self.publish(value) {
                        Ok(()) => debug!(value, "answered pull request"),
                        Err(err) => warn!(error = %err, "pull reply failed"),
                    }
                }
                Ok(_) => {} // other traffic or timeout
                Err(err) => {
                    warn!(error = %err, "bus receive error");
                    // back off instead of spinning on a broken socket
                    std::thread::sleep(RECV_TIMEOUT);
                }
            }
        }
        info!("pull listener stopped");
    }
}
