//! Interface broadcaster (§4.I): a small capability trait over a wireless
//! interface, grounded on the original `abc-iface.h` vtable-of-callbacks
//! shape (`init_iface_cb`, `iface_is_enabled_cb`, `iface_set_enabled_cb`,
//! `iface_on_off_ms`), translated into a Rust trait with native `async fn`
//! methods rather than the vtable-of-function-pointers the C header uses.

pub mod null;
pub mod wifi;

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::Result;

/// The socket/address pair an interface hands back on `init` (the
/// callback's `sock`/`address`/`bc` out-parameters in the original, adapted
/// from link-layer addresses to socket addresses since `#![forbid(unsafe_code)]`
/// rules out the raw `AF_PACKET` sockets the original uses).
pub struct IfaceHandles {
    pub local_addr: SocketAddr,
    pub broadcast_addr: SocketAddr,
}

pub trait BroadcastIface: Send {
    /// Bring the interface up and return its addressing.
    async fn init(&mut self) -> Result<IfaceHandles>;

    /// Whether the interface is currently powered on.
    async fn is_enabled(&self) -> Result<bool>;

    /// Power the interface on or off.
    async fn set_enabled(&mut self, state: bool) -> Result<()>;

    /// Measured (or guideline, before the first `set_enabled`) time the
    /// interface takes to come up.
    fn on_off_time(&self) -> Duration;

    /// Broadcast one frame read from the forwarder pipe.
    async fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Receive the next frame from the wireless socket, to be forwarded
    /// back to the forwarder pipe.
    async fn recv(&mut self) -> Result<Vec<u8>>;
}
