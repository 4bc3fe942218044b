use std::net::SocketAddr;

use crate::addr::NodeId;
use crate::state_store::StateObject;

/// The largest virtual-network MTU the overlay will ever report. Receive
///  buffers are sized from this plus [`RCV_HEADROOM`].
pub const MAX_MTU: usize = 10_000;

/// The smallest MTU a virtual network may be configured with.
pub const MIN_MTU: usize = 1_280;

/// Extra space on top of the overlay MTU for wire-level overhead. The
///  overlay's own framing is around 52 bytes today; the headroom leaves room
///  for growth.
pub const RCV_HEADROOM: usize = 128;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConfigOperation {
    Up,
    ConfigUpdate,
    Down,
    Destroy,
}

/// Per-network parameters the overlay hands out on join and on config
///  updates. Only the MTUs matter to the transport; the MAC is fixed by
///  (node id, nwid) and carried for consistency checks.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct VirtualNetworkConfig {
    pub nwid: u64,
    pub mac: u64,
    pub mtu: usize,
    pub phy_mtu: usize,
}

/// Informational overlay events. The transport logs them and nothing else.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OverlayEvent {
    Up,
    Online,
    Offline,
    Down,
    Trace(String),
}

/// Failures reported by the overlay library. Fatal errors take the whole
///  node down; the rest fail the triggering operation only.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum OverlayError {
    #[error("overlay out of memory")]
    OutOfMemory,
    #[error("overlay data store failed")]
    DataStoreFailed,
    #[error("fatal internal overlay error")]
    Internal,
    #[error("virtual network not found")]
    NetworkNotFound,
    #[error("unsupported overlay operation")]
    UnsupportedOperation,
    #[error("bad parameter")]
    BadParameter,
}

impl OverlayError {
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            OverlayError::OutOfMemory | OverlayError::DataStoreFailed | OverlayError::Internal
        )
    }
}

/// The callback surface the node offers to the overlay. Calls arrive while
///  the node lock is held, so implementations must not block and must not
///  re-enter the overlay.
///
/// Wire sends and virtual frames are typically buffered by the sink and acted
///  on once the overlay call that produced them has returned.
pub trait OverlaySink {
    /// Ship a UDP packet to a physical peer. Best effort: the payload is
    ///  copied, failures drop the packet.
    fn wire_packet_send(&mut self, to: SocketAddr, payload: &[u8]);

    /// A decrypted frame arrived on a virtual network.
    fn virtual_network_frame(
        &mut self,
        nwid: u64,
        src_mac: u64,
        dst_mac: u64,
        ethertype: u16,
        payload: &[u8],
    );

    /// The configuration of a joined network changed.
    fn virtual_network_config(
        &mut self,
        nwid: u64,
        op: ConfigOperation,
        config: &VirtualNetworkConfig,
    );

    fn event(&mut self, event: OverlayEvent);

    fn state_put(&mut self, object: StateObject, data: Option<&[u8]>);

    /// Returns the object's length, or `None` if absent or larger than `buf`.
    fn state_get(&mut self, object: StateObject, buf: &mut [u8]) -> Option<usize>;
}

/// The overlay library: a non-reentrant protocol engine that owns node
///  identity, network membership, encryption and path selection. All calls
///  happen under the node's lock; time is passed in as milliseconds so the
///  engine never reads a clock itself.
///
/// Methods that advance the engine return the time (msec) at which
///  `process_background_tasks` next wants to run.
pub trait Overlay: Send + 'static {
    fn node_id(&self) -> NodeId;

    /// Feed one received UDP packet into the overlay.
    fn process_wire_packet(
        &mut self,
        now: u64,
        from: SocketAddr,
        payload: &[u8],
        sink: &mut dyn OverlaySink,
    ) -> Result<u64, OverlayError>;

    /// Run housekeeping (path upkeep, retransmits, key renegotiation).
    fn process_background_tasks(
        &mut self,
        now: u64,
        sink: &mut dyn OverlaySink,
    ) -> Result<u64, OverlayError>;

    /// Join a virtual network. Idempotent.
    fn join(&mut self, nwid: u64, sink: &mut dyn OverlaySink) -> Result<(), OverlayError>;

    /// Send one L2 frame on a joined virtual network.
    fn virtual_send(
        &mut self,
        now: u64,
        nwid: u64,
        src_mac: u64,
        dst_mac: u64,
        ethertype: u16,
        payload: &[u8],
        sink: &mut dyn OverlaySink,
    ) -> Result<u64, OverlayError>;

    /// The current configuration of a joined network, if any.
    fn network_config(&self, nwid: u64) -> Option<VirtualNetworkConfig>;
}

/// Creates the overlay instance for a freshly constructed node. The sink is
///  live during creation so the overlay can load or store its identity.
pub trait OverlayFactory: Send + Sync + 'static {
    fn create(&self, now: u64, sink: &mut dyn OverlaySink)
        -> Result<Box<dyn Overlay>, OverlayError>;
}
