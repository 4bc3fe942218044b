//! Test doubles: an in-process loopback overlay that delivers virtual frames
//!  straight back to the sending node, plus plumbing to observe the wire.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::addr::NodeId;
use crate::config::ZtConfig;
use crate::overlay::{
    Overlay, OverlayError, OverlayFactory, OverlaySink, VirtualNetworkConfig, MIN_MTU,
};
use crate::state_store::StateObject;

/// Every frame that passed through `virtual_send`, delivered or not.
pub(crate) struct RecordedFrame {
    pub nwid: u64,
    pub src_mac: u64,
    pub dst_mac: u64,
    pub payload: Vec<u8>,
}

impl RecordedFrame {
    pub fn opcode(&self) -> u8 {
        self.payload[0]
    }
}

#[derive(Default)]
pub(crate) struct FrameRecord {
    pub frames: Mutex<Vec<RecordedFrame>>,
}

impl FrameRecord {
    pub fn count_op(&self, op: u8) -> usize {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.opcode() == op)
            .count()
    }

    /// Error frames carry their code right after the fixed header.
    pub fn count_error(&self, code: u8) -> usize {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.opcode() == 0x40 && f.payload.get(12) == Some(&code))
            .count()
    }
}

/// Overlay double: frames addressed to this node's own MAC are handed right
///  back as received; everything else evaporates (an unreachable peer).
pub(crate) struct LoopbackOverlay {
    node_id: NodeId,
    mtu: usize,
    joined: Vec<u64>,
    record: Arc<FrameRecord>,
    deliver: Arc<AtomicBool>,
}

impl LoopbackOverlay {
    fn config_for(&self, nwid: u64) -> VirtualNetworkConfig {
        VirtualNetworkConfig {
            nwid,
            mac: self.node_id.to_mac(nwid),
            mtu: self.mtu,
            phy_mtu: MIN_MTU,
        }
    }
}

impl Overlay for LoopbackOverlay {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn process_wire_packet(
        &mut self,
        now: u64,
        _from: SocketAddr,
        _payload: &[u8],
        _sink: &mut dyn OverlaySink,
    ) -> Result<u64, OverlayError> {
        Ok(now + 60_000)
    }

    fn process_background_tasks(
        &mut self,
        now: u64,
        _sink: &mut dyn OverlaySink,
    ) -> Result<u64, OverlayError> {
        Ok(now + 60_000)
    }

    fn join(&mut self, nwid: u64, _sink: &mut dyn OverlaySink) -> Result<(), OverlayError> {
        if !self.joined.contains(&nwid) {
            self.joined.push(nwid);
        }
        Ok(())
    }

    fn virtual_send(
        &mut self,
        now: u64,
        nwid: u64,
        src_mac: u64,
        dst_mac: u64,
        ethertype: u16,
        payload: &[u8],
        sink: &mut dyn OverlaySink,
    ) -> Result<u64, OverlayError> {
        if !self.joined.contains(&nwid) {
            return Err(OverlayError::NetworkNotFound);
        }
        self.record.frames.lock().unwrap().push(RecordedFrame {
            nwid,
            src_mac,
            dst_mac,
            payload: payload.to_vec(),
        });
        if self.deliver.load(Ordering::SeqCst) && dst_mac == self.node_id.to_mac(nwid) {
            sink.virtual_network_frame(nwid, src_mac, dst_mac, ethertype, payload);
        }
        Ok(now + 60_000)
    }

    fn network_config(&self, nwid: u64) -> Option<VirtualNetworkConfig> {
        self.joined.contains(&nwid).then(|| self.config_for(nwid))
    }
}

pub(crate) struct LoopbackFactory {
    pub node_id: u64,
    pub mtu: usize,
    pub record: Arc<FrameRecord>,
    pub deliver: Arc<AtomicBool>,
}

impl OverlayFactory for LoopbackFactory {
    fn create(
        &self,
        _now: u64,
        sink: &mut dyn OverlaySink,
    ) -> Result<Box<dyn Overlay>, OverlayError> {
        // load-or-generate identity, the way a real overlay comes up
        let mut buf = [0u8; 128];
        if sink.state_get(StateObject::IdentitySecret, &mut buf).is_none() {
            let public = format!("{:010x}", self.node_id);
            let secret = format!("{:010x}:secret", self.node_id);
            sink.state_put(StateObject::IdentityPublic, Some(public.as_bytes()));
            sink.state_put(StateObject::IdentitySecret, Some(secret.as_bytes()));
        }

        Ok(Box::new(LoopbackOverlay {
            node_id: NodeId::from_raw(self.node_id),
            mtu: self.mtu,
            joined: Vec::new(),
            record: self.record.clone(),
            deliver: self.deliver.clone(),
        }))
    }
}

/// Overlay double whose send path dies with a fatal internal error, for
///  exercising the node-wide failure propagation.
pub(crate) struct FatalOverlay {
    node_id: NodeId,
}

impl Overlay for FatalOverlay {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn process_wire_packet(
        &mut self,
        now: u64,
        _from: SocketAddr,
        _payload: &[u8],
        _sink: &mut dyn OverlaySink,
    ) -> Result<u64, OverlayError> {
        Ok(now + 60_000)
    }

    fn process_background_tasks(
        &mut self,
        now: u64,
        _sink: &mut dyn OverlaySink,
    ) -> Result<u64, OverlayError> {
        Ok(now + 60_000)
    }

    fn join(&mut self, _nwid: u64, _sink: &mut dyn OverlaySink) -> Result<(), OverlayError> {
        Ok(())
    }

    fn virtual_send(
        &mut self,
        _now: u64,
        _nwid: u64,
        _src_mac: u64,
        _dst_mac: u64,
        _ethertype: u16,
        _payload: &[u8],
        _sink: &mut dyn OverlaySink,
    ) -> Result<u64, OverlayError> {
        Err(OverlayError::Internal)
    }

    fn network_config(&self, nwid: u64) -> Option<VirtualNetworkConfig> {
        Some(VirtualNetworkConfig {
            nwid,
            mac: self.node_id.to_mac(nwid),
            mtu: 2800,
            phy_mtu: MIN_MTU,
        })
    }
}

pub(crate) struct FatalFactory {
    pub node_id: u64,
}

impl OverlayFactory for FatalFactory {
    fn create(
        &self,
        _now: u64,
        _sink: &mut dyn OverlaySink,
    ) -> Result<Box<dyn Overlay>, OverlayError> {
        Ok(Box::new(FatalOverlay {
            node_id: NodeId::from_raw(self.node_id),
        }))
    }
}

/// One isolated test world: its own node (unique home string), overlay
///  double, and wire recording.
pub(crate) struct TestWorld {
    pub node_id: u64,
    pub config: ZtConfig,
    pub factory: Arc<dyn OverlayFactory>,
    pub record: Arc<FrameRecord>,
    pub deliver: Arc<AtomicBool>,
}

impl TestWorld {
    pub fn new(node_id: u64, mtu: usize) -> TestWorld {
        let record = Arc::new(FrameRecord::default());
        let deliver = Arc::new(AtomicBool::new(true));

        let config = ZtConfig {
            home: format!("zt-test-{}", uuid::Uuid::new_v4()),
            conn_interval: Duration::from_millis(40),
            conn_attempts: 3,
            reassembly_stale: Duration::from_millis(200),
            listen_expire: Duration::from_secs(2),
            ..ZtConfig::default()
        };

        TestWorld {
            node_id,
            config,
            factory: Arc::new(LoopbackFactory {
                node_id,
                mtu,
                record: record.clone(),
                deliver: deliver.clone(),
            }),
            record,
            deliver,
        }
    }

    pub fn dial_url(&self, port: u32) -> String {
        format!("zt://a09acf0233/{:x}:{}", self.node_id, port)
    }

    pub fn dial_url_to(&self, node_id: u64, port: u32) -> String {
        format!("zt://a09acf0233/{:x}:{}", node_id, port)
    }

    pub fn listen_url(&self, port: u32) -> String {
        format!("zt://a09acf0233/*:{}", port)
    }
}
