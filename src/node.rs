use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::{Duration, SystemTime};

use rand::RngCore;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;

use crate::addr::{Address, NodeId, PORT_EPHEMERAL, PORT_MAX};
use crate::config::ZtConfig;
use crate::error::{ZtError, ZtResult};
use crate::frame::{Frame, FrameHeader, FrameKind, WireErrorCode, ETHERTYPE};
use crate::id_table::IdTable;
use crate::overlay::{
    ConfigOperation, Overlay, OverlayEvent, OverlayFactory, OverlaySink, VirtualNetworkConfig,
    MAX_MTU, RCV_HEADROOM,
};
use crate::state_store::{StateObject, StateStore};
use crate::wire::{spawn_send_worker, WireSender, WireSocket};

pub(crate) fn now_msec() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock is before the UNIX epoch")
        .as_millis() as u64
}

/// One frame delivered by the overlay, buffered until the overlay call that
///  produced it has returned.
pub(crate) struct InboundFrame {
    pub nwid: u64,
    pub src_mac: u64,
    pub dst_mac: u64,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

/// Buffered outcomes of overlay calls.
///
/// The overlay is non-reentrant and runs under the node lock, so its
///  callbacks cannot act directly: wire sends, delivered frames and config
///  updates are collected here and processed by [`NodeShared::drive`] after
///  the overlay call returns - still under the lock, but with the overlay
///  borrow released.
#[derive(Default)]
pub(crate) struct Effects {
    pub wire: VecDeque<(SocketAddr, Vec<u8>)>,
    pub frames: VecDeque<InboundFrame>,
    pub configs: VecDeque<(u64, ConfigOperation, VirtualNetworkConfig)>,
    pub events: VecDeque<OverlayEvent>,
    pub resched: Option<u64>,
    pub fatal: bool,
}

impl Effects {
    pub fn merge_resched(&mut self, at: u64) {
        self.resched = Some(match self.resched {
            Some(cur) => cur.min(at),
            None => at,
        });
    }
}

/// The sink handed to the overlay for the duration of one call.
pub(crate) struct EffectSink<'a> {
    pub state: &'a mut StateStore,
    pub fx: &'a mut Effects,
}

impl OverlaySink for EffectSink<'_> {
    fn wire_packet_send(&mut self, to: SocketAddr, payload: &[u8]) {
        self.fx.wire.push_back((to, payload.to_vec()));
    }

    fn virtual_network_frame(
        &mut self,
        nwid: u64,
        src_mac: u64,
        dst_mac: u64,
        ethertype: u16,
        payload: &[u8],
    ) {
        self.fx.frames.push_back(InboundFrame {
            nwid,
            src_mac,
            dst_mac,
            ethertype,
            payload: payload.to_vec(),
        });
    }

    fn virtual_network_config(
        &mut self,
        nwid: u64,
        op: ConfigOperation,
        config: &VirtualNetworkConfig,
    ) {
        self.fx.configs.push_back((nwid, op, *config));
    }

    fn event(&mut self, event: OverlayEvent) {
        self.fx.events.push_back(event);
    }

    fn state_put(&mut self, object: StateObject, data: Option<&[u8]>) {
        self.state.put(object, data);
    }

    fn state_get(&mut self, object: StateObject, buf: &mut [u8]) -> Option<usize> {
        self.state.get(object, buf)
    }
}

/// Wakeup bookkeeping for the background worker thread. Lives in its own
///  `Arc` so the thread can wait without pinning the node itself alive.
struct BgScheduler {
    state: Mutex<BgState>,
    cv: Condvar,
}

struct BgState {
    next_run: u64,
    closed: bool,
}

impl BgScheduler {
    fn new() -> BgScheduler {
        BgScheduler {
            state: Mutex::new(BgState {
                next_run: u64::MAX,
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn reschedule(&self, at: u64) {
        let mut state = self.state.lock().unwrap();
        if at < state.next_run {
            state.next_run = at;
            self.cv.notify_all();
        }
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.cv.notify_all();
    }
}

/// All mutable node state, guarded by the one node-wide lock. The overlay is
///  not reentrant, so every touch of it - and of the indexes its callbacks
///  feed - happens under this lock.
pub(crate) struct NodeInner {
    pub config: ZtConfig,
    pub node_id: NodeId,
    pub overlay: Box<dyn Overlay>,
    pub state: StateStore,
    pub ports: IdTable<()>,
    pub next_endpoint_id: u64,
    pub endpoints: FxHashMap<u64, crate::endpoint::EndpointState>,
    pub endpoint_addrs: FxHashMap<Address, u64>,
    pub pipes: FxHashMap<Address, crate::pipe::PipeState>,
    pub peers: FxHashMap<Address, Address>,
    pub closed: bool,
}

pub(crate) struct NodeShared {
    pub home: String,
    pub node_id: NodeId,
    pub rt: tokio::runtime::Handle,
    pub inner: Mutex<NodeInner>,
    bg: Arc<BgScheduler>,
    udp_v4: Option<WireSender>,
    udp_v6: Option<WireSender>,
    io_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap handle on a shared node. Endpoints and pipes each hold one; the
///  node is destroyed when the last handle goes away.
#[derive(Clone)]
pub(crate) struct Node {
    pub shared: Arc<NodeShared>,
}

static NODES: OnceLock<Mutex<FxHashMap<String, Weak<NodeShared>>>> = OnceLock::new();

fn registry() -> &'static Mutex<FxHashMap<String, Weak<NodeShared>>> {
    NODES.get_or_init(|| Mutex::new(FxHashMap::default()))
}

impl Node {
    /// Returns the node serving `config.home`, creating it (overlay instance,
    ///  UDP sockets, background worker) on first use. Nodes are shared: all
    ///  endpoints naming the same home ride the same overlay identity.
    pub(crate) async fn find(
        config: &ZtConfig,
        factory: &Arc<dyn OverlayFactory>,
    ) -> ZtResult<Node> {
        if let Some(existing) = Self::lookup(&config.home) {
            return Ok(existing);
        }

        // Bind sockets before re-checking the registry - binding awaits and
        //  the registry lock must not be held across it. Either family may be
        //  unavailable; only both failing is fatal.
        let udp_v4 = UdpSocket::bind("0.0.0.0:0").await.ok().map(Arc::new);
        let udp_v6 = UdpSocket::bind("[::]:0").await.ok().map(Arc::new);
        if udp_v4.is_none() && udp_v6.is_none() {
            error!("could not bind a UDP socket in either address family");
            return Err(ZtError::Internal);
        }

        let mut registry = registry().lock().unwrap();
        if let Some(existing) = registry.get(&config.home).and_then(Weak::upgrade) {
            return Ok(Node { shared: existing });
        }

        let now = now_msec();
        let mut state = StateStore::new(&config.home);
        let mut fx = Effects::default();
        let overlay = {
            let mut sink = EffectSink {
                state: &mut state,
                fx: &mut fx,
            };
            factory
                .create(now, &mut sink)
                .map_err(ZtError::from_overlay)?
        };
        let node_id = overlay.node_id();
        info!("created overlay node {:?} for home {:?}", node_id, config.home);

        let ephemeral_seed = rand::thread_rng().next_u64();
        let inner = NodeInner {
            config: config.clone(),
            node_id,
            overlay,
            state,
            ports: IdTable::new(PORT_EPHEMERAL as u64, PORT_MAX as u64, ephemeral_seed),
            next_endpoint_id: 1,
            endpoints: FxHashMap::default(),
            endpoint_addrs: FxHashMap::default(),
            pipes: FxHashMap::default(),
            peers: FxHashMap::default(),
            closed: false,
        };

        let mut io_tasks = Vec::new();
        let mut make_sender = |socket: &Option<Arc<UdpSocket>>| {
            socket.as_ref().map(|s| {
                let (sender, task) = spawn_send_worker(s.clone());
                io_tasks.push(task);
                sender
            })
        };
        let sender_v4 = make_sender(&udp_v4);
        let sender_v6 = make_sender(&udp_v6);

        let shared = Arc::new(NodeShared {
            home: config.home.clone(),
            node_id,
            rt: tokio::runtime::Handle::current(),
            inner: Mutex::new(inner),
            bg: Arc::new(BgScheduler::new()),
            udp_v4: sender_v4,
            udp_v6: sender_v6,
            io_tasks: Mutex::new(io_tasks),
        });

        for socket in [udp_v4, udp_v6].into_iter().flatten() {
            let task = tokio::spawn(recv_loop(Arc::downgrade(&shared), socket));
            shared.io_tasks.lock().unwrap().push(task);
        }

        {
            let weak = Arc::downgrade(&shared);
            let bg = shared.bg.clone();
            std::thread::spawn(move || bg_loop(weak, bg));
        }

        registry.insert(config.home.clone(), Arc::downgrade(&shared));
        drop(registry);

        // flush whatever the overlay emitted while coming up, and schedule
        //  the first background run right away
        {
            let mut inner = shared.inner.lock().unwrap();
            fx.merge_resched(now + 1);
            shared.drive(&mut inner, fx);
        }

        Ok(Node { shared })
    }

    fn lookup(home: &str) -> Option<Node> {
        registry()
            .lock()
            .unwrap()
            .get(home)
            .and_then(Weak::upgrade)
            .map(|shared| Node { shared })
    }

    pub(crate) fn node_id(&self) -> NodeId {
        self.shared.node_id
    }
}

impl NodeShared {
    /// Feeds one received UDP packet to the overlay and acts on the fallout.
    fn on_wire_packet(self: &Arc<NodeShared>, from: SocketAddr, payload: &[u8]) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "wire_packet", ?correlation_id);
        let _entered = span.enter();

        let now = now_msec();
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }

        let mut fx = Effects::default();
        let result = {
            let NodeInner { overlay, state, .. } = &mut *inner;
            let mut sink = EffectSink {
                state,
                fx: &mut fx,
            };
            overlay.process_wire_packet(now, from, payload, &mut sink)
        };
        match result {
            Ok(next) => fx.merge_resched(next),
            Err(e) if e.is_fatal() => fx.fatal = true,
            Err(e) => debug!("overlay rejected wire packet from {:?}: {}", from, e),
        }

        self.drive(&mut inner, fx);
    }

    fn run_background_tasks(self: &Arc<NodeShared>) {
        let now = now_msec();
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }

        let mut fx = Effects::default();
        let result = {
            let NodeInner { overlay, state, .. } = &mut *inner;
            let mut sink = EffectSink {
                state,
                fx: &mut fx,
            };
            overlay.process_background_tasks(now, &mut sink)
        };
        match result {
            Ok(next) => fx.merge_resched(next),
            Err(e) if e.is_fatal() => fx.fatal = true,
            Err(e) => debug!("overlay background run failed: {}", e),
        }

        self.drive(&mut inner, fx);
    }

    /// Processes buffered overlay effects to quiescence: ships wire packets,
    ///  applies config updates, routes delivered frames (which may produce
    ///  further effects), then passes the earliest requested wakeup to the
    ///  background worker.
    pub(crate) fn drive(self: &Arc<NodeShared>, inner: &mut NodeInner, mut fx: Effects) {
        let node = Node {
            shared: self.clone(),
        };

        loop {
            if fx.fatal {
                warn!("fatal overlay error, closing node {:?}", self.node_id);
                inner.close_all(ZtError::Internal);
                self.bg.close();
                break;
            }
            if let Some((to, buf)) = fx.wire.pop_front() {
                self.udp_send(to, buf);
                continue;
            }
            if let Some(event) = fx.events.pop_front() {
                debug!("overlay event: {:?}", event);
                continue;
            }
            if let Some((nwid, op, config)) = fx.configs.pop_front() {
                inner.on_network_config(nwid, op, &config, &mut fx);
                continue;
            }
            if let Some(frame) = fx.frames.pop_front() {
                inner.route_frame(&node, &frame, &mut fx);
                continue;
            }
            break;
        }

        if let Some(at) = fx.resched {
            self.bg.reschedule(at);
        }
    }

    fn udp_send(&self, to: SocketAddr, payload: Vec<u8>) {
        let sender = if to.is_ipv4() {
            self.udp_v4.as_ref()
        } else {
            self.udp_v6.as_ref()
        };
        match sender {
            Some(sender) => sender.send(to, payload),
            None => trace!("no socket for address family of {:?}, dropping packet", to),
        }
    }

    /// Lock, run `f` against the inner state with an effect buffer, then
    ///  drive the effects. The shape of every user-triggered operation.
    pub(crate) fn with_inner<R>(
        self: &Arc<NodeShared>,
        f: impl FnOnce(&mut NodeInner, &mut Effects) -> R,
    ) -> R {
        let mut inner = self.inner.lock().unwrap();
        let mut fx = Effects::default();
        let result = f(&mut inner, &mut fx);
        self.drive(&mut inner, fx);
        result
    }
}

impl Drop for NodeShared {
    fn drop(&mut self) {
        info!("destroying overlay node {:?}", self.node_id);

        let mut registry = registry().lock().unwrap();
        if let Some(stale) = registry.get(&self.home) {
            if stale.strong_count() == 0 {
                registry.remove(&self.home);
            }
        }
        drop(registry);

        let inner = self.inner.get_mut().unwrap();
        inner.close_all(ZtError::Closed);

        self.bg.close();
        for task in self.io_tasks.get_mut().unwrap().drain(..) {
            task.abort();
        }
    }
}

async fn recv_loop(weak: Weak<NodeShared>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_MTU + RCV_HEADROOM];
    loop {
        let received = socket.recv_packet(&mut buf).await;
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match received {
            Ok((len, from)) => shared.on_wire_packet(from, &buf[..len]),
            Err(e) => {
                // transient by assumption; the socket is rearmed regardless
                error!("UDP receive error: {}", e);
            }
        }
        if shared.inner.lock().unwrap().closed {
            return;
        }
    }
}

/// The background worker: sleeps until the overlay's requested wakeup time,
///  then runs its housekeeping under the node lock. The thread holds the
///  node only weakly so that it never keeps a dead node alive.
fn bg_loop(weak: Weak<NodeShared>, bg: Arc<BgScheduler>) {
    loop {
        {
            let mut state = bg.state.lock().unwrap();
            loop {
                if state.closed {
                    return;
                }
                let now = now_msec();
                if now >= state.next_run {
                    state.next_run = u64::MAX;
                    break;
                }
                let wait = Duration::from_millis((state.next_run - now).min(60_000));
                state = bg.cv.wait_timeout(state, wait).unwrap().0;
            }
        }

        let Some(shared) = weak.upgrade() else {
            return;
        };
        shared.run_background_tasks();
    }
}

impl NodeInner {
    /// Demultiplexes one virtual-network frame: pipes by laddr first, then
    ///  endpoints, then the canned rejections.
    pub(crate) fn route_frame(&mut self, node: &Node, inbound: &InboundFrame, fx: &mut Effects) {
        if inbound.ethertype != ETHERTYPE {
            debug!("frame with foreign ethertype {:#06x}, dropping", inbound.ethertype);
            return;
        }
        if NodeId::from_mac(inbound.dst_mac, inbound.nwid) != self.node_id {
            debug!("frame for a foreign destination MAC, dropping");
            return;
        }

        let mut buf = inbound.payload.as_slice();
        let header = match FrameHeader::deser(&mut buf) {
            Ok(header) => header,
            Err(e) => {
                debug!("unparsable frame header: {}", e);
                return;
            }
        };

        let raddr = Address::new(
            NodeId::from_mac(inbound.src_mac, inbound.nwid),
            header.src_port,
        );
        let laddr = Address::new(self.node_id, header.dst_port);

        let frame = match Frame::deser_body(&header, &mut buf) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("bad frame from {:?}: {}", raddr, e);
                if raddr.is_bound() {
                    self.send_error(inbound.nwid, laddr, raddr, WireErrorCode::Proto, "bad frame", fx);
                }
                return;
            }
        };
        trace!("routing {:?} from {:?} to {:?}", frame, raddr, laddr);

        if let Some(pipe) = self.pipes.get_mut(&laddr) {
            if pipe.raddr == raddr {
                self.on_pipe_frame(laddr, &frame, fx);
                return;
            }
            if !pipe.raddr.is_bound() {
                pipe.raddr = raddr;
                self.peers.insert(raddr, laddr);
                self.on_pipe_frame(laddr, &frame, fx);
                return;
            }
            // wrong peer for this pipe: fall through like any unroutable frame
        }

        if let Some(&endpoint_id) = self.endpoint_addrs.get(&laddr) {
            self.on_endpoint_frame(node, endpoint_id, inbound.nwid, &frame, raddr, fx);
            return;
        }

        match frame.kind {
            FrameKind::ConnReq { .. } => {
                self.send_error(inbound.nwid, laddr, raddr, WireErrorCode::Refused, "connection refused", fx)
            }
            FrameKind::Data { .. } | FrameKind::PingReq | FrameKind::ConnAck { .. } => {
                self.send_error(inbound.nwid, laddr, raddr, WireErrorCode::NotConn, "no such connection", fx)
            }
            _ => trace!("dropping unroutable {:?}", frame),
        }
    }

    /// Serializes a frame and hands it to the overlay for delivery to
    ///  `raddr`'s node. Failures are best-effort except fatal overlay errors.
    pub(crate) fn send_frame(
        &mut self,
        nwid: u64,
        laddr: Address,
        raddr: Address,
        kind: FrameKind,
        fx: &mut Effects,
    ) {
        let frame = Frame {
            dst_port: raddr.port(),
            src_port: laddr.port(),
            kind,
        };
        trace!("sending {:?} on network {:#x}", frame, nwid);

        let mut buf = Vec::new();
        frame.ser(&mut buf);

        let src_mac = self.node_id.to_mac(nwid);
        let dst_mac = raddr.node().to_mac(nwid);
        let now = now_msec();

        let result = {
            let NodeInner { overlay, state, .. } = self;
            let mut sink = EffectSink {
                state,
                fx: &mut *fx,
            };
            overlay.virtual_send(now, nwid, src_mac, dst_mac, ETHERTYPE, &buf, &mut sink)
        };
        match result {
            Ok(next) => fx.merge_resched(next),
            Err(e) if e.is_fatal() => fx.fatal = true,
            Err(e) => debug!("overlay could not send frame to {:?}: {}", raddr, e),
        }
    }

    pub(crate) fn send_error(
        &mut self,
        nwid: u64,
        laddr: Address,
        raddr: Address,
        code: WireErrorCode,
        reason: &str,
        fx: &mut Effects,
    ) {
        self.send_frame(
            nwid,
            laddr,
            raddr,
            FrameKind::Error {
                code,
                reason: reason.to_string(),
            },
            fx,
        );
    }

    /// UP / CONFIG_UPDATE: refresh endpoint MTUs; a dialer mid-connect gets
    ///  its CONN_REQ re-sent right away instead of waiting for the timer.
    fn on_network_config(
        &mut self,
        nwid: u64,
        op: ConfigOperation,
        config: &VirtualNetworkConfig,
        fx: &mut Effects,
    ) {
        match op {
            ConfigOperation::Up | ConfigOperation::ConfigUpdate => {}
            ConfigOperation::Down | ConfigOperation::Destroy => return,
        }
        debug!("network {:#x} config: mtu {}, phy mtu {}", nwid, config.mtu, config.phy_mtu);

        let ids = self
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.nwid == nwid)
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();
        for id in ids {
            self.endpoint_apply_config(id, config, fx);
        }
    }

    /// Fails every pending operation and empties the indexes. Called on
    ///  fatal overlay errors and on destruction.
    pub(crate) fn close_all(&mut self, error: ZtError) {
        if self.closed {
            return;
        }
        self.closed = true;

        for (_, endpoint) in self.endpoints.drain() {
            endpoint.fail_waiters(error);
        }
        self.endpoint_addrs.clear();
        for (_, pipe) in self.pipes.drain() {
            pipe.fail_pending(error);
        }
        self.peers.clear();
    }
}
