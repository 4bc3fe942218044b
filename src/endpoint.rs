use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::addr::Address;
use crate::config::ZtConfig;
use crate::error::{ZtError, ZtResult};
use crate::frame::{Frame, FrameKind, WireErrorCode};
use crate::node::{now_msec, Effects, EffectSink, Node, NodeInner, NodeShared};
use crate::overlay::{OverlayFactory, VirtualNetworkConfig, MAX_MTU, MIN_MTU};
use crate::pipe::Pipe;
use crate::zt_url::ZtUrl;

/// A connection request a listener has taken in but not yet paired with an
///  accept.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnRequest {
    pub expire: u64,
    pub raddr: Address,
    pub proto: u16,
}

/// Fixed-capacity ring of pending connection requests. Entries expire in
///  place and are discarded lazily when the ring is drained.
pub(crate) struct ConnBacklog {
    entries: Vec<Option<ConnRequest>>,
    head: u64,
    tail: u64,
}

impl ConnBacklog {
    pub fn new(capacity: usize) -> ConnBacklog {
        ConnBacklog {
            entries: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
        }
    }

    fn slot(&self, i: u64) -> usize {
        (i % self.entries.len() as u64) as usize
    }

    /// True if a live entry for this remote address is already queued.
    pub fn contains(&self, raddr: Address, now: u64) -> bool {
        (self.tail..self.head).any(|i| {
            matches!(&self.entries[self.slot(i)], Some(req) if req.raddr == raddr && req.expire > now)
        })
    }

    /// False if the ring is full - the request is then dropped silently and
    ///  the dialer's retry gets another chance later.
    pub fn push(&mut self, request: ConnRequest) -> bool {
        if self.head - self.tail == self.entries.len() as u64 {
            return false;
        }
        let slot = self.slot(self.head);
        self.entries[slot] = Some(request);
        self.head += 1;
        true
    }

    /// Pops the oldest non-expired entry, discarding expired ones on the way.
    pub fn pop_valid(&mut self, now: u64) -> Option<ConnRequest> {
        while self.tail < self.head {
            let slot = self.slot(self.tail);
            let request = self.entries[slot].take().expect("queued slot must be filled");
            self.tail += 1;
            if request.expire > now {
                return Some(request);
            }
            trace!("discarding expired connection request from {:?}", request.raddr);
        }
        None
    }

    pub fn len(&self) -> usize {
        (self.head - self.tail) as usize
    }
}

pub(crate) struct DialState {
    pub raddr: Address,
    pub tries: u32,
    pub waiter: Option<oneshot::Sender<ZtResult<Pipe>>>,
    pub timer: Option<JoinHandle<()>>,
}

pub(crate) struct ListenState {
    pub backlog: ConnBacklog,
    pub waiters: VecDeque<oneshot::Sender<ZtResult<Pipe>>>,
}

pub(crate) enum EndpointMode {
    Dial(DialState),
    Listen(ListenState),
}

/// One dialing or listening endpoint, registered in its node under `laddr`
///  for as long as that address is bound.
pub(crate) struct EndpointState {
    pub nwid: u64,
    pub laddr: Address,
    pub proto: u16,
    pub recv_max: usize,
    pub max_mtu: usize,
    pub phy_mtu: usize,
    pub mode: EndpointMode,
}

impl EndpointState {
    /// Terminates every pending user operation on this endpoint.
    pub(crate) fn fail_waiters(self, error: ZtError) {
        match self.mode {
            EndpointMode::Dial(mut dial) => {
                if let Some(timer) = dial.timer.take() {
                    timer.abort();
                }
                if let Some(waiter) = dial.waiter.take() {
                    let _ = waiter.send(Err(error));
                }
            }
            EndpointMode::Listen(mut listen) => {
                for waiter in listen.waiters.drain(..) {
                    let _ = waiter.send(Err(error));
                }
            }
        }
    }
}

fn arm_connect_timer(node: &Node, endpoint_id: u64, interval: Duration) -> JoinHandle<()> {
    let weak = Arc::downgrade(&node.shared);
    node.shared.rt.spawn(async move {
        tokio::time::sleep(interval).await;
        if let Some(shared) = weak.upgrade() {
            shared.on_connect_timer(endpoint_id);
        }
    })
}

impl NodeShared {
    fn on_connect_timer(self: &Arc<NodeShared>, endpoint_id: u64) {
        let node = Node {
            shared: self.clone(),
        };
        self.with_inner(|inner, fx| inner.connect_timer_fired(&node, endpoint_id, fx));
    }
}

impl NodeInner {
    /// Joins the endpoint's network, returning its current config if the
    ///  overlay already has one.
    fn join_network(
        &mut self,
        nwid: u64,
        fx: &mut Effects,
    ) -> ZtResult<Option<VirtualNetworkConfig>> {
        let result = {
            let NodeInner { overlay, state, .. } = self;
            let mut sink = EffectSink {
                state,
                fx: &mut *fx,
            };
            overlay.join(nwid, &mut sink)
        };
        match result {
            Ok(()) => Ok(self.overlay.network_config(nwid)),
            Err(e) if e.is_fatal() => {
                fx.fatal = true;
                Err(ZtError::Internal)
            }
            Err(e) => Err(ZtError::from_overlay(e)),
        }
    }

    pub(crate) fn add_dialer(
        &mut self,
        nwid: u64,
        raddr: Address,
        sp_proto: u16,
        recv_max: usize,
    ) -> ZtResult<u64> {
        if self.closed {
            return Err(ZtError::Closed);
        }
        let id = self.next_endpoint_id;
        self.next_endpoint_id += 1;
        self.endpoints.insert(
            id,
            EndpointState {
                nwid,
                laddr: Address::UNBOUND,
                proto: sp_proto,
                recv_max,
                max_mtu: MAX_MTU,
                phy_mtu: MIN_MTU,
                mode: EndpointMode::Dial(DialState {
                    raddr,
                    tries: 0,
                    waiter: None,
                    timer: None,
                }),
            },
        );
        Ok(id)
    }

    pub(crate) fn add_listener(
        &mut self,
        nwid: u64,
        port: u32,
        sp_proto: u16,
        recv_max: usize,
        fx: &mut Effects,
    ) -> ZtResult<u64> {
        if self.closed {
            return Err(ZtError::Closed);
        }

        let port = if port == 0 {
            self.ports.allocate(())? as u32
        } else {
            self.ports.insert(port as u64, ())?;
            port
        };
        let laddr = Address::new(self.node_id, port);

        let id = self.next_endpoint_id;
        self.next_endpoint_id += 1;
        self.endpoints.insert(
            id,
            EndpointState {
                nwid,
                laddr,
                proto: sp_proto,
                recv_max,
                max_mtu: MAX_MTU,
                phy_mtu: MIN_MTU,
                mode: EndpointMode::Listen(ListenState {
                    backlog: ConnBacklog::new(self.config.listen_queue),
                    waiters: VecDeque::new(),
                }),
            },
        );
        self.endpoint_addrs.insert(laddr, id);

        match self.join_network(nwid, fx) {
            Ok(config) => {
                if let Some(config) = config {
                    let ep = self.endpoints.get_mut(&id).expect("endpoint just inserted");
                    ep.max_mtu = config.mtu;
                    ep.phy_mtu = config.phy_mtu;
                }
                Ok(id)
            }
            Err(e) => {
                self.endpoints.remove(&id);
                self.endpoint_addrs.remove(&laddr);
                self.ports.remove(port as u64);
                Err(e)
            }
        }
    }

    /// Starts (or restarts) the connect handshake: binds an ephemeral local
    ///  port if unbound, joins the network, sends the first CONN_REQ and arms
    ///  the retry timer. Completion arrives through the returned channel.
    pub(crate) fn begin_connect(
        &mut self,
        node: &Node,
        endpoint_id: u64,
        fx: &mut Effects,
    ) -> ZtResult<oneshot::Receiver<ZtResult<Pipe>>> {
        if self.closed {
            return Err(ZtError::Closed);
        }

        let (needs_bind, nwid) = {
            let ep = self.endpoints.get(&endpoint_id).ok_or(ZtError::Closed)?;
            match &ep.mode {
                EndpointMode::Dial(dial) => {
                    if matches!(&dial.waiter, Some(w) if !w.is_closed()) {
                        return Err(ZtError::Busy);
                    }
                }
                EndpointMode::Listen(_) => return Err(ZtError::NotSup),
            }
            (!ep.laddr.is_bound(), ep.nwid)
        };

        if needs_bind {
            let port = self.ports.allocate(())?;
            let laddr = Address::new(self.node_id, port as u32);
            self.endpoints
                .get_mut(&endpoint_id)
                .expect("endpoint checked above")
                .laddr = laddr;
            self.endpoint_addrs.insert(laddr, endpoint_id);
        }

        if let Some(config) = self.join_network(nwid, fx)? {
            let ep = self.endpoints.get_mut(&endpoint_id).expect("endpoint checked above");
            ep.max_mtu = config.mtu;
            ep.phy_mtu = config.phy_mtu;
            trace!("joined network {:#x}: mtu {}, physical mtu {}", nwid, ep.max_mtu, ep.phy_mtu);
        }

        let ep = self.endpoints.get_mut(&endpoint_id).expect("endpoint checked above");
        let (laddr, proto) = (ep.laddr, ep.proto);
        let EndpointMode::Dial(dial) = &mut ep.mode else {
            unreachable!("mode checked above");
        };
        let raddr = dial.raddr;
        dial.tries = 1;

        let (tx, rx) = oneshot::channel();
        dial.waiter = Some(tx);
        if let Some(old) = dial.timer.take() {
            old.abort();
        }
        dial.timer = Some(arm_connect_timer(node, endpoint_id, self.config.conn_interval));

        debug!("connecting {:?} -> {:?} on network {:#x}", laddr, raddr, nwid);
        self.send_frame(nwid, laddr, raddr, FrameKind::ConnReq { sp_proto: proto }, fx);

        Ok(rx)
    }

    fn connect_timer_fired(&mut self, node: &Node, endpoint_id: u64, fx: &mut Effects) {
        if self.closed {
            return;
        }
        let Some(ep) = self.endpoints.get_mut(&endpoint_id) else {
            return;
        };
        let (nwid, laddr, proto) = (ep.nwid, ep.laddr, ep.proto);
        let EndpointMode::Dial(dial) = &mut ep.mode else {
            return;
        };
        let raddr = dial.raddr;

        match &dial.waiter {
            None => {
                dial.tries = 0;
                dial.timer = None;
                return;
            }
            Some(waiter) if waiter.is_closed() => {
                debug!("connect to {:?} canceled by caller", raddr);
                dial.waiter = None;
                dial.tries = 0;
                dial.timer = None;
                return;
            }
            Some(_) => {}
        }

        if dial.tries >= self.config.conn_attempts {
            debug!("connect to {:?} gave up after {} attempts", raddr, dial.tries);
            let waiter = dial.waiter.take().expect("waiter checked above");
            dial.tries = 0;
            dial.timer = None;
            let _ = waiter.send(Err(ZtError::TimedOut));
            return;
        }

        dial.tries += 1;
        trace!("re-sending connection request to {:?} (attempt {})", raddr, dial.tries);
        dial.timer = Some(arm_connect_timer(node, endpoint_id, self.config.conn_interval));
        self.send_frame(nwid, laddr, raddr, FrameKind::ConnReq { sp_proto: proto }, fx);
    }

    /// Registers an accept waiter and immediately tries to pair it with a
    ///  queued connection request.
    pub(crate) fn begin_accept(
        &mut self,
        node: &Node,
        endpoint_id: u64,
        fx: &mut Effects,
    ) -> ZtResult<oneshot::Receiver<ZtResult<Pipe>>> {
        if self.closed {
            return Err(ZtError::Closed);
        }
        let ep = self.endpoints.get_mut(&endpoint_id).ok_or(ZtError::Closed)?;
        let EndpointMode::Listen(listen) = &mut ep.mode else {
            return Err(ZtError::NotSup);
        };

        let (tx, rx) = oneshot::channel();
        listen.waiters.push_back(tx);
        self.drain_backlog(node, endpoint_id, fx);
        Ok(rx)
    }

    pub(crate) fn on_endpoint_frame(
        &mut self,
        node: &Node,
        endpoint_id: u64,
        nwid: u64,
        frame: &Frame,
        raddr: Address,
        fx: &mut Effects,
    ) {
        let Some(ep) = self.endpoints.get(&endpoint_id) else {
            return;
        };
        if ep.nwid != nwid {
            debug!("frame on network {:#x} for endpoint joined to {:#x}, dropping", nwid, ep.nwid);
            return;
        }
        let laddr = ep.laddr;
        let is_dialer = matches!(ep.mode, EndpointMode::Dial(_));

        match (&frame.kind, is_dialer) {
            (FrameKind::ConnAck { sp_proto }, true) => {
                self.dialer_conn_acked(node, endpoint_id, nwid, raddr, *sp_proto, fx)
            }
            (FrameKind::Error { code, reason }, true) => {
                debug!("connect rejected by {:?}: {:?} ({})", raddr, code, reason);
                let Some(ep) = self.endpoints.get_mut(&endpoint_id) else {
                    return;
                };
                let EndpointMode::Dial(dial) = &mut ep.mode else {
                    return;
                };
                if let Some(timer) = dial.timer.take() {
                    timer.abort();
                }
                dial.tries = 0;
                if let Some(waiter) = dial.waiter.take() {
                    let _ = waiter.send(Err(ZtError::from_wire(*code)));
                }
            }
            (FrameKind::ConnReq { sp_proto }, false) => {
                self.listener_conn_requested(node, endpoint_id, nwid, raddr, *sp_proto, fx)
            }
            (FrameKind::ConnReq { .. }, true) => {
                self.send_error(nwid, laddr, raddr, WireErrorCode::Proto, "endpoint is dialing", fx)
            }
            (FrameKind::Data { .. }, _) | (FrameKind::PingReq, _) => {
                self.send_error(nwid, laddr, raddr, WireErrorCode::NotConn, "no such connection", fx)
            }
            (FrameKind::ConnAck { .. }, false) => {
                self.send_error(nwid, laddr, raddr, WireErrorCode::NotConn, "not dialing", fx)
            }
            (kind, _) => trace!("endpoint {:?} ignoring {:?}", laddr, kind),
        }
    }

    /// The dialer's CONN_ACK path: learn the peer protocol, hand the bound
    ///  address over to a fresh pipe, and complete the waiting connect.
    ///  The ack may come from a different port than the one dialed - the
    ///  listener answers from the pipe's own ephemeral port.
    fn dialer_conn_acked(
        &mut self,
        node: &Node,
        endpoint_id: u64,
        nwid: u64,
        raddr: Address,
        peer_proto: u16,
        fx: &mut Effects,
    ) {
        let Some(ep) = self.endpoints.get_mut(&endpoint_id) else {
            return;
        };
        let (laddr, proto, recv_max, peer_mtu) = (ep.laddr, ep.proto, ep.recv_max, ep.max_mtu);
        let EndpointMode::Dial(dial) = &mut ep.mode else {
            return;
        };
        if dial.tries == 0 {
            trace!("unsolicited CONN_ACK from {:?}, dropping", raddr);
            return;
        }

        let waiter = dial.waiter.take();
        if let Some(timer) = dial.timer.take() {
            timer.abort();
        }
        dial.tries = 0;

        // the pipe owns the address from here on
        ep.laddr = Address::UNBOUND;
        self.endpoint_addrs.remove(&laddr);

        match waiter {
            Some(waiter) if !waiter.is_closed() => {
                self.install_pipe(node, nwid, laddr, raddr, proto, peer_proto, recv_max, peer_mtu);
                debug!("connected {:?} -> {:?}", laddr, raddr);
                let pipe = Pipe::attach(node.clone(), laddr);
                if let Err(result) = waiter.send(Ok(pipe)) {
                    if let Ok(mut unwanted) = result {
                        unwanted.detach();
                    }
                    self.close_pipe(laddr, ZtError::Closed, true, fx);
                }
            }
            _ => {
                // canceled connect: nobody wants the pipe, notify the peer
                self.send_frame(nwid, laddr, raddr, FrameKind::DiscReq, fx);
                self.ports.remove(laddr.port() as u64);
            }
        }
    }

    fn listener_conn_requested(
        &mut self,
        node: &Node,
        endpoint_id: u64,
        nwid: u64,
        raddr: Address,
        peer_proto: u16,
        fx: &mut Effects,
    ) {
        // a retransmitted CONN_REQ for an established conversation is
        //  re-acknowledged, never turned into a second pipe
        if let Some(&pipe_laddr) = self.peers.get(&raddr) {
            if let Some(pipe) = self.pipes.get(&pipe_laddr) {
                let proto = pipe.proto;
                debug!("duplicate CONN_REQ from {:?}, re-acknowledging", raddr);
                self.send_frame(nwid, pipe_laddr, raddr, FrameKind::ConnAck { sp_proto: proto }, fx);
                return;
            }
        }

        let now = now_msec();
        let expire = now + self.config.listen_expire.as_millis() as u64;
        let Some(ep) = self.endpoints.get_mut(&endpoint_id) else {
            return;
        };
        let EndpointMode::Listen(listen) = &mut ep.mode else {
            return;
        };

        if !listen.backlog.contains(raddr, now) {
            let accepted = listen.backlog.push(ConnRequest {
                expire,
                raddr,
                proto: peer_proto,
            });
            if !accepted {
                debug!("listen backlog full, dropping CONN_REQ from {:?}", raddr);
            }
        }

        self.drain_backlog(node, endpoint_id, fx);
    }

    /// Pairs queued connection requests with accept waiters: each pairing
    ///  creates a pipe on its own ephemeral port and acknowledges from
    ///  there, leaving the listener free on its well-known port.
    fn drain_backlog(&mut self, node: &Node, endpoint_id: u64, fx: &mut Effects) {
        loop {
            let now = now_msec();
            let Some(ep) = self.endpoints.get_mut(&endpoint_id) else {
                return;
            };
            let (nwid, proto, recv_max, peer_mtu) = (ep.nwid, ep.proto, ep.recv_max, ep.max_mtu);
            let EndpointMode::Listen(listen) = &mut ep.mode else {
                return;
            };

            while matches!(listen.waiters.front(), Some(w) if w.is_closed()) {
                listen.waiters.pop_front();
            }
            if listen.waiters.is_empty() {
                return;
            }
            let Some(request) = listen.backlog.pop_valid(now) else {
                return;
            };
            let waiter = listen.waiters.pop_front().expect("waiter checked above");

            let port = match self.ports.allocate(()) {
                Ok(port) => port,
                Err(e) => {
                    warn!("no free port for accepted connection: {}", e);
                    let _ = waiter.send(Err(e));
                    continue;
                }
            };
            let pipe_laddr = Address::new(self.node_id, port as u32);

            self.install_pipe(node, nwid, pipe_laddr, request.raddr, proto, request.proto, recv_max, peer_mtu);
            self.send_frame(nwid, pipe_laddr, request.raddr, FrameKind::ConnAck { sp_proto: proto }, fx);
            debug!("accepted {:?} on {:?}", request.raddr, pipe_laddr);

            let pipe = Pipe::attach(node.clone(), pipe_laddr);
            if let Err(result) = waiter.send(Ok(pipe)) {
                if let Ok(mut unwanted) = result {
                    unwanted.detach();
                }
                self.close_pipe(pipe_laddr, ZtError::Closed, true, fx);
            }
        }
    }

    pub(crate) fn endpoint_apply_config(
        &mut self,
        endpoint_id: u64,
        config: &VirtualNetworkConfig,
        fx: &mut Effects,
    ) {
        let Some(ep) = self.endpoints.get_mut(&endpoint_id) else {
            return;
        };
        ep.max_mtu = config.mtu;
        ep.phy_mtu = config.phy_mtu;

        let (nwid, laddr, proto) = (ep.nwid, ep.laddr, ep.proto);
        if let EndpointMode::Dial(dial) = &mut ep.mode {
            if dial.tries > 0 && matches!(&dial.waiter, Some(w) if !w.is_closed()) {
                let raddr = dial.raddr;
                trace!("network config arrived mid-connect, re-sending CONN_REQ to {:?}", raddr);
                self.send_frame(nwid, laddr, raddr, FrameKind::ConnReq { sp_proto: proto }, fx);
            }
        }
    }

    pub(crate) fn close_endpoint(&mut self, endpoint_id: u64) {
        let Some(ep) = self.endpoints.remove(&endpoint_id) else {
            return;
        };
        if ep.laddr.is_bound() {
            self.endpoint_addrs.remove(&ep.laddr);
            self.ports.remove(ep.laddr.port() as u64);
        }
        ep.fail_waiters(ZtError::Closed);
    }

    pub(crate) fn endpoint_local_port(&self, endpoint_id: u64) -> Option<u32> {
        self.endpoints
            .get(&endpoint_id)
            .filter(|ep| ep.laddr.is_bound())
            .map(|ep| ep.laddr.port())
    }
}

/// Dialing endpoint handle: resolves a `zt://<nwid>/<node>:<port>` URL and
///  produces pipes via [`Dialer::connect`].
pub struct Dialer {
    pub(crate) node: Node,
    pub(crate) endpoint_id: u64,
    active: bool,
}

impl Dialer {
    pub async fn new(
        url: &str,
        sp_proto: u16,
        config: ZtConfig,
        factory: Arc<dyn OverlayFactory>,
    ) -> ZtResult<Dialer> {
        config.validate().map_err(|_| ZtError::Inval)?;
        let ZtUrl::Dial { nwid, node: remote, port } = ZtUrl::parse_dial(url)? else {
            unreachable!("parse_dial only returns dial URLs");
        };

        let node = Node::find(&config, &factory).await?;
        let raddr = Address::new(remote, port);
        let endpoint_id = node
            .shared
            .with_inner(|inner, _| inner.add_dialer(nwid, raddr, sp_proto, config.recv_max))?;

        Ok(Dialer {
            node,
            endpoint_id,
            active: true,
        })
    }

    /// Performs the connect handshake. Retries internally every
    ///  `conn_interval` and gives up after `conn_attempts` tries. Dropping
    ///  the returned future cancels the attempt.
    pub async fn connect(&self) -> ZtResult<Pipe> {
        let node = self.node.clone();
        let rx = node
            .shared
            .with_inner(|inner, fx| inner.begin_connect(&node, self.endpoint_id, fx))?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ZtError::Closed),
        }
    }

    /// The `zt:nwid` option: the virtual network this endpoint dials on.
    pub fn nwid(&self) -> u64 {
        self.node
            .shared
            .with_inner(|inner, _| inner.endpoints.get(&self.endpoint_id).map(|ep| ep.nwid))
            .unwrap_or(0)
    }

    /// The `zt:node` option: this endpoint's own overlay node id.
    pub fn node_id(&self) -> u64 {
        self.node.node_id().to_raw()
    }

    /// The currently bound local port, once a connect has bound one.
    pub fn local_port(&self) -> Option<u32> {
        self.node
            .shared
            .with_inner(|inner, _| inner.endpoint_local_port(self.endpoint_id))
    }

    pub fn close(mut self) {
        self.do_close();
    }

    fn do_close(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.node
            .shared
            .with_inner(|inner, _| inner.close_endpoint(self.endpoint_id));
    }
}

impl Drop for Dialer {
    fn drop(&mut self) {
        self.do_close();
    }
}

/// Listening endpoint handle: binds a `zt://<nwid>[/*]:<port>` URL and
///  produces pipes via [`Listener::accept`].
pub struct Listener {
    pub(crate) node: Node,
    pub(crate) endpoint_id: u64,
    active: bool,
}

impl Listener {
    pub async fn bind(
        url: &str,
        sp_proto: u16,
        config: ZtConfig,
        factory: Arc<dyn OverlayFactory>,
    ) -> ZtResult<Listener> {
        config.validate().map_err(|_| ZtError::Inval)?;
        let ZtUrl::Listen { nwid, port } = ZtUrl::parse_listen(url)? else {
            unreachable!("parse_listen only returns listen URLs");
        };

        let node = Node::find(&config, &factory).await?;
        let endpoint_id = node
            .shared
            .with_inner(|inner, fx| inner.add_listener(nwid, port, sp_proto, config.recv_max, fx))?;

        Ok(Listener {
            node,
            endpoint_id,
            active: true,
        })
    }

    /// Waits for an incoming connection. Dropping the returned future gives
    ///  the accept slot up; queued connection requests stay in the backlog
    ///  until they expire or another accept arrives.
    pub async fn accept(&self) -> ZtResult<Pipe> {
        let node = self.node.clone();
        let rx = node
            .shared
            .with_inner(|inner, fx| inner.begin_accept(&node, self.endpoint_id, fx))?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ZtError::Closed),
        }
    }

    pub fn nwid(&self) -> u64 {
        self.node
            .shared
            .with_inner(|inner, _| inner.endpoints.get(&self.endpoint_id).map(|ep| ep.nwid))
            .unwrap_or(0)
    }

    pub fn node_id(&self) -> u64 {
        self.node.node_id().to_raw()
    }

    /// The bound port - the requested one, or the allocated ephemeral port
    ///  when the URL asked for port 0.
    pub fn port(&self) -> u32 {
        self.node
            .shared
            .with_inner(|inner, _| inner.endpoint_local_port(self.endpoint_id))
            .unwrap_or(0)
    }

    pub fn close(mut self) {
        self.do_close();
    }

    fn do_close(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.node
            .shared
            .with_inner(|inner, _| inner.close_endpoint(self.endpoint_id));
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.do_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::NodeId;

    fn addr(node: u64, port: u32) -> Address {
        Address::new(NodeId::from_raw(node), port)
    }

    fn request(node: u64, port: u32, expire: u64) -> ConnRequest {
        ConnRequest {
            expire,
            raddr: addr(node, port),
            proto: 0x10,
        }
    }

    #[test]
    fn test_backlog_fifo() {
        let mut backlog = ConnBacklog::new(4);
        assert!(backlog.push(request(1, 1, 100)));
        assert!(backlog.push(request(2, 2, 100)));
        assert_eq!(backlog.len(), 2);

        assert_eq!(backlog.pop_valid(0).unwrap().raddr, addr(1, 1));
        assert_eq!(backlog.pop_valid(0).unwrap().raddr, addr(2, 2));
        assert!(backlog.pop_valid(0).is_none());
    }

    #[test]
    fn test_backlog_drops_when_full() {
        let mut backlog = ConnBacklog::new(2);
        assert!(backlog.push(request(1, 1, 100)));
        assert!(backlog.push(request(2, 2, 100)));
        assert!(!backlog.push(request(3, 3, 100)));

        // popping makes room again
        backlog.pop_valid(0);
        assert!(backlog.push(request(3, 3, 100)));
    }

    #[test]
    fn test_backlog_expired_entries_are_never_delivered() {
        let mut backlog = ConnBacklog::new(4);
        backlog.push(request(1, 1, 10));
        backlog.push(request(2, 2, 100));

        assert_eq!(backlog.pop_valid(50).unwrap().raddr, addr(2, 2));
        assert!(backlog.pop_valid(50).is_none());
    }

    #[test]
    fn test_backlog_dedupe_window() {
        let mut backlog = ConnBacklog::new(4);
        backlog.push(request(1, 1, 100));

        assert!(backlog.contains(addr(1, 1), 0));
        assert!(!backlog.contains(addr(2, 2), 0));
        // an expired entry no longer blocks a fresh request
        assert!(!backlog.contains(addr(1, 1), 200));
    }

    #[test]
    fn test_backlog_wraps_around() {
        let mut backlog = ConnBacklog::new(2);
        for i in 0..10u32 {
            assert!(backlog.push(request(i as u64 + 1, i + 1, 100)));
            assert_eq!(backlog.pop_valid(0).unwrap().raddr, addr(i as u64 + 1, i + 1));
        }
        assert_eq!(backlog.len(), 0);
    }
}
