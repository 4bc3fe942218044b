use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::addr::Address;
use crate::error::{ZtError, ZtResult};
use crate::fragment::{DeliverOutcome, Reassembler};
use crate::frame::{Frame, FrameKind, WireErrorCode, DATA_HEADER_LEN, MAX_FRAGS};
use crate::node::{now_msec, Effects, Node, NodeInner, NodeShared};

/// Established-connection state, registered in the node under `laddr` and -
///  via the peer index - under `raddr`.
pub(crate) struct PipeState {
    pub nwid: u64,
    pub laddr: Address,
    pub raddr: Address,
    pub proto: u16,
    pub peer_proto: u16,
    pub peer_mtu: usize,
    pub recv_max: usize,
    /// id for the next outgoing message; wraps around skipping zero
    pub next_msg_id: u16,
    pub pending_read: Option<oneshot::Sender<ZtResult<Vec<u8>>>>,
    pub reassembly: Reassembler,
    pub last_recv: u64,
    pub pings_outstanding: u32,
    pub keepalive: Option<JoinHandle<()>>,
}

impl PipeState {
    /// Terminates the pending read and stops the keepalive loop.
    pub(crate) fn fail_pending(mut self, error: ZtError) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        if let Some(pending) = self.pending_read.take() {
            let _ = pending.send(Err(error));
        }
    }
}

pub(crate) enum RecvBegin {
    Ready(Vec<u8>),
    Wait(oneshot::Receiver<ZtResult<Vec<u8>>>),
}

fn spawn_keepalive(node: &Node, laddr: Address, interval: Duration) -> JoinHandle<()> {
    let weak = Arc::downgrade(&node.shared);
    node.shared.rt.spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if !shared.on_keepalive_tick(laddr) {
                return;
            }
        }
    })
}

impl NodeShared {
    /// Returns false once the pipe is gone and the loop should stop.
    fn on_keepalive_tick(self: &Arc<NodeShared>, laddr: Address) -> bool {
        self.with_inner(|inner, fx| inner.keepalive_tick(laddr, fx))
    }
}

impl NodeInner {
    /// Registers a new pipe in all indexes and starts its keepalive loop.
    pub(crate) fn install_pipe(
        &mut self,
        node: &Node,
        nwid: u64,
        laddr: Address,
        raddr: Address,
        proto: u16,
        peer_proto: u16,
        recv_max: usize,
        peer_mtu: usize,
    ) {
        let keepalive = self
            .config
            .ping_interval
            .map(|interval| spawn_keepalive(node, laddr, interval));

        let state = PipeState {
            nwid,
            laddr,
            raddr,
            proto,
            peer_proto,
            peer_mtu,
            recv_max,
            next_msg_id: 1,
            pending_read: None,
            reassembly: Reassembler::new(self.config.recvq),
            last_recv: now_msec(),
            pings_outstanding: 0,
            keepalive,
        };

        debug_assert!(!self.pipes.contains_key(&laddr));
        debug_assert!(!self.peers.contains_key(&raddr));
        self.pipes.insert(laddr, state);
        self.peers.insert(raddr, laddr);
    }

    /// The send path: the gather list is segmented into `peer_mtu`-bounded
    ///  fragments and handed to the overlay one by one. Completion is
    ///  synchronous and best-effort, as for any datagram send.
    pub(crate) fn pipe_send(
        &mut self,
        laddr: Address,
        parts: &[&[u8]],
        fx: &mut Effects,
    ) -> ZtResult<()> {
        if self.closed {
            return Err(ZtError::Closed);
        }
        let pipe = self.pipes.get_mut(&laddr).ok_or(ZtError::Closed)?;

        let frag_sz = pipe.peer_mtu.saturating_sub(DATA_HEADER_LEN);
        if frag_sz == 0 {
            return Err(ZtError::Internal);
        }

        let total: usize = parts.iter().map(|part| part.len()).sum();
        let nfrags = ((total + frag_sz - 1) / frag_sz).max(1);
        if nfrags >= MAX_FRAGS {
            return Err(ZtError::MsgSize);
        }

        let msg_id = pipe.next_msg_id;
        pipe.next_msg_id = if msg_id == u16::MAX { 1 } else { msg_id + 1 };
        let (nwid, raddr) = (pipe.nwid, pipe.raddr);

        let data = parts.concat();
        trace!("sending message #{} of {} bytes as {} fragments to {:?}", msg_id, total, nfrags, raddr);

        for frag_no in 0..nfrags {
            let start = frag_no * frag_sz;
            let end = (start + frag_sz).min(total);
            self.send_frame(
                nwid,
                laddr,
                raddr,
                FrameKind::Data {
                    msg_id,
                    frag_sz: frag_sz as u16,
                    frag_no: frag_no as u16,
                    nfrags: nfrags as u16,
                    payload: data[start..end].to_vec(),
                },
                fx,
            );
        }

        Ok(())
    }

    /// The receive path's posting side: returns a completed message if one
    ///  is already waiting, otherwise registers the single pending read.
    pub(crate) fn pipe_begin_recv(&mut self, laddr: Address) -> ZtResult<RecvBegin> {
        if self.closed {
            return Err(ZtError::Closed);
        }
        let stale = self.config.reassembly_stale.as_millis() as u64;
        let pipe = self.pipes.get_mut(&laddr).ok_or(ZtError::Closed)?;

        pipe.reassembly.gc(now_msec(), stale);
        if let Some(message) = pipe.reassembly.take_ready() {
            return Ok(RecvBegin::Ready(message));
        }

        if matches!(&pipe.pending_read, Some(tx) if !tx.is_closed()) {
            return Err(ZtError::Busy);
        }
        let (tx, rx) = oneshot::channel();
        pipe.pending_read = Some(tx);
        Ok(RecvBegin::Wait(rx))
    }

    pub(crate) fn on_pipe_frame(&mut self, laddr: Address, frame: &Frame, fx: &mut Effects) {
        let now = now_msec();
        let stale = self.config.reassembly_stale.as_millis() as u64;
        let Some(pipe) = self.pipes.get_mut(&laddr) else {
            return;
        };
        pipe.last_recv = now;
        let (nwid, raddr) = (pipe.nwid, pipe.raddr);

        match &frame.kind {
            FrameKind::Data {
                msg_id,
                frag_sz,
                frag_no,
                nfrags,
                payload,
            } => {
                let last = *frag_no + 1 == *nfrags;
                let outcome = pipe.reassembly.deliver(
                    now,
                    stale,
                    pipe.recv_max,
                    *msg_id,
                    *frag_sz,
                    *frag_no,
                    *nfrags,
                    last,
                    payload,
                );
                match outcome {
                    DeliverOutcome::Ready => {
                        if matches!(&pipe.pending_read, Some(tx) if !tx.is_closed()) {
                            let message =
                                pipe.reassembly.take_ready().expect("slot just became ready");
                            let pending =
                                pipe.pending_read.take().expect("pending read checked above");
                            let _ = pending.send(Ok(message));
                        }
                        // without a pending read the message stays in its
                        //  slot until the next read is posted
                    }
                    DeliverOutcome::Proto => {
                        self.send_error(
                            nwid,
                            laddr,
                            raddr,
                            WireErrorCode::Proto,
                            "inconsistent fragment",
                            fx,
                        );
                    }
                    DeliverOutcome::MsgSize => {
                        if let Some(pending) = pipe.pending_read.take() {
                            let _ = pending.send(Err(ZtError::MsgSize));
                        }
                        self.send_error(
                            nwid,
                            laddr,
                            raddr,
                            WireErrorCode::MsgSize,
                            "message exceeds receive limit",
                            fx,
                        );
                    }
                    DeliverOutcome::Stored
                    | DeliverOutcome::Duplicate
                    | DeliverOutcome::Dropped => {}
                }
            }
            FrameKind::DiscReq => {
                debug!("peer {:?} disconnected", raddr);
                self.close_pipe(laddr, ZtError::Closed, false, fx);
            }
            FrameKind::PingReq => {
                self.send_frame(nwid, laddr, raddr, FrameKind::PingAck, fx);
            }
            FrameKind::PingAck => {
                pipe.pings_outstanding = 0;
            }
            FrameKind::ConnAck { .. } => {
                trace!("duplicate CONN_ACK on established pipe {:?}", laddr);
            }
            FrameKind::ConnReq { .. } => {
                self.send_error(
                    nwid,
                    laddr,
                    raddr,
                    WireErrorCode::Proto,
                    "address owned by a connection",
                    fx,
                );
            }
            FrameKind::Error { code, reason } => {
                debug!("peer {:?} reported {:?} ({}), closing pipe", raddr, code, reason);
                self.close_pipe(laddr, ZtError::from_wire(*code), false, fx);
            }
        }
    }

    /// Removes the pipe from every index, fails its pending read, and
    ///  optionally tells the peer with a best-effort DISC_REQ.
    pub(crate) fn close_pipe(
        &mut self,
        laddr: Address,
        error: ZtError,
        send_disc: bool,
        fx: &mut Effects,
    ) {
        let Some(pipe) = self.pipes.remove(&laddr) else {
            return;
        };
        self.peers.remove(&pipe.raddr);
        self.ports.remove(pipe.laddr.port() as u64);

        let (nwid, raddr) = (pipe.nwid, pipe.raddr);
        pipe.fail_pending(error);

        if send_disc {
            self.send_frame(nwid, laddr, raddr, FrameKind::DiscReq, fx);
        }
    }

    fn keepalive_tick(&mut self, laddr: Address, fx: &mut Effects) -> bool {
        if self.closed {
            return false;
        }
        let interval = self
            .config
            .ping_interval
            .unwrap_or_default()
            .as_millis() as u64;
        let limit = self.config.ping_miss_limit;

        let Some(pipe) = self.pipes.get_mut(&laddr) else {
            return false;
        };
        let now = now_msec();
        if now.saturating_sub(pipe.last_recv) < interval {
            return true;
        }

        if pipe.pings_outstanding >= limit {
            debug!("peer {:?} missed {} pings, closing pipe", pipe.raddr, pipe.pings_outstanding);
            self.close_pipe(laddr, ZtError::Closed, true, fx);
            return false;
        }

        pipe.pings_outstanding += 1;
        let (nwid, raddr) = (pipe.nwid, pipe.raddr);
        self.send_frame(nwid, laddr, raddr, FrameKind::PingReq, fx);
        true
    }
}

/// An established conversation with one peer: ordered-within-a-message,
///  best-effort delivery of application messages. Dropping the handle closes
///  the connection and notifies the peer.
pub struct Pipe {
    pub(crate) node: Node,
    pub(crate) laddr: Address,
    active: bool,
}

impl Pipe {
    pub(crate) fn attach(node: Node, laddr: Address) -> Pipe {
        Pipe {
            node,
            laddr,
            active: true,
        }
    }

    /// Disarms the drop-close without touching node state. Used when a
    ///  freshly created handle could not be delivered to its waiter.
    pub(crate) fn detach(&mut self) {
        self.active = false;
    }

    pub async fn send(&self, message: &[u8]) -> ZtResult<()> {
        self.send_parts(&[message]).await
    }

    /// Gather-list send: the parts are concatenated on the wire and arrive
    ///  as one message.
    pub async fn send_parts(&self, parts: &[&[u8]]) -> ZtResult<()> {
        self.node
            .shared
            .with_inner(|inner, fx| inner.pipe_send(self.laddr, parts, fx))
    }

    /// Receives one complete message. At most one receive may be pending at
    ///  a time; dropping the returned future gives the slot up.
    pub async fn recv(&self) -> ZtResult<Vec<u8>> {
        let begin = self
            .node
            .shared
            .with_inner(|inner, _| inner.pipe_begin_recv(self.laddr))?;
        match begin {
            RecvBegin::Ready(message) => Ok(message),
            RecvBegin::Wait(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(ZtError::Closed),
            },
        }
    }

    /// The SP protocol the peer announced during the handshake.
    pub fn peer_proto(&self) -> ZtResult<u16> {
        self.node.shared.with_inner(|inner, _| {
            inner
                .pipes
                .get(&self.laddr)
                .map(|pipe| pipe.peer_proto)
                .ok_or(ZtError::Closed)
        })
    }

    pub fn local_addr(&self) -> Address {
        self.laddr
    }

    pub fn remote_addr(&self) -> ZtResult<Address> {
        self.node.shared.with_inner(|inner, _| {
            inner
                .pipes
                .get(&self.laddr)
                .map(|pipe| pipe.raddr)
                .ok_or(ZtError::Closed)
        })
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
            .with_inner(|inner, fx| inner.close_pipe(self.laddr, ZtError::Closed, true, fx));
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.do_close();
    }
}
