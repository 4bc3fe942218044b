use tracing::{debug, trace};

/// What became of one delivered fragment.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeliverOutcome {
    /// Fragment stored; the message is still incomplete.
    Stored,
    /// The fragment completed a message; a slot is now ready for delivery.
    Ready,
    /// Duplicate of a fragment already received. Dropped silently.
    Duplicate,
    /// All slots hold completed messages awaiting delivery; the fragment was
    ///  dropped silently and the sender has to retry.
    Dropped,
    /// The fragment contradicts the slot's geometry. The slot was reset; the
    ///  peer deserves an ERROR(PROTO).
    Proto,
    /// The message exceeds the receive ceiling. The slot was reset; the peer
    ///  deserves an ERROR(MSGSIZE).
    MsgSize,
}

/// One in-flight incoming message.
///
/// `msg_id == 0` marks the slot empty. The missing bitmap has one bit per
///  fragment, set while the fragment is outstanding; `ready` is equivalent to
///  an all-zero bitmap.
struct ReassemblySlot {
    first_frag_time: u64,
    msg_id: u16,
    ready: bool,
    frag_sz: u16,
    nfrags: u16,
    missing: Vec<u8>,
    buf: Vec<u8>,
}

impl ReassemblySlot {
    fn empty() -> ReassemblySlot {
        ReassemblySlot {
            first_frag_time: 0,
            msg_id: 0,
            ready: false,
            frag_sz: 0,
            nfrags: 0,
            missing: Vec::new(),
            buf: Vec::new(),
        }
    }

    fn reset(&mut self) {
        *self = ReassemblySlot::empty();
    }

    fn init(&mut self, now: u64, msg_id: u16, frag_sz: u16, nfrags: u16) {
        self.first_frag_time = now;
        self.msg_id = msg_id;
        self.ready = false;
        self.frag_sz = frag_sz;
        self.nfrags = nfrags;

        // all-ones over [0, nfrags), then mask off the unused high bits of
        //  the final byte
        let bytes = (nfrags as usize + 7) / 8;
        self.missing = vec![0xff; bytes];
        let used_in_last = nfrags as usize - (bytes - 1) * 8;
        self.missing[bytes - 1] = 0xffu8 >> (8 - used_in_last);

        self.buf = vec![0; nfrags as usize * frag_sz as usize];
    }

    fn is_missing(&self, frag_no: u16) -> bool {
        self.missing[frag_no as usize / 8] & (1 << (frag_no % 8)) != 0
    }

    fn mark_received(&mut self, frag_no: u16) {
        self.missing[frag_no as usize / 8] &= !(1 << (frag_no % 8));
    }

    fn all_received(&self) -> bool {
        self.missing.iter().all(|b| *b == 0)
    }
}

/// Per-pipe reassembly of fragmented messages: a fixed set of slots, each
///  tracking one incoming message by id. Messages complete in the order their
///  last fragment arrives, not the order they were sent.
pub struct Reassembler {
    slots: Vec<ReassemblySlot>,
}

impl Reassembler {
    pub fn new(recvq: usize) -> Reassembler {
        assert!(recvq >= 2);
        Reassembler {
            slots: (0..recvq).map(|_| ReassemblySlot::empty()).collect(),
        }
    }

    /// Discards partially reassembled messages whose first fragment is older
    ///  than `stale` msec. Completed messages are kept until delivered.
    pub fn gc(&mut self, now: u64, stale: u64) {
        for slot in &mut self.slots {
            if slot.msg_id != 0 && !slot.ready && slot.first_frag_time + stale < now {
                debug!("discarding stale partial message #{}", slot.msg_id);
                slot.reset();
            }
        }
    }

    /// Files one fragment, choosing or recycling a slot as needed.
    ///
    /// `last` distinguishes the final fragment (opcode DATA) from the rest
    ///  (DATA_MF). `recv_max == 0` means unlimited.
    pub fn deliver(
        &mut self,
        now: u64,
        stale: u64,
        recv_max: usize,
        msg_id: u16,
        frag_sz: u16,
        frag_no: u16,
        nfrags: u16,
        last: bool,
        payload: &[u8],
    ) -> DeliverOutcome {
        self.gc(now, stale);

        if msg_id == 0 || nfrags == 0 || frag_sz == 0 {
            return DeliverOutcome::Proto;
        }

        let slot = match self.slots.iter().position(|s| s.msg_id == msg_id) {
            Some(i) => &mut self.slots[i],
            None => {
                // no match: recycle the oldest slot that is not holding a
                //  completed message (those may only be cleared by delivery)
                match self
                    .slots
                    .iter_mut()
                    .filter(|s| !s.ready)
                    .min_by_key(|s| s.first_frag_time)
                {
                    Some(slot) => slot,
                    None => {
                        trace!("all reassembly slots ready, dropping fragment of #{}", msg_id);
                        return DeliverOutcome::Dropped;
                    }
                }
            }
        };

        if slot.msg_id != msg_id {
            slot.reset();
            // reject before committing buffer memory: even with a zero-length
            //  final fragment this message cannot fit
            if recv_max > 0 && (nfrags as usize - 1) * frag_sz as usize > recv_max {
                return DeliverOutcome::MsgSize;
            }
            slot.init(now, msg_id, frag_sz, nfrags);
        }

        if nfrags != slot.nfrags
            || frag_sz != slot.frag_sz
            || frag_no >= nfrags
            || (!last && payload.len() != frag_sz as usize)
            || (last && payload.len() > frag_sz as usize)
            || (last != (frag_no + 1 == nfrags))
        {
            debug!("fragment geometry mismatch for message #{}, discarding message", msg_id);
            slot.reset();
            return DeliverOutcome::Proto;
        }

        if !slot.is_missing(frag_no) {
            trace!("duplicate fragment {}/{} of message #{}", frag_no, nfrags, msg_id);
            return DeliverOutcome::Duplicate;
        }

        let offset = frag_no as usize * frag_sz as usize;
        slot.buf[offset..offset + payload.len()].copy_from_slice(payload);
        slot.mark_received(frag_no);

        if last {
            let total = (nfrags as usize - 1) * frag_sz as usize + payload.len();
            if recv_max > 0 && total > recv_max {
                debug!("message #{} of {} bytes exceeds receive ceiling {}", msg_id, total, recv_max);
                slot.reset();
                return DeliverOutcome::MsgSize;
            }
            slot.buf.truncate(total);
        }

        if slot.all_received() {
            slot.ready = true;
            DeliverOutcome::Ready
        } else {
            DeliverOutcome::Stored
        }
    }

    /// Removes and returns the first completed message, if any.
    pub fn take_ready(&mut self) -> Option<Vec<u8>> {
        let slot = self.slots.iter_mut().find(|s| s.ready)?;
        let message = std::mem::take(&mut slot.buf);
        slot.reset();
        Some(message)
    }

    pub fn has_ready(&self) -> bool {
        self.slots.iter().any(|s| s.ready)
    }

    /// Drops everything, complete or not. Used on pipe close.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const STALE: u64 = 1_000;

    fn deliver_msg(
        r: &mut Reassembler,
        now: u64,
        recv_max: usize,
        msg_id: u16,
        frag_sz: u16,
        frags: &[&[u8]],
        order: &[usize],
    ) -> Vec<DeliverOutcome> {
        let nfrags = frags.len() as u16;
        order
            .iter()
            .map(|&i| {
                r.deliver(
                    now,
                    STALE,
                    recv_max,
                    msg_id,
                    frag_sz,
                    i as u16,
                    nfrags,
                    i as u16 + 1 == nfrags,
                    frags[i],
                )
            })
            .collect()
    }

    #[rstest]
    #[case::in_order(&[0, 1, 2])]
    #[case::last_first(&[2, 0, 1])]
    #[case::reversed(&[2, 1, 0])]
    #[case::middle_first(&[1, 0, 2])]
    #[case::middle_last(&[0, 2, 1])]
    #[case::rotated(&[1, 2, 0])]
    fn test_reorder_tolerance(#[case] order: &[usize]) {
        let mut r = Reassembler::new(2);
        let outcomes = deliver_msg(&mut r, 0, 0, 1, 2, &[b"AB", b"CD", b"E"], order);

        assert_eq!(outcomes[0], DeliverOutcome::Stored);
        assert_eq!(outcomes[1], DeliverOutcome::Stored);
        assert_eq!(outcomes[2], DeliverOutcome::Ready);
        assert_eq!(r.take_ready(), Some(b"ABCDE".to_vec()));
        assert_eq!(r.take_ready(), None);
    }

    #[test]
    fn test_duplicate_tolerance() {
        let mut r = Reassembler::new(2);
        assert_eq!(
            deliver_msg(&mut r, 0, 0, 1, 2, &[b"AB", b"C"], &[0, 0]),
            vec![DeliverOutcome::Stored, DeliverOutcome::Duplicate]
        );
        assert_eq!(
            deliver_msg(&mut r, 0, 0, 1, 2, &[b"AB", b"C"], &[1]),
            vec![DeliverOutcome::Ready]
        );
        assert_eq!(r.take_ready(), Some(b"ABC".to_vec()));
    }

    #[test]
    fn test_single_fragment_message() {
        let mut r = Reassembler::new(2);
        assert_eq!(
            r.deliver(0, STALE, 0, 9, 100, 0, 1, true, b"hi"),
            DeliverOutcome::Ready
        );
        assert_eq!(r.take_ready(), Some(b"hi".to_vec()));
    }

    #[test]
    fn test_empty_message() {
        let mut r = Reassembler::new(2);
        assert_eq!(
            r.deliver(0, STALE, 0, 9, 100, 0, 1, true, b""),
            DeliverOutcome::Ready
        );
        assert_eq!(r.take_ready(), Some(Vec::new()));
    }

    #[test]
    fn test_stale_partial_is_discarded() {
        let mut r = Reassembler::new(2);
        r.deliver(0, STALE, 0, 1, 2, 0, 2, false, b"AB");

        // past the staleness deadline the partial message is gone, and the
        //  late closing fragment starts over as a fresh (incomplete) message
        assert_eq!(
            r.deliver(1_001, STALE, 0, 1, 2, 1, 2, true, b"C"),
            DeliverOutcome::Stored
        );
        assert!(!r.has_ready());
    }

    #[test]
    fn test_ready_survives_gc() {
        let mut r = Reassembler::new(2);
        r.deliver(0, STALE, 0, 1, 4, 0, 1, true, b"done");
        r.gc(10_000, STALE);
        assert_eq!(r.take_ready(), Some(b"done".to_vec()));
    }

    #[test]
    fn test_oldest_slot_is_evicted() {
        let mut r = Reassembler::new(2);
        r.deliver(0, STALE, 0, 1, 2, 0, 2, false, b"AB");
        r.deliver(10, STALE, 0, 2, 2, 0, 2, false, b"CD");

        // a third in-flight message evicts message #1 (the oldest)
        r.deliver(20, STALE, 0, 3, 2, 0, 2, false, b"EF");

        assert_eq!(
            r.deliver(30, STALE, 0, 2, 2, 1, 2, true, b"X"),
            DeliverOutcome::Ready
        );
        assert_eq!(r.take_ready(), Some(b"CDX".to_vec()));

        // message #1 lost its slot, its final fragment re-starts it
        assert_eq!(
            r.deliver(40, STALE, 0, 1, 2, 1, 2, true, b"Y"),
            DeliverOutcome::Stored
        );
    }

    #[test]
    fn test_ready_slots_are_not_evicted() {
        let mut r = Reassembler::new(2);
        r.deliver(0, STALE, 0, 1, 2, 0, 1, true, b"AA");
        r.deliver(0, STALE, 0, 2, 2, 0, 1, true, b"BB");

        assert_eq!(
            r.deliver(10, STALE, 0, 3, 2, 0, 2, false, b"CC"),
            DeliverOutcome::Dropped
        );
        assert_eq!(r.take_ready(), Some(b"AA".to_vec()));
        assert_eq!(r.take_ready(), Some(b"BB".to_vec()));
    }

    #[rstest]
    #[case::nfrags_changed(3, 2, 1, false, 2)]
    #[case::frag_sz_changed(2, 3, 1, true, 3)]
    fn test_geometry_change_discards_message(
        #[case] nfrags: u16,
        #[case] frag_sz: u16,
        #[case] frag_no: u16,
        #[case] last: bool,
        #[case] len: usize,
    ) {
        let mut r = Reassembler::new(2);
        r.deliver(0, STALE, 0, 1, 2, 0, 2, false, b"AB");

        let payload = vec![0u8; len];
        assert_eq!(
            r.deliver(1, STALE, 0, 1, frag_sz, frag_no, nfrags, last, &payload),
            DeliverOutcome::Proto
        );
        assert!(!r.has_ready());
    }

    #[test]
    fn test_short_non_final_fragment_is_protocol_error() {
        let mut r = Reassembler::new(2);
        assert_eq!(
            r.deliver(0, STALE, 0, 1, 4, 0, 2, false, b"AB"),
            DeliverOutcome::Proto
        );
    }

    #[test]
    fn test_receive_ceiling() {
        // exactly at the limit is fine
        let mut r = Reassembler::new(2);
        assert_eq!(
            deliver_msg(&mut r, 0, 5, 1, 2, &[b"AB", b"CD", b"E"], &[0, 1, 2]),
            vec![
                DeliverOutcome::Stored,
                DeliverOutcome::Stored,
                DeliverOutcome::Ready
            ]
        );
        assert_eq!(r.take_ready(), Some(b"ABCDE".to_vec()));

        // one byte over is rejected when the final fragment lands
        assert_eq!(
            deliver_msg(&mut r, 0, 4, 2, 2, &[b"AB", b"CD", b"E"], &[0, 1, 2]),
            vec![
                DeliverOutcome::Stored,
                DeliverOutcome::Stored,
                DeliverOutcome::MsgSize
            ]
        );
        assert!(!r.has_ready());
    }

    #[test]
    fn test_hopeless_message_rejected_up_front() {
        let mut r = Reassembler::new(2);
        // 2 full fragments of 500 already exceed a 600 byte ceiling
        assert_eq!(
            r.deliver(0, STALE, 600, 1, 500, 0, 3, false, &[0u8; 500]),
            DeliverOutcome::MsgSize
        );
    }

    #[test]
    fn test_many_fragments_bitmap_edge() {
        // 9 fragments exercises the bitmap's second byte
        let mut r = Reassembler::new(2);
        let frag = [7u8; 4];
        for i in 0..8 {
            assert_eq!(
                r.deliver(0, STALE, 0, 1, 4, i, 9, false, &frag),
                DeliverOutcome::Stored
            );
        }
        assert_eq!(
            r.deliver(0, STALE, 0, 1, 4, 8, 9, true, b"x"),
            DeliverOutcome::Ready
        );
        assert_eq!(r.take_ready().unwrap().len(), 8 * 4 + 1);
    }
}
