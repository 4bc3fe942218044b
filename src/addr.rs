use std::fmt::{Debug, Formatter};

/// Port numbers are 24 bits. The high half of the range is ephemeral and
///  allocated from a randomly seeded counter; the low half (excluding 0) is
///  available for static binds. Port 0 means "unbound".
pub const PORT_MAX: u32 = (1 << 24) - 1;
pub const PORT_EPHEMERAL: u32 = 1 << 23;

const NODE_MASK: u64 = 0xff_ffff_ffff;

/// 40-bit overlay identity of a node.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeId(u64);

impl NodeId {
    pub fn from_raw(raw: u64) -> NodeId {
        NodeId(raw & NODE_MASK)
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Builds the virtual MAC address this node uses on the given network.
    ///
    /// The first octet is the low byte of the nwid with the multicast bit
    ///  cleared and the locally-administered bit set; 0x52 is remapped to
    ///  0x32 because KVM and friends squat on it. The node id sits in the low
    ///  40 bits, and the upper 40 bits of the nwid are XOR'd in byte-reversed
    ///  so that MACs differ across networks.
    pub fn to_mac(self, nwid: u64) -> u64 {
        let mut first = (nwid & 0xfe) | 0x02;
        if first == 0x52 {
            first = 0x32;
        }
        let mut mac = first << 40;
        mac |= self.0;
        mac ^= ((nwid >> 8) & 0xff) << 32;
        mac ^= ((nwid >> 16) & 0xff) << 24;
        mac ^= ((nwid >> 24) & 0xff) << 16;
        mac ^= ((nwid >> 32) & 0xff) << 8;
        mac ^= (nwid >> 40) & 0xff;
        mac
    }

    /// Inverse of [`NodeId::to_mac`]: recovers the node id from a MAC seen on
    ///  the given network.
    pub fn from_mac(mac: u64, nwid: u64) -> NodeId {
        let mut node = mac & NODE_MASK;
        node ^= ((nwid >> 8) & 0xff) << 32;
        node ^= ((nwid >> 16) & 0xff) << 24;
        node ^= ((nwid >> 24) & 0xff) << 16;
        node ^= ((nwid >> 32) & 0xff) << 8;
        node ^= (nwid >> 40) & 0xff;
        NodeId(node)
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

/// The canonical demux key: `node_id(40) || port(24)` packed into 64 bits.
///
/// Every endpoint and pipe is indexed under such an address, locally (laddr)
///  and - for pipes - by the peer's address (raddr).
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Address(u64);

impl Address {
    pub const UNBOUND: Address = Address(0);

    pub fn new(node: NodeId, port: u32) -> Address {
        debug_assert!(port <= PORT_MAX);
        Address((node.to_raw() << 24) | (port as u64 & PORT_MAX as u64))
    }

    pub fn node(self) -> NodeId {
        NodeId::from_raw(self.0 >> 24)
    }

    pub fn port(self) -> u32 {
        (self.0 & PORT_MAX as u64) as u32
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }

    pub fn is_bound(self) -> bool {
        self.port() != 0
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.node(), self.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::simple(0x1234567890, 77, 0x1234567890 << 24 | 77)]
    #[case::max_port(0xffffffffff, PORT_MAX, u64::MAX)]
    #[case::ephemeral(0x1, PORT_EPHEMERAL, (1u64 << 24) | 0x800000)]
    fn test_address_pack(#[case] node: u64, #[case] port: u32, #[case] expected: u64) {
        let addr = Address::new(NodeId::from_raw(node), port);
        assert_eq!(addr.to_raw(), expected);
        assert_eq!(addr.node().to_raw(), node);
        assert_eq!(addr.port(), port);
    }

    #[rstest]
    #[case::plain(0x1d2e3f4a5b, 0xa09acf0233)]
    #[case::zero_low_nwid(0x0000000001, 0x1200000000000000)]
    #[case::all_bits(0xffffffffff, 0xfedcba9876543210)]
    #[case::kvm_taboo(0x1d2e3f4a5b, 0x50)] // first octet would be 0x52
    fn test_mac_roundtrip(#[case] node: u64, #[case] nwid: u64) {
        let mac = NodeId::from_raw(node).to_mac(nwid);
        assert_eq!(NodeId::from_mac(mac, nwid), NodeId::from_raw(node));
    }

    #[test]
    fn test_mac_first_octet() {
        // multicast cleared, locally-administered set
        let mac = NodeId::from_raw(1).to_mac(0xa09acf0233);
        assert_eq!(mac >> 40 & 0xff, (0x33 & 0xfe) | 0x02);

        // 0x50 | 0x02 == 0x52 is avoided
        let mac = NodeId::from_raw(1).to_mac(0x50);
        assert_eq!(mac >> 40 & 0xff, 0x32);
    }

    #[test]
    fn test_unbound() {
        assert!(!Address::UNBOUND.is_bound());
        assert!(Address::new(NodeId::from_raw(5), 1).is_bound());
    }
}
