use crate::addr::{NodeId, PORT_MAX};
use crate::error::ZtError;

/// A parsed `zt://` URL.
///
/// Dial form: `zt://<nwid_hex>/<node_hex>:<port_dec>` - the remote node must
///  be a concrete, non-zero 40-bit id and the port non-zero.
///
/// Listen form: `zt://<nwid_hex>[/<node_hex_or_*>]:<port_dec>` - the node
///  part is ignored (a listener serves all remotes), and port 0 requests an
///  ephemeral port.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ZtUrl {
    Dial { nwid: u64, node: NodeId, port: u32 },
    Listen { nwid: u64, port: u32 },
}

const SCHEME: &str = "zt://";

impl ZtUrl {
    pub fn parse_dial(url: &str) -> Result<ZtUrl, ZtError> {
        let rest = url.strip_prefix(SCHEME).ok_or(ZtError::AddrInval)?;
        let (nwid_s, rest) = rest.split_once('/').ok_or(ZtError::AddrInval)?;
        let (node_s, port_s) = rest.split_once(':').ok_or(ZtError::AddrInval)?;

        let nwid = parse_hex(nwid_s, 16)?;
        let node = parse_hex(node_s, 10)?;
        if node == 0 {
            return Err(ZtError::AddrInval);
        }
        let port = parse_port(port_s)?;
        if port == 0 {
            return Err(ZtError::AddrInval);
        }

        Ok(ZtUrl::Dial {
            nwid,
            node: NodeId::from_raw(node),
            port,
        })
    }

    pub fn parse_listen(url: &str) -> Result<ZtUrl, ZtError> {
        let rest = url.strip_prefix(SCHEME).ok_or(ZtError::AddrInval)?;

        let (head, port_s) = rest.rsplit_once(':').ok_or(ZtError::AddrInval)?;
        let nwid_s = match head.split_once('/') {
            Some((nwid_s, node_s)) => {
                // The node part is tolerated for symmetry with dial URLs but
                //  carries no meaning for a listener.
                if node_s != "*" {
                    let node = parse_hex(node_s, 10)?;
                    if node == 0 {
                        return Err(ZtError::AddrInval);
                    }
                }
                nwid_s
            }
            None => head,
        };

        let nwid = parse_hex(nwid_s, 16)?;
        let port = parse_port(port_s)?;

        Ok(ZtUrl::Listen { nwid, port })
    }

    pub fn nwid(&self) -> u64 {
        match self {
            ZtUrl::Dial { nwid, .. } => *nwid,
            ZtUrl::Listen { nwid, .. } => *nwid,
        }
    }

    pub fn port(&self) -> u32 {
        match self {
            ZtUrl::Dial { port, .. } => *port,
            ZtUrl::Listen { port, .. } => *port,
        }
    }
}

fn parse_hex(s: &str, max_digits: usize) -> Result<u64, ZtError> {
    if s.is_empty() || s.len() > max_digits {
        return Err(ZtError::AddrInval);
    }
    let mut v: u64 = 0;
    for c in s.chars() {
        let digit = c.to_digit(16).ok_or(ZtError::AddrInval)?;
        v = (v << 4) | digit as u64;
    }
    Ok(v)
}

fn parse_port(s: &str) -> Result<u32, ZtError> {
    if s.is_empty() || s.len() > 8 {
        return Err(ZtError::AddrInval);
    }
    let mut v: u64 = 0;
    for c in s.chars() {
        let digit = c.to_digit(10).ok_or(ZtError::AddrInval)?;
        v = v * 10 + digit as u64;
    }
    if v > PORT_MAX as u64 {
        return Err(ZtError::AddrInval);
    }
    Ok(v as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain("zt://a09acf0233/1d2e3f4a5b:9001", 0xa09acf0233, 0x1d2e3f4a5b, 9001)]
    #[case::full_nwid("zt://fedcba9876543210/1:1", 0xfedcba9876543210, 1, 1)]
    #[case::max_port("zt://1/2:16777215", 1, 2, PORT_MAX)]
    fn test_parse_dial(
        #[case] url: &str,
        #[case] nwid: u64,
        #[case] node: u64,
        #[case] port: u32,
    ) {
        assert_eq!(
            ZtUrl::parse_dial(url),
            Ok(ZtUrl::Dial {
                nwid,
                node: NodeId::from_raw(node),
                port
            })
        );
    }

    #[rstest]
    #[case::wildcard("zt://a09acf0233/*:9001", 0xa09acf0233, 9001)]
    #[case::no_node("zt://a09acf0233:9001", 0xa09acf0233, 9001)]
    #[case::concrete_node("zt://a09acf0233/1d2e3f4a5b:9001", 0xa09acf0233, 9001)]
    #[case::ephemeral("zt://ff:0", 0xff, 0)]
    fn test_parse_listen(#[case] url: &str, #[case] nwid: u64, #[case] port: u32) {
        assert_eq!(ZtUrl::parse_listen(url), Ok(ZtUrl::Listen { nwid, port }));
    }

    #[rstest]
    #[case::wrong_scheme("tcp://a09acf0233/1:9001")]
    #[case::missing_node("zt://a09acf0233:9001")]
    #[case::wildcard_node("zt://a09acf0233/*:9001")]
    #[case::zero_node("zt://a09acf0233/0:9001")]
    #[case::zero_port("zt://a09acf0233/1:0")]
    #[case::node_too_long("zt://a09acf0233/112233445566:9001")]
    #[case::nwid_too_long("zt://00112233445566778/1:9001")]
    #[case::port_out_of_range("zt://a09acf0233/1:16777216")]
    #[case::port_not_decimal("zt://a09acf0233/1:90a1")]
    #[case::trailing_garbage("zt://a09acf0233/1:9001x")]
    #[case::missing_port("zt://a09acf0233/1")]
    #[case::empty("")]
    fn test_parse_dial_reject(#[case] url: &str) {
        assert_eq!(ZtUrl::parse_dial(url), Err(ZtError::AddrInval));
    }

    #[rstest]
    #[case::wrong_scheme("zz://a09acf0233:9001")]
    #[case::port_out_of_range("zt://a09acf0233:16777216")]
    #[case::bad_node("zt://a09acf0233/xyz:9001")]
    #[case::zero_node("zt://a09acf0233/0:9001")]
    #[case::missing_port("zt://a09acf0233")]
    #[case::bad_nwid("zt://q:1")]
    fn test_parse_listen_reject(#[case] url: &str) {
        assert_eq!(ZtUrl::parse_listen(url), Err(ZtError::AddrInval));
    }
}
