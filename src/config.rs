use std::time::Duration;

use anyhow::bail;

/// Tunables for the transport. One instance is shared by all endpoints that
///  name the same home directory; per-endpoint values (`recv_max`) are copied
///  at endpoint creation.
#[derive(Clone)]
pub struct ZtConfig {
    /// Directory in which the overlay may read and write its identity and
    ///  planet files. An empty string keeps all overlay state in memory,
    ///  which gives the node a fresh identity every time.
    pub home: String,

    /// Per-pipe ceiling for a reassembled message, in bytes. 0 means
    ///  unlimited. Messages above the ceiling are rejected with a MSGSIZE
    ///  error to the sender and a failed read locally.
    pub recv_max: usize,

    /// Delay between connection request attempts.
    pub conn_interval: Duration,

    /// Number of CONN_REQ frames sent before a connect fails with a timeout.
    ///  The overall connect deadline is `conn_attempts * conn_interval`.
    pub conn_attempts: u32,

    /// Capacity of a listener's ring of accepted-but-unpaired connection
    ///  requests. Requests arriving at a full ring are dropped silently -
    ///  the dialer retries.
    pub listen_queue: usize,

    /// How long a backlog entry stays eligible for pairing with an accept.
    pub listen_expire: Duration,

    /// Age at which a partially reassembled incoming message is discarded.
    pub reassembly_stale: Duration,

    /// Number of reassembly slots per pipe, i.e. how many incoming messages
    ///  may be in flight concurrently. Must be at least 2 so that a lost
    ///  fragment does not stall the pipe.
    pub recvq: usize,

    /// Idle interval after which a pipe sends a keepalive PING_REQ. `None`
    ///  disables keepalive.
    pub ping_interval: Option<Duration>,

    /// Number of consecutively unanswered pings after which the pipe is
    ///  closed locally.
    pub ping_miss_limit: u32,
}

impl Default for ZtConfig {
    fn default() -> ZtConfig {
        ZtConfig {
            home: String::new(),
            recv_max: 0,
            conn_interval: Duration::from_secs(5),
            conn_attempts: 12,
            listen_queue: 128,
            listen_expire: Duration::from_secs(60),
            reassembly_stale: Duration::from_secs(1),
            recvq: 2,
            ping_interval: None,
            ping_miss_limit: 2,
        }
    }
}

impl ZtConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.recv_max > u32::MAX as usize {
            bail!("recv_max exceeds the wire protocol's 32 bit message limit");
        }
        if self.conn_attempts == 0 {
            bail!("conn_attempts must be at least 1");
        }
        if self.conn_interval.is_zero() {
            bail!("conn_interval must be non-zero");
        }
        if self.listen_queue == 0 {
            bail!("listen_queue must be at least 1");
        }
        if self.recvq < 2 {
            bail!("recvq must be at least 2");
        }
        if self.ping_interval.is_some() && self.ping_miss_limit == 0 {
            bail!("ping_miss_limit must be at least 1 when keepalive is enabled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ZtConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        let mut cfg = ZtConfig::default();
        cfg.recvq = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = ZtConfig::default();
        cfg.conn_attempts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ZtConfig::default();
        cfg.recv_max = u32::MAX as usize + 1;
        assert!(cfg.validate().is_err());
    }
}
