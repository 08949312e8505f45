//! Tunables for a connection.

use rand::Rng;
use std::{sync::OnceLock, time::Duration, time::Instant};

/// Maximum segment lifetime. Connections linger in TIME-WAIT for twice this.
pub const MSL: Duration = Duration::from_secs(2);

/// The configuration of one connection. Every connection owns a copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Maximum segment lifetime
    pub msl: Duration,
    /// The retransmission timeout used before the first round-trip sample
    pub initial_rto: Duration,
    /// Lower bound of the retransmission timeout
    pub min_rto: Duration,
    /// Upper bound of the retransmission timeout, including backoff
    pub max_rto: Duration,
    /// Weight of a new round-trip sample in the smoothed round-trip time
    pub alpha: f64,
    /// Weight of a new round-trip sample in the round-trip variance
    pub beta: f64,
    /// Variance multiplier of the retransmission timeout
    pub k: u32,
    /// Granularity of the clock driving the connection
    pub clock_granularity: Duration,
    /// Consecutive retransmission timeouts tolerated before the connection is
    /// abandoned
    pub max_retransmissions: u32,
    /// How long sent data may stay unacknowledged before the connection is
    /// aborted
    pub user_timeout: Option<Duration>,
    /// Bytes of received data buffered for the user. Bounds the advertised
    /// window.
    pub receive_buffer: u16,
    /// The largest payload we accept in one segment. Advertised on SYN.
    pub mss: u16,
    /// Whether to offer RFC 7323 timestamps
    pub timestamps: bool,
    /// Disables the Nagle algorithm. Small segments are then sent as soon as
    /// the windows allow.
    pub no_delay: bool,
    /// How long a small segment may be held back before it is sent anyway
    pub override_timeout: Duration,
    /// Fraction of the largest window the peer ever offered that a segment
    /// must fill to be sent while nothing is in flight. RFC 9293 calls it Fs.
    pub fs: f64,
    /// How initial send sequence numbers are chosen
    pub iss: IssSource,
}

impl Config {
    /// Chooses an initial send sequence number for a new connection.
    pub fn initial_sequence_number(&self) -> u32 {
        match self.iss {
            IssSource::Fixed(iss) => iss,
            IssSource::Clock => clock_iss(),
        }
    }

    /// The timer that runs in TIME-WAIT
    pub fn time_wait(&self) -> Duration {
        self.msl * 2
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            msl: MSL,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_secs(1),
            max_rto: Duration::from_secs(60),
            alpha: 1.0 / 8.0,
            beta: 1.0 / 4.0,
            k: 4,
            clock_granularity: Duration::from_millis(10),
            max_retransmissions: 12,
            user_timeout: Some(Duration::from_secs(60)),
            receive_buffer: u16::MAX,
            // Leaves room for the overlay's own headers inside a 1460 byte
            // underlay payload
            mss: 1312,
            timestamps: false,
            no_delay: false,
            override_timeout: Duration::from_millis(100),
            fs: 0.5,
            iss: IssSource::Clock,
        }
    }
}

/// Where initial send sequence numbers come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssSource {
    /// A clock ticking every 4 microseconds, offset by a per-process random
    /// value
    Clock,
    /// Always the given value
    Fixed(u32),
}

fn clock_iss() -> u32 {
    static EPOCH: OnceLock<(Instant, u32)> = OnceLock::new();
    let (start, offset) = *EPOCH.get_or_init(|| (Instant::now(), rand::thread_rng().gen()));
    let ticks = (start.elapsed().as_micros() / 4) as u32;
    offset.wrapping_add(ticks)
}
