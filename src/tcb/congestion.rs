//! Slow start and congestion avoidance as described by RFC 5681.

/// Maintains the congestion window. The controller never sends anything on its
/// own. It only bounds how much data may be in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionController {
    /// Congestion window in octets
    cwnd: u32,
    /// Slow start threshold in octets
    ssthresh: u32,
    /// Sender maximum segment size
    smss: u32,
}

impl CongestionController {
    pub fn new(smss: u16) -> Self {
        let smss = smss.max(1) as u32;
        Self {
            cwnd: initial_window(smss),
            ssthresh: u32::MAX,
            smss,
        }
    }

    /// Adopts the maximum segment size agreed on during the handshake. Only
    /// valid before any data was sent.
    pub fn set_smss(&mut self, smss: u16) {
        *self = Self {
            ssthresh: self.ssthresh,
            ..Self::new(smss)
        };
    }

    /// Grows the window after an acknowledgment of `acked` new octets.
    pub fn on_ack(&mut self, acked: u32) {
        if acked == 0 {
            return;
        }
        let increase = if self.in_slow_start() {
            // 3.1, equation 2
            acked.min(self.smss)
        } else {
            // 3.1, equation 3
            let smss = self.smss as u64;
            let cwnd = self.cwnd as u64;
            ((smss * smss + cwnd - 1) / cwnd).max(1) as u32
        };
        self.cwnd = self.cwnd.saturating_add(increase);
    }

    /// Collapses the window after a retransmission timeout.
    pub fn on_timeout(&mut self, flight_size: u32) {
        // 3.1, equation 4
        self.ssthresh = (flight_size / 2).max(2 * self.smss);
        self.cwnd = self.smss;
    }

    /// How much data may be unacknowledged given the peer's window
    pub fn send_window(&self, snd_wnd: u16) -> u32 {
        self.cwnd.min(snd_wnd as u32)
    }

    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn smss(&self) -> u32 {
        self.smss
    }
}

/// 3.1, equation 1
fn initial_window(smss: u32) -> u32 {
    (4 * smss).min((2 * smss).max(4380))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_window_follows_segment_size() {
        assert_eq!(CongestionController::new(1312).cwnd(), 4380);
        assert_eq!(CongestionController::new(536).cwnd(), 2144);
        assert_eq!(CongestionController::new(2190).cwnd(), 4380);
        assert_eq!(CongestionController::new(4000).cwnd(), 8000);
        assert_eq!(CongestionController::new(1312).ssthresh(), u32::MAX);
    }

    #[test]
    fn slow_start_grows_per_segment() {
        let mut cc = CongestionController::new(1000);
        assert_eq!(cc.cwnd(), 4000);
        cc.on_ack(1000);
        cc.on_ack(1000);
        assert_eq!(cc.cwnd(), 6000);
        // A stretch ACK still only counts as one segment
        cc.on_ack(5000);
        assert_eq!(cc.cwnd(), 7000);
        cc.on_ack(300);
        assert_eq!(cc.cwnd(), 7300);
    }

    #[test]
    fn loss_restarts_slow_start() {
        let mut cc = CongestionController::new(1000);
        cc.on_timeout(10_000);
        assert_eq!(cc.cwnd(), 1000);
        assert_eq!(cc.ssthresh(), 5000);

        cc.on_timeout(1000);
        assert_eq!(cc.cwnd(), 1000);
        assert_eq!(cc.ssthresh(), 2000);
    }

    #[test]
    fn congestion_avoidance_grows_linearly() {
        let mut cc = CongestionController::new(1000);
        cc.on_timeout(8000);
        while cc.in_slow_start() {
            cc.on_ack(1000);
        }
        assert_eq!(cc.cwnd(), 4000);
        cc.on_ack(1000);
        assert_eq!(cc.cwnd(), 4250);
        // Roughly one segment per window of acknowledgments
        for _ in 0..4 {
            cc.on_ack(1000);
        }
        assert!(cc.cwnd() > 5000 && cc.cwnd() < 5300);
    }

    #[test]
    fn window_never_drops_below_one_segment() {
        let mut cc = CongestionController::new(1000);
        for flight in [0, 1, 500, 100_000] {
            cc.on_timeout(flight);
            assert_eq!(cc.cwnd(), cc.smss());
            assert!(cc.ssthresh() >= 2 * cc.smss());
            cc.on_ack(1000);
            assert!(cc.cwnd() >= cc.smss());
        }
    }

    #[test]
    fn send_window_is_the_smaller_window() {
        let cc = CongestionController::new(1000);
        assert_eq!(cc.send_window(u16::MAX), 4000);
        assert_eq!(cc.send_window(1500), 1500);
        assert_eq!(cc.send_window(0), 0);
    }
}
