//! Retransmission timeout computation (RFC 6298) and the queue of segments
//! awaiting acknowledgment.

use super::modular_cmp::{mod_leq, mod_lt};
use crate::{config::Config, segment::Segment};
use std::{collections::VecDeque, time::Duration};

/// Tracks the smoothed round-trip time and derives the retransmission timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct RttEstimator {
    /// Smoothed round-trip time. Absent until the first sample.
    srtt: Option<Duration>,
    /// Round-trip time variation
    rttvar: Duration,
    /// Current retransmission timeout, including backoff
    rto: Duration,
    /// Consecutive timeouts without an acknowledgment of new data
    backoff: u32,
    alpha: f64,
    beta: f64,
    k: u32,
    granularity: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(config: &Config) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: config.initial_rto.clamp(config.min_rto, config.max_rto),
            backoff: 0,
            alpha: config.alpha,
            beta: config.beta,
            k: config.k,
            granularity: config.clock_granularity,
            min_rto: config.min_rto,
            max_rto: config.max_rto,
        }
    }

    /// Feeds a round-trip measurement into the estimator.
    pub fn sample(&mut self, r: Duration) {
        match self.srtt {
            None => {
                // 2.2
                self.srtt = Some(r);
                self.rttvar = r / 2;
            }
            Some(srtt) => {
                // 2.3
                let delta = if srtt > r { srtt - r } else { r - srtt };
                self.rttvar = self.rttvar.mul_f64(1.0 - self.beta) + delta.mul_f64(self.beta);
                self.srtt = Some(srtt.mul_f64(1.0 - self.alpha) + r.mul_f64(self.alpha));
            }
        }
        let srtt = self.srtt.unwrap_or(r);
        let rto = srtt + self.granularity.max(self.rttvar * self.k);
        self.rto = rto.clamp(self.min_rto, self.max_rto);
    }

    /// Backs the timer off after a retransmission timeout (5.5).
    pub fn back_off(&mut self) {
        self.backoff += 1;
        self.rto = (self.rto * 2).min(self.max_rto);
    }

    /// New data was acknowledged, so the run of timeouts is over.
    pub fn clear_backoff(&mut self) {
        self.backoff = 0;
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    pub fn backoff(&self) -> u32 {
        self.backoff
    }
}

/// A one-shot timer on the connection's clock. The connection owns each of its
/// timers, so dropping the connection cancels them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timer {
    deadline: Option<Duration>,
}

impl Timer {
    /// Start or restart the timer
    pub fn arm(&mut self, now: Duration, duration: Duration) {
        self.deadline = Some(now + duration);
    }

    /// Start the timer if it is not already running
    pub fn arm_if_idle(&mut self, now: Duration, duration: Duration) {
        if self.deadline.is_none() {
            self.arm(now, duration);
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Whether the timer has run out. A timer that ran out is disarmed.
    pub fn expire(&mut self, now: Duration) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }
}

/// A segment on the retransmission queue
#[derive(Debug, Clone)]
pub struct Transmit {
    /// The segment as last sent
    pub segment: Segment,
    /// When the segment was first sent
    pub sent_at: Duration,
    /// Whether the segment has been sent more than once. Such segments give
    /// ambiguous round-trip samples.
    pub retransmitted: bool,
}

/// What an acknowledgment removed from the retransmission queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Acknowledged {
    /// Octets of data removed from the queue
    pub bytes: u32,
    /// The round-trip time of the newest fully acknowledged segment, if no
    /// acknowledged segment was ever retransmitted
    pub rtt: Option<Duration>,
}

/// Segments that were sent but not yet acknowledged, in sequence order
#[derive(Debug, Clone, Default)]
pub struct RetransmissionQueue {
    queue: VecDeque<Transmit>,
}

impl RetransmissionQueue {
    pub fn push(&mut self, segment: Segment, now: Duration) {
        self.queue.push_back(Transmit {
            segment,
            sent_at: now,
            retransmitted: false,
        });
    }

    /// Removes everything below `ack` from the queue. A segment that is only
    /// partly acknowledged has its acknowledged prefix trimmed.
    pub fn acknowledge(&mut self, ack: u32, now: Duration) -> Acknowledged {
        let mut acknowledged = Acknowledged::default();
        let mut ambiguous = false;
        let mut newest = None;
        while let Some(transmit) = self.queue.front_mut() {
            let segment = &mut transmit.segment;
            if mod_leq(segment.end(), ack) {
                acknowledged.bytes += segment.text.len() as u32;
                ambiguous |= transmit.retransmitted;
                newest = Some(transmit.sent_at);
                self.queue.pop_front();
            } else if mod_lt(segment.seq, ack) {
                let mut acked = ack.wrapping_sub(segment.seq);
                if segment.ctl.syn() {
                    segment.ctl.set_syn(false);
                    acked -= 1;
                    segment.seq = segment.seq.wrapping_add(1);
                }
                let acked = (acked as usize).min(segment.text.len());
                segment.text.drain(..acked);
                segment.seq = segment.seq.wrapping_add(acked as u32);
                acknowledged.bytes += acked as u32;
                break;
            } else {
                break;
            }
        }
        if !ambiguous {
            acknowledged.rtt = newest.map(|sent_at| now.saturating_sub(sent_at));
        }
        acknowledged
    }

    /// The oldest unacknowledged segment, marked as retransmitted
    pub fn retransmit(&mut self) -> Option<&mut Segment> {
        let transmit = self.queue.front_mut()?;
        transmit.retransmitted = true;
        Some(&mut transmit.segment)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentBuilder;

    fn millis(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    fn config() -> Config {
        Config {
            min_rto: millis(200),
            ..Default::default()
        }
    }

    #[test]
    fn first_sample() {
        let mut rtt = RttEstimator::new(&config());
        assert_eq!(rtt.rto(), Duration::from_secs(1));
        rtt.sample(millis(100));
        assert_eq!(rtt.srtt(), Some(millis(100)));
        assert_eq!(rtt.rttvar(), millis(50));
        // 100 + max(10, 4 * 50)
        assert_eq!(rtt.rto(), millis(300));
    }

    #[test]
    fn subsequent_samples() {
        let mut rtt = RttEstimator::new(&config());
        rtt.sample(millis(100));
        rtt.sample(millis(180));
        // 3/4 * 50 + 1/4 * 80
        assert_close(rtt.rttvar(), millis(57) + Duration::from_micros(500));
        // 7/8 * 100 + 1/8 * 180
        assert_close(rtt.srtt().unwrap(), millis(110));
        assert_close(rtt.rto(), millis(340));
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let error = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(
            error < Duration::from_micros(1),
            "{actual:?} != {expected:?}"
        );
    }

    #[test]
    fn rto_is_clamped() {
        let mut rtt = RttEstimator::new(&Config::default());
        rtt.sample(millis(1));
        assert_eq!(rtt.rto(), Duration::from_secs(1));
        rtt.sample(Duration::from_secs(100));
        assert_eq!(rtt.rto(), Duration::from_secs(60));
    }

    #[test]
    fn backoff_is_monotonic_and_bounded() {
        let config = Config::default();
        let mut rtt = RttEstimator::new(&config);
        let mut last = rtt.rto();
        for _ in 0..20 {
            rtt.back_off();
            assert!(rtt.rto() >= last);
            assert!(rtt.rto() <= config.max_rto);
            last = rtt.rto();
        }
        assert_eq!(rtt.rto(), config.max_rto);
        assert_eq!(rtt.backoff(), 20);
        rtt.clear_backoff();
        assert_eq!(rtt.backoff(), 0);
    }

    #[test]
    fn timer() {
        let mut timer = Timer::default();
        assert!(!timer.expire(millis(10)));
        timer.arm(millis(10), millis(5));
        timer.arm_if_idle(millis(10), millis(100));
        assert_eq!(timer.deadline(), Some(millis(15)));
        assert!(!timer.expire(millis(14)));
        assert!(timer.expire(millis(15)));
        assert!(!timer.is_armed());
    }

    #[test]
    fn cumulative_acknowledgment() {
        let mut queue = RetransmissionQueue::default();
        for (i, seq) in [100u32, 110, 120].into_iter().enumerate() {
            let segment = SegmentBuilder::new(seq).ack(1).text(vec![0; 10]).build();
            queue.push(segment, millis(i as u64));
        }

        let acknowledged = queue.acknowledge(115, millis(50));
        assert_eq!(acknowledged.bytes, 15);
        assert_eq!(acknowledged.rtt, Some(millis(50)));
        assert_eq!(queue.len(), 2);

        // The partly acknowledged segment keeps only its unacknowledged tail
        let front = queue.retransmit().unwrap();
        assert_eq!(front.seq, 115);
        assert_eq!(front.text.len(), 5);
        let acknowledged = queue.acknowledge(130, millis(60));
        assert_eq!(acknowledged.bytes, 15);
        assert_eq!(acknowledged.rtt, None);
        assert!(queue.is_empty());
    }

    #[test]
    fn syn_acknowledgment() {
        let mut queue = RetransmissionQueue::default();
        queue.push(SegmentBuilder::new(u32::MAX).syn().build(), millis(0));
        let acknowledged = queue.acknowledge(0, millis(30));
        assert_eq!(acknowledged.bytes, 0);
        assert_eq!(acknowledged.rtt, Some(millis(30)));
        assert!(queue.is_empty());
    }
}
