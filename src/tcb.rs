//! The transmission control block and the connection state machine that drives
//! it, following [RFC 9293](https://www.rfc-editor.org/rfc/rfc9293.html).
//!
//! A [`Tcb`] never performs I/O and never reads a clock. Inbound segments, user
//! calls, and the passage of time are fed in by the host, and the host collects
//! the outbound segments and lifecycle notices afterwards. [`Tcb::step`] does
//! both in one call.

use crate::{
    config::Config,
    id::ConnectionId,
    segment::{Segment, SegmentBuilder, Timestamps},
};
use std::{collections::VecDeque, time::Duration};
use tracing::{debug, trace, warn};

mod congestion;
pub mod modular_cmp;
mod receive_sequence_space;
mod retransmission;
mod send_sequence_space;
mod state;


pub use congestion::CongestionController;
pub use receive_sequence_space::ReceiveSequenceSpace;
pub use retransmission::{RetransmissionQueue, RttEstimator, Timer};
pub use send_sequence_space::SendSequenceSpace;
pub use state::State;

use modular_cmp::{mod_gt, mod_leq, mod_lt};

/// The state of one connection.
#[derive(Debug, Clone)]
pub struct Tcb {
    id: ConnectionId,
    config: Config,
    initiation: Initiation,
    state: State,
    snd: SendSequenceSpace,
    rcv: ReceiveSequenceSpace,
    rtt: RttEstimator,
    congestion: CongestionController,
    timestamps: TimestampOption,
    retransmission: RetransmissionQueue,
    retransmission_timer: Timer,
    persist_timer: Timer,
    user_timer: Timer,
    time_wait_timer: Timer,
    /// Bounds how long the Nagle algorithm holds back a small segment
    override_timer: Timer,
    /// The override timer ran out, so the next small segment goes out
    override_expired: bool,
    /// Data bytes queued for transmission but not yet segmentized
    send_buffer: VecDeque<u8>,
    /// In-order data bytes not yet read by the user
    receive_buffer: Vec<u8>,
    /// Segments ready to be handed to the host
    outgoing: Vec<Segment>,
    notices: Vec<Notice>,
    /// The user called CLOSE. A FIN goes out once the send buffer drains.
    close_requested: bool,
    /// The sequence number of our FIN, once sent
    fin_seq: Option<u32>,
    /// An acknowledgment must go out, either on its own or on a data segment
    ack_pending: bool,
    /// Whether the TCB ever left its initial CLOSED state
    used: bool,
    /// Why the connection ended, for user calls made afterwards
    outcome: Option<ConnectionError>,
    /// Time elapsed on the connection's clock
    now: Duration,
}

/// RFC 7323 timestamp state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct TimestampOption {
    /// Snd.TS.OK
    ok: bool,
    /// TS.Recent
    recent: u32,
    /// Last.ACK.sent
    last_ack_sent: u32,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Initiation {
    Listen,
    Open,
}

impl Tcb {
    /// Creates a TCB in the CLOSED state. A fresh TCB answers an unsolicited
    /// SYN with a passive open.
    pub fn new(id: ConnectionId, config: Config) -> Self {
        Self {
            id,
            initiation: Initiation::Open,
            state: State::Closed,
            snd: SendSequenceSpace::default(),
            rcv: ReceiveSequenceSpace {
                wnd: config.receive_buffer,
                ..Default::default()
            },
            rtt: RttEstimator::new(&config),
            congestion: CongestionController::new(config.mss),
            timestamps: TimestampOption::default(),
            retransmission: RetransmissionQueue::default(),
            retransmission_timer: Timer::default(),
            persist_timer: Timer::default(),
            user_timer: Timer::default(),
            time_wait_timer: Timer::default(),
            override_timer: Timer::default(),
            override_expired: false,
            send_buffer: VecDeque::new(),
            receive_buffer: vec![],
            outgoing: vec![],
            notices: vec![],
            close_requested: false,
            fin_seq: None,
            ack_pending: false,
            used: false,
            outcome: None,
            now: Duration::ZERO,
            config,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Why the connection ended. `None` while it is still running or when it
    /// ended normally.
    pub fn outcome(&self) -> Option<ConnectionError> {
        self.outcome
    }

    /// Processes one event to completion and collects everything it produced.
    pub fn step(&mut self, event: Event) -> Result<Step, ConnectionError> {
        match event {
            Event::Open => self.open()?,
            Event::Listen => self.listen()?,
            Event::Send(data) => self.send(&data)?,
            Event::Close => self.close()?,
            Event::Abort => self.abort()?,
            Event::Segment(segment) => self.segment_arrives(segment),
            Event::Elapsed(delta) => self.advance_time(delta),
        }
        Ok(self.drain())
    }

    /// Collects queued segments, the timer the host should run, and notices.
    pub fn drain(&mut self) -> Step {
        Step {
            segments: self.segments(),
            timer: self
                .next_timeout()
                .map_or(TimerAction::Disarm, TimerAction::Arm),
            notices: self.notices(),
        }
    }

    /// Takes the segments that are ready to send.
    pub fn segments(&mut self) -> Vec<Segment> {
        std::mem::take(&mut self.outgoing)
    }

    /// Takes the lifecycle notices produced since the last call.
    pub fn notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Time until the earliest running timer fires
    pub fn next_timeout(&self) -> Option<Duration> {
        [
            self.retransmission_timer,
            self.persist_timer,
            self.user_timer,
            self.time_wait_timer,
            self.override_timer,
        ]
        .iter()
        .filter_map(Timer::deadline)
        .min()
        .map(|deadline| deadline.saturating_sub(self.now))
    }

    /// Active OPEN. See 3.10.1.
    pub fn open(&mut self) -> Result<(), ConnectionError> {
        match self.state {
            State::Closed if self.used => Err(self.closed_error()),
            State::Closed | State::Listen => {
                self.initiation = Initiation::Open;
                self.used = true;
                self.snd = SendSequenceSpace::new(self.config.initial_sequence_number());
                self.set_state(State::SynSent);
                let syn = self.syn_builder(self.config.timestamps).build();
                self.emit_reliable(syn);
                Ok(())
            }
            _ => Err(ConnectionError::AlreadyExists),
        }
    }

    /// Passive OPEN. See 3.10.1.
    pub fn listen(&mut self) -> Result<(), ConnectionError> {
        match self.state {
            State::Closed if self.used => Err(self.closed_error()),
            State::Closed => {
                self.initiation = Initiation::Listen;
                self.used = true;
                self.set_state(State::Listen);
                Ok(())
            }
            _ => Err(ConnectionError::AlreadyExists),
        }
    }

    /// SEND. See 3.10.2.
    pub fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        match self.state {
            State::Closed => Err(self.closed_error()),
            state if self.close_requested || !state.accepts_sends() => {
                Err(ConnectionError::Closing)
            }
            State::Listen => {
                self.send_buffer.extend(data);
                self.open()
            }
            _ => {
                self.send_buffer.extend(data);
                self.transmit();
                Ok(())
            }
        }
    }

    /// RECEIVE. Takes all in-order data received so far. See 3.10.3.
    pub fn receive(&mut self) -> Vec<u8> {
        let old_wnd = self.rcv.wnd;
        let data = std::mem::take(&mut self.receive_buffer);
        self.update_receive_window();
        let mss = self.config.mss.min(self.config.receive_buffer);
        let reopened = old_wnd == 0 || (old_wnd < mss && self.rcv.wnd >= mss);
        if self.state.accepts_text() && self.rcv.wnd > old_wnd && reopened {
            // Window update
            self.ack_pending = true;
            self.transmit();
        }
        data
    }

    /// CLOSE. See 3.10.4.
    pub fn close(&mut self) -> Result<(), ConnectionError> {
        match self.state {
            State::Closed => Err(self.closed_error()),
            State::Listen | State::SynSent => {
                self.terminate(Notice::Closed);
                Ok(())
            }
            State::SynReceived => {
                self.close_requested = true;
                if self.send_buffer.is_empty() {
                    self.set_state(State::FinWait1);
                }
                self.transmit();
                Ok(())
            }
            State::Established => {
                self.close_requested = true;
                self.set_state(State::FinWait1);
                self.transmit();
                Ok(())
            }
            State::CloseWait => {
                self.close_requested = true;
                self.set_state(State::LastAck);
                self.transmit();
                Ok(())
            }
            State::FinWait1
            | State::FinWait2
            | State::Closing
            | State::LastAck
            | State::TimeWait => Err(ConnectionError::Closing),
        }
    }

    /// ABORT. See 3.10.5.
    pub fn abort(&mut self) -> Result<(), ConnectionError> {
        match self.state {
            State::Closed => return Err(self.closed_error()),
            State::SynReceived
            | State::Established
            | State::FinWait1
            | State::FinWait2
            | State::CloseWait => {
                let rst = SegmentBuilder::new(self.snd.nxt).rst().build();
                self.emit(rst);
            }
            State::Listen
            | State::SynSent
            | State::Closing
            | State::LastAck
            | State::TimeWait => {}
        }
        self.terminate(Notice::Closed);
        self.outcome = Some(ConnectionError::Aborted);
        warn!(id = %self.id, "Connection aborted by the local user");
        Ok(())
    }

    /// STATUS. Reads every variable of the TCB without changing any of them.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            id: self.id,
            state: self.state,
            snd: self.snd,
            rcv: self.rcv,
            cwnd: self.congestion.cwnd(),
            ssthresh: self.congestion.ssthresh(),
            send_mss: self.congestion.smss(),
            srtt: self.rtt.srtt(),
            rttvar: self.rtt.rttvar(),
            rto: self.rtt.rto(),
            backoff: self.rtt.backoff(),
            timestamps: self.timestamps.ok,
            ts_recent: self.timestamps.recent,
            last_ack_sent: self.timestamps.last_ack_sent,
            retransmission_queue: self.retransmission.len(),
            send_buffered: self.send_buffer.len(),
            receive_buffered: self.receive_buffer.len(),
        }
    }

    /// Advances the connection's clock and runs any timers that expire.
    pub fn advance_time(&mut self, delta: Duration) {
        self.now += delta;

        if self.time_wait_timer.expire(self.now) {
            self.terminate(Notice::Closed);
            return;
        }

        if self.user_timer.expire(self.now) {
            warn!(id = %self.id, "Data went unacknowledged for too long");
            self.terminate(Notice::UserTimeout);
            return;
        }

        if self.retransmission_timer.expire(self.now) {
            self.retransmission_timeout();
        }

        if self.persist_timer.expire(self.now) {
            self.probe_window();
        }

        if self.override_timer.expire(self.now) {
            self.override_expired = true;
        }

        self.transmit();
    }

    /// SEGMENT ARRIVES. See 3.10.7.
    pub fn segment_arrives(&mut self, seg: Segment) {
        if seg.is_malformed() {
            trace!(id = %self.id, ?seg, "Dropping malformed segment");
            return;
        }
        trace!(id = %self.id, state = %self.state, ?seg, "Segment arrives");

        match self.state {
            State::Closed if !self.used && seg.ctl.syn() && !seg.ctl.ack() => {
                self.segment_arrives_listen(seg)
            }
            State::Closed => {
                if let Some(response) = segment_arrives_closed(&seg) {
                    self.emit(response);
                }
            }
            State::Listen => self.segment_arrives_listen(seg),
            State::SynSent => self.segment_arrives_syn_sent(seg),
            _ => self.segment_arrives_synchronized(seg),
        }

        self.transmit();
    }

    fn segment_arrives_listen(&mut self, seg: Segment) {
        // 3.10.7.2
        if seg.ctl.rst() {
            // First:
            // Could not be valid, ignore
            return;
        }

        if seg.ctl.ack() {
            // Second:
            // Bad acknowledgement, reset
            self.emit(SegmentBuilder::new(seg.ack).rst().build());
            return;
        }

        if !seg.ctl.syn() {
            // Fourth:
            // Any other control or data-bearing segment should be discarded
            return;
        }

        // Third:
        // Text on the SYN is dropped and will be retransmitted by the peer
        self.initiation = Initiation::Listen;
        self.used = true;
        self.rcv.synchronize(seg.seq);
        self.negotiate(&seg);
        self.snd = SendSequenceSpace::new(self.config.initial_sequence_number());
        self.set_state(State::SynReceived);
        let syn_ack = self
            .syn_builder(self.timestamps.ok)
            .ack(self.rcv.nxt)
            .build();
        self.emit_reliable(syn_ack);
    }

    fn segment_arrives_syn_sent(&mut self, seg: Segment) {
        // 3.10.7.3
        // First:
        if seg.ctl.ack() && (mod_leq(seg.ack, self.snd.iss) || mod_gt(seg.ack, self.snd.nxt)) {
            // The acknowledgment does not match anything we sent. The peer may
            // hold a connection we forgot, so it gets a reset, but our own
            // attempt goes on.
            if !seg.ctl.rst() {
                trace!(id = %self.id, ack = seg.ack, "Unacceptable ACK in SYN-SENT");
                self.emit(SegmentBuilder::new(seg.ack).rst().build());
            }
            return;
        }

        // Second:
        if seg.ctl.rst() {
            if seg.ctl.ack() {
                self.terminate(Notice::Reset);
            }
            return;
        }

        // Fourth:
        if !seg.ctl.syn() {
            return;
        }

        self.rcv.synchronize(seg.seq);
        self.negotiate(&seg);
        if seg.ctl.ack() {
            self.acknowledge(seg.ack, seg.timestamps);
        }

        if mod_gt(self.snd.una, self.snd.iss) {
            self.snd.wnd = seg.wnd;
            self.snd.wl1 = seg.seq;
            self.snd.wl2 = seg.ack;
            self.snd.max_wnd = seg.wnd;
            self.establish();
            self.ack_pending = true;
        } else {
            // Simultaneous open. Our SYN is repeated as a SYN,ACK from now on.
            self.set_state(State::SynReceived);
            self.retransmission.clear();
            let syn_ack = self
                .syn_builder(self.timestamps.ok)
                .ack(self.rcv.nxt)
                .build();
            self.emit_reliable(syn_ack);
        }
    }

    fn segment_arrives_synchronized(&mut self, mut seg: Segment) {
        // 3.10.7.4
        if self.state == State::SynReceived && seg.ctl.syn() && seg.seq == self.rcv.irs {
            if seg.ctl.ack() {
                // The peer's SYN,ACK during a simultaneous open. Its SYN was
                // already accounted for.
                seg.ctl.set_syn(false);
                seg.mss = None;
                seg.seq = seg.seq.wrapping_add(1);
            } else {
                // The peer did not hear our SYN,ACK yet
                self.resend_oldest();
                return;
            }
        }

        if self.timestamps.ok && !seg.ctl.rst() {
            if let Some(timestamps) = seg.timestamps {
                if mod_lt(timestamps.val, self.timestamps.recent) {
                    trace!(id = %self.id, "Rejecting segment with an old timestamp");
                    self.ack_pending = true;
                    return;
                }
            }
        }

        // First:
        if !self.rcv.is_acceptable(seg.seq, seg.seg_len()) {
            trace!(id = %self.id, seq = seg.seq, rcv_nxt = self.rcv.nxt, "Unacceptable segment");
            if !seg.ctl.rst() {
                if self.state == State::TimeWait && seg.ctl.fin() {
                    // The peer missed our last ACK
                    self.time_wait_timer
                        .arm(self.now, self.config.time_wait());
                }
                self.ack_pending = true;
            }
            return;
        }

        if self.timestamps.ok {
            if let Some(timestamps) = seg.timestamps {
                if mod_leq(seg.seq, self.timestamps.last_ack_sent) {
                    self.timestamps.recent = timestamps.val;
                }
            }
        }

        // Second:
        if seg.ctl.rst() {
            if seg.seq != self.rcv.nxt {
                // Challenge ACK. See RFC 5961.
                self.ack_pending = true;
                return;
            }
            match self.state {
                State::SynReceived => match self.initiation {
                    Initiation::Listen => self.return_to_listen(),
                    Initiation::Open => self.terminate(Notice::Refused),
                },
                State::Established | State::FinWait1 | State::FinWait2 | State::CloseWait => {
                    self.terminate(Notice::Reset)
                }
                _ => self.terminate(Notice::Closed),
            }
            return;
        }

        // Fourth:
        if seg.ctl.syn() {
            // A SYN in a synchronized state is answered by restating where
            // this side is. A peer that restarted will answer with a reset.
            self.ack_pending = true;
            return;
        }

        // Fifth:
        if !seg.ctl.ack() {
            return;
        }

        // A CLOSE in SYN-RECEIVED moves to FIN-WAIT-1 before our SYN is
        // acknowledged
        let handshake_pending = self.state == State::SynReceived
            || (self.state == State::FinWait1 && self.snd.una == self.snd.iss);
        if handshake_pending {
            if !self.snd.acks_new_data(seg.ack) {
                self.emit(SegmentBuilder::new(seg.ack).rst().build());
                return;
            }
            self.snd.wnd = seg.wnd;
            self.snd.wl1 = seg.seq;
            self.snd.wl2 = seg.ack;
            self.snd.max_wnd = seg.wnd;
            self.establish();
        }

        if self.snd.acks_unsent(seg.ack) || self.snd.is_ancient_ack(seg.ack) {
            trace!(id = %self.id, ack = seg.ack, "Dropping ACK outside the send window");
            self.ack_pending = true;
            return;
        }

        if self.snd.acks_new_data(seg.ack) {
            self.acknowledge(seg.ack, seg.timestamps);
        }

        if self.snd.update_window(seg.seq, seg.ack, seg.wnd) {
            trace!(id = %self.id, wnd = seg.wnd, "Send window updated");
        }

        match self.state {
            State::FinWait1 if self.fin_acked() => self.set_state(State::FinWait2),
            State::Closing => {
                if self.fin_acked() {
                    self.enter_time_wait();
                } else {
                    return;
                }
            }
            State::LastAck => {
                if self.fin_acked() {
                    self.terminate(Notice::Closed);
                }
                return;
            }
            _ => {}
        }

        // Seventh:
        let mut fin = seg.ctl.fin();
        if !seg.text.is_empty() && self.state.accepts_text() {
            if mod_gt(seg.seq, self.rcv.nxt) {
                // No reassembly. The sender will retransmit once it sees the
                // duplicate acknowledgment.
                trace!(id = %self.id, seq = seg.seq, "Dropping out of order segment");
                self.ack_pending = true;
                return;
            }
            let overlap = (self.rcv.overlap(seg.seq) as usize).min(seg.text.len());
            let text = &seg.text[overlap..];
            let accepted = text.len().min(self.rcv.wnd as usize);
            if accepted < text.len() {
                // The FIN lies beyond what fit in the window
                fin = false;
            }
            self.receive_buffer.extend_from_slice(&text[..accepted]);
            self.rcv.nxt = self.rcv.nxt.wrapping_add(accepted as u32);
            self.update_receive_window();
            self.ack_pending = true;
        }

        // Eighth:
        if fin {
            let fin_seq = seg.seq.wrapping_add(seg.text.len() as u32);
            if fin_seq != self.rcv.nxt {
                self.ack_pending = true;
                return;
            }
            self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
            self.ack_pending = true;
            self.notices.push(Notice::PeerClosed);
            match self.state {
                State::SynReceived | State::Established => self.set_state(State::CloseWait),
                State::FinWait1 => {
                    if self.fin_acked() {
                        self.enter_time_wait();
                    } else {
                        self.set_state(State::Closing);
                    }
                }
                State::FinWait2 => self.enter_time_wait(),
                State::TimeWait => self
                    .time_wait_timer
                    .arm(self.now, self.config.time_wait()),
                State::Closed
                | State::Listen
                | State::SynSent
                | State::CloseWait
                | State::Closing
                | State::LastAck => {}
            }
        }
    }

    /// Handles an acknowledgment of new data: SND.UNA advances, the
    /// retransmission queue shrinks, and both the RTT estimator and congestion
    /// controller learn about it.
    fn acknowledge(&mut self, ack: u32, timestamps: Option<Timestamps>) {
        let acknowledged = self.retransmission.acknowledge(ack, self.now);
        self.snd.una = ack;

        let sample = match timestamps {
            Some(timestamps) if self.timestamps.ok && timestamps.ecr != 0 => {
                let elapsed = self.ts_clock().wrapping_sub(timestamps.ecr);
                Some(Duration::from_millis(elapsed as u64))
            }
            _ => acknowledged.rtt,
        };
        if let Some(rtt) = sample {
            self.rtt.sample(rtt);
        }
        self.rtt.clear_backoff();
        self.congestion.on_ack(acknowledged.bytes);

        if self.retransmission.is_empty() {
            self.retransmission_timer.cancel();
            self.user_timer.cancel();
        } else {
            self.retransmission_timer.arm(self.now, self.rtt.rto());
            if let Some(user_timeout) = self.config.user_timeout {
                self.user_timer.arm(self.now, user_timeout);
            }
        }
    }

    /// Sends whatever the windows allow, then the FIN if one is due, then any
    /// acknowledgment still owed.
    fn transmit(&mut self) {
        let sending = matches!(
            self.state,
            State::Established | State::CloseWait | State::FinWait1 | State::LastAck
        ) && self.fin_seq.is_none();

        if sending {
            while !self.send_buffer.is_empty() {
                let window = self.congestion.send_window(self.snd.wnd);
                let usable = self.snd.usable(window) as usize;
                let len = usable
                    .min(self.congestion.smss() as usize)
                    .min(self.send_buffer.len());
                if len == 0 {
                    break;
                }
                if !self.may_send(len, usable) {
                    if !self.override_timer.is_armed() {
                        trace!(id = %self.id, len, "Holding back small segment");
                        self.override_timer
                            .arm(self.now, self.config.override_timeout);
                    }
                    break;
                }
                self.override_expired = false;
                let text: Vec<_> = self.send_buffer.drain(..len).collect();
                let mut builder = self.builder(self.snd.nxt).ack(self.rcv.nxt).text(text);
                if self.send_buffer.is_empty() {
                    builder = builder.psh();
                }
                self.snd.nxt = self.snd.nxt.wrapping_add(len as u32);
                self.emit_reliable(builder.build());
            }

            if self.send_buffer.is_empty() {
                self.override_timer.cancel();
            }
            self.override_expired = false;

            if self.snd.wnd == 0 && !self.send_buffer.is_empty() && self.retransmission.is_empty()
            {
                self.persist_timer.arm_if_idle(self.now, self.rtt.rto());
            } else {
                self.persist_timer.cancel();
            }

            if self.close_requested
                && self.send_buffer.is_empty()
                && matches!(self.state, State::FinWait1 | State::LastAck)
            {
                let fin = self.builder(self.snd.nxt).fin().ack(self.rcv.nxt).build();
                self.fin_seq = Some(self.snd.nxt);
                self.snd.nxt = self.snd.nxt.wrapping_add(1);
                self.emit_reliable(fin);
            }
        }

        if self.ack_pending {
            if self.state.is_synchronized() {
                let ack = self.builder(self.snd.nxt).ack(self.rcv.nxt).build();
                self.emit(ack);
            }
            self.ack_pending = false;
        }
    }

    /// Sender side silly window avoidance and the Nagle algorithm. See
    /// 3.7.4 and 3.8.6.2.1.
    fn may_send(&self, len: usize, usable: usize) -> bool {
        let buffered = self.send_buffer.len();
        let idle = self.snd.una == self.snd.nxt;
        self.config.no_delay
            || self.override_expired
            || len >= self.congestion.smss() as usize
            || (idle && buffered <= usable)
            || (idle && len as f64 >= self.config.fs * f64::from(self.snd.max_wnd))
            // The FIN goes out right behind the last of the data
            || (self.close_requested && len == buffered)
    }

    fn retransmission_timeout(&mut self) {
        if self.retransmission.is_empty() {
            return;
        }
        if self.rtt.backoff() >= self.config.max_retransmissions {
            warn!(
                id = %self.id,
                retransmissions = self.rtt.backoff(),
                "Giving up on unacknowledged data"
            );
            self.terminate(Notice::TimedOut);
            return;
        }
        // 5.4 through 5.6
        self.congestion.on_timeout(self.snd.flight_size());
        self.rtt.back_off();
        debug!(
            id = %self.id,
            rto = ?self.rtt.rto(),
            cwnd = self.congestion.cwnd(),
            "Retransmission timeout"
        );
        self.resend_oldest();
        self.retransmission_timer.arm(self.now, self.rtt.rto());
    }

    /// Sends a single octet beyond a zero window so that a lost window update
    /// cannot stall the connection. The octet is retransmitted like any other
    /// data until the peer takes it.
    fn probe_window(&mut self) {
        if self.snd.wnd != 0 || !self.retransmission.is_empty() {
            return;
        }
        let Some(octet) = self.send_buffer.pop_front() else {
            return;
        };
        trace!(id = %self.id, "Probing zero window");
        let probe = self
            .builder(self.snd.nxt)
            .ack(self.rcv.nxt)
            .text(vec![octet])
            .build();
        self.snd.nxt = self.snd.nxt.wrapping_add(1);
        self.emit_reliable(probe);
    }

    /// Sends the oldest unacknowledged segment again with fresh acknowledgment
    /// fields.
    fn resend_oldest(&mut self) {
        let ack = self.rcv.nxt;
        let wnd = self.rcv.wnd;
        let val = self.ts_clock();
        let ecr = self.timestamps.recent;
        let Some(segment) = self.retransmission.retransmit() else {
            return;
        };
        if segment.ctl.ack() {
            segment.ack = ack;
        }
        segment.wnd = wnd;
        if let Some(timestamps) = segment.timestamps.as_mut() {
            timestamps.val = val;
            timestamps.ecr = ecr;
        }
        let segment = segment.clone();
        self.emit(segment);
    }

    fn establish(&mut self) {
        if self.close_requested {
            self.set_state(State::FinWait1);
        } else {
            self.set_state(State::Established);
        }
        self.notices.push(Notice::Established);
    }

    fn enter_time_wait(&mut self) {
        self.set_state(State::TimeWait);
        self.retransmission.clear();
        self.retransmission_timer.cancel();
        self.persist_timer.cancel();
        self.user_timer.cancel();
        self.override_timer.cancel();
        self.time_wait_timer.arm(self.now, self.config.time_wait());
    }

    /// A passive open that was reset goes back to waiting for a connection.
    /// Nothing of the failed attempt carries over to the next one.
    fn return_to_listen(&mut self) {
        let mut fresh = Tcb::new(self.id, self.config.clone());
        fresh.initiation = Initiation::Listen;
        fresh.used = true;
        fresh.now = self.now;
        fresh.outgoing = std::mem::take(&mut self.outgoing);
        fresh.notices = std::mem::take(&mut self.notices);
        fresh.state = self.state;
        *self = fresh;
        self.set_state(State::Listen);
    }

    /// Enters CLOSED and releases everything the connection held.
    fn terminate(&mut self, notice: Notice) {
        self.set_state(State::Closed);
        self.retransmission.clear();
        self.send_buffer.clear();
        self.retransmission_timer.cancel();
        self.persist_timer.cancel();
        self.user_timer.cancel();
        self.time_wait_timer.cancel();
        self.override_timer.cancel();
        self.ack_pending = false;
        self.outcome = notice.error();
        if self.outcome.is_some() {
            self.receive_buffer.clear();
            warn!(id = %self.id, ?notice, "Connection terminated");
        }
        self.notices.push(notice);
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!(id = %self.id, from = %self.state, to = %state, "State change");
            self.state = state;
        }
    }

    /// Applies the options of the peer's SYN.
    fn negotiate(&mut self, seg: &Segment) {
        if let Some(mss) = seg.mss {
            self.congestion.set_smss(mss.min(self.config.mss));
        }
        if let (true, Some(timestamps)) = (self.config.timestamps, seg.timestamps) {
            self.timestamps.ok = true;
            self.timestamps.recent = timestamps.val;
        }
    }

    fn fin_acked(&self) -> bool {
        self.fin_seq.map_or(false, |fin| mod_gt(self.snd.una, fin))
    }

    fn closed_error(&self) -> ConnectionError {
        self.outcome.unwrap_or(ConnectionError::DoesNotExist)
    }

    fn update_receive_window(&mut self) {
        let free = (self.config.receive_buffer as usize).saturating_sub(self.receive_buffer.len());
        self.rcv.wnd = free as u16;
    }

    /// The timestamp clock ticks in milliseconds. Zero is never sent so that an
    /// echo of zero always means "nothing to echo".
    fn ts_clock(&self) -> u32 {
        (self.now.as_millis() as u32).wrapping_add(1)
    }

    fn builder(&self, seq: u32) -> SegmentBuilder {
        let timestamps = self.timestamps.ok.then(|| Timestamps {
            val: self.ts_clock(),
            ecr: self.timestamps.recent,
        });
        SegmentBuilder::new(seq)
            .wnd(self.rcv.wnd)
            .timestamps(timestamps)
    }

    fn syn_builder(&self, timestamps: bool) -> SegmentBuilder {
        let timestamps = timestamps.then(|| Timestamps {
            val: self.ts_clock(),
            ecr: self.timestamps.recent,
        });
        SegmentBuilder::new(self.snd.iss)
            .syn()
            .wnd(self.rcv.wnd)
            .mss(self.config.mss)
            .timestamps(timestamps)
    }

    fn emit(&mut self, segment: Segment) {
        if segment.ctl.ack() {
            self.timestamps.last_ack_sent = segment.ack;
            self.ack_pending = false;
        }
        trace!(id = %self.id, ?segment, "Sending segment");
        self.outgoing.push(segment);
    }

    /// Sends a segment that occupies sequence space and keeps it until it is
    /// acknowledged.
    fn emit_reliable(&mut self, segment: Segment) {
        self.retransmission.push(segment.clone(), self.now);
        self.retransmission_timer
            .arm_if_idle(self.now, self.rtt.rto());
        if let Some(user_timeout) = self.config.user_timeout {
            self.user_timer.arm_if_idle(self.now, user_timeout);
        }
        self.emit(segment);
    }
}

/// Answers a segment addressed to a connection that does not exist. See
/// 3.10.7.1.
pub fn segment_arrives_closed(seg: &Segment) -> Option<Segment> {
    if seg.ctl.rst() {
        // Discard RST segments
        return None;
    }

    Some(if seg.ctl.ack() {
        SegmentBuilder::new(seg.ack).rst().build()
    } else {
        SegmentBuilder::new(0)
            .rst()
            .ack(seg.seq.wrapping_add(seg.seg_len()))
            .build()
    })
}

/// An input to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Active open
    Open,
    /// Passive open
    Listen,
    /// Queue data for delivery
    Send(Vec<u8>),
    /// Graceful close
    Close,
    /// Abortive close
    Abort,
    /// A segment from the remote peer
    Segment(Segment),
    /// Time passed on the host's clock
    Elapsed(Duration),
}

/// Everything one event produced
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Step {
    /// Segments for the host to send, in order
    pub segments: Vec<Segment>,
    /// When the host should next deliver [`Event::Elapsed`]
    pub timer: TimerAction,
    /// Lifecycle changes the user should hear about
    pub notices: Vec<Notice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerAction {
    /// Fire after the given time
    Arm(Duration),
    /// No timer is running
    #[default]
    Disarm,
}

/// A connection lifecycle change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// The handshake completed
    Established,
    /// The remote peer will send no more data
    PeerClosed,
    /// The connection ended normally or by a local abort
    Closed,
    /// The remote peer reset the connection
    Reset,
    /// The remote peer refused the connection
    Refused,
    /// Retransmissions were exhausted
    TimedOut,
    /// Data stayed unacknowledged past the user timeout
    UserTimeout,
}

impl Notice {
    /// The error a terminal notice reports to the user, if any
    pub fn error(self) -> Option<ConnectionError> {
        match self {
            Notice::Reset => Some(ConnectionError::Reset),
            Notice::Refused => Some(ConnectionError::Refused),
            Notice::TimedOut => Some(ConnectionError::TimedOut),
            Notice::UserTimeout => Some(ConnectionError::UserTimeout),
            Notice::Established | Notice::PeerClosed | Notice::Closed => None,
        }
    }

    /// Whether the connection is over after this notice
    pub fn is_terminal(self) -> bool {
        !matches!(self, Notice::Established | Notice::PeerClosed)
    }
}

/// The outcome of a user call that could not be carried out
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection does not exist")]
    DoesNotExist,
    #[error("Connection already exists")]
    AlreadyExists,
    #[error("Connection closing")]
    Closing,
    #[error("Connection reset by peer")]
    Reset,
    #[error("Connection refused")]
    Refused,
    #[error("Connection timed out after too many retransmissions")]
    TimedOut,
    #[error("Connection aborted due to user timeout")]
    UserTimeout,
    #[error("Connection aborted by the local user")]
    Aborted,
    #[error("The connection task is no longer running")]
    HostGone,
}

/// A read-only copy of a TCB's variables
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: ConnectionId,
    pub state: State,
    pub snd: SendSequenceSpace,
    pub rcv: ReceiveSequenceSpace,
    pub cwnd: u32,
    pub ssthresh: u32,
    pub send_mss: u32,
    pub srtt: Option<Duration>,
    pub rttvar: Duration,
    pub rto: Duration,
    pub backoff: u32,
    /// Snd.TS.OK
    pub timestamps: bool,
    pub ts_recent: u32,
    pub last_ack_sent: u32,
    /// Segments awaiting acknowledgment
    pub retransmission_queue: usize,
    pub send_buffered: usize,
    pub receive_buffered: usize,
}
