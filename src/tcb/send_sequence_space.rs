use super::modular_cmp::{mod_bounded, mod_gt, mod_leq, mod_lt, Leq, Lt};

//      1         2          3          4
// ----------|----------|----------|----------
//        SND.UNA    SND.NXT    SND.UNA
//                             +SND.WND
//
// 1 - old sequence numbers which have been acknowledged
// 2 - sequence numbers of unacknowledged data
// 3 - sequence numbers allowed for new data transmission (send window)
// 4 - future sequence numbers which are not yet allowed
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub struct SendSequenceSpace {
    /// Oldest unacknowledged sequence number
    pub una: u32,
    /// Next sequence number to be sent
    pub nxt: u32,
    /// The size of the remote peer's window
    pub wnd: u16,
    /// Segment sequence number used for last window update
    pub wl1: u32,
    /// Segment acknowledgment number used for last window update
    pub wl2: u32,
    /// Initial send sequence number
    pub iss: u32,
    /// The largest window the remote peer has advertised
    pub max_wnd: u16,
}

impl SendSequenceSpace {
    /// Sets up the send side for a connection whose SYN carries `iss`.
    pub fn new(iss: u32) -> Self {
        Self {
            iss,
            una: iss,
            nxt: iss.wrapping_add(1),
            ..Default::default()
        }
    }

    /// The number of sequence numbers sent but not yet acknowledged
    pub fn flight_size(&self) -> u32 {
        self.nxt.wrapping_sub(self.una)
    }

    /// SND.UNA < ack <= SND.NXT
    pub fn acks_new_data(&self, ack: u32) -> bool {
        mod_bounded(self.una, Lt, ack, Leq, self.nxt)
    }

    /// The acknowledgment covers sequence numbers that were never sent.
    pub fn acks_unsent(&self, ack: u32) -> bool {
        mod_gt(ack, self.nxt)
    }

    /// The acknowledgment is older than anything the peer could legitimately
    /// still be acknowledging.
    pub fn is_ancient_ack(&self, ack: u32) -> bool {
        mod_lt(ack, self.una.wrapping_sub(self.max_wnd as u32))
    }

    /// Whether a segment with the given sequence and acknowledgment numbers may
    /// update SND.WND. Segments older than the one that last updated the window
    /// are rejected so that reordering cannot shrink the window.
    pub fn is_window_update(&self, seq: u32, ack: u32) -> bool {
        mod_bounded(self.una, Leq, ack, Leq, self.nxt)
            && (mod_lt(self.wl1, seq) || (self.wl1 == seq && mod_leq(self.wl2, ack)))
    }

    /// Applies a window update. Returns whether the window changed.
    pub fn update_window(&mut self, seq: u32, ack: u32, wnd: u16) -> bool {
        if !self.is_window_update(seq, ack) {
            return false;
        }
        let changed = self.wnd != wnd;
        self.wnd = wnd;
        self.wl1 = seq;
        self.wl2 = ack;
        self.max_wnd = self.max_wnd.max(wnd);
        changed
    }

    /// The number of sequence numbers that may still be sent under a window of
    /// `wnd` bytes
    pub fn usable(&self, wnd: u32) -> u32 {
        wnd.saturating_sub(self.flight_size())
    }
}
