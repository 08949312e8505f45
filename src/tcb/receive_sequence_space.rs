use super::modular_cmp::{in_window, mod_lt};

//     1          2          3
// ----------|----------|----------
//        RCV.NXT    RCV.NXT
//                  +RCV.WND
//
// 1 - old sequence numbers which have been acknowledged
// 2 - sequence numbers allowed for new reception
// 3 - future sequence numbers which are not yet allowed
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub struct ReceiveSequenceSpace {
    /// Initial receive sequence number
    pub irs: u32,
    /// Next sequence number expected on an incoming segment, and is the
    /// left or lower edge of the receive window
    pub nxt: u32,
    /// The number of bytes we can buffer from the remote peer
    pub wnd: u16,
}

impl ReceiveSequenceSpace {
    /// Records the remote peer's SYN.
    pub fn synchronize(&mut self, irs: u32) {
        self.irs = irs;
        self.nxt = irs.wrapping_add(1);
    }

    /// Test segment acceptability. See RFC 9293 Table 6.
    ///
    /// | Segment Length | Receive Window | Test                                  |
    /// |----------------|----------------|---------------------------------------|
    /// | 0              | 0              | SEG.SEQ = RCV.NXT                     |
    /// | 0              | >0             | RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND  |
    /// | >0             | 0              | not acceptable                        |
    /// | >0             | >0             | first or last octet in the window     |
    pub fn is_acceptable(&self, seq: u32, seg_len: u32) -> bool {
        match (seg_len, self.wnd) {
            (0, 0) => seq == self.nxt,
            (0, _) => self.in_window(seq),
            (_, 0) => false,
            (_, _) => self.in_window(seq) || self.in_window(seq.wrapping_add(seg_len - 1)),
        }
    }

    fn in_window(&self, seq: u32) -> bool {
        in_window(seq, self.nxt, self.nxt.wrapping_add(self.wnd as u32))
    }

    /// The number of leading octets of a segment starting at `seq` that were
    /// already received
    pub fn overlap(&self, seq: u32) -> u32 {
        if mod_lt(seq, self.nxt) {
            self.nxt.wrapping_sub(seq)
        } else {
            0
        }
    }
}
