//! The unit of transmission exchanged between two connection state machines.

use std::fmt::{self, Debug, Formatter};

/// A transport segment. Segments are values: once built they are only read,
/// except when the retransmission machinery refreshes the acknowledgment fields
/// of a copy before sending it again.
#[derive(Clone, PartialEq, Eq)]
pub struct Segment {
    /// Control bits
    pub ctl: Control,
    /// The sequence number of the first data octet in this segment (except when
    /// SYN is present). If SYN is present the sequence number is the initial
    /// sequence number (ISN) and the first data octet is ISN+1.
    pub seq: u32,
    /// If the ACK control bit is set this field contains the value of the next
    /// sequence number the sender of the segment is expecting to receive.
    pub ack: u32,
    /// The number of data octets beginning with the one indicated in the
    /// acknowledgment field which the sender of this segment is willing to
    /// accept.
    pub wnd: u16,
    /// The largest segment the sender is willing to receive. Only valid on SYN
    /// segments.
    pub mss: Option<u16>,
    /// Timestamp option values, present once both peers agreed to use them or
    /// on a SYN offering them.
    pub timestamps: Option<Timestamps>,
    /// The payload
    pub text: Vec<u8>,
}

impl Segment {
    /// The length of the segment in sequence space, including any control bits
    pub fn seg_len(&self) -> u32 {
        self.text.len() as u32 + self.ctl.syn() as u32 + self.ctl.fin() as u32
    }

    /// The sequence number following the last octet occupied by this segment
    pub fn end(&self) -> u32 {
        self.seq.wrapping_add(self.seg_len())
    }

    /// Whether the segment carries a combination of fields that no correct
    /// sender produces.
    pub fn is_malformed(&self) -> bool {
        let ctl = self.ctl;
        (ctl.syn() && (ctl.fin() || ctl.rst())) || (self.mss.is_some() && !ctl.syn())
    }
}

impl Debug for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Segment");
        s.field("ctl", &self.ctl).field("seq", &self.seq);
        if self.ctl.ack() {
            s.field("ack", &self.ack);
        }
        s.field("wnd", &self.wnd);
        if let Some(mss) = self.mss {
            s.field("mss", &mss);
        }
        if let Some(timestamps) = self.timestamps {
            s.field("timestamps", &timestamps);
        }
        s.field("len", &self.text.len()).finish()
    }
}

/// The RFC 7323 timestamp option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Timestamps {
    /// TSval, the sender's timestamp clock
    pub val: u32,
    /// TSecr, the most recent TSval received from the remote peer
    pub ecr: u32,
}

/// Used for building a segment
#[derive(Debug)]
pub struct SegmentBuilder(Segment);

impl SegmentBuilder {
    /// Initialize a segment with defaults and the given sequence number
    pub fn new(seq: u32) -> Self {
        Self(Segment {
            ctl: Control::default(),
            seq,
            ack: 0,
            wnd: 0,
            mss: None,
            timestamps: None,
            text: vec![],
        })
    }

    /// Set the window size
    pub fn wnd(mut self, wnd: u16) -> Self {
        self.0.wnd = wnd;
        self
    }

    /// Set the acknowledgement number
    pub fn ack(mut self, ack: u32) -> Self {
        self.0.ack = ack;
        self.0.ctl.set_ack(true);
        self
    }

    /// Set the psh bit up
    pub fn psh(mut self) -> Self {
        self.0.ctl.set_psh(true);
        self
    }

    /// Set the rst bit up
    pub fn rst(mut self) -> Self {
        self.0.ctl.set_rst(true);
        self
    }

    /// Set the syn bit up
    pub fn syn(mut self) -> Self {
        self.0.ctl.set_syn(true);
        self
    }

    /// Set the fin bit up
    pub fn fin(mut self) -> Self {
        self.0.ctl.set_fin(true);
        self
    }

    /// Advertise a maximum segment size
    pub fn mss(mut self, mss: u16) -> Self {
        self.0.mss = Some(mss);
        self
    }

    /// Attach timestamps
    pub fn timestamps(mut self, timestamps: Option<Timestamps>) -> Self {
        self.0.timestamps = timestamps;
        self
    }

    /// Attach a payload
    pub fn text(mut self, text: Vec<u8>) -> Self {
        self.0.text = text;
        self
    }

    /// Get the finished segment
    pub fn build(self) -> Segment {
        self.0
    }
}

/// The control bits of a segment
#[derive(Default, Hash, PartialEq, Eq, Clone, Copy)]
pub struct Control(u8);

impl Control {
    /// The bits that have a meaning
    pub const MASK: u8 = 0b1_1111;

    /// Create a new Control with the given bits
    pub const fn new(ack: bool, psh: bool, rst: bool, syn: bool, fin: bool) -> Self {
        Self(
            fin as u8 | (syn as u8) << 1 | (rst as u8) << 2 | (psh as u8) << 3 | (ack as u8) << 4,
        )
    }

    /// Get whether the acknowledgment field significant
    pub const fn ack(self) -> bool {
        self.bit(4)
    }

    /// Set whether the acknowledgment field significant
    pub fn set_ack(&mut self, state: bool) {
        self.set_bit(4, state);
    }

    /// Get whether the push function is enabled
    pub const fn psh(self) -> bool {
        self.bit(3)
    }

    /// Set whether the push function is enabled
    pub fn set_psh(&mut self, state: bool) {
        self.set_bit(3, state);
    }

    /// Get whether to reset the connection
    pub const fn rst(self) -> bool {
        self.bit(2)
    }

    /// Set whether to reset the connection
    pub fn set_rst(&mut self, state: bool) {
        self.set_bit(2, state);
    }

    /// Get whether to synchronize sequence numbers
    pub const fn syn(self) -> bool {
        self.bit(1)
    }

    /// Set whether to synchronize sequence numbers
    pub fn set_syn(&mut self, state: bool) {
        self.set_bit(1, state);
    }

    /// Get whether there is no more data to send
    pub const fn fin(self) -> bool {
        self.bit(0)
    }

    /// Set whether there is no more data to send
    pub fn set_fin(&mut self, state: bool) {
        self.set_bit(0, state);
    }

    const fn bit(self, bit: u8) -> bool {
        (self.0 >> bit) & 0b1 == 1
    }

    fn set_bit(&mut self, bit: u8, state: bool) {
        self.0 = (self.0 & !(1 << bit)) | ((state as u8) << bit);
    }
}

impl From<u8> for Control {
    fn from(n: u8) -> Self {
        Self(n & Self::MASK)
    }
}

impl From<Control> for u8 {
    fn from(control: Control) -> Self {
        control.0
    }
}

impl Debug for Control {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let names = [
            (self.ack(), "ACK"),
            (self.psh(), "PSH"),
            (self.rst(), "RST"),
            (self.syn(), "SYN"),
            (self.fin(), "FIN"),
        ];
        let set: Vec<_> = names
            .into_iter()
            .filter_map(|(set, name)| set.then_some(name))
            .collect();
        write!(f, "Control({})", set.join(", "))
    }
}
