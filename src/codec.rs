//! The byte layout of a segment as handed to the overlay underlay.
//!
//! ```text
//!  0               4               8       9      11       12
//! +---------------+---------------+-------+-------+--------+---------+---------+
//! |      SEQ      |      ACK      |  CTL  |  WND  | OPTLEN | options | payload |
//! +---------------+---------------+-------+-------+--------+---------+---------+
//! ```
//!
//! Options are encoded as kind/length/value triples. Every multi-byte field is
//! big endian.

use crate::segment::{Control, Segment, Timestamps};
use thiserror::Error as ThisError;

/// The number of bytes in a segment header without options
pub const BASE_HEADER_OCTETS: usize = 12;

const OPTION_END: u8 = 0;
const OPTION_MSS: u8 = 2;
const OPTION_MSS_LEN: u8 = 4;
const OPTION_TIMESTAMPS: u8 = 8;
const OPTION_TIMESTAMPS_LEN: u8 = 10;

impl Segment {
    /// The number of header bytes this segment occupies when serialized
    pub fn header_len(&self) -> usize {
        BASE_HEADER_OCTETS + self.options_len()
    }

    fn options_len(&self) -> usize {
        self.mss.map_or(0, |_| OPTION_MSS_LEN as usize)
            + self
                .timestamps
                .map_or(0, |_| OPTION_TIMESTAMPS_LEN as usize)
    }

    /// Convert the segment to its serialized format, ready to hand to the
    /// underlay.
    pub fn serialize(&self) -> Vec<u8> {
        let options_len = self.options_len();
        let mut out = Vec::with_capacity(BASE_HEADER_OCTETS + options_len + self.text.len());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.push(self.ctl.into());
        out.extend_from_slice(&self.wnd.to_be_bytes());
        // Options never exceed 14 bytes
        out.push(options_len as u8);
        if let Some(mss) = self.mss {
            out.extend_from_slice(&[OPTION_MSS, OPTION_MSS_LEN]);
            out.extend_from_slice(&mss.to_be_bytes());
        }
        if let Some(timestamps) = self.timestamps {
            out.extend_from_slice(&[OPTION_TIMESTAMPS, OPTION_TIMESTAMPS_LEN]);
            out.extend_from_slice(&timestamps.val.to_be_bytes());
            out.extend_from_slice(&timestamps.ecr.to_be_bytes());
        }
        out.extend_from_slice(&self.text);
        out
    }

    /// Parses a serialized segment into its constituent fields.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader(bytes);

        let seq = reader.u32()?;
        let ack = reader.u32()?;
        let ctl = reader.u8()?;
        if ctl & !Control::MASK != 0 {
            Err(ParseError::ReservedBits(ctl))?
        }
        let ctl = Control::from(ctl);
        let wnd = reader.u16()?;
        let options_len = reader.u8()? as usize;
        let options = reader.take(options_len)?;

        let mut mss = None;
        let mut timestamps = None;
        let mut options = Reader(options);
        while let Some(kind) = options.next() {
            match kind {
                OPTION_END => break,
                OPTION_MSS => {
                    options.expect_len(kind, OPTION_MSS_LEN)?;
                    mss = Some(options.u16()?);
                }
                OPTION_TIMESTAMPS => {
                    options.expect_len(kind, OPTION_TIMESTAMPS_LEN)?;
                    timestamps = Some(Timestamps {
                        val: options.u32()?,
                        ecr: options.u32()?,
                    });
                }
                kind => {
                    // Unknown options are skipped
                    let len = options.u8()?;
                    if len < 2 {
                        Err(ParseError::OptionLength { kind, len })?
                    }
                    options.take(len as usize - 2)?;
                }
            }
        }

        Ok(Segment {
            ctl,
            seq,
            ack,
            wnd,
            mss,
            timestamps,
            text: reader.0.to_vec(),
        })
    }
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.0.len() < n {
            Err(ParseError::HeaderTooShort)?
        }
        let (taken, rest) = self.0.split_at(n);
        self.0 = rest;
        Ok(taken)
    }

    fn next(&mut self) -> Option<u8> {
        let (&first, rest) = self.0.split_first()?;
        self.0 = rest;
        Some(first)
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        self.next().ok_or(ParseError::HeaderTooShort)
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn expect_len(&mut self, kind: u8, expected: u8) -> Result<(), ParseError> {
        let len = self.u8()?;
        if len == expected {
            Ok(())
        } else {
            Err(ParseError::OptionLength { kind, len })
        }
    }
}

/// An error that occurred while parsing a segment
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum ParseError {
    #[error("Too few bytes to constitute a segment header")]
    HeaderTooShort,
    #[error("Reserved control bits were set: {0:#04x}")]
    ReservedBits(u8),
    #[error("Option {kind} has an invalid length of {len}")]
    OptionLength { kind: u8, len: u8 },
}
