//! A reliable, ordered, congestion-controlled byte stream between two peers of
//! an overlay network, implemented in user space.
//!
//! The transport follows TCP:
//!
//! - [RFC 9293](https://www.rfc-editor.org/rfc/rfc9293.html) for the
//!   connection state machine and segment processing
//! - [RFC 6298](https://www.rfc-editor.org/rfc/rfc6298.html) for the
//!   retransmission timer
//! - [RFC 5681](https://www.rfc-editor.org/rfc/rfc5681.html) for slow start and
//!   congestion avoidance
//! - [RFC 7323](https://www.rfc-editor.org/rfc/rfc7323.html) for timestamps
//!
//! # Organization
//!
//! - [`Tcb`] is the state of one connection. It is a pure state machine: the
//!   host feeds it segments, user calls, and elapsed time, and collects the
//!   segments it wants sent.
//! - [`Connection`] runs a [`Tcb`] on a tokio task and exposes its user calls
//!   as async methods.
//! - [`Segment`] is the unit exchanged between peers. Its byte layout lives in
//!   [`codec`].
//!
//! Connections are addressed by [`ConnectionId`], a pair of overlay
//! [`Endpoint`]s, rather than by network address.

pub mod codec;
pub mod config;
pub mod connection;
pub mod id;
pub mod segment;
pub mod tcb;

pub use codec::ParseError;
pub use config::{Config, IssSource};
pub use connection::Connection;
pub use id::{ConnectionId, Endpoint, PeerId};
pub use segment::{Control, Segment, SegmentBuilder, Timestamps};
pub use tcb::{ConnectionError, Event, Notice, Snapshot, State, Step, Tcb, TimerAction};
