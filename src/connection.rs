//! A task that owns one [`Tcb`] and drives it from a tokio runtime.
//!
//! The task is the only place the TCB lives, so no locking is needed. Users and
//! the host talk to it through a [`Connection`] handle, which forwards every
//! call over a channel and waits for the task's reply.

use crate::{
    segment::Segment,
    tcb::{ConnectionError, Event, Notice, Snapshot, State, Step, Tcb, TimerAction},
};
use std::{collections::VecDeque, mem};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{sleep_until, Instant},
};

/// Instructions buffered on the way to a connection task
const INSTRUCTION_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, ConnectionError>>;

/// A handle to a running connection. Cloning the handle is cheap, and the task
/// stops once every handle is dropped.
#[derive(Debug, Clone)]
pub struct Connection {
    instructions: mpsc::Sender<Instruction>,
    status: watch::Receiver<Snapshot>,
}

impl Connection {
    /// Starts a task for the given TCB. Every segment the connection produces
    /// is sent on `outbound`.
    pub fn spawn(tcb: Tcb, outbound: mpsc::Sender<Segment>) -> Self {
        let (instructions, receiver) = mpsc::channel(INSTRUCTION_BUFFER);
        let (status_sender, status) = watch::channel(tcb.snapshot());
        let task = Task {
            tcb,
            instructions: receiver,
            outbound,
            status: status_sender,
            clock: Instant::now(),
            deadline: None,
            pending: vec![],
            openers: vec![],
            closers: vec![],
            receivers: VecDeque::new(),
            established: false,
            peer_closed: false,
        };
        tokio::spawn(task.run());
        Self {
            instructions,
            status,
        }
    }

    /// Actively opens the connection. Resolves once the handshake completes.
    pub async fn open(&self) -> Result<(), ConnectionError> {
        self.request(Instruction::Open).await
    }

    /// Waits for a remote peer to open the connection.
    pub async fn listen(&self) -> Result<(), ConnectionError> {
        self.request(Instruction::Listen).await
    }

    /// Queues data for reliable delivery. Resolves once the data is queued, not
    /// once it is acknowledged.
    pub async fn send(&self, data: impl Into<Vec<u8>>) -> Result<(), ConnectionError> {
        let data = data.into();
        self.request(|reply| Instruction::Send(data, reply)).await
    }

    /// Waits for data from the remote peer. An empty result means the peer
    /// will send nothing more.
    pub async fn receive(&self) -> Result<Vec<u8>, ConnectionError> {
        self.request(Instruction::Receive).await
    }

    /// Closes our side of the connection. Resolves once the remote peer has
    /// acknowledged everything we sent, including the FIN.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.request(Instruction::Close).await
    }

    /// Resets the connection and discards everything queued.
    pub async fn abort(&self) -> Result<(), ConnectionError> {
        self.request(Instruction::Abort).await
    }

    /// Hands a segment from the remote peer to the connection.
    pub async fn deliver(&self, segment: Segment) -> Result<(), ConnectionError> {
        self.instructions
            .send(Instruction::Incoming(segment))
            .await
            .map_err(|_| ConnectionError::HostGone)
    }

    /// The connection's variables as of the last event it processed
    pub fn status(&self) -> Snapshot {
        self.status.borrow().clone()
    }

    /// Waits until the connection enters `state`.
    pub async fn reached(&self, state: State) -> Result<(), ConnectionError> {
        let mut status = self.status.clone();
        loop {
            if status.borrow_and_update().state == state {
                return Ok(());
            }
            status
                .changed()
                .await
                .map_err(|_| ConnectionError::HostGone)?;
        }
    }

    async fn request<T>(
        &self,
        instruction: impl FnOnce(Reply<T>) -> Instruction,
    ) -> Result<T, ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.instructions
            .send(instruction(reply))
            .await
            .map_err(|_| ConnectionError::HostGone)?;
        response.await.map_err(|_| ConnectionError::HostGone)?
    }
}

#[derive(Debug)]
enum Instruction {
    Incoming(Segment),
    Open(Reply<()>),
    Listen(Reply<()>),
    Send(Vec<u8>, Reply<()>),
    Receive(Reply<Vec<u8>>),
    Close(Reply<()>),
    Abort(Reply<()>),
}

struct Task {
    tcb: Tcb,
    instructions: mpsc::Receiver<Instruction>,
    outbound: mpsc::Sender<Segment>,
    status: watch::Sender<Snapshot>,
    /// When the TCB's clock was last advanced
    clock: Instant,
    /// When the TCB next needs to hear about elapsed time
    deadline: Option<Instant>,
    /// Segments produced but not yet sent
    pending: Vec<Segment>,
    openers: Vec<Reply<()>>,
    closers: Vec<Reply<()>>,
    receivers: VecDeque<Reply<Vec<u8>>>,
    established: bool,
    peer_closed: bool,
}

impl Task {
    async fn run(mut self) {
        let id = self.tcb.id();
        tracing::debug!(%id, "Connection task started");
        loop {
            let timer = sleep_until(self.deadline.unwrap_or(self.clock));
            let instruction = tokio::select! {
                instruction = self.instructions.recv() => match instruction {
                    Some(instruction) => Some(instruction),
                    None => break,
                },
                () = timer, if self.deadline.is_some() => None,
            };

            let now = Instant::now();
            let elapsed = now.saturating_duration_since(self.clock);
            self.clock = now;
            if let Err(e) = self.apply(Event::Elapsed(elapsed)) {
                tracing::error!(%id, "Failed to advance time: {}", e);
            }

            if let Some(instruction) = instruction {
                self.handle(instruction);
            }
            self.resolve();
            let step = self.tcb.drain();
            self.absorb(step);

            if self.flush().await.is_err() {
                tracing::warn!(%id, "Outbound link closed, stopping connection task");
                break;
            }
            self.status.send_replace(self.tcb.snapshot());
        }
        tracing::debug!(%id, "Connection task stopped");
    }

    fn handle(&mut self, instruction: Instruction) {
        match instruction {
            Instruction::Incoming(segment) => {
                // Segments never fail
                let _ = self.apply(Event::Segment(segment));
            }
            Instruction::Open(reply) => match self.apply(Event::Open) {
                Ok(()) => self.openers.push(reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Instruction::Listen(reply) => match self.apply(Event::Listen) {
                Ok(()) => self.openers.push(reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Instruction::Send(data, reply) => {
                let _ = reply.send(self.apply(Event::Send(data)));
            }
            Instruction::Receive(reply) => self.receivers.push_back(reply),
            Instruction::Close(reply) => match self.apply(Event::Close) {
                Ok(()) => self.closers.push(reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Instruction::Abort(reply) => {
                let _ = reply.send(self.apply(Event::Abort));
            }
        }
    }

    fn apply(&mut self, event: Event) -> Result<(), ConnectionError> {
        let step = self.tcb.step(event)?;
        self.absorb(step);
        Ok(())
    }

    fn absorb(&mut self, step: Step) {
        self.pending.extend(step.segments);
        self.deadline = match step.timer {
            TimerAction::Arm(duration) => Some(self.clock + duration),
            TimerAction::Disarm => None,
        };
        for notice in step.notices {
            match notice {
                Notice::Established => self.established = true,
                Notice::PeerClosed => self.peer_closed = true,
                _ => {}
            }
            if notice.is_terminal() {
                tracing::info!(id = %self.tcb.id(), ?notice, "Connection ended");
            }
        }
    }

    /// Answers every waiting user call whose outcome is now known.
    fn resolve(&mut self) {
        // Callers woken below see the state that woke them
        self.status.send_replace(self.tcb.snapshot());
        let state = self.tcb.state();
        let outcome = self.tcb.outcome();

        if self.established {
            for reply in self.openers.drain(..) {
                let _ = reply.send(Ok(()));
            }
        } else if state == State::Closed {
            let error = outcome.unwrap_or(ConnectionError::Closing);
            for reply in self.openers.drain(..) {
                let _ = reply.send(Err(error));
            }
        }

        if matches!(state, State::FinWait2 | State::TimeWait | State::Closed) {
            for reply in self.closers.drain(..) {
                let _ = reply.send(outcome.map_or(Ok(()), Err));
            }
        }

        while !self.receivers.is_empty() {
            let data = self.tcb.receive();
            let result = if !data.is_empty() {
                Ok(data)
            } else if let Some(error) = outcome {
                Err(error)
            } else if self.peer_closed || state == State::Closed {
                Ok(data)
            } else {
                break;
            };
            if let Some(reply) = self.receivers.pop_front() {
                let _ = reply.send(result);
            }
        }
    }

    async fn flush(&mut self) -> Result<(), mpsc::error::SendError<Segment>> {
        for segment in mem::take(&mut self.pending) {
            self.outbound.send(segment).await?;
        }
        Ok(())
    }
}
