//! Control Point command queue.
//!
//! Pure state machine deciding what the transport writes next and when:
//!
//! - writes are spaced at least `debounce` apart;
//! - only one command is in flight; the next waits for its response
//!   indication or for the acknowledgment timeout;
//! - only one Set Target Power is queued at a time. A different target
//!   arriving while one is queued is refused with
//!   [`SensorError::TargetPending`] and the queued one is sent; an identical
//!   one shares its outcome. A queued target nobody waits for anymore is
//!   replaced;
//! - Request Control is queued ahead of the first target when control has
//!   not been granted yet.
//!
//! The transport owns the I/O: it calls [`CommandQueue::poll`] to learn what
//! to do and reports write failures and responses back.

use crate::sensors::ftms::{ControlCommand, ControlOpcode, ControlPointResponse, ResultCode};
use crate::sensors::types::SensorError;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Outcome delivered to whoever enqueued a command.
pub type CommandResult = Result<(), SensorError>;

/// What the transport should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePoll {
    /// Write this command now
    Send(ControlCommand),
    /// Nothing to do before this instant
    WaitUntil(Instant),
    /// Nothing queued
    Idle,
}

struct Queued {
    command: ControlCommand,
    waiters: Vec<oneshot::Sender<CommandResult>>,
}

struct InFlight {
    opcode: ControlOpcode,
    sent_at: Instant,
    waiters: Vec<oneshot::Sender<CommandResult>>,
}

fn resolve(waiters: Vec<oneshot::Sender<CommandResult>>, result: CommandResult) {
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
}

/// Rate-limited, acknowledgment-gated command queue.
pub struct CommandQueue {
    debounce: Duration,
    ack_timeout: Duration,
    pending: VecDeque<Queued>,
    in_flight: Option<InFlight>,
    last_write: Option<Instant>,
    control_granted: bool,
}

impl CommandQueue {
    /// Create an empty queue.
    pub fn new(debounce: Duration, ack_timeout: Duration) -> Self {
        Self {
            debounce,
            ack_timeout,
            pending: VecDeque::new(),
            in_flight: None,
            last_write: None,
            control_granted: false,
        }
    }

    /// Whether the trainer granted control.
    pub fn control_granted(&self) -> bool {
        self.control_granted
    }

    /// Commands waiting to be written.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether a command awaits its response.
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Nothing queued and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none()
    }

    fn control_requested(&self) -> bool {
        self.pending
            .iter()
            .any(|q| q.command == ControlCommand::RequestControl)
            || self
                .in_flight
                .as_ref()
                .is_some_and(|f| f.opcode == ControlOpcode::RequestControl)
    }

    /// Queue a command. Returns `false` when it was merged into, or refused in
    /// favour of, one already queued.
    pub fn enqueue(
        &mut self,
        command: ControlCommand,
        waiter: Option<oneshot::Sender<CommandResult>>,
    ) -> bool {
        match command {
            ControlCommand::SetTargetPower(watts) => {
                let queued = self.pending.iter_mut().find_map(|q| {
                    let queued_command = q.command;
                    match queued_command {
                        ControlCommand::SetTargetPower(queued) => Some((q, queued)),
                        ControlCommand::RequestControl => None,
                    }
                });
                if let Some((existing, queued)) = queued {
                    let abandoned = existing.waiters.iter().all(|w| w.is_closed());
                    if queued == watts || abandoned {
                        existing.command = command;
                        existing.waiters.retain(|w| !w.is_closed());
                        existing.waiters.extend(waiter);
                        return false;
                    }

                    tracing::trace!("Dropping {}W, {}W is already queued", watts, queued);
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Err(SensorError::TargetPending(queued)));
                    }
                    return false;
                }

                if !self.control_granted && !self.control_requested() {
                    tracing::debug!("Control not granted yet, requesting it first");
                    self.pending.push_back(Queued {
                        command: ControlCommand::RequestControl,
                        waiters: Vec::new(),
                    });
                }
            }
            ControlCommand::RequestControl => {
                if let Some(existing) = self
                    .pending
                    .iter_mut()
                    .find(|q| q.command == ControlCommand::RequestControl)
                {
                    existing.waiters.extend(waiter);
                    return false;
                }
            }
        }

        self.pending.push_back(Queued {
            command,
            waiters: waiter.into_iter().collect(),
        });
        true
    }

    /// Decide the next step at `now`.
    ///
    /// Expires the in-flight command when its acknowledgment is overdue, then
    /// hands out the head of the queue once the debounce window has passed.
    pub fn poll(&mut self, now: Instant) -> QueuePoll {
        if let Some(in_flight) = &self.in_flight {
            let deadline = in_flight.sent_at + self.ack_timeout;
            if now < deadline {
                return QueuePoll::WaitUntil(deadline);
            }
            if let Some(expired) = self.in_flight.take() {
                tracing::warn!(
                    "No response to {:?} within {:?}",
                    expired.opcode,
                    self.ack_timeout
                );
                resolve(expired.waiters, Err(SensorError::AckTimeout(self.ack_timeout)));
            }
        }

        if self.pending.is_empty() {
            return QueuePoll::Idle;
        }

        if let Some(last) = self.last_write {
            let ready = last + self.debounce;
            if now < ready {
                return QueuePoll::WaitUntil(ready);
            }
        }

        match self.pending.pop_front() {
            Some(next) => {
                self.in_flight = Some(InFlight {
                    opcode: next.command.opcode(),
                    sent_at: now,
                    waiters: next.waiters,
                });
                self.last_write = Some(now);
                QueuePoll::Send(next.command)
            }
            None => QueuePoll::Idle,
        }
    }

    /// The write of the in-flight command failed at the GATT level.
    pub fn on_write_failed(&mut self, error: SensorError) {
        if let Some(failed) = self.in_flight.take() {
            resolve(failed.waiters, Err(error));
        }
    }

    /// Match a response indication against the in-flight command.
    ///
    /// Returns `false` for responses nobody is waiting for.
    pub fn on_response(&mut self, response: ControlPointResponse) -> bool {
        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.opcode as u8 == response.request_opcode);
        if !matches {
            tracing::debug!(
                "Ignoring unsolicited response for opcode 0x{:02X}",
                response.request_opcode
            );
            return false;
        }

        let Some(acked) = self.in_flight.take() else {
            return false;
        };

        if acked.opcode == ControlOpcode::RequestControl {
            self.control_granted = response.result.is_success();
        }
        if response.result == ResultCode::ControlNotPermitted {
            self.control_granted = false;
        }

        let outcome = if response.result.is_success() {
            Ok(())
        } else {
            Err(SensorError::ControlRejected(response.result))
        };
        resolve(acked.waiters, outcome);
        true
    }

    /// Drop everything, failing all waiters. Used on disconnect.
    pub fn reset(&mut self, error: SensorError) {
        if let Some(in_flight) = self.in_flight.take() {
            resolve(in_flight.waiters, Err(error.clone()));
        }
        for queued in self.pending.drain(..) {
            resolve(queued.waiters, Err(error.clone()));
        }
        self.last_write = None;
        self.control_granted = false;
    }
}
