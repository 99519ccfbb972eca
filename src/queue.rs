use std::collections::VecDeque;

use thiserror::Error;

use crate::{
    command::CommandType,
    identifier::{RequestNumber, TransactionNumber},
    message::Request,
    numbers::GuardId,
};

/// Non-terminal request states. Accepted and rejected requests leave the
/// queue, see [`RequestStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Built,
    Sent,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Request {request_number} is not outstanding")]
    NotOutstanding { request_number: RequestNumber },
    #[error("Request {request_number} is already queued")]
    DuplicateRequest { request_number: RequestNumber },
    #[error("Transaction number {number} is already held by request {request_number}")]
    OverlappingNumbers {
        number: TransactionNumber,
        request_number: RequestNumber,
    },
    #[error("Request {request_number} could not be re-signed: {reason}")]
    Unsignable {
        request_number: RequestNumber,
        reason: String,
    },
    #[error("Request {request_number} is {state:?}, it can only be resent after timing out")]
    NotTimedOut {
        request_number: RequestNumber,
        state: RequestState,
    },
}

#[derive(Debug, Clone)]
pub struct Outgoing {
    pub request: Request,
    /// Guard managing `request.numbers`, if any were reserved.
    pub guard: Option<GuardId>,
    pub state: RequestState,
    /// Request numbers this request was sent under before being resent.
    pub aliases: Vec<RequestNumber>,
}

impl Outgoing {
    pub fn new(request: Request, guard: Option<GuardId>) -> Self {
        Self {
            request,
            guard,
            state: RequestState::Built,
            aliases: Vec::new(),
        }
    }

    pub fn answers_to(&self, request_number: RequestNumber) -> bool {
        self.request.request_number == request_number || self.aliases.contains(&request_number)
    }

    pub fn request_numbers(&self) -> impl Iterator<Item = RequestNumber> + '_ {
        std::iter::once(self.request.request_number).chain(self.aliases.iter().copied())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub request_number: RequestNumber,
    pub command: CommandType,
    pub state: RequestState,
    pub numbers: Vec<TransactionNumber>,
}

/// Signed, unconfirmed requests of one context, in FIFO order.
#[derive(Debug, Default)]
pub struct OutgoingQueue {
    entries: VecDeque<Outgoing>,
}

impl OutgoingQueue {
    pub fn push(&mut self, outgoing: Outgoing) -> Result<(), QueueError> {
        for entry in &self.entries {
            if entry.answers_to(outgoing.request.request_number) {
                return Err(QueueError::DuplicateRequest {
                    request_number: outgoing.request.request_number,
                });
            }
            if let Some(number) = outgoing
                .request
                .numbers
                .iter()
                .find(|n| entry.request.numbers.contains(n))
            {
                return Err(QueueError::OverlappingNumbers {
                    number: *number,
                    request_number: entry.request.request_number,
                });
            }
        }
        self.entries.push_back(outgoing);
        Ok(())
    }

    pub fn get(&self, request_number: RequestNumber) -> Option<&Outgoing> {
        self.entries.iter().find(|e| e.answers_to(request_number))
    }

    pub fn get_mut(&mut self, request_number: RequestNumber) -> Option<&mut Outgoing> {
        self.entries.iter_mut().find(|e| e.answers_to(request_number))
    }

    pub fn remove(&mut self, request_number: RequestNumber) -> Option<Outgoing> {
        let index = self
            .entries
            .iter()
            .position(|e| e.answers_to(request_number))?;
        self.entries.remove(index)
    }

    pub fn get_by_guard(&self, guard: GuardId) -> Option<&Outgoing> {
        self.entries.iter().find(|e| e.guard == Some(guard))
    }

    pub fn remove_by_guard(&mut self, guard: GuardId) -> Option<Outgoing> {
        let index = self.entries.iter().position(|e| e.guard == Some(guard))?;
        self.entries.remove(index)
    }

    pub fn mark_sent(&mut self, request_number: RequestNumber) -> Result<(), QueueError> {
        self.set_state(request_number, RequestState::Sent)
    }

    pub fn mark_timed_out(&mut self, request_number: RequestNumber) -> Result<(), QueueError> {
        self.set_state(request_number, RequestState::TimedOut)
    }

    fn set_state(
        &mut self,
        request_number: RequestNumber,
        state: RequestState,
    ) -> Result<(), QueueError> {
        let entry = self
            .get_mut(request_number)
            .ok_or(QueueError::NotOutstanding { request_number })?;
        entry.state = state;
        Ok(())
    }

    /// Requests waiting to go out, oldest first.
    pub fn unsent(&self) -> Vec<Request> {
        self.entries
            .iter()
            .filter(|e| e.state == RequestState::Built)
            .map(|e| e.request.clone())
            .collect()
    }

    pub fn pending(&self) -> Vec<PendingRequest> {
        self.entries
            .iter()
            .map(|e| PendingRequest {
                request_number: e.request.request_number,
                command: e.request.command,
                state: e.state,
                numbers: e.request.numbers.clone(),
            })
            .collect()
    }

    /// Lowest request number any queued request may still be answered
    /// under, resent ones included.
    pub fn oldest_request_number(&self) -> Option<RequestNumber> {
        self.entries.iter().flat_map(Outgoing::request_numbers).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
