use thiserror::Error;

use crate::{identifier::RequestNumber, message::Request};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to send request {request_number}: {reason}")]
    SendFailed {
        request_number: RequestNumber,
        reason: String,
    },
}

/// Moves signed requests to the notary. Replies come back through
/// [`Dispatcher::process_reply`](crate::dispatcher::Dispatcher::process_reply),
/// in any order.
pub trait Transport {
    fn send(&self, request: &Request) -> Result<(), TransportError>;
}
