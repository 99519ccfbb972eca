/// Identifiers shared by every other module.
pub mod identifier;

/// Sign/verify capability and the SHA-256 digest used for hashing ledgers.
pub mod crypto;

/// Dual-bucket key-value storage over a pluggable driver.
pub mod storage;

/// Balance state of one account.
/// State is modified using events, which are created by handling commands
pub mod account;

/// Owns every account; the only way to mutate one.
pub mod wallet;

/// Payment workflow events recorded while reconciling.
pub mod workflow;

/// Signed boxes (nymbox, inbox, outbox) and their items.
pub mod ledger;

/// Request commands and their caller-side validation.
pub mod command;

/// Wire-level request and reply messages.
pub mod message;

/// Transaction number bookkeeping.
pub mod numbers;

/// Per (identity, notary) consensus state and the guard that manages
/// reserved numbers.
pub mod context;

/// Outstanding requests awaiting replies.
pub mod queue;

/// Applies ledger deltas from replies to local state.
pub mod reconciler;

/// Builds requests and routes replies to per-command handlers.
/// Coordinates the context, the queue and the reconciler.
pub mod dispatcher;

/// Moves requests to the notary.
pub mod transport;

/// Client settings read from a TOML file.
pub mod config;

/// Ideally, this module should exist as its own crate, as a way to
/// bootstrap the client. It also drives the integration tests, so it
/// lives here.
pub mod bin_utils;
