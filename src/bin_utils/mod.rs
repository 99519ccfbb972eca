//! Runs client scripts against an in-process notary. Shared by the binary
//! and the integration tests.

use std::{
    collections::HashMap,
    io::{Read, Write},
    sync::Arc,
};

use anyhow::Result;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    command::{CommandType, Payload, RequestSpec},
    config::ClientConfig,
    context::{ContextStore, ServerContext},
    crypto::{Crypto, Digest, Ed25519Crypto},
    dispatcher::{BuildError, Dispatcher, ReplyError, ReplyOutcome},
    identifier::{AccountId, IdentityId},
    queue::RequestStatus,
    storage::Storage,
    transport::TransportError,
    wallet::Wallet,
    workflow::InMemoryWorkflow,
};
use csv_parser::{CsvScriptParser, Operation, Step};
use csv_printer::{AccountRow, print_accounts};
use loopback::{LoopbackNotary, LoopbackTransport};

pub mod csv_parser;
pub mod csv_printer;
pub mod loopback;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Malformed row: {0}")]
    Parse(#[from] csv::Error),
    #[error("{operation:?} needs a value for `{field}`")]
    MissingField {
        operation: Operation,
        field: &'static str,
    },
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Reply(#[from] ReplyError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Notary refused {0:?}")]
    Refused(CommandType),
}

pub struct Service<'w, R, W: 'w> {
    pub input: R,
    pub output: &'w mut W,
    pub config: ClientConfig,
    pub error_printer: Box<dyn FnMut(u64, ScriptError)>,
}

impl<'w, R, W> Service<'w, R, W>
where
    R: Read,
    W: Write + 'w,
{
    pub fn run(mut self) -> Result<()> {
        let notary = Mutex::new(LoopbackNotary::new("loopback", [7; 32]));
        let mut runner = Runner::new(&notary, self.config.clone());

        for (line, step) in CsvScriptParser::new(self.input) {
            if let Err(err) = step.map_err(ScriptError::from).and_then(|s| runner.run_step(&s)) {
                (self.error_printer)(line, err);
            }
        }

        print_accounts(
            self.output,
            runner.wallet.accounts().into_iter().map(|acc| AccountRow {
                account: acc.id().clone(),
                owner: acc.owner().clone(),
                unit: acc.unit().clone(),
                balance: acc.balance(),
            }),
        )
    }
}

struct Runner<'n> {
    notary: &'n Mutex<LoopbackNotary>,
    config: ClientConfig,
    storage: Arc<Storage>,
    wallet: Arc<Wallet>,
    workflow: Arc<InMemoryWorkflow>,
    contexts: ContextStore,
    dispatchers: HashMap<IdentityId, Dispatcher>,
}

impl<'n> Runner<'n> {
    fn new(notary: &'n Mutex<LoopbackNotary>, config: ClientConfig) -> Self {
        let storage = Arc::new(Storage::in_memory());
        Self {
            notary,
            config,
            wallet: Arc::new(Wallet::new(storage.clone())),
            storage,
            workflow: Arc::default(),
            contexts: ContextStore::default(),
            dispatchers: HashMap::new(),
        }
    }

    fn context(&mut self, identity: &IdentityId) -> Arc<ServerContext> {
        if !self.dispatchers.contains_key(identity) {
            let seed = *Digest::of(identity.as_str().as_bytes()).as_bytes();
            let crypto: Arc<dyn Crypto> = Arc::new(Ed25519Crypto::from_seed(seed));
            self.notary
                .lock()
                .register_identity(identity.clone(), crypto.clone());
            let dispatcher = Dispatcher::new(
                crypto,
                self.wallet.clone(),
                self.storage.clone(),
                self.workflow.clone(),
                self.config.clone(),
            );
            self.dispatchers.insert(identity.clone(), dispatcher);
        }
        let notary = self.notary.lock();
        self.contexts
            .get_or_create(&self.storage, identity, notary.id(), notary.public_key())
    }

    fn run_step(&mut self, step: &Step) -> Result<(), ScriptError> {
        let identity = &step.identity;
        let context = self.context(identity);
        let account = || {
            step.account.clone().ok_or(ScriptError::MissingField {
                operation: step.operation,
                field: "account",
            })
        };
        let amount = || {
            step.amount.ok_or(ScriptError::MissingField {
                operation: step.operation,
                field: "amount",
            })
        };
        debug!(op = ?step.operation, %identity, "running step");

        match step.operation {
            Operation::Register => {
                let unit = step.unit.clone().ok_or(ScriptError::MissingField {
                    operation: step.operation,
                    field: "unit",
                })?;
                let mut spec = RequestSpec::new(CommandType::RegisterAccount).with_unit(unit);
                if let Some(account) = &step.account {
                    spec = spec.with_account(account.clone());
                }
                self.roundtrip(identity, &context, spec)?;
            }
            Operation::Numbers => {
                let count = step
                    .amount
                    .and_then(|a| a.to_u32())
                    .unwrap_or(5);
                self.fetch_numbers(identity, &context, count)?;
            }
            Operation::Sync => self.sync_nymbox(identity, &context)?,
            Operation::Deposit => {
                let spec = RequestSpec::new(CommandType::Deposit)
                    .with_account(account()?)
                    .with_amount(amount()?)
                    .with_payload(Payload::Cash { tokens: Vec::new() });
                self.transact(identity, &context, spec)?;
            }
            Operation::Transfer => {
                let to = step.counterparty_account.clone().ok_or(ScriptError::MissingField {
                    operation: step.operation,
                    field: "counterparty_account",
                })?;
                let recipient = step.counterparty.clone().unwrap_or_else(|| identity.clone());
                let spec = RequestSpec::new(CommandType::NotarizeTransaction)
                    .with_account(account()?)
                    .with_amount(amount()?)
                    .with_counterparty(recipient, to);
                self.transact(identity, &context, spec)?;
            }
            Operation::Accept => self.accept_inbox(identity, &context, account()?)?,
            Operation::Withdraw => {
                let amount = amount()?;
                let blinded = amount.to_string().into_bytes();
                let spec = RequestSpec::new(CommandType::Withdrawal)
                    .with_account(account()?)
                    .with_amount(amount)
                    .with_blinding(Digest::of(&blinded).as_bytes().to_vec())
                    .with_payload(Payload::Withdrawal { blinded });
                self.transact(identity, &context, spec)?;
            }
            Operation::Dividend => {
                let share_unit = step.unit.clone().ok_or(ScriptError::MissingField {
                    operation: step.operation,
                    field: "unit",
                })?;
                let spec = RequestSpec::new(CommandType::PayDividend)
                    .with_account(account()?)
                    .with_payload(Payload::Dividend {
                        share_unit,
                        per_share: amount()?,
                    });
                self.transact(identity, &context, spec)?;
            }
            Operation::Unregister => {
                let spec = RequestSpec::new(CommandType::UnregisterAccount).with_account(account()?);
                self.roundtrip(identity, &context, spec)?;
            }
        }
        Ok(())
    }

    /// Tops up transaction numbers when running low, then runs `spec`.
    fn transact(
        &self,
        identity: &IdentityId,
        context: &Arc<ServerContext>,
        spec: RequestSpec,
    ) -> Result<ReplyOutcome, ScriptError> {
        if context.needs_numbers(self.config.numbers_low_watermark) {
            self.fetch_numbers(identity, context, 5)?;
        }
        self.roundtrip(identity, context, spec)
    }

    fn fetch_numbers(
        &self,
        identity: &IdentityId,
        context: &Arc<ServerContext>,
        count: u32,
    ) -> Result<(), ScriptError> {
        if context.requires_resync() {
            self.sync_nymbox(identity, context)?;
        }
        let spec = RequestSpec::new(CommandType::GetTransactionNumbers)
            .with_payload(Payload::NumberCount(count));
        self.roundtrip(identity, context, spec).map(|_| ())
    }

    fn sync_nymbox(
        &self,
        identity: &IdentityId,
        context: &Arc<ServerContext>,
    ) -> Result<(), ScriptError> {
        self.roundtrip(identity, context, RequestSpec::new(CommandType::GetNymbox))?;
        let waiting = context.nymbox().numbers();
        if !waiting.is_empty() {
            let spec = RequestSpec::new(CommandType::ProcessNymbox).with_payload(Payload::Process {
                accept: waiting,
                reject: Vec::new(),
            });
            self.roundtrip(identity, context, spec)?;
        }
        Ok(())
    }

    fn accept_inbox(
        &self,
        identity: &IdentityId,
        context: &Arc<ServerContext>,
        account: AccountId,
    ) -> Result<(), ScriptError> {
        let refresh = RequestSpec::new(CommandType::GetAccountData).with_account(account.clone());
        self.roundtrip(identity, context, refresh)?;
        let waiting = context.inbox(&account).map(|inbox| inbox.numbers()).unwrap_or_default();
        if waiting.is_empty() {
            return Ok(());
        }
        let spec = RequestSpec::new(CommandType::ProcessInbox)
            .with_account(account)
            .with_payload(Payload::Process {
                accept: waiting,
                reject: Vec::new(),
            });
        self.transact(identity, context, spec).map(|_| ())
    }

    fn roundtrip(
        &self,
        identity: &IdentityId,
        context: &Arc<ServerContext>,
        spec: RequestSpec,
    ) -> Result<ReplyOutcome, ScriptError> {
        let command = spec.command;
        // `context` created the dispatcher for this identity
        let Some(dispatcher) = self.dispatchers.get(identity) else {
            return Err(ScriptError::Refused(command));
        };
        let mut guards = vec![dispatcher.build_request(context, spec)?];
        let transport = LoopbackTransport::new(self.notary);
        dispatcher.send_pending(context, &transport)?;

        let mut outcome = None;
        for reply in transport.take_replies() {
            match dispatcher.process_reply(&mut guards, context, reply, None) {
                Ok(applied) => outcome = Some(applied),
                Err(err) if err.is_benign() => debug!(%err, "skipping replay"),
                Err(err) => return Err(err.into()),
            }
        }
        match outcome {
            Some(outcome) if outcome.status == RequestStatus::Accepted => {
                info!(%identity, ?command, request_number = outcome.request_number, "request accepted");
                Ok(outcome)
            }
            _ => Err(ScriptError::Refused(command)),
        }
    }
}
