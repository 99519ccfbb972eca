use std::sync::Arc;

use notary_client::{
    bin_utils::loopback::{LoopbackNotary, LoopbackTransport},
    command::{CommandType, Payload, RequestSpec},
    config::ClientConfig,
    context::{ManagedNumbers, ServerContext},
    crypto::{Crypto, Digest, Ed25519Crypto},
    dispatcher::{
        BuildError, Dispatcher, PreconditionError, ReplyError, ReplyOutcome, ValidationError,
    },
    identifier::{AccountId, IdentityId, TransactionNumber},
    ledger::{ItemKind, LedgerItem, LedgerKind, Originator},
    message::{Reply, Request},
    queue::{QueueError, RequestState, RequestStatus},
    storage::Storage,
    transport::{Transport, TransportError},
    wallet::{Wallet, WalletError},
    workflow::{InMemoryWorkflow, WorkflowEventKind},
};
use parking_lot::Mutex;
use rust_decimal::Decimal;

struct Network {
    notary: Mutex<LoopbackNotary>,
    storage: Arc<Storage>,
    wallet: Arc<Wallet>,
    workflow: Arc<InMemoryWorkflow>,
}

impl Network {
    fn new() -> Self {
        let storage = Arc::new(Storage::in_memory());
        Self {
            notary: Mutex::new(LoopbackNotary::new("loopback", [7; 32])),
            wallet: Arc::new(Wallet::new(storage.clone())),
            storage,
            workflow: Arc::default(),
        }
    }

    fn client(&self, name: &str) -> Client<'_> {
        let identity = IdentityId::new(name);
        let seed = *Digest::of(name.as_bytes()).as_bytes();
        let crypto: Arc<dyn Crypto> = Arc::new(Ed25519Crypto::from_seed(seed));
        let context = {
            let mut notary = self.notary.lock();
            notary.register_identity(identity.clone(), crypto.clone());
            ServerContext::new(identity, notary.id().clone(), notary.public_key())
        };
        Client {
            network: self,
            context,
            dispatcher: Dispatcher::new(
                crypto,
                self.wallet.clone(),
                self.storage.clone(),
                self.workflow.clone(),
                ClientConfig::default(),
            ),
        }
    }

    fn events(&self, kind: WorkflowEventKind) -> usize {
        self.workflow
            .events()
            .iter()
            .filter(|event| event.kind == kind)
            .count()
    }
}

struct Client<'n> {
    network: &'n Network,
    context: Arc<ServerContext>,
    dispatcher: Dispatcher,
}

impl Client<'_> {
    fn identity(&self) -> &IdentityId {
        self.context.identity()
    }

    fn build(&self, spec: RequestSpec) -> ManagedNumbers {
        self.dispatcher.build_request(&self.context, spec).unwrap()
    }

    fn exchange(&self) -> Vec<Reply> {
        let transport = LoopbackTransport::new(&self.network.notary);
        self.dispatcher
            .send_pending(&self.context, &transport)
            .unwrap();
        transport.take_replies()
    }

    fn process(
        &self,
        guards: &mut Vec<ManagedNumbers>,
        reply: Reply,
    ) -> Result<ReplyOutcome, ReplyError> {
        self.dispatcher
            .process_reply(guards, &self.context, reply, None)
    }

    fn try_run(&self, spec: RequestSpec) -> Result<ReplyOutcome, ReplyError> {
        let mut guards = vec![self.build(spec)];
        let mut replies = self.exchange();
        assert_eq!(replies.len(), 1);
        let result = self.process(&mut guards, replies.remove(0));
        assert!(guards.is_empty() || result.is_err());
        result
    }

    fn run(&self, spec: RequestSpec) -> ReplyOutcome {
        let outcome = self.try_run(spec).unwrap();
        assert_eq!(outcome.status, RequestStatus::Accepted, "{outcome:?}");
        outcome
    }

    fn register(&self, account: &str, unit: &str) {
        self.run(
            RequestSpec::new(CommandType::RegisterAccount)
                .with_account(account)
                .with_unit(unit),
        );
    }

    fn numbers(&self, count: u32) {
        self.run(
            RequestSpec::new(CommandType::GetTransactionNumbers)
                .with_payload(Payload::NumberCount(count)),
        );
    }

    fn deposit(&self, account: &str, amount: i64) {
        self.run(deposit(account, amount));
    }

    fn transfer(&self, from: &str, to: &Client<'_>, to_account: &str, amount: i64) {
        self.run(
            RequestSpec::new(CommandType::NotarizeTransaction)
                .with_account(from)
                .with_amount(Decimal::from(amount))
                .with_counterparty(to.identity().clone(), to_account),
        );
    }

    fn refresh(&self, account: &str) {
        self.run(RequestSpec::new(CommandType::GetAccountData).with_account(account));
    }

    /// Refreshes the account, then accepts everything in its inbox.
    fn accept(&self, account: &str) -> Vec<TransactionNumber> {
        self.refresh(account);
        let waiting = self.inbox(account);
        if !waiting.is_empty() {
            self.run(process_inbox(account, waiting.clone()));
        }
        waiting
    }

    fn inbox(&self, account: &str) -> Vec<TransactionNumber> {
        self.context
            .inbox(&AccountId::new(account))
            .map(|inbox| inbox.numbers())
            .unwrap_or_default()
    }

    fn balance(&self, account: &str) -> Decimal {
        self.dispatcher
            .wallet()
            .get_or_load_account(self.identity(), &AccountId::new(account), self.context.server())
            .unwrap()
            .balance()
    }
}

fn deposit(account: &str, amount: i64) -> RequestSpec {
    RequestSpec::new(CommandType::Deposit)
        .with_account(account)
        .with_amount(Decimal::from(amount))
        .with_payload(Payload::Cash { tokens: Vec::new() })
}

fn process_inbox(account: &str, accept: Vec<TransactionNumber>) -> RequestSpec {
    RequestSpec::new(CommandType::ProcessInbox)
        .with_account(account)
        .with_payload(Payload::Process {
            accept,
            reject: Vec::new(),
        })
}

fn withdrawal(account: &str, amount: i64) -> RequestSpec {
    RequestSpec::new(CommandType::Withdrawal)
        .with_account(account)
        .with_amount(Decimal::from(amount))
        .with_blinding(b"blinding factors".to_vec())
        .with_payload(Payload::Withdrawal {
            blinded: b"prototokens".to_vec(),
        })
}

/// Incoming transfer signed by `sender`, as it sits in the recipient's
/// inbox before the notary countersigns it.
fn signed_transfer(
    sender: &Ed25519Crypto,
    number: TransactionNumber,
    amount: i64,
    to_account: &str,
) -> LedgerItem {
    let mut item = LedgerItem {
        account: Some(AccountId::new(to_account)),
        counterparty: Some(IdentityId::new("alice")),
        counterparty_account: Some(AccountId::new("alice-usd")),
        ..LedgerItem::new(number, ItemKind::Transfer, Decimal::from(amount))
    };
    item.originator = Some(Originator {
        identity: IdentityId::new("alice"),
        key: sender.public_key(),
        signature: sender.sign(&item.body_bytes()),
    });
    item
}

/// Builds, sends and applies one request through `notary`.
fn round_trip(
    dispatcher: &Dispatcher,
    context: &Arc<ServerContext>,
    notary: &Mutex<LoopbackNotary>,
    spec: RequestSpec,
) -> ReplyOutcome {
    let mut guards = vec![dispatcher.build_request(context, spec).unwrap()];
    let transport = LoopbackTransport::new(notary);
    dispatcher.send_pending(context, &transport).unwrap();
    let reply = transport.take_replies().remove(0);
    let outcome = dispatcher
        .process_reply(&mut guards, context, reply, None)
        .unwrap();
    assert_eq!(outcome.status, RequestStatus::Accepted, "{outcome:?}");
    outcome
}

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<Request>>,
}

impl Transport for Recorder {
    fn send(&self, request: &Request) -> Result<(), TransportError> {
        self.sent.lock().push(request.clone());
        Ok(())
    }
}

#[test]
fn abandoned_request_returns_its_numbers() {
    let net = Network::new();
    let alice = net.client("alice");
    alice.register("alice-usd", "usd");
    alice.context.merge_issued([5, 6, 7]);

    let guard = alice.build(
        RequestSpec::new(CommandType::PaymentPlan)
            .with_account("alice-usd")
            .with_payload(Payload::Cron {
                terms: "pay 5 monthly".to_owned(),
            }),
    );
    assert_eq!(guard.numbers(), &[5, 6]);
    assert_eq!(alice.context.available_numbers().into_iter().collect::<Vec<_>>(), vec![7]);

    let request_number = alice.context.pending_requests()[0].request_number;
    alice
        .dispatcher
        .mark_timed_out(&alice.context, request_number)
        .unwrap();
    let returned = alice.dispatcher.abandon(guard);

    assert_eq!(returned, vec![5, 6]);
    assert_eq!(
        alice.context.available_numbers().into_iter().collect::<Vec<_>>(),
        vec![5, 6, 7]
    );
    assert!(alice.context.consumed_numbers().is_empty());
    assert!(alice.context.pending_requests().is_empty());
}

#[test]
fn dropped_guard_abandons_its_request() {
    let net = Network::new();
    let alice = net.client("alice");
    alice.register("alice-usd", "usd");
    alice.numbers(3);
    let before = alice.context.available_numbers();

    {
        let _guard = alice.build(deposit("alice-usd", 10));
        assert_eq!(alice.context.pending_requests().len(), 1);
        assert_eq!(alice.context.available_numbers().len(), before.len() - 1);
    }

    assert!(alice.context.pending_requests().is_empty());
    assert_eq!(alice.context.available_numbers(), before);
}

#[test]
fn replayed_number_grant_is_ignored() {
    let net = Network::new();
    let alice = net.client("alice");
    alice.context.merge_issued([5, 6, 7]);
    let summary = alice.context.merge_issued([6, 7, 8, 9]);
    assert_eq!(summary.added, vec![8, 9]);
    assert_eq!(summary.duplicates, vec![6, 7]);

    let mut guards = vec![alice.build(
        RequestSpec::new(CommandType::GetTransactionNumbers).with_payload(Payload::NumberCount(2)),
    )];
    let reply = alice.exchange().remove(0);
    let outcome = alice.process(&mut guards, reply.clone()).unwrap();
    assert_eq!(outcome.items_applied, 2);
    let after_first = alice.context.available_numbers();
    assert_eq!(after_first.len(), 7);

    let err = alice.process(&mut guards, reply).unwrap_err();
    assert!(matches!(err, ReplyError::Replay { .. }), "{err:?}");
    assert!(err.is_benign());
    assert_eq!(alice.context.available_numbers(), after_first);
}

#[test]
fn transfer_is_credited_once_even_if_delivered_twice() {
    let net = Network::new();
    let bob = net.client("bob");
    let sender = Ed25519Crypto::from_seed([1; 32]);
    bob.register("bob-usd", "usd");
    bob.numbers(5);

    let item = signed_transfer(&sender, 42, 100, "bob-usd");
    net.notary
        .lock()
        .deliver(bob.identity(), &AccountId::new("bob-usd"), item.clone());
    bob.refresh("bob-usd");
    assert_eq!(bob.inbox("bob-usd"), vec![42]);

    let mut guards = vec![bob.build(process_inbox("bob-usd", vec![42]))];
    let reply = bob.exchange().remove(0);
    let outcome = bob.process(&mut guards, reply.clone()).unwrap();
    assert_eq!(outcome.items_applied, 1);
    assert!(!outcome.resync_required);
    assert_eq!(bob.balance("bob-usd"), Decimal::from(100));
    assert!(bob.inbox("bob-usd").is_empty());

    // the same reply again
    let err = bob.process(&mut guards, reply).unwrap_err();
    assert!(matches!(err, ReplyError::Replay { .. }), "{err:?}");
    assert_eq!(bob.balance("bob-usd"), Decimal::from(100));

    // the same item delivered a second time
    net.notary
        .lock()
        .deliver(bob.identity(), &AccountId::new("bob-usd"), item);
    let accepted = bob.accept("bob-usd");
    assert_eq!(accepted, vec![42]);
    assert_eq!(bob.balance("bob-usd"), Decimal::from(100));
    assert_eq!(net.events(WorkflowEventKind::IncomingTransfer), 1);
}

#[test]
fn reply_with_bad_signature_changes_nothing() {
    let net = Network::new();
    let alice = net.client("alice");
    alice.register("alice-usd", "usd");
    alice.numbers(3);

    let mut guards = vec![alice.build(deposit("alice-usd", 50))];
    let genuine = alice.exchange().remove(0);
    let mut forged = genuine.clone();
    forged.sign(&Ed25519Crypto::from_seed([66; 32])).unwrap();

    let err = alice.process(&mut guards, forged).unwrap_err();
    assert!(
        matches!(err, ReplyError::Validation(ValidationError::BadSignature { .. })),
        "{err:?}"
    );
    assert_eq!(guards.len(), 1);
    assert!(alice.context.consumed_numbers().is_empty());
    assert_eq!(alice.balance("alice-usd"), Decimal::ZERO);
    assert_eq!(alice.context.pending_requests().len(), 1);

    let outcome = alice.process(&mut guards, genuine).unwrap();
    assert_eq!(outcome.status, RequestStatus::Accepted);
    assert!(guards.is_empty());
    assert_eq!(alice.context.consumed_numbers().len(), 1);
    assert_eq!(alice.balance("alice-usd"), Decimal::from(50));
}

#[test]
fn refused_request_returns_numbers() {
    let net = Network::new();
    let alice = net.client("alice");
    let bob = net.client("bob");
    bob.register("bob-usd", "usd");
    alice.register("alice-usd", "usd");
    alice.numbers(3);
    let before = alice.context.available_numbers();

    let outcome = alice
        .try_run(
            RequestSpec::new(CommandType::NotarizeTransaction)
                .with_account("alice-usd")
                .with_amount(Decimal::from(500))
                .with_counterparty(bob.identity().clone(), "bob-usd"),
        )
        .unwrap();

    assert_eq!(outcome.status, RequestStatus::Rejected);
    assert_eq!(alice.context.available_numbers(), before);
    assert!(alice.context.pending_requests().is_empty());
}

#[test]
fn nymbox_change_blocks_numbers_until_synchronized() {
    let net = Network::new();
    let alice = net.client("alice");
    alice.register("alice-usd", "usd");
    alice.numbers(3);
    net.notary.lock().grant_via_nymbox(alice.identity(), 2);

    let outcome = alice.run(RequestSpec::new(CommandType::GetAccountData).with_account("alice-usd"));
    assert!(outcome.resync_required);
    assert!(alice.context.requires_resync());

    let err = alice
        .dispatcher
        .build_request(&alice.context, deposit("alice-usd", 10))
        .unwrap_err();
    assert!(
        matches!(err, BuildError::Precondition(PreconditionError::ResyncRequired)),
        "{err:?}"
    );
    let err = alice
        .dispatcher
        .build_request(&alice.context, RequestSpec::new(CommandType::GetTransactionNumbers))
        .unwrap_err();
    assert!(matches!(err, BuildError::Precondition(PreconditionError::ResyncRequired)));

    alice.run(RequestSpec::new(CommandType::GetNymbox));
    assert!(!alice.context.requires_resync());
    let notices = alice.context.nymbox().numbers();
    assert_eq!(notices.len(), 1);

    let outcome = alice.run(RequestSpec::new(CommandType::ProcessNymbox).with_payload(
        Payload::Process {
            accept: notices,
            reject: Vec::new(),
        },
    ));
    assert!(!outcome.resync_required);
    assert!(alice.context.nymbox().is_empty());
    assert_eq!(alice.context.available_numbers().len(), 5);

    alice.deposit("alice-usd", 10);
    assert_eq!(alice.balance("alice-usd"), Decimal::from(10));
}

#[test]
fn nymbox_contradicting_its_hash_is_a_desync() {
    let net = Network::new();
    let alice = net.client("alice");
    net.notary.lock().grant_via_nymbox(alice.identity(), 2);

    let mut guards = vec![alice.build(RequestSpec::new(CommandType::GetNymbox))];
    let mut reply = alice.exchange().remove(0);
    reply.nymbox_hash = Digest::of(b"something else");
    let reply = net.notary.lock().sign_reply(reply);

    let err = alice.process(&mut guards, reply.clone()).unwrap_err();
    assert!(
        matches!(err, ReplyError::Desync { kind: LedgerKind::Nymbox, .. }),
        "{err:?}"
    );
    assert!(guards.is_empty());
    assert!(alice.context.requires_resync());
    assert!(alice.context.nymbox().is_empty());
    assert!(alice.context.pending_requests().is_empty());

    let err = alice.process(&mut guards, reply).unwrap_err();
    assert!(matches!(err, ReplyError::Replay { .. }));

    // a clean fetch recovers
    alice.run(RequestSpec::new(CommandType::GetNymbox));
    assert!(!alice.context.requires_resync());
    assert_eq!(alice.context.nymbox().len(), 1);
}

#[test]
fn resent_request_keeps_numbers_and_accepts_either_reply() {
    let net = Network::new();
    let alice = net.client("alice");
    alice.register("alice-usd", "usd");
    alice.numbers(3);

    let guard = alice.build(deposit("alice-usd", 25));
    let lost = Recorder::default();
    assert_eq!(alice.dispatcher.send_pending(&alice.context, &lost).unwrap(), 1);
    let original = lost.sent.lock()[0].clone();

    let err = alice
        .dispatcher
        .resend(&alice.context, original.request_number)
        .unwrap_err();
    assert!(
        matches!(err, QueueError::NotTimedOut { state: RequestState::Sent, .. }),
        "{err:?}"
    );

    alice
        .dispatcher
        .mark_timed_out(&alice.context, original.request_number)
        .unwrap();
    let resent = alice
        .dispatcher
        .resend(&alice.context, original.request_number)
        .unwrap();
    assert!(resent.request_number > original.request_number);
    assert_eq!(resent.numbers, original.numbers);
    assert_eq!(guard.numbers(), resent.numbers.as_slice());

    // the notary answers the first transmission after all
    let late = net.notary.lock().handle(&original);
    let mut guards = vec![guard];
    let outcome = alice.process(&mut guards, late).unwrap();
    assert_eq!(outcome.status, RequestStatus::Accepted);
    assert!(guards.is_empty());
    assert_eq!(alice.balance("alice-usd"), Decimal::from(25));

    let duplicate = net.notary.lock().handle(&resent);
    let err = alice.process(&mut guards, duplicate).unwrap_err();
    assert!(matches!(err, ReplyError::Replay { .. }), "{err:?}");
    assert_eq!(alice.balance("alice-usd"), Decimal::from(25));
    assert!(alice.context.pending_requests().is_empty());
}

#[test]
fn withdrawal_holds_the_slot_until_answered() {
    let net = Network::new();
    let alice = net.client("alice");
    alice.register("alice-usd", "usd");
    alice.numbers(5);
    alice.deposit("alice-usd", 100);

    let mut guards = vec![alice.build(withdrawal("alice-usd", 30))];
    let pending = alice.dispatcher.wallet().pending_withdrawal().unwrap();
    assert_eq!(pending.amount, Decimal::from(30));

    let err = alice
        .dispatcher
        .build_request(&alice.context, withdrawal("alice-usd", 5))
        .unwrap_err();
    assert!(
        matches!(
            err,
            BuildError::Precondition(PreconditionError::Wallet(WalletError::WithdrawalPending { .. }))
        ),
        "{err:?}"
    );

    let reply = alice.exchange().remove(0);
    let outcome = alice.process(&mut guards, reply).unwrap();
    assert_eq!(alice.balance("alice-usd"), Decimal::from(70));
    assert!(alice.dispatcher.wallet().pending_withdrawal().is_none());
    // receipt and purse
    assert_eq!(outcome.receipts.len(), 2);
    for key in &outcome.receipts {
        assert!(net.storage.load(key).is_ok());
    }
    assert_eq!(net.events(WorkflowEventKind::Withdrawal), 1);
}

#[test]
fn abandoned_withdrawal_frees_the_slot() {
    let net = Network::new();
    let alice = net.client("alice");
    alice.register("alice-usd", "usd");
    alice.numbers(5);

    let guard = alice.build(withdrawal("alice-usd", 30));
    assert!(alice.dispatcher.wallet().pending_withdrawal().is_some());
    let returned = alice.dispatcher.abandon(guard);

    assert_eq!(returned.len(), 1);
    assert!(alice.dispatcher.wallet().pending_withdrawal().is_none());
    assert!(alice.context.pending_requests().is_empty());
    drop(alice.build(withdrawal("alice-usd", 5)));
}

#[test]
fn withdrawal_slot_belongs_to_its_context() {
    let net = Network::new();
    let alice = net.client("alice");
    let bob = net.client("bob");
    alice.register("alice-usd", "usd");
    alice.numbers(5);
    alice.deposit("alice-usd", 100);
    bob.register("bob-usd", "usd");
    bob.numbers(5);
    bob.refresh("bob-usd");

    let mut alice_guards = vec![alice.build(withdrawal("alice-usd", 30))];
    let pending = net.wallet.pending_withdrawal().unwrap();
    assert_eq!(pending.identity, *alice.identity());

    // request numbers restart per context, bob's next one equals alice's
    let mut bob_guards = vec![bob.build(RequestSpec::new(CommandType::GetNymbox))];
    assert_eq!(
        bob.context.pending_requests()[0].request_number,
        pending.request_number
    );
    let reply = bob.exchange().remove(0);
    bob.process(&mut bob_guards, reply).unwrap();
    assert_eq!(net.wallet.pending_withdrawal(), Some(pending.clone()));

    let err = bob
        .dispatcher
        .build_request(&bob.context, withdrawal("bob-usd", 1))
        .unwrap_err();
    assert!(
        matches!(
            err,
            BuildError::Precondition(PreconditionError::Wallet(WalletError::WithdrawalPending { .. }))
        ),
        "{err:?}"
    );
    assert_eq!(net.wallet.pending_withdrawal(), Some(pending));

    let reply = alice.exchange().remove(0);
    alice.process(&mut alice_guards, reply).unwrap();
    assert_eq!(alice.balance("alice-usd"), Decimal::from(70));
    assert!(net.wallet.pending_withdrawal().is_none());
    assert!(alice.context.pending_requests().is_empty());
}

#[test]
fn one_dispatcher_serves_two_notaries() {
    let storage = Arc::new(Storage::in_memory());
    let wallet = Arc::new(Wallet::new(storage.clone()));
    let crypto: Arc<dyn Crypto> = Arc::new(Ed25519Crypto::from_seed([3; 32]));
    let dispatcher = Dispatcher::new(
        crypto.clone(),
        wallet.clone(),
        storage,
        Arc::new(InMemoryWorkflow::default()),
        ClientConfig::default(),
    );
    let notaries = [
        Mutex::new(LoopbackNotary::new("east", [7; 32])),
        Mutex::new(LoopbackNotary::new("west", [8; 32])),
    ];
    let contexts: Vec<_> = notaries
        .iter()
        .map(|notary| {
            let mut notary = notary.lock();
            notary.register_identity(IdentityId::new("alice"), crypto.clone());
            ServerContext::new(IdentityId::new("alice"), notary.id().clone(), notary.public_key())
        })
        .collect();
    let accounts = ["east-usd", "west-usd"];
    let balance = |context: &ServerContext, account: &str| {
        wallet
            .get_or_load_account(context.identity(), &AccountId::new(account), context.server())
            .unwrap()
            .balance()
    };

    std::thread::scope(|scope| {
        for ((context, notary), account) in contexts.iter().zip(&notaries).zip(accounts) {
            let dispatcher = &dispatcher;
            scope.spawn(move || {
                round_trip(
                    dispatcher,
                    context,
                    notary,
                    RequestSpec::new(CommandType::RegisterAccount)
                        .with_account(account)
                        .with_unit("usd"),
                );
                round_trip(
                    dispatcher,
                    context,
                    notary,
                    RequestSpec::new(CommandType::GetTransactionNumbers)
                        .with_payload(Payload::NumberCount(4)),
                );
                for _ in 0..3 {
                    round_trip(dispatcher, context, notary, deposit(account, 10));
                }
            });
        }
    });
    for (context, account) in contexts.iter().zip(accounts) {
        assert_eq!(balance(context, account), Decimal::from(30));
        assert_eq!(context.consumed_numbers().len(), 3);
        assert!(context.pending_requests().is_empty());
    }
    // both notaries issued the same numbers, each context keeps its own
    assert_eq!(contexts[0].available_numbers(), contexts[1].available_numbers());

    let mut guards = vec![
        dispatcher
            .build_request(&contexts[0], deposit("east-usd", 5))
            .unwrap(),
        dispatcher
            .build_request(&contexts[1], deposit("west-usd", 7))
            .unwrap(),
    ];
    assert_eq!(guards[0].id(), guards[1].id());
    let east = LoopbackTransport::new(&notaries[0]);
    let west = LoopbackTransport::new(&notaries[1]);
    dispatcher.send_pending(&contexts[0], &east).unwrap();
    dispatcher.send_pending(&contexts[1], &west).unwrap();
    let east_reply = east.take_replies().remove(0);
    let west_reply = west.take_replies().remove(0);
    assert_eq!(east_reply.request_number, west_reply.request_number);

    let err = dispatcher
        .process_reply(&mut guards, &contexts[0], west_reply.clone(), None)
        .unwrap_err();
    assert!(
        matches!(err, ReplyError::Validation(ValidationError::WrongContext { .. })),
        "{err:?}"
    );
    assert_eq!(guards.len(), 2);

    dispatcher
        .process_reply(&mut guards, &contexts[1], west_reply, None)
        .unwrap();
    assert_eq!(guards.len(), 1);
    assert!(guards[0].is_for(&contexts[0]));
    assert_eq!(contexts[0].pending_requests().len(), 1);

    dispatcher
        .process_reply(&mut guards, &contexts[0], east_reply, None)
        .unwrap();
    assert!(guards.is_empty());
    assert_eq!(balance(&contexts[0], "east-usd"), Decimal::from(35));
    assert_eq!(balance(&contexts[1], "west-usd"), Decimal::from(37));
    for context in &contexts {
        assert_eq!(context.consumed_numbers().len(), 4);
    }
}

#[test]
fn answered_request_numbers_are_pruned_behind_the_oldest_outstanding() {
    let net = Network::new();
    let alice = net.client("alice");
    alice.register("alice-usd", "usd");
    alice.numbers(5);

    let mut held = vec![alice.build(deposit("alice-usd", 10))];
    let lost = Recorder::default();
    alice.dispatcher.send_pending(&alice.context, &lost).unwrap();
    let held_request = lost.sent.lock()[0].clone();

    let mut answered = Vec::new();
    for _ in 0..3 {
        let mut guards = vec![alice.build(RequestSpec::new(CommandType::GetNymbox))];
        let reply = alice.exchange().remove(0);
        alice.process(&mut guards, reply.clone()).unwrap();
        answered.push(reply);
    }
    // only the answers newer than the held request are remembered
    assert_eq!(alice.context.lock().applied_len(), 3);

    let reply = net.notary.lock().handle(&held_request);
    alice.process(&mut held, reply).unwrap();
    assert_eq!(alice.context.lock().applied_len(), 0);
    for reply in answered {
        let err = alice.process(&mut Vec::new(), reply).unwrap_err();
        assert!(matches!(err, ReplyError::Replay { .. }), "{err:?}");
    }
    assert_eq!(alice.balance("alice-usd"), Decimal::from(10));
}

#[test]
fn dividend_credits_local_shareholder_accounts() {
    let net = Network::new();
    let mint = net.client("mint");
    let alice = net.client("alice");
    let bob = net.client("bob");
    mint.register("mint-shr", "shr");
    alice.register("alice-usd", "usd");
    alice.register("alice-payouts", "usd");
    alice.register("alice-shr", "shr");
    bob.register("bob-usd", "usd");
    bob.register("bob-shr", "shr");
    for client in [&mint, &alice, &bob] {
        client.numbers(5);
    }

    mint.transfer("mint-shr", &bob, "bob-shr", 10);
    mint.transfer("mint-shr", &alice, "alice-shr", 5);
    bob.accept("bob-shr");
    alice.accept("alice-shr");
    alice.deposit("alice-usd", 100);

    let outcome = alice.run(
        RequestSpec::new(CommandType::PayDividend)
            .with_account("alice-usd")
            .with_payload(Payload::Dividend {
                share_unit: "shr".into(),
                per_share: Decimal::from(2),
            }),
    );

    // 2 per share on 15 shares, the payout to alice's own holding stays local
    assert_eq!(outcome.items_applied, 2);
    assert_eq!(alice.balance("alice-usd"), Decimal::from(70));
    assert_eq!(alice.balance("alice-payouts"), Decimal::from(10));
    assert_eq!(net.notary.lock().balance(&AccountId::new("bob-usd")), Some(Decimal::from(20)));
    assert_eq!(net.events(WorkflowEventKind::DividendPaid), 1);
    assert_eq!(net.events(WorkflowEventKind::DividendReceived), 1);

    bob.refresh("bob-usd");
    assert_eq!(bob.balance("bob-usd"), Decimal::from(20));
}

#[test]
fn cron_item_runs_its_trigger_clause() {
    let net = Network::new();
    let alice = net.client("alice");
    alice.register("alice-usd", "usd");
    alice.numbers(5);

    let outcome = alice.run(
        RequestSpec::new(CommandType::PaymentPlan)
            .with_account("alice-usd")
            .with_payload(Payload::Cron {
                terms: "pay 5 monthly, trigger on first payment".to_owned(),
            }),
    );
    assert_eq!(outcome.items_applied, 2);
    assert_eq!(alice.context.consumed_numbers().len(), 2);

    let cron_items = alice.context.cron_items();
    assert_eq!(cron_items.len(), 1);
    let (opening, item) = cron_items.into_iter().next().unwrap();
    assert_eq!(item.command, CommandType::PaymentPlan);
    assert_eq!(item.numbers.len(), 2);
    assert!(!item.awaiting_trigger);
    assert_eq!(net.events(WorkflowEventKind::CronActivated), 1);
    assert_eq!(net.events(WorkflowEventKind::ClauseTriggered), 1);

    alice.run(
        RequestSpec::new(CommandType::TriggerClause).with_payload(Payload::Clause {
            contract: opening,
            clause: "early-exit".to_owned(),
        }),
    );
    assert_eq!(net.events(WorkflowEventKind::ClauseTriggered), 2);
}

#[test]
fn unverifiable_item_is_left_in_the_inbox() {
    let net = Network::new();
    let bob = net.client("bob");
    let sender = Ed25519Crypto::from_seed([1; 32]);
    bob.register("bob-usd", "usd");
    bob.numbers(5);

    let good = signed_transfer(&sender, 42, 100, "bob-usd");
    let mut forged = signed_transfer(&sender, 43, 100, "bob-usd");
    forged.amount = Decimal::from(1000);
    {
        let mut notary = net.notary.lock();
        let account = AccountId::new("bob-usd");
        notary.deliver(bob.identity(), &account, good);
        notary.deliver(bob.identity(), &account, forged);
    }
    bob.refresh("bob-usd");
    assert_eq!(bob.inbox("bob-usd"), vec![42, 43]);
    let consumed_before = bob.context.consumed_numbers().len();

    let err = bob.try_run(process_inbox("bob-usd", vec![42, 43])).unwrap_err();
    match err {
        ReplyError::PartialApply {
            applied, failed, ..
        } => {
            assert_eq!(applied, 1);
            assert_eq!(failed, vec![43]);
        }
        err => panic!("expected a partial apply, got {err:?}"),
    }

    assert_eq!(bob.balance("bob-usd"), Decimal::from(100));
    assert_eq!(bob.inbox("bob-usd"), vec![43]);
    assert_eq!(bob.context.consumed_numbers().len(), consumed_before + 1);
    // the notary closed both, so the local inbox no longer matches
    assert!(bob.context.is_account_stale(&AccountId::new("bob-usd")));
    let err = bob
        .dispatcher
        .build_request(&bob.context, deposit("bob-usd", 1))
        .unwrap_err();
    assert!(
        matches!(err, BuildError::Precondition(PreconditionError::StaleAccount { .. })),
        "{err:?}"
    );

    bob.refresh("bob-usd");
    assert!(!bob.context.is_account_stale(&AccountId::new("bob-usd")));
}
