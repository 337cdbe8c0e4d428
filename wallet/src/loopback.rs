//! # In-process collaborators
//!
//! A toy chain, a message bus and a driver that wires wallets to both. Used
//! by the integration tests and the CLI demo; nothing here talks to a real
//! network.
//!
//! The bus encodes every bag to wire bytes and decodes it on delivery, so
//! anything that survives a simulation also survives the wire format.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::WalletConfig;
use crate::gateway::{ChainEvent, ChainGateway, PeerChannel};
use crate::keykeeper::PrivateKeyKeeper;
use crate::storage::WalletStorage;
use crate::transaction::parameters::{ParameterId, SetTxParameter, DEFAULT_SUB_TX_ID};
use crate::transaction::tx::Transaction;
use crate::transaction::types::{Height, KernelId, RegistrationStatus, TxId, WalletId};
use crate::transaction::verification::{verify_transaction, ValidationContext};
use crate::wallet::{Wallet, WalletResult};

// ---------------------------------------------------------------------------
// LocalChain
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Subscriber {
    inbox: VecDeque<ChainEvent>,
    watches: BTreeMap<TxId, KernelId>,
}

struct ChainState {
    height: Height,
    mempool: Vec<Transaction>,
    kernels: HashMap<KernelId, Height>,
    spent: HashSet<[u8; 32]>,
    subscribers: Vec<Subscriber>,
}

/// Single-node chain that mines on request.
pub struct LocalChain {
    state: Mutex<ChainState>,
}

impl LocalChain {
    pub fn new(height: Height) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChainState {
                height,
                mempool: Vec::new(),
                kernels: HashMap::new(),
                spent: HashSet::new(),
                subscribers: Vec::new(),
            }),
        })
    }

    /// A gateway with its own event inbox.
    pub fn connect(self: &Arc<Self>) -> Arc<LocalChainGateway> {
        let mut state = self.state.lock();
        state.subscribers.push(Subscriber::default());
        Arc::new(LocalChainGateway {
            chain: Arc::clone(self),
            index: state.subscribers.len() - 1,
        })
    }

    pub fn height(&self) -> Height {
        self.state.lock().height
    }

    pub fn mempool_len(&self) -> usize {
        self.state.lock().mempool.len()
    }

    pub fn kernel_height(&self, kernel_id: &KernelId) -> Option<Height> {
        self.state.lock().kernels.get(kernel_id).copied()
    }

    /// Mine one block holding every mempool transaction still valid at the
    /// new height. Returns the new height.
    pub fn mine_block(&self) -> Height {
        let mut state = self.state.lock();
        state.height += 1;
        let height = state.height;

        let mempool = std::mem::take(&mut state.mempool);
        let mut included = 0usize;
        for tx in mempool {
            if let Err(e) = verify_transaction(&tx, &ValidationContext::at_height(height)) {
                debug!(height, error = %e, "mempool transaction dropped");
                continue;
            }
            for kernel in &tx.kernels {
                state.kernels.insert(kernel.id(), height);
            }
            for input in &tx.inputs {
                state.spent.insert(input.commitment.to_bytes());
            }
            included += 1;
        }

        let ChainState {
            kernels, subscribers, ..
        } = &mut *state;
        for sub in subscribers.iter_mut() {
            let watches = std::mem::take(&mut sub.watches);
            for (tx_id, kernel_id) in watches {
                match kernels.get(&kernel_id) {
                    Some(&proof) => sub.inbox.push_back(ChainEvent::KernelProof { tx_id, height: proof }),
                    None => {
                        sub.inbox.push_back(ChainEvent::KernelUnconfirmed { tx_id, height });
                        sub.watches.insert(tx_id, kernel_id);
                    }
                }
            }
            sub.inbox.push_back(ChainEvent::NewTip { height });
        }
        info!(height, included, "block mined");
        height
    }

    fn register(&self, index: usize, tx_id: TxId, tx: &Transaction) {
        let mut state = self.state.lock();
        let status = Self::admit(&state, tx);
        if status == RegistrationStatus::Ok {
            state.mempool.push(tx.clone());
        }
        debug!(%tx_id, ?status, "transaction submitted");
        if let Some(sub) = state.subscribers.get_mut(index) {
            sub.inbox.push_back(ChainEvent::Registered { tx_id, status });
        }
    }

    fn admit(state: &ChainState, tx: &Transaction) -> RegistrationStatus {
        if verify_transaction(tx, &ValidationContext::at_height(state.height + 1)).is_err() {
            return RegistrationStatus::InvalidTransaction;
        }
        let pending_kernels: HashSet<KernelId> = state
            .mempool
            .iter()
            .flat_map(|t| t.kernels.iter().map(|k| k.id()))
            .collect();
        if tx
            .kernels
            .iter()
            .any(|k| state.kernels.contains_key(&k.id()) || pending_kernels.contains(&k.id()))
        {
            return RegistrationStatus::InvalidContext;
        }
        let pending_inputs: HashSet<[u8; 32]> = state
            .mempool
            .iter()
            .flat_map(|t| t.inputs.iter().map(|i| i.commitment.to_bytes()))
            .collect();
        if tx.inputs.iter().any(|i| {
            let key = i.commitment.to_bytes();
            state.spent.contains(&key) || pending_inputs.contains(&key)
        }) {
            return RegistrationStatus::Conflicting;
        }
        RegistrationStatus::Ok
    }

    fn watch(&self, index: usize, tx_id: TxId, kernel_id: KernelId) {
        let mut state = self.state.lock();
        let mined = state.kernels.get(&kernel_id).copied();
        if let Some(sub) = state.subscribers.get_mut(index) {
            match mined {
                Some(height) => sub.inbox.push_back(ChainEvent::KernelProof { tx_id, height }),
                None => {
                    sub.watches.insert(tx_id, kernel_id);
                }
            }
        }
    }
}

/// One wallet's view of a [`LocalChain`].
pub struct LocalChainGateway {
    chain: Arc<LocalChain>,
    index: usize,
}

impl LocalChainGateway {
    pub fn take_events(&self) -> Vec<ChainEvent> {
        let mut state = self.chain.state.lock();
        state
            .subscribers
            .get_mut(self.index)
            .map(|sub| sub.inbox.drain(..).collect())
            .unwrap_or_default()
    }
}

impl ChainGateway for LocalChainGateway {
    fn tip_height(&self) -> Height {
        self.chain.height()
    }

    fn register_tx(&self, tx_id: TxId, tx: &Transaction) {
        self.chain.register(self.index, tx_id, tx);
    }

    fn confirm_kernel(&self, tx_id: TxId, kernel_id: KernelId) {
        self.chain.watch(self.index, tx_id, kernel_id);
    }
}

// ---------------------------------------------------------------------------
// LocalNetwork
// ---------------------------------------------------------------------------

#[derive(Default)]
struct NetworkState {
    queue: VecDeque<(WalletId, Vec<u8>)>,
    sent: usize,
    rejecting: bool,
    dropped: HashSet<ParameterId>,
    overrides: HashMap<ParameterId, Vec<u8>>,
}

/// Message bus between wallets of one process.
#[derive(Default)]
pub struct LocalNetwork {
    state: Mutex<NetworkState>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every send fail, as a dead transport would.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.state.lock().rejecting = rejecting;
    }

    /// Strip `id` from every bag from now on.
    pub fn drop_parameter(&self, id: ParameterId) {
        self.state.lock().dropped.insert(id);
    }

    /// Replace the value of `id` in every bag that carries it.
    pub fn override_parameter(&self, id: ParameterId, bytes: Vec<u8>) {
        self.state.lock().overrides.insert(id, bytes);
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().sent
    }

    /// Queued messages, decoded. Undecodable ones are logged and dropped.
    pub fn take_messages(&self) -> Vec<(WalletId, SetTxParameter)> {
        let queued: Vec<_> = self.state.lock().queue.drain(..).collect();
        queued
            .into_iter()
            .filter_map(|(to, bytes)| match SetTxParameter::decode(&bytes) {
                Ok(msg) => Some((to, msg)),
                Err(e) => {
                    warn!(peer = %to, error = %e, "undecodable message dropped");
                    None
                }
            })
            .collect()
    }
}

impl PeerChannel for LocalNetwork {
    fn send_tx_params(&self, to: &WalletId, mut msg: SetTxParameter) -> bool {
        let mut state = self.state.lock();
        if state.rejecting {
            return false;
        }
        for id in &state.dropped {
            msg.params.remove(*id);
        }
        for (id, bytes) in &state.overrides {
            if msg.params.contains(*id) {
                if let Err(e) = msg.params.set_raw(*id, DEFAULT_SUB_TX_ID, bytes.clone()) {
                    warn!(%id, error = %e, "override not applied");
                }
            }
        }
        let encoded = match msg.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(peer = %to, error = %e, "unencodable message refused");
                return false;
            }
        };
        state.queue.push_back((*to, encoded));
        state.sent += 1;
        true
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// Rounds after which [`Simulation::run_until_idle`] gives up.
const MAX_ROUNDS: usize = 1_000;

/// How long one round waits for a threaded keeper.
const KEEPER_WAIT: Duration = Duration::from_secs(5);

struct Node {
    wallet: Wallet,
    gateway: Arc<LocalChainGateway>,
}

/// Several wallets, one chain, one bus.
pub struct Simulation {
    pub chain: Arc<LocalChain>,
    pub network: Arc<LocalNetwork>,
    nodes: Vec<Node>,
}

impl Simulation {
    pub fn new(start_height: Height) -> Self {
        Self {
            chain: LocalChain::new(start_height),
            network: LocalNetwork::new(),
            nodes: Vec::new(),
        }
    }

    /// Add a wallet; returns its index.
    pub fn add_wallet(
        &mut self,
        storage: Arc<dyn WalletStorage>,
        keeper: Arc<dyn PrivateKeyKeeper>,
        config: WalletConfig,
    ) -> WalletResult<usize> {
        let gateway = self.chain.connect();
        let peers: Arc<dyn PeerChannel> = self.network.clone();
        let wallet = Wallet::new(storage, keeper, gateway.clone(), peers, config)?;
        self.nodes.push(Node { wallet, gateway });
        Ok(self.nodes.len() - 1)
    }

    /// Drop wallet `index` and bring it back from its storage with `keeper`,
    /// as a process restart would. Replies of the old keeper are lost.
    pub fn restart_wallet(&mut self, index: usize, keeper: Arc<dyn PrivateKeyKeeper>) -> WalletResult<()> {
        let node = &mut self.nodes[index];
        let storage = Arc::clone(node.wallet.storage());
        let config = node.wallet.config().clone();
        let peers: Arc<dyn PeerChannel> = self.network.clone();
        node.wallet = Wallet::new(storage, keeper, node.gateway.clone(), peers, config)?;
        info!(index, "wallet restarted");
        Ok(())
    }

    /// # Panics
    ///
    /// If `index` was not returned by [`Simulation::add_wallet`].
    pub fn wallet(&self, index: usize) -> &Wallet {
        &self.nodes[index].wallet
    }

    /// # Panics
    ///
    /// If `index` was not returned by [`Simulation::add_wallet`].
    pub fn wallet_mut(&mut self, index: usize) -> &mut Wallet {
        &mut self.nodes[index].wallet
    }

    /// Drain the chain inbox of wallet `index` without delivering it, as a
    /// dropped node connection would.
    ///
    /// # Panics
    ///
    /// If `index` was not returned by [`Simulation::add_wallet`].
    pub fn take_chain_events(&self, index: usize) -> Vec<ChainEvent> {
        self.nodes[index].gateway.take_events()
    }

    /// Route keeper replies, chain events and peer messages until nothing
    /// moves. Returns the number of rounds that made progress.
    pub fn run_until_idle(&mut self) -> usize {
        let mut busy_rounds = 0;
        for _ in 0..MAX_ROUNDS {
            let mut progress = false;

            for node in &mut self.nodes {
                progress |= node.wallet.wait_keeper(KEEPER_WAIT) > 0;
                for event in node.gateway.take_events() {
                    node.wallet.on_chain_event(event);
                    progress = true;
                }
            }

            for (to, msg) in self.network.take_messages() {
                progress = true;
                let owner = self.nodes.iter_mut().find(|node| {
                    matches!(node.wallet.storage().find_address(&to), Ok(Some(address)) if address.is_own())
                });
                match owner {
                    Some(node) => {
                        if let Err(e) = node.wallet.on_tx_parameters(&to, msg) {
                            warn!(peer = %to, error = %e, "message rejected");
                        }
                    }
                    None => warn!(peer = %to, "message for an unknown address"),
                }
            }

            if !progress && !self.nodes.iter().any(|n| n.wallet.is_awaiting_keeper()) {
                return busy_rounds;
            }
            busy_rounds += 1;
        }
        warn!(rounds = MAX_ROUNDS, "simulation did not settle");
        busy_rounds
    }

    /// Mine `blocks` blocks, settling after each. Returns the new height.
    pub fn mine(&mut self, blocks: usize) -> Height {
        for _ in 0..blocks {
            self.chain.mine_block();
            self.run_until_idle();
        }
        self.chain.height()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyType;
    use crate::keykeeper::{KeyKeeperExt, LocalKeyKeeper};
    use crate::storage::WalletDb;
    use crate::transaction::kernel::KernelParameters;
    use crate::transaction::parameters::TxParameters;
    use crate::transaction::tx::Input;
    use crate::transaction::types::{Amount, CoinId, TxType};

    #[test]
    fn new_tip_reaches_every_gateway() {
        let chain = LocalChain::new(10);
        let (a, b) = (chain.connect(), chain.connect());
        assert_eq!(chain.mine_block(), 11);
        assert_eq!(a.take_events(), vec![ChainEvent::NewTip { height: 11 }]);
        assert_eq!(b.take_events(), vec![ChainEvent::NewTip { height: 11 }]);
        assert!(a.take_events().is_empty());
        assert_eq!(a.tip_height(), 11);
    }

    #[test]
    fn unconfirmed_kernel_is_reported_each_block() {
        let chain = LocalChain::new(10);
        let gateway = chain.connect();
        let tx_id = TxId::generate();
        gateway.confirm_kernel(tx_id, KernelId([1u8; 32]));
        chain.mine_block();
        let events = gateway.take_events();
        assert_eq!(events[0], ChainEvent::KernelUnconfirmed { tx_id, height: 11 });
        chain.mine_block();
        assert_eq!(gateway.take_events()[0], ChainEvent::KernelUnconfirmed { tx_id, height: 12 });
    }

    #[test]
    fn empty_transaction_is_rejected() {
        let chain = LocalChain::new(10);
        let gateway = chain.connect();
        let tx_id = TxId::generate();
        let tx = Transaction {
            inputs: Vec::new(),
            outputs: Vec::new(),
            kernels: Vec::new(),
            offset: curve25519_dalek::scalar::Scalar::ZERO,
        };
        gateway.register_tx(tx_id, &tx);
        assert_eq!(
            gateway.take_events(),
            vec![ChainEvent::Registered {
                tx_id,
                status: RegistrationStatus::InvalidTransaction
            }]
        );
        assert_eq!(chain.mempool_len(), 0);
    }

    /// Self-signed split of one coinbase coin, valid from height 10.
    fn split_tx(keeper: &LocalKeyKeeper, outputs: &[Amount], fee: Amount) -> Transaction {
        let input = CoinId::new(1, KeyType::Coinbase, 1_000);
        let outputs: Vec<_> = outputs
            .iter()
            .enumerate()
            .map(|(i, amount)| CoinId::new(i as u64 + 2, KeyType::Regular, *amount))
            .collect();
        let kernel = KernelParameters {
            fee,
            min_height: 10,
            max_height: 110,
            ..Default::default()
        };
        let signed = keeper.sign_split(vec![input], outputs.clone(), kernel).unwrap();
        let commitment = keeper.generate_public_keys(vec![input], true).unwrap()[0];
        let mut tx = Transaction {
            inputs: vec![Input { commitment }],
            outputs: keeper.generate_outputs(10, outputs).unwrap(),
            kernels: vec![signed.kernel],
            offset: signed.offset,
        };
        tx.normalize();
        tx
    }

    fn registered(gateway: &LocalChainGateway) -> Vec<RegistrationStatus> {
        gateway
            .take_events()
            .into_iter()
            .filter_map(|event| match event {
                ChainEvent::Registered { status, .. } => Some(status),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn duplicate_kernels_and_double_spends_are_refused() {
        let db = Arc::new(WalletDb::open_temporary().unwrap());
        let keeper = LocalKeyKeeper::from_seed(db, &[5u8; 32]).unwrap();
        let chain = LocalChain::new(10);
        let gateway = chain.connect();

        let tx = split_tx(&keeper, &[450, 450], 100);
        let kernel_id = tx.kernels[0].id();
        gateway.register_tx(TxId::generate(), &tx);
        gateway.register_tx(TxId::generate(), &tx);
        assert_eq!(
            registered(&gateway),
            vec![RegistrationStatus::Ok, RegistrationStatus::InvalidContext]
        );

        let rival = split_tx(&keeper, &[400, 400], 200);
        gateway.register_tx(TxId::generate(), &rival);
        assert_eq!(registered(&gateway), vec![RegistrationStatus::Conflicting]);
        assert_eq!(chain.mempool_len(), 1);

        assert_eq!(chain.mine_block(), 11);
        assert_eq!(chain.kernel_height(&kernel_id), Some(11));
        gateway.register_tx(TxId::generate(), &tx);
        assert_eq!(registered(&gateway), vec![RegistrationStatus::InvalidContext]);

        let tx_id = TxId::generate();
        gateway.confirm_kernel(tx_id, kernel_id);
        assert_eq!(gateway.take_events(), vec![ChainEvent::KernelProof { tx_id, height: 11 }]);
    }

    fn message() -> SetTxParameter {
        let mut params = TxParameters::new();
        params.set(ParameterId::AMOUNT, &500u64).unwrap();
        params.set(ParameterId::PEER_PROTO_VERSION, &2u32).unwrap();
        SetTxParameter {
            from: WalletId([1u8; 32]),
            tx_id: TxId::generate(),
            tx_type: TxType::Simple,
            params,
        }
    }

    #[test]
    fn network_delivers_through_the_wire_format() {
        let network = LocalNetwork::new();
        let msg = message();
        assert!(network.send_tx_params(&WalletId([2u8; 32]), msg.clone()));
        let delivered = network.take_messages();
        assert_eq!(delivered, vec![(WalletId([2u8; 32]), msg)]);
        assert_eq!(network.sent_count(), 1);
    }

    #[test]
    fn network_can_strip_and_reject() {
        let network = LocalNetwork::new();
        network.drop_parameter(ParameterId::PEER_PROTO_VERSION);
        network.send_tx_params(&WalletId([2u8; 32]), message());
        let (_, msg) = network.take_messages().remove(0);
        assert!(!msg.params.contains(ParameterId::PEER_PROTO_VERSION));
        assert!(msg.params.contains(ParameterId::AMOUNT));

        network.set_rejecting(true);
        assert!(!network.send_tx_params(&WalletId([2u8; 32]), message()));
        assert_eq!(network.sent_count(), 1);
    }
}
