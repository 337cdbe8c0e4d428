//! In-process key keeper holding the master seed in memory.
//!
//! Every coin blinding factor is derived on demand from the master KDF and
//! the coin's full id (amount and asset included), so two coins never share
//! a blinding factor even when their key indices collide.
//!
//! Sender nonces come from the persisted [`NoncePool`]; receiver, split and
//! asset-kernel nonces are derived deterministically from secret material
//! and everything the signature commits to.

use std::collections::BTreeMap;
use std::sync::Arc;

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn};

use super::nonce::NoncePool;
use super::{
    AssetKernelParameters, KeeperError, KeeperResult, Method, PrivateKeyKeeper, ReceiverSignature, Reply,
    SenderSignature, SignedKernel,
};
use crate::config::{NONCE_POOL_SIZE, SEED_LENGTH};
use crate::crypto::commitment::{blinding_generator, commit, prove_range, RangeProofScheme};
use crate::crypto::encryption::{open, password_key, seal};
use crate::crypto::hash::DomainHasher;
use crate::crypto::keys::{Kdf, KeyError, KeyId, KeyType};
use crate::crypto::schnorr::{challenge, sign_partial, Signature};
use crate::crypto::decompress;
use crate::storage::VariablesDb;
use crate::transaction::kernel::{kernel_message, AssetEmission, KernelParameters, TxKernel};
use crate::transaction::payment::payment_confirmation_message;
use crate::transaction::tx::Output;
use crate::transaction::types::{Amount, AssetId, CoinId, Height, KernelId, NATIVE_ASSET};

const VAR_NONCE_POOL: &str = "keykeeper.nonce_pool";
const VAR_SEALED_SEED: &str = "keykeeper.sealed_seed";
const VAR_SEED_SALT: &str = "keykeeper.seed_salt";

const NONCE_POOL_AAD: &[u8] = b"umbra.nonce-pool";
const SEED_AAD: &[u8] = b"umbra.master-seed";

pub struct LocalKeyKeeper {
    vars: Arc<dyn VariablesDb>,
    master: Kdf,
    sbbs: Arc<Kdf>,
    pool_key: [u8; 32],
    nonces: Mutex<NoncePool>,
}

impl LocalKeyKeeper {
    /// Keeper over a known seed. Loads the nonce pool if one was persisted.
    pub fn from_seed(vars: Arc<dyn VariablesDb>, seed: &[u8; SEED_LENGTH]) -> KeeperResult<Self> {
        let master = Kdf::from_seed(seed);
        let sbbs = Arc::new(master.named_child("sbbs"));
        let pool_key = master.derive_bytes("umbra.nonce-pool.key");

        let pool = match vars.get_var(VAR_NONCE_POOL).map_err(storage)? {
            Some(sealed) => {
                let plain = open(&pool_key, &sealed, NONCE_POOL_AAD)
                    .map_err(|e| KeeperError::State(format!("nonce pool: {e}")))?;
                let pool: NoncePool = bincode::deserialize(&plain).map_err(storage)?;
                pool.check()?;
                pool
            }
            None => NoncePool::new(NONCE_POOL_SIZE),
        };
        debug!(last_slot = pool.last_allocated(), "nonce pool loaded");

        Ok(Self {
            vars,
            master,
            sbbs,
            pool_key,
            nonces: Mutex::new(pool),
        })
    }

    /// Fresh wallet: draw a random seed and store it sealed under `password`.
    pub fn create(vars: Arc<dyn VariablesDb>, password: &[u8]) -> KeeperResult<Self> {
        if vars.get_var(VAR_SEALED_SEED).map_err(storage)?.is_some() {
            return Err(KeeperError::State("a master seed already exists".into()));
        }
        let mut seed = [0u8; SEED_LENGTH];
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut seed);
        OsRng.fill_bytes(&mut salt);

        let sealed = seal(&password_key(password, &salt), &seed, SEED_AAD)
            .map_err(|e| KeeperError::State(e.to_string()))?;
        vars.set_var(VAR_SEED_SALT, &salt).map_err(storage)?;
        vars.set_var(VAR_SEALED_SEED, &sealed).map_err(storage)?;
        info!("master seed created");

        Self::from_seed(vars, &seed)
    }

    pub fn has_seed(vars: &dyn VariablesDb) -> KeeperResult<bool> {
        Ok(vars.get_var(VAR_SEALED_SEED).map_err(storage)?.is_some())
    }

    /// Existing wallet: unseal the stored seed.
    pub fn open(vars: Arc<dyn VariablesDb>, password: &[u8]) -> KeeperResult<Self> {
        let missing = || KeeperError::State("no master seed stored".into());
        let salt = vars.get_var(VAR_SEED_SALT).map_err(storage)?.ok_or_else(missing)?;
        let sealed = vars.get_var(VAR_SEALED_SEED).map_err(storage)?.ok_or_else(missing)?;

        let plain = open(&password_key(password, &salt), &sealed, SEED_AAD)
            .map_err(|_| KeeperError::State("wrong password or corrupted seed".into()))?;
        let seed: [u8; SEED_LENGTH] = plain
            .as_slice()
            .try_into()
            .map_err(|_| KeeperError::State("stored seed has the wrong length".into()))?;

        Self::from_seed(vars, &seed)
    }

    fn save_pool(&self, pool: &NoncePool) -> KeeperResult<()> {
        let plain = bincode::serialize(pool).map_err(storage)?;
        let sealed = seal(&self.pool_key, &plain, NONCE_POOL_AAD).map_err(storage)?;
        self.vars.set_var(VAR_NONCE_POOL, &sealed).map_err(storage)
    }

    // -- key material ------------------------------------------------------

    fn coin_blinding(&self, id: &CoinId) -> KeeperResult<Scalar> {
        if !id.key_type.is_coin() {
            return Err(KeyError::NotACoinKey(id.key_type).into());
        }
        let base = self.master.derive_key(&id.key_id())?;
        Ok(DomainHasher::new("umbra.coin.blinding")
            .chain(base.as_bytes())
            .chain_u64(id.amount)
            .chain(&id.asset_id.to_le_bytes())
            .to_scalar())
    }

    /// `Σ r_in − Σ r_out`.
    fn blinding_excess(&self, inputs: &[CoinId], outputs: &[CoinId]) -> KeeperResult<Scalar> {
        let mut total = Scalar::ZERO;
        for id in inputs {
            total += self.coin_blinding(id)?;
        }
        for id in outputs {
            total -= self.coin_blinding(id)?;
        }
        Ok(total)
    }

    /// Deterministic scalar bound to secret material plus `parts`.
    fn derived_scalar(&self, context: &str, secret: &Scalar, parts: &[&[u8]]) -> Scalar {
        let mut h = DomainHasher::new(context)
            .chain(&self.master.derive_bytes(context))
            .chain(secret.as_bytes());
        for part in parts {
            h.update(part);
        }
        h.to_scalar()
    }

    fn sender_nonce(seed: &[u8; 32]) -> (Scalar, Scalar) {
        let nonce = DomainHasher::new("umbra.sender.nonce").chain(seed).to_scalar();
        let offset = DomainHasher::new("umbra.sender.offset").chain(seed).to_scalar();
        (nonce, offset)
    }

    // -- capabilities --------------------------------------------------------

    fn allocate_slot(&self) -> KeeperResult<u64> {
        let mut pool = self.nonces.lock();
        let mut next = pool.clone();
        let slot = next.allocate(&mut OsRng);
        self.save_pool(&next)?;
        *pool = next;
        debug!(slot, "nonce slot allocated");
        Ok(slot)
    }

    fn public_nonce(&self, slot: u64) -> KeeperResult<CompressedRistretto> {
        let seed = self.nonces.lock().seed(slot)?;
        let (nonce, _) = Self::sender_nonce(&seed);
        Ok((nonce * blinding_generator()).compress())
    }

    fn public_keys(&self, ids: &[CoinId], create_coin_key: bool) -> KeeperResult<Vec<CompressedRistretto>> {
        ids.iter()
            .map(|id| {
                let r = self.coin_blinding(id)?;
                let point = if create_coin_key {
                    commit(id.amount, &r, id.asset_id)
                } else {
                    r * blinding_generator()
                };
                Ok(point.compress())
            })
            .collect()
    }

    fn outputs(&self, scheme_height: Height, ids: &[CoinId]) -> KeeperResult<Vec<Output>> {
        let scheme = RangeProofScheme::for_height(scheme_height);
        ids.iter()
            .map(|id| {
                let r = self.coin_blinding(id)?;
                let (range_proof, commitment) = prove_range(id.amount, &r, id.asset_id, scheme)?;
                Ok(Output {
                    commitment,
                    range_proof,
                    scheme,
                    asset_id: id.asset_id,
                })
            })
            .collect()
    }

    fn sender_signature(
        &self,
        inputs: &[CoinId],
        outputs: &[CoinId],
        slot: u64,
        params: &KernelParameters,
        initial: bool,
    ) -> KeeperResult<SenderSignature> {
        let nets = net_values(inputs, outputs);
        if nets.values().any(|v| *v < 0) {
            return Err(KeeperError::InvalidArgument("sender cannot receive value".into()));
        }
        if nets.get(&NATIVE_ASSET).copied().unwrap_or(0) < i128::from(params.fee) {
            return Err(KeeperError::InvalidArgument("inputs do not cover the fee".into()));
        }

        let mut pool = self.nonces.lock();
        let seed = pool.seed(slot)?;
        let (nonce, offset) = Self::sender_nonce(&seed);
        let excess = self.blinding_excess(inputs, outputs)? - offset;
        let public_excess = (excess * blinding_generator()).compress();
        let public_nonce = (nonce * blinding_generator()).compress();

        if initial {
            return Ok(SenderSignature {
                public_excess,
                public_nonce,
                offset,
                partial_signature: None,
                kernel_id: None,
            });
        }

        let (peer_excess, peer_nonce) = peer_commitments(params)?;
        let total_excess = (excess * blinding_generator() + peer_excess).compress();
        let total_nonce = (nonce * blinding_generator() + peer_nonce).compress();
        let message = kernel_message(params.fee, params.min_height, params.max_height, &total_excess, None);
        let e = challenge(&total_nonce, &total_excess, &message);
        let partial = sign_partial(&excess, &nonce, &e);

        // The slot must be burned on disk before the signature leaves.
        let mut next = pool.clone();
        next.consume(slot)?;
        self.save_pool(&next)?;
        *pool = next;
        debug!(slot, "nonce slot consumed");

        Ok(SenderSignature {
            public_excess,
            public_nonce,
            offset,
            partial_signature: Some(partial),
            kernel_id: Some(KernelId(message)),
        })
    }

    fn receiver_signature(
        &self,
        inputs: &[CoinId],
        outputs: &[CoinId],
        params: &KernelParameters,
        wallet_id_key: Option<u64>,
    ) -> KeeperResult<ReceiverSignature> {
        let nets = net_values(inputs, outputs);
        if nets.values().any(|v| *v > 0) || !nets.values().any(|v| *v < 0) {
            return Err(KeeperError::InvalidArgument("receiver must receive a positive amount".into()));
        }
        let (peer_excess, peer_nonce) = peer_commitments(params)?;
        let peer_parts = [
            peer_excess.compress().to_bytes(),
            peer_nonce.compress().to_bytes(),
        ];

        let blinding = self.blinding_excess(inputs, outputs)?;
        let offset = self.derived_scalar(
            "umbra.receiver.offset",
            &blinding,
            &[peer_parts[0].as_slice(), peer_parts[1].as_slice()],
        );
        let excess = blinding - offset;
        let nonce = self.derived_scalar(
            "umbra.receiver.nonce",
            &excess,
            &[
                peer_parts[0].as_slice(),
                peer_parts[1].as_slice(),
                &params.fee.to_le_bytes()[..],
                &params.min_height.to_le_bytes()[..],
                &params.max_height.to_le_bytes()[..],
            ],
        );

        let public_excess = excess * blinding_generator();
        let public_nonce = nonce * blinding_generator();
        let total_excess = (public_excess + peer_excess).compress();
        let total_nonce = (public_nonce + peer_nonce).compress();
        let message = kernel_message(params.fee, params.min_height, params.max_height, &total_excess, None);
        let e = challenge(&total_nonce, &total_excess, &message);
        let kernel_id = KernelId(message);

        let payment_confirmation = match wallet_id_key {
            Some(idx) => {
                let sender = params
                    .peer_id
                    .ok_or_else(|| KeeperError::InvalidArgument("payment confirmation needs the sender id".into()))?;
                let (asset_id, amount) = received_value(&nets);
                let address_key = self.sbbs.derive_key(&KeyId::new(idx, KeyType::Bbs))?;
                let message = payment_confirmation_message(&kernel_id, amount, asset_id, &sender);
                let nonce = self.derived_scalar("umbra.payment.nonce", &address_key, &[message.as_slice()]);
                Some(Signature::sign(&address_key, &nonce, &message))
            }
            None => None,
        };

        Ok(ReceiverSignature {
            public_excess: public_excess.compress(),
            public_nonce: public_nonce.compress(),
            offset,
            partial_signature: sign_partial(&excess, &nonce, &e),
            kernel_id,
            payment_confirmation,
        })
    }

    fn split_kernel(&self, inputs: &[CoinId], outputs: &[CoinId], params: &KernelParameters) -> KeeperResult<SignedKernel> {
        let nets = net_values(inputs, outputs);
        let fee = i128::from(params.fee);
        let balanced = nets
            .iter()
            .all(|(asset, net)| if *asset == NATIVE_ASSET { *net == fee } else { *net == 0 });
        if !balanced || (fee > 0 && !nets.contains_key(&NATIVE_ASSET)) {
            return Err(KeeperError::InvalidArgument("split must leave exactly the fee".into()));
        }

        let blinding = self.blinding_excess(inputs, outputs)?;
        let offset = self.derived_scalar("umbra.split.offset", &blinding, &[&params.min_height.to_le_bytes()[..]]);
        let excess = blinding - offset;
        let public_excess = (excess * blinding_generator()).compress();
        let message = kernel_message(params.fee, params.min_height, params.max_height, &public_excess, None);
        let nonce = self.derived_scalar("umbra.split.nonce", &excess, &[message.as_slice()]);

        Ok(SignedKernel {
            kernel: TxKernel {
                excess: public_excess,
                fee: params.fee,
                min_height: params.min_height,
                max_height: params.max_height,
                signature: Signature::sign(&excess, &nonce, &message),
                asset_emission: None,
            },
            offset,
        })
    }

    fn owner_key(&self, owner_idx: u64) -> KeeperResult<Scalar> {
        Ok(self.master.derive_key(&KeyId::new(owner_idx, KeyType::AssetOwner))?)
    }

    fn asset_kernel(
        &self,
        inputs: &[CoinId],
        outputs: &[CoinId],
        fee: Amount,
        owner_idx: u64,
        params: &AssetKernelParameters,
    ) -> KeeperResult<SignedKernel> {
        if params.asset_id == NATIVE_ASSET {
            return Err(KeeperError::InvalidArgument("the native asset cannot be emitted".into()));
        }
        let nets = net_values(inputs, outputs);
        let fee = i128::from(fee);
        let emission = i128::from(params.emission);
        let matches = nets.iter().all(|(asset, net)| match *asset {
            NATIVE_ASSET => *net == fee,
            a if a == params.asset_id => *net == -emission,
            _ => *net == 0,
        });
        let covered = (fee == 0 || nets.contains_key(&NATIVE_ASSET))
            && (emission == 0 || nets.contains_key(&params.asset_id));
        if !matches || !covered {
            return Err(KeeperError::InvalidArgument("coins do not match the emission".into()));
        }

        let owner_key = self.owner_key(owner_idx)?;
        let blinding = self.blinding_excess(inputs, outputs)?;
        let offset = self.derived_scalar("umbra.asset.offset", &blinding, &[&params.asset_id.to_le_bytes()[..]]);
        let excess = blinding - offset;
        let public_excess = (excess * blinding_generator()).compress();
        let asset_emission = AssetEmission {
            asset_id: params.asset_id,
            owner: (owner_key * blinding_generator()).compress(),
            value: params.emission,
        };
        let fee = fee as Amount;
        let message = kernel_message(
            fee,
            params.min_height,
            params.max_height,
            &public_excess,
            Some(&asset_emission),
        );
        let signing_key = excess + owner_key;
        let nonce = self.derived_scalar("umbra.asset.nonce", &signing_key, &[message.as_slice()]);

        Ok(SignedKernel {
            kernel: TxKernel {
                excess: public_excess,
                fee,
                min_height: params.min_height,
                max_height: params.max_height,
                signature: Signature::sign(&signing_key, &nonce, &message),
                asset_emission: Some(asset_emission),
            },
            offset,
        })
    }
}

impl PrivateKeyKeeper for LocalKeyKeeper {
    fn invoke_sync(&self, method: Method) -> KeeperResult<Reply> {
        let name = method.name();
        let result = match method {
            Method::AllocateNonceSlot => self.allocate_slot().map(Reply::NonceSlot),
            Method::GenerateNonce { slot } => self.public_nonce(slot).map(Reply::Nonce),
            Method::GeneratePublicKeys { ids, create_coin_key } => {
                self.public_keys(&ids, create_coin_key).map(Reply::PublicKeys)
            }
            Method::GenerateOutputs { scheme_height, ids } => {
                self.outputs(scheme_height, &ids).map(Reply::Outputs)
            }
            Method::SignSender {
                inputs,
                outputs,
                nonce_slot,
                kernel,
                initial,
            } => self
                .sender_signature(&inputs, &outputs, nonce_slot, &kernel, initial)
                .map(Reply::Sender),
            Method::SignReceiver {
                inputs,
                outputs,
                kernel,
                wallet_id_key,
            } => self
                .receiver_signature(&inputs, &outputs, &kernel, wallet_id_key)
                .map(Reply::Receiver),
            Method::SignSplit { inputs, outputs, kernel } => {
                self.split_kernel(&inputs, &outputs, &kernel).map(Reply::Split)
            }
            Method::GetSbbsKdf => Ok(Reply::SbbsKdf(Arc::clone(&self.sbbs))),
            Method::GetAssetOwnerId { owner_idx } => self
                .owner_key(owner_idx)
                .map(|k| Reply::AssetOwnerId((k * blinding_generator()).compress())),
            Method::SignAssetKernel {
                inputs,
                outputs,
                fee,
                owner_idx,
                params,
            } => self
                .asset_kernel(&inputs, &outputs, fee, owner_idx, &params)
                .map(Reply::AssetKernel),
        };
        if let Err(e) = &result {
            warn!(method = name, error = %e, "key keeper request failed");
        }
        result
    }
}

impl std::fmt::Debug for LocalKeyKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeyKeeper").finish_non_exhaustive()
    }
}

fn storage<E: std::fmt::Display>(e: E) -> KeeperError {
    KeeperError::Storage(e.to_string())
}

/// Value leaving per asset: `Σ in − Σ out`.
fn net_values(inputs: &[CoinId], outputs: &[CoinId]) -> BTreeMap<AssetId, i128> {
    let mut nets = BTreeMap::new();
    for id in inputs {
        *nets.entry(id.asset_id).or_insert(0i128) += i128::from(id.amount);
    }
    for id in outputs {
        *nets.entry(id.asset_id).or_insert(0i128) -= i128::from(id.amount);
    }
    nets
}

/// The asset a receiver is paid in: the non-native one if any.
fn received_value(nets: &BTreeMap<AssetId, i128>) -> (AssetId, Amount) {
    nets.iter()
        .filter(|(_, net)| **net < 0)
        .max_by_key(|(asset, _)| **asset != NATIVE_ASSET)
        .map(|(asset, net)| (*asset, u64::try_from(-*net).unwrap_or(u64::MAX)))
        .unwrap_or((NATIVE_ASSET, 0))
}

fn peer_commitments(params: &KernelParameters) -> KeeperResult<(RistrettoPoint, RistrettoPoint)> {
    match (&params.peer_public_excess, &params.peer_public_nonce) {
        (Some(excess), Some(nonce)) => Ok((decompress(excess)?, decompress(nonce)?)),
        _ => Err(KeeperError::InvalidArgument("peer public excess and nonce are required".into())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::schnorr::verify_partial;
    use crate::keykeeper::KeyKeeperExt;
    use crate::storage::WalletDb;
    use crate::transaction::types::WalletId;

    fn db() -> Arc<WalletDb> {
        Arc::new(WalletDb::open_temporary().unwrap())
    }

    fn keeper(seed: u8) -> LocalKeyKeeper {
        LocalKeyKeeper::from_seed(db(), &[seed; SEED_LENGTH]).unwrap()
    }

    fn coin(idx: u64, amount: Amount) -> CoinId {
        CoinId::new(idx, KeyType::Regular, amount)
    }

    fn kernel_params(fee: Amount) -> KernelParameters {
        KernelParameters {
            fee,
            min_height: 10,
            max_height: 130,
            ..Default::default()
        }
    }

    #[test]
    fn public_keys_match_commitments() {
        let k = keeper(1);
        let id = coin(1, 500);
        let commitment = k.generate_public_keys(vec![id], true).unwrap();
        let outputs = k.generate_outputs(200, vec![id]).unwrap();
        assert_eq!(commitment[0], outputs[0].commitment);
        assert_eq!(outputs[0].scheme, RangeProofScheme::V2);
    }

    #[test]
    fn non_coin_key_is_invalid_argument() {
        let k = keeper(1);
        let id = CoinId::new(1, KeyType::Bbs, 10);
        assert!(matches!(
            k.generate_public_keys(vec![id], false),
            Err(KeeperError::InvalidArgument(_))
        ));
    }

    #[test]
    fn two_party_signature_aggregates() {
        let sender = keeper(1);
        let receiver = keeper(2);
        let inputs = vec![coin(1, 1_000)];
        let change = vec![CoinId::new(2, KeyType::Change, 400)];
        let received = vec![coin(1, 500)];
        let slot = sender.allocate_nonce_slot().unwrap();

        let mut params = kernel_params(100);
        let initial = sender
            .sign_sender(inputs.clone(), change.clone(), slot, params.clone(), true)
            .unwrap();
        assert!(initial.partial_signature.is_none());
        assert_eq!(sender.generate_nonce(slot).unwrap(), initial.public_nonce);

        params.peer_public_excess = Some(initial.public_excess);
        params.peer_public_nonce = Some(initial.public_nonce);
        let theirs = receiver.sign_receiver(vec![], received, params.clone(), None).unwrap();

        params.peer_public_excess = Some(theirs.public_excess);
        params.peer_public_nonce = Some(theirs.public_nonce);
        let fin = sender.sign_sender(inputs, change, slot, params, false).unwrap();
        assert_eq!(fin.kernel_id, Some(theirs.kernel_id));
        assert_eq!(fin.public_excess, initial.public_excess);

        let total_excess =
            (decompress(&fin.public_excess).unwrap() + decompress(&theirs.public_excess).unwrap()).compress();
        let total_nonce =
            (decompress(&fin.public_nonce).unwrap() + decompress(&theirs.public_nonce).unwrap()).compress();
        let signature = Signature::aggregate(
            total_nonce,
            &[fin.partial_signature.unwrap(), theirs.partial_signature],
        );
        assert!(signature.verify(&total_excess, &theirs.kernel_id.0));

        let e = challenge(&total_nonce, &total_excess, &theirs.kernel_id.0);
        assert!(verify_partial(
            &theirs.partial_signature,
            &decompress(&theirs.public_nonce).unwrap(),
            &decompress(&theirs.public_excess).unwrap(),
            &e,
        ));
    }

    #[test]
    fn final_signature_consumes_the_slot() {
        let sender = keeper(1);
        let receiver = keeper(2);
        let slot = sender.allocate_nonce_slot().unwrap();
        let mut params = kernel_params(100);
        let initial = sender.sign_sender(vec![coin(1, 600)], vec![], slot, params.clone(), true).unwrap();
        params.peer_public_excess = Some(initial.public_excess);
        params.peer_public_nonce = Some(initial.public_nonce);
        let theirs = receiver.sign_receiver(vec![], vec![coin(1, 500)], params.clone(), None).unwrap();
        params.peer_public_excess = Some(theirs.public_excess);
        params.peer_public_nonce = Some(theirs.public_nonce);

        sender.sign_sender(vec![coin(1, 600)], vec![], slot, params.clone(), false).unwrap();
        let again = sender.sign_sender(vec![coin(1, 600)], vec![], slot, params, false);
        assert!(matches!(again, Err(KeeperError::State(_))));
    }

    #[test]
    fn sender_must_cover_fee() {
        let k = keeper(1);
        let slot = k.allocate_nonce_slot().unwrap();
        let result = k.sign_sender(vec![coin(1, 50)], vec![], slot, kernel_params(100), true);
        assert!(matches!(result, Err(KeeperError::InvalidArgument(_))));
    }

    #[test]
    fn receiver_must_receive() {
        let k = keeper(1);
        let mut params = kernel_params(100);
        params.peer_public_excess = Some(blinding_generator().compress());
        params.peer_public_nonce = Some(blinding_generator().compress());
        let result = k.sign_receiver(vec![coin(1, 10)], vec![], params, None);
        assert!(matches!(result, Err(KeeperError::InvalidArgument(_))));
    }

    #[test]
    fn payment_confirmation_is_signed_by_the_address_key() {
        let k = keeper(3);
        let sender = WalletId([5u8; 32]);
        let mut params = kernel_params(100);
        params.peer_public_excess = Some(blinding_generator().compress());
        params.peer_public_nonce = Some(blinding_generator().compress());
        params.peer_id = Some(sender);
        let sig = k.sign_receiver(vec![], vec![coin(4, 700)], params, Some(9)).unwrap();

        let address = WalletId::from(k.sbbs_kdf().unwrap().derive_public(&KeyId::new(9, KeyType::Bbs)).unwrap());
        let message = payment_confirmation_message(&sig.kernel_id, 700, NATIVE_ASSET, &sender);
        assert!(sig.payment_confirmation.unwrap().verify(&address.public_key(), &message));
    }

    #[test]
    fn split_kernel_is_self_signed() {
        let k = keeper(1);
        let signed = k
            .sign_split(vec![coin(1, 1_000)], vec![coin(2, 450), coin(3, 450)], kernel_params(100))
            .unwrap();
        assert!(signed.kernel.verify_signature());

        let unbalanced = k.sign_split(vec![coin(1, 1_000)], vec![coin(2, 450)], kernel_params(100));
        assert!(matches!(unbalanced, Err(KeeperError::InvalidArgument(_))));
    }

    #[test]
    fn asset_kernel_verifies_under_owner_key() {
        let k = keeper(1);
        let params = AssetKernelParameters {
            asset_id: 7,
            emission: 1_000,
            min_height: 1,
            max_height: 100,
        };
        let minted = coin(2, 1_000).with_asset(7);
        let signed = k
            .sign_asset_kernel(vec![coin(1, 100)], vec![minted], 100, 3, params)
            .unwrap();
        assert!(signed.kernel.verify_signature());
        let owner = k.asset_owner_id(3).unwrap();
        assert_eq!(signed.kernel.asset_emission.unwrap().owner, owner);

        let mismatch = k.sign_asset_kernel(vec![coin(1, 100)], vec![coin(2, 999).with_asset(7)], 100, 3, params);
        assert!(matches!(mismatch, Err(KeeperError::InvalidArgument(_))));
    }

    #[test]
    fn nonce_pool_survives_reopen() {
        let vars = db();
        let slot = {
            let k = LocalKeyKeeper::from_seed(vars.clone(), &[1u8; SEED_LENGTH]).unwrap();
            k.allocate_nonce_slot().unwrap()
        };
        let k = LocalKeyKeeper::from_seed(vars, &[1u8; SEED_LENGTH]).unwrap();
        assert!(k.generate_nonce(slot).is_ok());
        assert_eq!(k.allocate_nonce_slot().unwrap(), slot + 1);
    }

    #[test]
    fn stored_pool_without_entries_is_refused() {
        let vars = db();
        let pool_key = {
            let k = LocalKeyKeeper::from_seed(vars.clone(), &[1u8; SEED_LENGTH]).unwrap();
            k.pool_key
        };
        let empty = bincode::serialize(&(4u64, Vec::<u8>::new())).unwrap();
        let sealed = seal(&pool_key, &empty, NONCE_POOL_AAD).unwrap();
        vars.set_var(VAR_NONCE_POOL, &sealed).unwrap();

        let reopened = LocalKeyKeeper::from_seed(vars, &[1u8; SEED_LENGTH]);
        assert!(matches!(reopened, Err(KeeperError::State(_))));
    }

    #[test]
    fn sealed_seed_requires_the_password() {
        let vars = db();
        assert!(!LocalKeyKeeper::has_seed(&*vars).unwrap());
        let created = LocalKeyKeeper::create(vars.clone(), b"hunter2").unwrap();
        let expected = created.generate_public_keys(vec![coin(1, 5)], false).unwrap();

        assert!(LocalKeyKeeper::has_seed(&*vars).unwrap());
        let reopened = LocalKeyKeeper::open(vars.clone(), b"hunter2").unwrap();
        assert_eq!(reopened.generate_public_keys(vec![coin(1, 5)], false).unwrap(), expected);

        assert!(matches!(LocalKeyKeeper::open(vars.clone(), b"wrong"), Err(KeeperError::State(_))));
        assert!(LocalKeyKeeper::create(vars, b"hunter2").is_err());
    }
}
