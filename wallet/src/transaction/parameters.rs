//! # Transaction Parameter Bags
//!
//! A [`TxParameters`] bag is the whole negotiation state of one transaction:
//! a map from `(SubTxId, ParameterId)` to a bincode-encoded value. It is
//! persisted after every step and it is what peers exchange, so everything
//! the state machine needs after a restart or a round-trip must live here.
//!
//! ## Public vs private ids
//!
//! Ids below [`ParameterId::PRIVATE_FIRST`] may be supplied by the peer. Ids
//! at or above it are local bookkeeping (our nonce slot, our offset, our
//! status) and are dropped when they arrive over the wire.
//!
//! ## Wire format
//!
//! ```text
//! u32 LE   entry count
//! entry := u8 parameter id | u32 LE length | length bytes
//! ```
//!
//! Entries are written in `(SubTxId, ParameterId)` order. Decoding starts in
//! scope [`DEFAULT_SUB_TX_ID`]; a [`ParameterId::SUB_TX_INDEX`] entry (value:
//! u32 LE) switches the scope for every entry after it.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{TxId, TxType, WalletId};

/// Scope of a parameter inside one transaction. Simple transactions only
/// use the default scope; multi-leg protocols use one per leg.
pub type SubTxId = u32;

pub const DEFAULT_SUB_TX_ID: SubTxId = 1;

/// Parameter identifier. Unknown ids are preserved verbatim so a bag from a
/// newer peer survives a decode/encode cycle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParameterId(pub u8);

impl ParameterId {
    // Public: may arrive from the peer.
    pub const TRANSACTION_TYPE: Self = Self(0);
    pub const IS_SENDER: Self = Self(1);
    pub const AMOUNT: Self = Self(2);
    pub const FEE: Self = Self(3);
    pub const MIN_HEIGHT: Self = Self(4);
    pub const AMOUNT_LIST: Self = Self(5);
    pub const PEER_MAX_HEIGHT: Self = Self(12);
    pub const MESSAGE: Self = Self(14);
    pub const LIFETIME: Self = Self(15);
    pub const PEER_PROTO_VERSION: Self = Self(16);
    pub const ASSET_ID: Self = Self(18);
    pub const FAILURE_REASON: Self = Self(20);
    pub const PEER_PUBLIC_EXCESS: Self = Self(23);
    pub const PEER_PUBLIC_NONCE: Self = Self(24);
    pub const SUB_TX_INDEX: Self = Self(25);
    pub const PEER_SIGNATURE: Self = Self(26);
    pub const PEER_INPUTS: Self = Self(27);
    pub const PEER_OUTPUTS: Self = Self(28);
    pub const PEER_OFFSET: Self = Self(29);
    pub const TRANSACTION_REGISTERED: Self = Self(30);
    pub const PAYMENT_CONFIRMATION: Self = Self(31);

    pub const PRIVATE_FIRST: Self = Self(128);

    // Private: local bookkeeping only.
    pub const STATE: Self = Self(128);
    pub const STATUS: Self = Self(129);
    pub const KERNEL_PROOF_HEIGHT: Self = Self(130);
    pub const KERNEL_UNCONFIRMED_HEIGHT: Self = Self(131);
    pub const INPUTS: Self = Self(132);
    pub const OUTPUTS: Self = Self(133);
    pub const INPUT_COINS: Self = Self(134);
    pub const OUTPUT_COINS: Self = Self(135);
    pub const NONCE_SLOT: Self = Self(136);
    pub const PUBLIC_NONCE: Self = Self(137);
    pub const PUBLIC_EXCESS: Self = Self(138);
    pub const PARTIAL_SIGNATURE: Self = Self(139);
    pub const OFFSET: Self = Self(140);
    pub const MAX_HEIGHT: Self = Self(141);
    pub const KERNEL_ID: Self = Self(142);
    pub const KERNEL: Self = Self(143);
    pub const IS_SELF_TX: Self = Self(144);
    pub const PEER_RESPONSE_HEIGHT: Self = Self(145);
    pub const IS_INITIATOR: Self = Self(146);
    pub const CREATE_TIME: Self = Self(147);
    pub const PEER_ID: Self = Self(148);
    pub const MY_ID: Self = Self(149);

    pub fn is_private(self) -> bool {
        self >= Self::PRIVATE_FIRST
    }

    fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::TRANSACTION_TYPE => "TransactionType",
            Self::IS_SENDER => "IsSender",
            Self::AMOUNT => "Amount",
            Self::FEE => "Fee",
            Self::MIN_HEIGHT => "MinHeight",
            Self::AMOUNT_LIST => "AmountList",
            Self::PEER_MAX_HEIGHT => "PeerMaxHeight",
            Self::MESSAGE => "Message",
            Self::LIFETIME => "Lifetime",
            Self::PEER_PROTO_VERSION => "PeerProtoVersion",
            Self::ASSET_ID => "AssetID",
            Self::FAILURE_REASON => "FailureReason",
            Self::PEER_PUBLIC_EXCESS => "PeerPublicExcess",
            Self::PEER_PUBLIC_NONCE => "PeerPublicNonce",
            Self::SUB_TX_INDEX => "SubTxIndex",
            Self::PEER_SIGNATURE => "PeerSignature",
            Self::PEER_INPUTS => "PeerInputs",
            Self::PEER_OUTPUTS => "PeerOutputs",
            Self::PEER_OFFSET => "PeerOffset",
            Self::TRANSACTION_REGISTERED => "TransactionRegistered",
            Self::PAYMENT_CONFIRMATION => "PaymentConfirmation",
            Self::STATE => "State",
            Self::STATUS => "Status",
            Self::KERNEL_PROOF_HEIGHT => "KernelProofHeight",
            Self::KERNEL_UNCONFIRMED_HEIGHT => "KernelUnconfirmedHeight",
            Self::INPUTS => "Inputs",
            Self::OUTPUTS => "Outputs",
            Self::INPUT_COINS => "InputCoins",
            Self::OUTPUT_COINS => "OutputCoins",
            Self::NONCE_SLOT => "NonceSlot",
            Self::PUBLIC_NONCE => "PublicNonce",
            Self::PUBLIC_EXCESS => "PublicExcess",
            Self::PARTIAL_SIGNATURE => "PartialSignature",
            Self::OFFSET => "Offset",
            Self::MAX_HEIGHT => "MaxHeight",
            Self::KERNEL_ID => "KernelID",
            Self::KERNEL => "Kernel",
            Self::IS_SELF_TX => "IsSelfTx",
            Self::PEER_RESPONSE_HEIGHT => "PeerResponseHeight",
            Self::IS_INITIATOR => "IsInitiator",
            Self::CREATE_TIME => "CreateTime",
            Self::PEER_ID => "PeerID",
            Self::MY_ID => "MyID",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Debug for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "ParameterId({})", self.0),
        }
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParameterError {
    #[error("parameter {0} is required but absent")]
    Missing(ParameterId),

    #[error("parameter {id} holds an undecodable value: {reason}")]
    Undecodable { id: ParameterId, reason: String },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("wire data truncated")]
    Truncated,

    #[error("{0} trailing bytes after the last entry")]
    TrailingBytes(usize),

    #[error("sub-transaction switch carries a malformed value")]
    InvalidSubTxIndex,

    #[error("parameter {0} is reserved for the wire format")]
    Reserved(ParameterId),

    #[error("parameter {id} is {len} bytes, too long for the wire format")]
    Oversized { id: ParameterId, len: usize },
}

// ---------------------------------------------------------------------------
// TxParameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxParameters {
    entries: BTreeMap<(SubTxId, ParameterId), Vec<u8>>,
}

impl TxParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` in the default scope, replacing any previous value.
    pub fn set<T: Serialize + ?Sized>(&mut self, id: ParameterId, value: &T) -> Result<(), ParameterError> {
        self.set_sub(id, value, DEFAULT_SUB_TX_ID)
    }

    pub fn set_sub<T: Serialize + ?Sized>(
        &mut self,
        id: ParameterId,
        value: &T,
        sub_tx: SubTxId,
    ) -> Result<(), ParameterError> {
        let bytes = bincode::serialize(value).map_err(|e| ParameterError::Serialization(e.to_string()))?;
        self.set_raw(id, sub_tx, bytes)
    }

    /// Store already-encoded bytes. `SubTxIndex` is the wire scope switch
    /// and cannot be stored.
    pub fn set_raw(&mut self, id: ParameterId, sub_tx: SubTxId, bytes: Vec<u8>) -> Result<(), ParameterError> {
        if id == ParameterId::SUB_TX_INDEX {
            return Err(ParameterError::Reserved(id));
        }
        self.entries.insert((sub_tx, id), bytes);
        Ok(())
    }

    /// `Ok(None)` when absent; an error only when present but undecodable.
    pub fn get<T: DeserializeOwned>(&self, id: ParameterId) -> Result<Option<T>, ParameterError> {
        self.get_sub(id, DEFAULT_SUB_TX_ID)
    }

    pub fn get_sub<T: DeserializeOwned>(
        &self,
        id: ParameterId,
        sub_tx: SubTxId,
    ) -> Result<Option<T>, ParameterError> {
        match self.entries.get(&(sub_tx, id)) {
            None => Ok(None),
            Some(bytes) => bincode::deserialize(bytes)
                .map(Some)
                .map_err(|e| ParameterError::Undecodable {
                    id,
                    reason: e.to_string(),
                }),
        }
    }

    /// Like [`TxParameters::get`] but absence is an error.
    pub fn require<T: DeserializeOwned>(&self, id: ParameterId) -> Result<T, ParameterError> {
        self.get(id)?.ok_or(ParameterError::Missing(id))
    }

    pub fn get_raw(&self, id: ParameterId, sub_tx: SubTxId) -> Option<&[u8]> {
        self.entries.get(&(sub_tx, id)).map(Vec::as_slice)
    }

    /// Drop the entry for `id` in every scope.
    pub fn remove(&mut self, id: ParameterId) {
        self.entries.retain(|(_, entry_id), _| *entry_id != id);
    }

    pub fn contains(&self, id: ParameterId) -> bool {
        self.entries.contains_key(&(DEFAULT_SUB_TX_ID, id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in `(SubTxId, ParameterId)` order.
    pub fn iter(&self) -> impl Iterator<Item = (SubTxId, ParameterId, &[u8])> + '_ {
        self.entries
            .iter()
            .map(|((sub, id), bytes)| (*sub, *id, bytes.as_slice()))
    }

    /// Flat wire encoding, see the module docs.
    pub fn to_wire(&self) -> Result<Vec<u8>, ParameterError> {
        let mut body = Vec::new();
        let mut count: u32 = 0;
        let mut scope = DEFAULT_SUB_TX_ID;

        let mut push = |body: &mut Vec<u8>, id: ParameterId, bytes: &[u8]| -> Result<(), ParameterError> {
            body.push(id.0);
            body.extend_from_slice(&wire_len(id, bytes.len())?.to_le_bytes());
            body.extend_from_slice(bytes);
            count += 1;
            Ok(())
        };

        for ((sub, id), bytes) in &self.entries {
            if *sub != scope {
                push(&mut body, ParameterId::SUB_TX_INDEX, &sub.to_le_bytes())?;
                scope = *sub;
            }
            push(&mut body, *id, bytes)?;
        }

        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn from_wire(data: &[u8]) -> Result<Self, ParameterError> {
        let mut reader = WireReader { data, pos: 0 };
        let count = reader.u32()?;
        let mut params = TxParameters::new();
        let mut scope = DEFAULT_SUB_TX_ID;

        for _ in 0..count {
            let id = ParameterId(reader.u8()?);
            let len = reader.u32()? as usize;
            let bytes = reader.take(len)?;
            if id == ParameterId::SUB_TX_INDEX {
                let arr: [u8; 4] = bytes.try_into().map_err(|_| ParameterError::InvalidSubTxIndex)?;
                scope = u32::from_le_bytes(arr);
            } else {
                params.set_raw(id, scope, bytes.to_vec())?;
            }
        }

        match reader.remaining() {
            0 => Ok(params),
            n => Err(ParameterError::TrailingBytes(n)),
        }
    }
}

fn wire_len(id: ParameterId, len: usize) -> Result<u32, ParameterError> {
    u32::try_from(len).map_err(|_| ParameterError::Oversized { id, len })
}

struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], ParameterError> {
        let end = self.pos.checked_add(len).ok_or(ParameterError::Truncated)?;
        let slice = self.data.get(self.pos..end).ok_or(ParameterError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ParameterError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ParameterError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

// ---------------------------------------------------------------------------
// SetTxParameter
// ---------------------------------------------------------------------------

/// The one message peers exchange.
///
/// ```text
/// 32 bytes sender WalletId | 16 bytes TxId | u8 TxType | parameter bag
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetTxParameter {
    pub from: WalletId,
    pub tx_id: TxId,
    pub tx_type: TxType,
    pub params: TxParameters,
}

impl SetTxParameter {
    pub fn encode(&self) -> Result<Vec<u8>, ParameterError> {
        let mut out = Vec::with_capacity(49);
        out.extend_from_slice(&self.from.0);
        out.extend_from_slice(&self.tx_id.0);
        out.push(match self.tx_type {
            TxType::Simple => 0,
        });
        out.extend_from_slice(&self.params.to_wire()?);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ParameterError> {
        let mut reader = WireReader { data, pos: 0 };
        let from: [u8; 32] = reader.take(32)?.try_into().map_err(|_| ParameterError::Truncated)?;
        let tx_id: [u8; 16] = reader.take(16)?.try_into().map_err(|_| ParameterError::Truncated)?;
        let tx_type = match reader.u8()? {
            0 => TxType::Simple,
            other => {
                return Err(ParameterError::Undecodable {
                    id: ParameterId::TRANSACTION_TYPE,
                    reason: format!("unknown transaction type {other}"),
                })
            }
        };
        let params = TxParameters::from_wire(&data[reader.pos..])?;
        Ok(Self {
            from: WalletId(from),
            tx_id: TxId(tx_id),
            tx_type,
            params,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::types::TxFailureReason;

    #[test]
    fn absent_parameter_is_none_not_error() {
        let params = TxParameters::new();
        assert_eq!(params.get::<u64>(ParameterId::AMOUNT), Ok(None));
        assert_eq!(
            params.require::<u64>(ParameterId::AMOUNT),
            Err(ParameterError::Missing(ParameterId::AMOUNT))
        );
    }

    #[test]
    fn last_write_wins() {
        let mut params = TxParameters::new();
        params.set(ParameterId::FEE, &100u64).unwrap();
        params.set(ParameterId::FEE, &250u64).unwrap();
        assert_eq!(params.get::<u64>(ParameterId::FEE), Ok(Some(250)));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn sub_transactions_are_independent_scopes() {
        let mut params = TxParameters::new();
        params.set(ParameterId::AMOUNT, &1u64).unwrap();
        params.set_sub(ParameterId::AMOUNT, &2u64, 2).unwrap();
        assert_eq!(params.get::<u64>(ParameterId::AMOUNT), Ok(Some(1)));
        assert_eq!(params.get_sub::<u64>(ParameterId::AMOUNT, 2), Ok(Some(2)));
    }

    #[test]
    fn wrong_type_is_undecodable() {
        let mut params = TxParameters::new();
        params.set(ParameterId::IS_SENDER, &true).unwrap();
        assert!(matches!(
            params.get::<u64>(ParameterId::IS_SENDER),
            Err(ParameterError::Undecodable { .. })
        ));
    }

    #[test]
    fn wire_roundtrip_across_sub_transactions() {
        let mut params = TxParameters::new();
        params.set(ParameterId::AMOUNT, &1_000_000_000u64).unwrap();
        params.set(ParameterId::FEE, &100u64).unwrap();
        params.set_sub(ParameterId::AMOUNT, &7u64, 2).unwrap();
        params.set_sub(ParameterId::PEER_MAX_HEIGHT, &500u64, 3).unwrap();
        params.set_sub(ParameterId::FAILURE_REASON, &TxFailureReason::Cancelled, 0).unwrap();

        let decoded = TxParameters::from_wire(&params.to_wire().unwrap()).unwrap();
        assert_eq!(decoded, params);
        assert_eq!(decoded.get_sub::<u64>(ParameterId::PEER_MAX_HEIGHT, 3), Ok(Some(500)));
    }

    #[test]
    fn wire_layout_is_bit_exact() {
        let mut params = TxParameters::new();
        params.set_raw(ParameterId::AMOUNT, DEFAULT_SUB_TX_ID, vec![0xAA]).unwrap();
        params.set_raw(ParameterId::FEE, 2, vec![0xBB, 0xCC]).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&3u32.to_le_bytes());
        expected.push(2);
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.push(0xAA);
        expected.push(25);
        expected.extend_from_slice(&4u32.to_le_bytes());
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.push(3);
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(&[0xBB, 0xCC]);
        assert_eq!(params.to_wire().unwrap(), expected);
    }

    #[test]
    fn unknown_ids_survive_roundtrip() {
        let mut params = TxParameters::new();
        params.set_raw(ParameterId(99), DEFAULT_SUB_TX_ID, vec![1, 2, 3]).unwrap();
        let decoded = TxParameters::from_wire(&params.to_wire().unwrap()).unwrap();
        assert_eq!(decoded.get_raw(ParameterId(99), DEFAULT_SUB_TX_ID), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn truncated_wire_data_is_rejected() {
        let mut params = TxParameters::new();
        params.set(ParameterId::AMOUNT, &5u64).unwrap();
        let wire = params.to_wire().unwrap();
        assert_eq!(
            TxParameters::from_wire(&wire[..wire.len() - 1]),
            Err(ParameterError::Truncated)
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut wire = TxParameters::new().to_wire().unwrap();
        wire.push(0);
        assert_eq!(TxParameters::from_wire(&wire), Err(ParameterError::TrailingBytes(1)));
    }

    #[test]
    fn scope_switch_id_cannot_be_stored() {
        let mut params = TxParameters::new();
        assert_eq!(
            params.set_raw(ParameterId::SUB_TX_INDEX, DEFAULT_SUB_TX_ID, 2u32.to_le_bytes().to_vec()),
            Err(ParameterError::Reserved(ParameterId::SUB_TX_INDEX))
        );
        assert_eq!(
            params.set(ParameterId::SUB_TX_INDEX, &2u32),
            Err(ParameterError::Reserved(ParameterId::SUB_TX_INDEX))
        );
        assert!(params.is_empty());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn values_past_u32_length_are_refused() {
        let len = u32::MAX as usize + 1;
        assert_eq!(
            wire_len(ParameterId::KERNEL, len),
            Err(ParameterError::Oversized {
                id: ParameterId::KERNEL,
                len
            })
        );
        assert_eq!(wire_len(ParameterId::KERNEL, u32::MAX as usize), Ok(u32::MAX));
    }

    #[test]
    fn private_ids_are_flagged() {
        assert!(ParameterId::NONCE_SLOT.is_private());
        assert!(ParameterId::STATUS.is_private());
        assert!(!ParameterId::PEER_SIGNATURE.is_private());
        assert!(!ParameterId::SUB_TX_INDEX.is_private());
    }

    #[test]
    fn message_envelope_roundtrip() {
        let mut params = TxParameters::new();
        params.set(ParameterId::AMOUNT, &42u64).unwrap();
        let msg = SetTxParameter {
            from: WalletId([5u8; 32]),
            tx_id: TxId([9u8; 16]),
            tx_type: TxType::Simple,
            params,
        };
        assert_eq!(SetTxParameter::decode(&msg.encode().unwrap()).unwrap(), msg);
    }
}
