//! Ledgers, ledger headers, and the hashes that identify them.

use std::{collections::BTreeMap, fmt, sync::Arc};

#[cfg(any(test, feature = "proptest-impl"))]
use proptest_derive::Arbitrary;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SerializationError;

/// The maximum number of ancestor hashes a ledger's skip list holds.
pub const MAX_SKIP_LIST_LEN: usize = 256;

/// A SHA-256d hash identifying a ledger or a transaction.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "proptest-impl"), derive(Arbitrary))]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// The all-zero hash. Never the hash of a real ledger.
    pub const ZERO: Hash = Hash([0; 32]);

    /// Returns `true` if this is the all-zero hash.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Returns the SHA-256d digest of `data`.
    pub fn digest(data: impl AsRef<[u8]>) -> Hash {
        let first = Sha256::digest(data.as_ref());
        Hash(Sha256::digest(first).into())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Hash").field(&hex::encode(self.0)).finish()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::str::FromStr for Hash {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; 32];
        if hex::decode_to_slice(s, &mut bytes[..]).is_err() {
            Err(SerializationError::Parse("hex decoding error"))
        } else {
            Ok(Hash(bytes))
        }
    }
}

/// Why a ledger is being acquired.
///
/// The reason decides what happens to a ledger once it has been rebuilt,
/// see [`LedgerDeltaAcquire`](crate::LedgerDeltaAcquire).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "proptest-impl"), derive(Arbitrary))]
pub enum Reason {
    /// Backfilling old ledgers.
    History,
    /// Filling a ledger shard.
    Shard,
    /// Any other purpose, the ledger becomes part of the canonical chain.
    Generic,
    /// Needed by consensus.
    Consensus,
}

/// The header of a ledger.
///
/// The ledger hash commits to every field, so a header that hashes to a
/// trusted ledger hash is itself trusted.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LedgerHeader {
    /// The sequence number of the ledger.
    pub seq: u32,
    /// The hash of the previous ledger.
    pub parent_hash: Hash,
    /// The root of the ledger's transaction set, see [`transaction_root`].
    pub tx_hash: Hash,
    /// The root of the ledger's state tree.
    pub state_hash: Hash,
    /// The root of the ledger's skip list, see [`skip_list_hash()`].
    pub skip_list_hash: Hash,
    /// The close time, in seconds.
    pub close_time: u64,
}

impl LedgerHeader {
    /// The serialized length of a header.
    pub const SERIALIZED_LEN: usize = 4 + 32 * 4 + 8;

    /// Returns the canonical serialization that the ledger hash commits to.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SERIALIZED_LEN);
        bytes.extend_from_slice(&self.seq.to_le_bytes());
        bytes.extend_from_slice(&self.parent_hash.0);
        bytes.extend_from_slice(&self.tx_hash.0);
        bytes.extend_from_slice(&self.state_hash.0);
        bytes.extend_from_slice(&self.skip_list_hash.0);
        bytes.extend_from_slice(&self.close_time.to_le_bytes());
        bytes
    }

    /// Returns the hash of the ledger with this header.
    pub fn hash(&self) -> Hash {
        Hash::digest(self.to_bytes())
    }
}

/// An opaque, serialized transaction.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    bytes: Vec<u8>,
}

impl Transaction {
    /// Wraps serialized transaction bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// The transaction ID: the hash of the serialized transaction.
    pub fn id(&self) -> Hash {
        Hash::digest(&self.bytes)
    }

    /// The serialized transaction.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Transactions keyed by their index within the ledger.
pub type OrderedTransactions = BTreeMap<u32, Arc<Transaction>>;

/// Returns the transaction root committed to by [`LedgerHeader::tx_hash`].
///
/// The root covers each transaction's index as well as its ID, so a peer
/// can't reorder a valid transaction set.
pub fn transaction_root(transactions: &OrderedTransactions) -> Hash {
    if transactions.is_empty() {
        return Hash::ZERO;
    }

    let mut bytes = Vec::with_capacity(transactions.len() * 36);
    for (index, tx) in transactions {
        bytes.extend_from_slice(&index.to_le_bytes());
        bytes.extend_from_slice(&tx.id().0);
    }

    Hash::digest(bytes)
}

/// Returns the skip list root committed to by [`LedgerHeader::skip_list_hash`].
///
/// The root covers the encoded list, so a peer can't substitute ancestors
/// behind a valid header.
pub fn skip_list_hash(skip_list: &[Hash]) -> Hash {
    if skip_list.is_empty() {
        return Hash::ZERO;
    }

    Hash::digest(encode_skip_list(skip_list))
}

/// An immutable ledger: a header, the skip list, and the applied transactions.
///
/// The account state itself lives in the node's state tree and is not
/// modelled here.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ledger {
    header: LedgerHeader,
    hash: Hash,
    skip_list: Vec<Hash>,
    transactions: OrderedTransactions,
}

impl Ledger {
    /// Creates a ledger, computing and caching its hash.
    pub fn new(header: LedgerHeader, skip_list: Vec<Hash>, transactions: OrderedTransactions) -> Self {
        debug_assert_eq!(
            header.skip_list_hash,
            skip_list_hash(&skip_list),
            "the header commits to the skip list"
        );

        let hash = header.hash();

        Self {
            header,
            hash,
            skip_list,
            transactions,
        }
    }

    /// The ledger hash.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// The ledger sequence number.
    pub fn seq(&self) -> u32 {
        self.header.seq
    }

    /// The hash of the previous ledger.
    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }

    /// The ledger header.
    pub fn header(&self) -> &LedgerHeader {
        &self.header
    }

    /// The hashes of up to [`MAX_SKIP_LIST_LEN`] preceding ledgers, oldest first.
    ///
    /// Does not include this ledger's own hash.
    pub fn skip_list(&self) -> &[Hash] {
        &self.skip_list
    }

    /// The transactions applied by this ledger, in application order.
    pub fn transactions(&self) -> &OrderedTransactions {
        &self.transactions
    }

    /// Returns the skip list a child of this ledger carries.
    pub fn child_skip_list(&self) -> Vec<Hash> {
        let mut skip_list = self.skip_list.clone();
        skip_list.push(self.hash);

        if skip_list.len() > MAX_SKIP_LIST_LEN {
            skip_list.drain(..skip_list.len() - MAX_SKIP_LIST_LEN);
        }

        skip_list
    }
}

/// Serializes a skip list into the leaf item peers send.
///
/// The format is a little-endian `u32` count followed by the hashes.
pub fn encode_skip_list(skip_list: &[Hash]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + skip_list.len() * 32);
    bytes.extend_from_slice(&(skip_list.len() as u32).to_le_bytes());
    for hash in skip_list {
        bytes.extend_from_slice(&hash.0);
    }

    bytes
}

/// Deserializes a skip-list leaf item received from a peer.
pub fn decode_skip_list(mut bytes: &[u8]) -> Result<Vec<Hash>, SerializationError> {
    if bytes.len() < 4 {
        return Err(SerializationError::Parse("skip list item is missing its count"));
    }

    let (count, rest) = bytes.split_at(4);
    let count = u32::from_le_bytes(count.try_into().expect("split at 4 bytes")) as usize;
    bytes = rest;

    if count > MAX_SKIP_LIST_LEN {
        return Err(SerializationError::Parse("skip list is too long"));
    }

    if bytes.len() != count * 32 {
        return Err(SerializationError::Parse(
            "skip list item length does not match its count",
        ));
    }

    Ok(bytes
        .chunks_exact(32)
        .map(|chunk| Hash(chunk.try_into().expect("chunks are exactly 32 bytes")))
        .collect())
}
