//! Core type definitions for the ledger node.
//!
//! This module contains the data structures shared by every other part of the
//! node: transactions, blocks, their canonical hashing, the typed P-256 key and
//! signature wrappers with their fixed-width hex wire format, and the JSON
//! request/response shapes exchanged with wallets and peers.

use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Sender address reserved for the miner's reward transaction.
pub const COINBASE_SENDER: &str = "COINBASE TRANSACTION";

/// SHA-256 digest of a block or transaction.
pub type Hash = [u8; 32];

/// Width in bytes of one big-integer component on the wire (X, Y, R or S).
const COMPONENT_LEN: usize = 32;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Hash conversion error")]
    HashConversionError,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Signing failed")]
    SigningFailed,
    #[error("Invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Errors raised while turning an inbound transaction request into a typed
/// transaction.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Malformed request body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Invalid key or signature encoding: {0}")]
    InvalidEncoding(#[from] CryptoError),
    #[error("Sender address is reserved for coinbase transactions")]
    ReservedSender,
}

/// Format a 32-byte hash as a hexadecimal string.
pub fn format_hex(bytes: &Hash) -> String {
    hex::encode(bytes)
}

fn decode_fixed<const N: usize>(encoded: &str) -> Result<[u8; N], CryptoError> {
    let bytes = hex::decode(encoded)?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidHex(hex::FromHexError::InvalidStringLength))
}

/// P-256 public key of a transaction sender.
///
/// On the wire a key is the X and Y coordinates, each zero-padded to 32 bytes,
/// concatenated and hex-encoded (128 hex characters).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_coordinates(coordinates: &[u8; 2 * COMPONENT_LEN]) -> Result<Self, CryptoError> {
        let mut sec1 = [0u8; 2 * COMPONENT_LEN + 1];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(coordinates);
        VerifyingKey::from_sec1_bytes(&sec1)
            .map(PublicKey)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let coordinates = decode_fixed::<{ 2 * COMPONENT_LEN }>(encoded)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_coordinates(&coordinates)
    }

    /// X‖Y, each coordinate as a fixed 32-byte big-endian integer.
    pub fn coordinates(&self) -> [u8; 2 * COMPONENT_LEN] {
        let point = self.0.to_encoded_point(false);
        let mut coordinates = [0u8; 2 * COMPONENT_LEN];
        coordinates.copy_from_slice(&point.as_bytes()[1..]);
        coordinates
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.coordinates())
    }

    /// Checks `signature` against an already hashed message.
    pub fn verify_digest(&self, digest: &Hash, signature: &TransactionSignature) -> bool {
        self.0.verify_prehash(digest, &signature.0).is_ok()
    }
}

impl From<VerifyingKey> for PublicKey {
    fn from(key: VerifyingKey) -> Self {
        PublicKey(key)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        PublicKey::from_hex(&encoded).map_err(serde::de::Error::custom)
    }
}

/// ECDSA signature `(r, s)` over a transaction digest.
///
/// The wire form is R‖S, each zero-padded to 32 bytes, hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSignature(Signature);

impl TransactionSignature {
    pub fn from_bytes(bytes: &[u8; 2 * COMPONENT_LEN]) -> Result<Self, CryptoError> {
        Signature::from_slice(bytes)
            .map(TransactionSignature)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = decode_fixed::<{ 2 * COMPONENT_LEN }>(encoded)
            .map_err(|_| CryptoError::InvalidSignature)?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> [u8; 2 * COMPONENT_LEN] {
        let mut bytes = [0u8; 2 * COMPONENT_LEN];
        bytes.copy_from_slice(&self.0.to_bytes());
        bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl From<Signature> for TransactionSignature {
    fn from(signature: Signature) -> Self {
        TransactionSignature(signature)
    }
}

impl Serialize for TransactionSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TransactionSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        TransactionSignature::from_hex(&encoded).map_err(serde::de::Error::custom)
    }
}

fn serialize_hash<S, H>(hash: &H, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    H: AsRef<[u8]>,
{
    serializer.serialize_str(&hex::encode(hash))
}

fn deserialize_hash<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    decode_fixed::<32>(&encoded).map_err(serde::de::Error::custom)
}

/// A value transfer between two blockchain addresses.
///
/// Transactions carry no identity of their own: two transactions with the
/// same fields are indistinguishable.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "sender_blockchain_address")]
    pub sender: String,
    #[serde(rename = "recipient_blockchain_address")]
    pub recipient: String,
    pub value: f64,
}

impl Transaction {
    pub fn new(sender: impl Into<String>, recipient: impl Into<String>, value: f64) -> Self {
        Transaction {
            sender: sender.into(),
            recipient: recipient.into(),
            value,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.sender == COINBASE_SENDER
    }

    /// SHA-256 of the canonical JSON form; this is the digest wallets sign.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::HashConversionError` if serialization fails.
    pub fn calculate_hash(&self) -> Result<Hash, CryptoError> {
        let serialized = serde_json::to_vec(self).map_err(|_| CryptoError::HashConversionError)?;
        Ok(Sha256::digest(serialized).into())
    }

    /// Verify that `signature` was produced over this transaction by the
    /// holder of `public_key`. Any failure, including a hashing failure,
    /// yields `false`.
    pub fn verify_signature(&self, public_key: &PublicKey, signature: &TransactionSignature) -> bool {
        match self.calculate_hash() {
            Ok(digest) => public_key.verify_digest(&digest, signature),
            Err(_) => false,
        }
    }
}

/// A block in the chain.
///
/// The block hash is never stored; it is recomputed from the four fields
/// below whenever it is needed.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Block {
    /// UNIX timestamp in nanoseconds
    pub timestamp: i64,
    /// Proof-of-work nonce
    pub nonce: u64,
    /// Hash of the previous block, hex-encoded on the wire
    #[serde(serialize_with = "serialize_hash", deserialize_with = "deserialize_hash")]
    pub previous_hash: Hash,
    /// Transactions in pool order, coinbase first
    pub transactions: Vec<Transaction>,
}

/// Borrowed view with the same canonical serialization as [`Block`], so the
/// proof-of-work search can hash candidates without cloning transactions.
#[derive(Serialize)]
struct BlockView<'a> {
    timestamp: i64,
    nonce: u64,
    #[serde(serialize_with = "serialize_hash")]
    previous_hash: &'a Hash,
    transactions: &'a [Transaction],
}

/// Hash a block assembled from its parts.
pub fn hash_block_parts(
    timestamp: i64,
    nonce: u64,
    previous_hash: &Hash,
    transactions: &[Transaction],
) -> Result<Hash, CryptoError> {
    let view = BlockView {
        timestamp,
        nonce,
        previous_hash,
        transactions,
    };
    let serialized = serde_json::to_vec(&view).map_err(|_| CryptoError::HashConversionError)?;
    Ok(Sha256::digest(serialized).into())
}

impl Block {
    pub fn new(timestamp: i64, nonce: u64, previous_hash: Hash, transactions: Vec<Transaction>) -> Self {
        Block {
            timestamp,
            nonce,
            previous_hash,
            transactions,
        }
    }

    /// Calculate the SHA-256 hash of the block.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::HashConversionError` if serialization fails.
    pub fn calculate_hash(&self) -> Result<Hash, CryptoError> {
        hash_block_parts(self.timestamp, self.nonce, &self.previous_hash, &self.transactions)
    }
}

/// Body of `GET /`: the full chain as served to peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainResponse {
    pub chain: Vec<Block>,
}

/// A transaction together with the sender's key and signature, decoded from
/// the wire.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub transaction: Transaction,
    pub public_key: PublicKey,
    pub signature: TransactionSignature,
}

/// Signed transaction as submitted by wallets and relayed between peers.
///
/// Every field is optional at the JSON level so that a missing field can be
/// reported as such instead of as a generic parse failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub sender_blockchain_address: Option<String>,
    pub recipient_blockchain_address: Option<String>,
    pub sender_public_key: Option<String>,
    pub value: Option<f64>,
    pub signature: Option<String>,
}

impl TransactionRequest {
    pub fn from_json(body: &[u8]) -> Result<Self, RequestError> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn new(transaction: &Transaction, public_key: &PublicKey, signature: &TransactionSignature) -> Self {
        TransactionRequest {
            sender_blockchain_address: Some(transaction.sender.clone()),
            recipient_blockchain_address: Some(transaction.recipient.clone()),
            sender_public_key: Some(public_key.to_hex()),
            value: Some(transaction.value),
            signature: Some(signature.to_hex()),
        }
    }

    /// Check that every field is present and decode the key and signature.
    pub fn decode(&self) -> Result<SignedTransaction, RequestError> {
        let sender = self
            .sender_blockchain_address
            .as_deref()
            .ok_or(RequestError::MissingField("sender_blockchain_address"))?;
        let recipient = self
            .recipient_blockchain_address
            .as_deref()
            .ok_or(RequestError::MissingField("recipient_blockchain_address"))?;
        let public_key = self
            .sender_public_key
            .as_deref()
            .ok_or(RequestError::MissingField("sender_public_key"))?;
        let value = self.value.ok_or(RequestError::MissingField("value"))?;
        let signature = self
            .signature
            .as_deref()
            .ok_or(RequestError::MissingField("signature"))?;

        if sender == COINBASE_SENDER {
            return Err(RequestError::ReservedSender);
        }

        Ok(SignedTransaction {
            transaction: Transaction::new(sender, recipient, value),
            public_key: PublicKey::from_hex(public_key)?,
            signature: TransactionSignature::from_hex(signature)?,
        })
    }
}
