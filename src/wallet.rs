//! Wallet: key material, blockchain addresses and transaction signing.
//!
//! The node only needs a wallet for its own miner address; external wallets
//! use the same pipeline to produce the signed requests the node verifies.

use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::types::{CryptoError, PublicKey, Transaction, TransactionRequest, TransactionSignature};

/// Version byte prepended to the RIPEMD-160 digest.
pub const ADDRESS_VERSION: u8 = 0x00;

const CHECKSUM_LEN: usize = 4;

/// Derive the base58 blockchain address of a public key.
///
/// SHA-256 over X‖Y, then RIPEMD-160, then the version byte, then the first
/// four bytes of a double SHA-256 as checksum.
pub fn derive_address(public_key: &PublicKey) -> String {
    let digest = Sha256::digest(public_key.coordinates());
    let ripemd = Ripemd160::digest(digest);

    let mut payload = Vec::with_capacity(1 + ripemd.len() + CHECKSUM_LEN);
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(&ripemd);

    let checksum = Sha256::digest(Sha256::digest(&payload));
    payload.extend_from_slice(&checksum[..CHECKSUM_LEN]);

    bs58::encode(payload).into_string()
}

pub struct Wallet {
    signing_key: SigningKey,
    public_key: PublicKey,
    blockchain_address: String,
}

impl Wallet {
    /// Generate a fresh P-256 key pair.
    pub fn new() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = PublicKey::from(VerifyingKey::from(&signing_key));
        let blockchain_address = derive_address(&public_key);
        Wallet {
            signing_key,
            public_key,
            blockchain_address,
        }
    }

    pub fn from_private_key_hex(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(encoded)?;
        let signing_key = SigningKey::from_slice(&bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self::from_signing_key(signing_key))
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn blockchain_address(&self) -> &str {
        &self.blockchain_address
    }

    /// Build a transaction from this wallet to `recipient` and sign its
    /// canonical hash.
    pub fn sign_transaction(
        &self,
        recipient: &str,
        value: f64,
    ) -> Result<(Transaction, TransactionSignature), CryptoError> {
        let transaction = Transaction::new(self.blockchain_address.as_str(), recipient, value);
        let digest = transaction.calculate_hash()?;
        let signature: Signature = self
            .signing_key
            .sign_prehash(&digest)
            .map_err(|_| CryptoError::SigningFailed)?;
        Ok((transaction, TransactionSignature::from(signature)))
    }

    /// Signed request ready to be posted to a node.
    pub fn transaction_request(&self, recipient: &str, value: f64) -> Result<TransactionRequest, CryptoError> {
        let (transaction, signature) = self.sign_transaction(recipient, value)?;
        Ok(TransactionRequest::new(&transaction, &self.public_key, &signature))
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}
