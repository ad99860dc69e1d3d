//! # Signature Verifier
//!
//! Checks that a depositor authorized a deposit payload. Depositors sign
//! the payload as EIP-712 typed data:
//!
//! ```text
//! domain  = EIP712Domain(string name,string version,uint256 chainId)
//!           { name: "Salad Deposit", version: "1", chainId }
//! message = Deposit(address sender,uint256 amount,bytes encRecipient,bytes pubKey)
//! digest  = keccak256(0x19 0x01 || domainSeparator || hashStruct(message))
//! ```
//!
//! The signing account is recovered from the 65-byte `r || s || v`
//! signature and compared with the claimed sender. Verification is pure:
//! no I/O, no state.

use alloy::primitives::{keccak256, Address, Bytes, U256};
use alloy::sol;
use alloy::sol_types::{eip712_domain, SolStruct};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1};
use thiserror::Error;

use crate::utils::{address_bytes, decode_hex, encode_hex_prefixed, normalize_address};

const DOMAIN_NAME: &str = "Salad Deposit";
const DOMAIN_VERSION: &str = "1";

sol! {
    /// Typed-data message a depositor signs.
    struct Deposit {
        address sender;
        uint256 amount;
        bytes encRecipient;
        bytes pubKey;
    }
}

/// Signature verification errors. Both are terminal.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignatureError {
    /// The signature or a payload field is not well-formed.
    #[error("Invalid signature encoding: {0}")]
    InvalidSignatureEncoding(String),

    /// The signature was produced by another account.
    #[error("Signature mismatch: signed by {recovered}, claimed by {claimed}")]
    SignatureMismatch { claimed: String, recovered: String },
}

/// The signed part of a deposit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositPayload {
    pub sender: String,
    pub amount: u128,
    /// Hex, with or without `0x`.
    pub enc_recipient: String,
    /// Hex, with or without `0x`.
    pub pub_key: String,
}

fn invalid(message: impl Into<String>) -> SignatureError {
    SignatureError::InvalidSignatureEncoding(message.into())
}

fn typed_message(payload: &DepositPayload) -> Result<Deposit, SignatureError> {
    Ok(Deposit {
        sender: Address::from(address_bytes(&payload.sender).map_err(invalid)?),
        amount: U256::from(payload.amount),
        encRecipient: Bytes::from(decode_hex(&payload.enc_recipient).map_err(invalid)?),
        pubKey: Bytes::from(decode_hex(&payload.pub_key).map_err(invalid)?),
    })
}

/// The EIP-712 digest a depositor signs.
pub fn typed_data_digest(payload: &DepositPayload, chain_id: u64) -> Result<[u8; 32], SignatureError> {
    let domain = eip712_domain! {
        name: DOMAIN_NAME,
        version: DOMAIN_VERSION,
        chain_id: chain_id,
    };
    Ok(typed_message(payload)?.eip712_signing_hash(&domain).0)
}

/// Account address of a public key (last 20 bytes of the Keccak-256 of
/// the uncompressed key), lowercase `0x` hex.
pub fn public_key_address(public_key: &PublicKey) -> String {
    let uncompressed = public_key.serialize_uncompressed();
    let hash = keccak256(&uncompressed[1..]);
    encode_hex_prefixed(&hash.as_slice()[12..])
}

fn recover_signer(digest: &[u8; 32], signature: &str) -> Result<String, SignatureError> {
    let bytes = decode_hex(signature).map_err(invalid)?;
    if bytes.len() != 65 {
        return Err(invalid(format!("expected 65 signature bytes, got {}", bytes.len())));
    }

    let rec_id = match bytes[64] {
        v @ (27 | 28) => v - 27,
        v @ (0 | 1) => v,
        v => return Err(invalid(format!("invalid recovery id: {} (expected 0, 1, 27, or 28)", v))),
    };
    let rid = RecoveryId::from_i32(rec_id as i32).map_err(|e| invalid(format!("recovery id: {e}")))?;
    let rec_sig = RecoverableSignature::from_compact(&bytes[..64], rid)
        .map_err(|e| invalid(format!("signature parse: {e}")))?;
    let message = Message::from_digest_slice(digest).map_err(|e| invalid(format!("digest: {e}")))?;

    let public_key = Secp256k1::verification_only()
        .recover_ecdsa(&message, &rec_sig)
        .map_err(|e| invalid(format!("recover: {e}")))?;
    Ok(public_key_address(&public_key))
}

/// Verify that `signature` authorizes `payload` on chain `chain_id`.
///
/// Returns the normalized sender on success.
pub fn verify(payload: &DepositPayload, signature: &str, chain_id: u64) -> Result<String, SignatureError> {
    let claimed = normalize_address(&payload.sender).map_err(invalid)?;
    let digest = typed_data_digest(payload, chain_id)?;
    let recovered = recover_signer(&digest, signature)?;

    if recovered != claimed {
        return Err(SignatureError::SignatureMismatch { claimed, recovered });
    }
    Ok(claimed)
}
