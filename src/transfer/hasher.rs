//! Canonical request hash for idempotency checks

use sha2::{Digest, Sha256};

use super::types::TransferRequest;
use crate::money;

/// SHA-256 hex of `sender|receiver|amount|CURRENCY` with trimmed ids, the
/// amount fixed to two decimals and the currency uppercased.
pub fn request_hash(request: &TransferRequest) -> String {
    let canonical = format!(
        "{}|{}|{}|{}",
        request.sender_account_id.trim(),
        request.receiver_account_id.trim(),
        money::fixed_scale(request.amount),
        request.currency.trim().to_ascii_uppercase()
    );
    hex::encode(Sha256::digest(canonical.as_bytes()))
}
