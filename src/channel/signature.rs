//! Field-concatenation signature scheme used by the settlement aggregator.
//!
//! Signing input is `secret + name1 + value1 + name2 + value2 + ...` over
//! the kept parameters, sorted by name, hashed with SHA-256 and rendered
//! as uppercase hex. Parameters with empty values and the signature
//! parameters themselves (`hash`, `sign`) are excluded before sorting.

use sha2::{Digest, Sha256};

/// Fields signed on a create request, sorted ascending.
pub const CREATE_SIGN_FIELDS: &[&str] = &["amount", "currency", "invoice_id", "merchant_id"];

/// Fields signed on a status query or close request.
pub const QUERY_SIGN_FIELDS: &[&str] = &["merchant_id", "payment_order_id"];

/// Fields signed on a refund request.
pub const REFUND_SIGN_FIELDS: &[&str] = &["currency", "invoice_id", "merchant_id", "refund_amount"];

/// Fields signed on an inbound notification.
pub const NOTIFY_SIGN_FIELDS: &[&str] = &[
    "amount",
    "currency",
    "invoice_id",
    "merchant_id",
    "payment_order_id",
    "status",
];

/// Compute the signature over the given parameters.
///
/// Callers pass every field of the operation's fixed list; empty values
/// are dropped here so optional-and-absent fields do not change the
/// digest depending on how the caller spelled absence.
pub fn sign(secret: &str, params: &[(&str, &str)]) -> String {
    let mut kept: Vec<(&str, &str)> = params
        .iter()
        .copied()
        .filter(|(name, value)| !value.is_empty() && *name != "hash" && *name != "sign")
        .collect();
    kept.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    for (name, value) in kept {
        hasher.update(name.as_bytes());
        hasher.update(value.as_bytes());
    }
    hex::encode_upper(hasher.finalize())
}

/// Recompute and compare against a carried signature, case-insensitively.
/// Missing or malformed carried values verify as `false`, never an error.
pub fn verify(secret: &str, params: &[(&str, &str)], carried: &str) -> bool {
    if carried.is_empty() {
        return false;
    }
    sign(secret, params).eq_ignore_ascii_case(carried)
}
