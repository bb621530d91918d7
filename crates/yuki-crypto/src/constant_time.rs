//! Constant-time comparisons.
//!
//! Used wherever a secret supplied by a peer is compared against a stored one.

use subtle::ConstantTimeEq;

/// Constant-time comparison of byte slices.
///
/// Returns `true` if slices are equal, `false` otherwise.
/// Execution time depends only on slice length, not content.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}

/// Constant-time comparison of two strings by their UTF-8 bytes.
#[must_use]
pub fn ct_eq_str(a: &str, b: &str) -> bool {
    ct_eq(a.as_bytes(), b.as_bytes())
}
