//! Deploy-token authentication for webhook-triggered deploys.

use sha2::{Digest, Sha256};
use subtle::{Choice, ConstantTimeEq};

use crate::errors::{PlatformError, PlatformResult};

fn digest(value: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(value.as_bytes()));
    out
}

/// Find the app owning `token`.
///
/// Every candidate is compared over its SHA-256 digest in constant time and
/// the scan never exits early.
pub fn find_app_by_token(token: &str, candidates: &[(String, String)]) -> PlatformResult<String> {
    let presented = digest(token);
    let mut matched: Option<&str> = None;
    let mut any = Choice::from(0u8);

    for (name, candidate) in candidates {
        let hit = presented[..].ct_eq(&digest(candidate)[..]);
        any |= hit;
        if bool::from(hit) && matched.is_none() {
            matched = Some(name.as_str());
        }
    }

    match matched {
        Some(name) if bool::from(any) && !token.is_empty() => Ok(name.to_string()),
        _ => Err(PlatformError::Unauthorized),
    }
}
