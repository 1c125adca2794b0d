//! Pay-link tokens and webhook signatures.
//!
//! A token is HMAC-SHA256(secret, subject_id) encoded as base64url without
//! padding. The same tag authorizes the public pay page and signs the
//! payment webhook for a bill.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies tokens bound to a subject id (a bill id).
///
/// Holds the process-wide secret; build it once from `Config` and share it.
/// Replacing the secret invalidates every token issued under the old one.
#[derive(Clone)]
pub struct TokenSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").field("key", &"<redacted>").finish()
    }
}

impl TokenSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
        }
    }

    fn mac(&self, subject_id: &str) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size");
        mac.update(subject_id.as_bytes());
        mac
    }

    /// Deterministic token for `subject_id`
    pub fn sign(&self, subject_id: &str) -> String {
        let tag = self.mac(subject_id).finalize().into_bytes();
        URL_SAFE_NO_PAD.encode(tag)
    }

    /// Constant-time check of `token` against `subject_id`.
    ///
    /// Malformed tokens (bad base64, wrong length) verify as `false`.
    pub fn verify(&self, subject_id: &str, token: &str) -> bool {
        let raw = match URL_SAFE_NO_PAD.decode(token.trim_end_matches('=')) {
            Ok(raw) => raw,
            Err(_) => return false,
        };

        self.mac(subject_id).verify_slice(&raw).is_ok()
    }

    /// `{base_url}/pay/{bill_id}?t={token}`
    pub fn pay_link(&self, base_url: &str, bill_id: &str) -> String {
        format!(
            "{}/pay/{}?t={}",
            base_url.trim_end_matches('/'),
            bill_id,
            self.sign(bill_id)
        )
    }
}
