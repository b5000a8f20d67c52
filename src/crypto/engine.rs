use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::ApiError;
use crate::platforms::Platform;

type HmacSha256 = Hmac<Sha256>;

/// AES-GCM nonce, prepended to every ciphertext.
const NONCE_LEN: usize = 12;
/// HMAC-SHA256 output, prepended to every signed state.
const SIGNATURE_LEN: usize = 32;

/// How long a signed connect state stays valid.
pub const STATE_MAX_AGE_SECS: i64 = 10 * 60;

/// Helper to create an HMAC instance, resolving trait ambiguity.
fn new_hmac(key: &[u8]) -> Result<HmacSha256, ApiError> {
    <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| ApiError::Crypto(format!("HMAC init failed: {e}")))
}

/// Payload carried through the vendor's OAuth redirect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectState {
    pub org_id: String,
    pub platform: Platform,
    pub issued_at: i64,
    pub nonce: String,
}

impl ConnectState {
    pub fn new(org_id: &str, platform: Platform) -> Self {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            org_id: org_id.to_string(),
            platform,
            issued_at: Utc::now().timestamp(),
            nonce: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(nonce),
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now - self.issued_at > STATE_MAX_AGE_SECS
    }
}

/// Encrypts platform tokens at rest (AES-256-GCM) and signs OAuth state (HMAC-SHA256).
pub struct TokenCipher {
    cipher: Aes256Gcm,
    hmac_key: Vec<u8>,
}

impl TokenCipher {
    /// Create a cipher from base64-encoded keys.
    pub fn new(master_key_b64: &str, hmac_secret_b64: &str) -> Result<Self, ApiError> {
        let master_key = base64::engine::general_purpose::STANDARD
            .decode(master_key_b64)
            .map_err(|e| ApiError::Crypto(format!("Invalid MASTER_KEY base64: {e}")))?;

        if master_key.len() != 32 {
            return Err(ApiError::Crypto(format!(
                "MASTER_KEY must be 32 bytes, got {}",
                master_key.len()
            )));
        }

        let hmac_key = base64::engine::general_purpose::STANDARD
            .decode(hmac_secret_b64)
            .map_err(|e| ApiError::Crypto(format!("Invalid HMAC_SECRET base64: {e}")))?;

        if hmac_key.is_empty() {
            return Err(ApiError::Crypto("HMAC_SECRET must not be empty".into()));
        }

        let cipher = Aes256Gcm::new_from_slice(&master_key)
            .map_err(|e| ApiError::Crypto(format!("Failed to init AES cipher: {e}")))?;

        Ok(Self { cipher, hmac_key })
    }

    /// Encrypt a token. Returns base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, ApiError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| ApiError::Crypto(format!("Encryption failed: {e}")))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    /// Decrypt base64(nonce || ciphertext) back to the token.
    pub fn decrypt(&self, encrypted_b64: &str) -> Result<String, ApiError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encrypted_b64)
            .map_err(|e| ApiError::Crypto(format!("Invalid base64: {e}")))?;

        if combined.len() < NONCE_LEN {
            return Err(ApiError::Crypto("Ciphertext too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| ApiError::Crypto(format!("Decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| ApiError::Crypto(format!("Invalid UTF-8 after decrypt: {e}")))
    }

    /// Encrypt an optional token, passing `None` through.
    pub fn encrypt_opt(&self, plaintext: Option<&str>) -> Result<Option<String>, ApiError> {
        plaintext.map(|p| self.encrypt(p)).transpose()
    }

    /// Sign a connect state. Returns base64url(hmac || json).
    pub fn sign_state(&self, state: &ConnectState) -> Result<String, ApiError> {
        let payload = serde_json::to_vec(state)
            .map_err(|e| ApiError::Internal(format!("state serialization failed: {e}")))?;

        let mut mac = new_hmac(&self.hmac_key)?;
        mac.update(&payload);
        let signature = mac.finalize().into_bytes();

        let mut combined = signature.to_vec();
        combined.extend_from_slice(&payload);

        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&combined))
    }

    /// PKCE code verifier bound to one connect flow.
    ///
    /// Derived from the state nonce under the HMAC key, so the callback can
    /// recompute it without storing anything and it never appears in a URL.
    /// 32 bytes base64url-encoded give the 43 characters RFC 7636 requires.
    pub fn pkce_verifier(&self, state: &ConnectState) -> Result<String, ApiError> {
        let mut mac = new_hmac(&self.hmac_key)?;
        mac.update(b"pkce:");
        mac.update(state.nonce.as_bytes());
        let digest = mac.finalize().into_bytes();
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest))
    }

    /// Verify a signed connect state and reject it once older than ten minutes.
    pub fn verify_state(&self, signed: &str) -> Result<ConnectState, ApiError> {
        let combined = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(signed)
            .map_err(|_| ApiError::InvalidState)?;

        if combined.len() <= SIGNATURE_LEN {
            return Err(ApiError::InvalidState);
        }

        let (signature, payload) = combined.split_at(SIGNATURE_LEN);

        let mut mac = new_hmac(&self.hmac_key)?;
        mac.update(payload);
        mac.verify_slice(signature)
            .map_err(|_| ApiError::InvalidState)?;

        let state: ConnectState =
            serde_json::from_slice(payload).map_err(|_| ApiError::InvalidState)?;

        if state.is_expired(Utc::now().timestamp()) {
            return Err(ApiError::BadRequest("OAuth session expired".into()));
        }

        Ok(state)
    }
}
