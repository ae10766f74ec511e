//! Shared-secret authentication of Connect messages.

use hmac::{Hmac, Mac};
use nodelink_types::EndpointId;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Nonce and signature attached to an outbound Connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectAuth {
    pub nonce: String,
    pub auth_hmac: String,
}

impl ConnectAuth {
    /// Sign a fresh nonce for `endpoint`. Empty when no secret is configured.
    pub fn sign(secret: Option<&str>, endpoint: &EndpointId) -> Self {
        match secret {
            Some(secret) => {
                let nonce = uuid::Uuid::new_v4().to_string();
                let auth_hmac = hmac_sign(secret, auth_data(&nonce, endpoint).as_bytes());
                Self { nonce, auth_hmac }
            }
            None => Self::default(),
        }
    }

    /// Check a received signature. Always true when no secret is configured.
    pub fn verify(&self, secret: Option<&str>, endpoint: &EndpointId) -> bool {
        match secret {
            Some(secret) => hmac_verify(
                secret,
                auth_data(&self.nonce, endpoint).as_bytes(),
                &self.auth_hmac,
            ),
            None => true,
        }
    }
}

fn auth_data(nonce: &str, endpoint: &EndpointId) -> String {
    format!("{}{}", nonce, endpoint.uuid())
}

/// Generate HMAC-SHA256 signature.
fn hmac_sign(secret: &str, data: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length.
        Err(_) => return String::new(),
    };
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify HMAC-SHA256 signature using constant-time comparison.
fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    let expected = hmac_sign(secret, data);
    if expected.is_empty() {
        return false;
    }
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}
