//! MQTT credentials for the IoT hubs
//!
//! Username is `<clientId>;12010126;<connId>;<expiry>` and password is the
//! hex HMAC of the username followed by `;<sign method>`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use errors::{RhilexError, RhilexResult};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::Sha256;

const SDK_APP_ID: u32 = 12010126;
const CONN_ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CONN_ID_LEN: usize = 5;
/// Credentials stay valid for ten years
const EXPIRY_SECS: u64 = 10 * 366 * 24 * 3600;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignMethod {
    #[default]
    HmacSha256,
    HmacSha1,
}

impl SignMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HmacSha256 => "hmacsha256",
            Self::HmacSha1 => "hmacsha1",
        }
    }

    fn sign(&self, key: &[u8], data: &str) -> RhilexResult<String> {
        let invalid = |e: hmac::digest::InvalidLength| RhilexError::InvalidParameter {
            param: "devicePsk".to_string(),
            reason: e.to_string(),
        };
        let digest = match self {
            Self::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(invalid)?;
                mac.update(data.as_bytes());
                mac.finalize().into_bytes().to_vec()
            },
            Self::HmacSha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(key).map_err(invalid)?;
                mac.update(data.as_bytes());
                mac.finalize().into_bytes().to_vec()
            },
        };
        Ok(hex::encode(digest))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthInfo {
    #[serde(rename = "clientid")]
    pub client_id: String,
    pub username: String,
    pub password: String,
}

fn conn_id() -> String {
    let mut rng = rand::thread_rng();
    (0..CONN_ID_LEN)
        .map(|_| CONN_ID_CHARSET[rng.gen_range(0..CONN_ID_CHARSET.len())] as char)
        .collect()
}

fn signed(client_id: String, key: &[u8], method: SignMethod) -> RhilexResult<AuthInfo> {
    let expiry = common::time::now_secs() + EXPIRY_SECS;
    let username = format!("{};{};{};{}", client_id, SDK_APP_ID, conn_id(), expiry);
    let password = format!("{};{}", method.sign(key, &username)?, method.as_str());
    Ok(AuthInfo {
        client_id,
        username,
        password,
    })
}

/// iThings: client id `<product>&<device>`, raw PSK as key
pub fn ithings(product_id: &str, device_name: &str, psk: &str, method: SignMethod) -> RhilexResult<AuthInfo> {
    signed(format!("{}&{}", product_id, device_name), psk.as_bytes(), method)
}

/// Tencent: client id `<product><device>`, base64 PSK as key
pub fn tencent(product_id: &str, device_name: &str, psk: &str) -> RhilexResult<AuthInfo> {
    let key = STANDARD.decode(psk).map_err(|e| RhilexError::InvalidParameter {
        param: "devicePsk".to_string(),
        reason: e.to_string(),
    })?;
    signed(format!("{}{}", product_id, device_name), &key, SignMethod::HmacSha256)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_tencent_credentials() {
        let psk = STANDARD.encode(b"secret-key");
        let auth = tencent("PROD", "dev1", &psk).unwrap();
        assert_eq!(auth.client_id, "PRODdev1");

        let fields: Vec<&str> = auth.username.split(';').collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0], "PRODdev1");
        assert_eq!(fields[1], "12010126");
        assert_eq!(fields[2].len(), 5);
        assert!(fields[2].bytes().all(|b| CONN_ID_CHARSET.contains(&b)));
        let expiry: u64 = fields[3].parse().unwrap();
        assert!(expiry > common::time::now_secs() + 10 * 365 * 24 * 3600);

        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret-key").unwrap();
        mac.update(auth.username.as_bytes());
        let expected = format!("{};hmacsha256", hex::encode(mac.finalize().into_bytes()));
        assert_eq!(auth.password, expected);
    }

    #[test]
    fn test_tencent_rejects_bad_psk() {
        assert!(tencent("P", "D", "not base64!").is_err());
    }

    #[test]
    fn test_ithings_credentials() {
        let auth = ithings("P1", "D1", "psk", SignMethod::HmacSha1).unwrap();
        assert_eq!(auth.client_id, "P1&D1");
        assert!(auth.username.starts_with("P1&D1;12010126;"));
        let (digest, method) = auth.password.split_once(';').unwrap();
        assert_eq!(method, "hmacsha1");
        assert_eq!(digest.len(), 40);
    }
}
