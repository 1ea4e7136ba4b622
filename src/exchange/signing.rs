use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over a query payload, hex-encoded. Binance and Bybit style.
pub fn sign_hex(secret: &str, payload: &str) -> Result<String, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// HMAC-SHA256 over a prehash string, base64-encoded. OKX style.
pub fn sign_base64(secret: &str, payload: &str) -> Result<String, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(payload.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// OKX prehash: timestamp + UPPERCASE method + request path (with query) + body
pub fn okx_prehash(timestamp: &str, method: &str, request_path: &str, body: &str) -> String {
    format!("{}{}{}{}", timestamp, method, request_path, body)
}

/// Bybit v5 prehash: timestamp + api key + recv window + query-or-body
pub fn bybit_prehash(timestamp: &str, api_key: &str, recv_window: &str, payload: &str) -> String {
    format!("{}{}{}{}", timestamp, api_key, recv_window, payload)
}
