use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

pub const OTP_MIN: u32 = 1000;
pub const OTP_MAX: u32 = 9999;
pub const CAPTCHA_LEN: usize = 6;

pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    to_hex(&Sha256::digest(bytes))
}

pub fn new_salt() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    to_hex(&bytes)
}

pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    to_hex(&hasher.finalize())
}

pub fn verify_password(password: &str, salt: &str, expected_hash: &str) -> bool {
    let actual = hash_password(password, salt);
    // Compare every byte so timing doesn't leak the matching prefix length.
    if actual.len() != expected_hash.len() {
        return false;
    }
    actual
        .bytes()
        .zip(expected_hash.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

pub fn generate_otp() -> String {
    rand::thread_rng().gen_range(OTP_MIN..=OTP_MAX).to_string()
}

pub fn generate_captcha() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CAPTCHA_LEN)
        .map(|b| (b as char).to_ascii_uppercase())
        .collect()
}

/// Contacts are matched against both mobile and email, so normalize the way a
/// user would type either one.
pub fn normalize_contact(raw: &str) -> String {
    let t = raw.trim();
    if t.contains('@') {
        t.to_ascii_lowercase()
    } else {
        t.chars().filter(|c| !c.is_whitespace() && *c != '-').collect()
    }
}
