//! MD5 challenge/response verification against a configured virtual
//! database. The proxy stores plaintext passwords and computes the same
//! double-MD5 answer the client does:
//! `"md5" + hex(md5(hex(md5(password ‖ user)) ‖ salt))`, NUL-terminated.

use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rand::RngCore;

use herald_common::config::VirtualDatabase;

/// Generate the 4-byte salt for an `AuthenticationMD5Password` challenge.
pub fn generate_salt() -> [u8; 4] {
    let mut salt = [0u8; 4];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// The exact byte sequence a correct client sends in its `PasswordMessage`,
/// trailing NUL included.
pub fn md5_response(password: &str, user: &str, salt: [u8; 4]) -> Vec<u8> {
    let inner = md5_hex(&[password.as_bytes(), user.as_bytes()]);
    let outer = md5_hex(&[inner.as_bytes(), &salt]);
    let mut expected = Vec::with_capacity(3 + outer.len() + 1);
    expected.extend_from_slice(b"md5");
    expected.extend_from_slice(outer.as_bytes());
    expected.push(0);
    expected
}

/// Compare a client's raw `PasswordMessage` payload against the expected
/// answer for this database and user. The payload must carry the `md5`
/// prefix; anything else fails without a digest comparison.
pub fn verify_md5(db: &VirtualDatabase, user: &str, salt: [u8; 4], payload: &[u8]) -> bool {
    if !payload.starts_with(b"md5") {
        return false;
    }
    if db.auth.user != user {
        return false;
    }
    payload == md5_response(&db.auth.password, user, salt).as_slice()
}

fn md5_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}
