//! Password scrambling.
//!
//! Stored passwords are XORed with a site key and base64-encoded for
//! transport. This keeps credentials out of casual view in the passwd
//! buffer and on the operator wire; it is not cryptography.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::Result;

/// Key compiled in when the site has not installed `etc/.xor.key`.
const DEFAULT_XOR_KEY: &[u8] = b"drift-scramble-key";

/// Site scrambling key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XorKey(Vec<u8>);

impl XorKey {
    /// The compiled-in fallback key.
    pub fn compiled_in() -> Self {
        Self(DEFAULT_XOR_KEY.to_vec())
    }

    /// Load the key from `etc/.xor.key`, falling back to the compiled-in
    /// key when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) if !bytes.is_empty() => Ok(Self(bytes)),
            Ok(_) => Ok(Self::compiled_in()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::compiled_in()),
            Err(e) => Err(e.into()),
        }
    }

    fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .zip(self.0.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }
}

/// Scramble `plain` and encode it for transport.
pub fn xor_encrypt(key: &XorKey, plain: &[u8]) -> String {
    STANDARD.encode(key.apply(plain))
}

/// Decode and unscramble a transport string.
pub fn xor_decrypt(key: &XorKey, encoded: &str) -> Result<Vec<u8>> {
    let raw = STANDARD.decode(encoded)?;
    Ok(key.apply(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scramble_roundtrip() {
        let key = XorKey::compiled_in();
        let secret = b"hunter2";

        let wire = xor_encrypt(&key, secret);
        assert_ne!(wire.as_bytes(), secret.as_slice());
        assert_eq!(xor_decrypt(&key, &wire).unwrap(), secret);
    }

    #[test]
    fn test_key_file_overrides_compiled_in() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(".xor.key");
        std::fs::write(&path, b"site-key").unwrap();

        let site = XorKey::load(&path).unwrap();
        assert_ne!(site, XorKey::compiled_in());

        let wire = xor_encrypt(&site, b"pw");
        assert_eq!(xor_decrypt(&site, &wire).unwrap(), b"pw");
    }

    #[test]
    fn test_missing_key_file_falls_back() {
        let temp = tempfile::tempdir().unwrap();
        let key = XorKey::load(&temp.path().join("nope")).unwrap();
        assert_eq!(key, XorKey::compiled_in());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let key = XorKey::compiled_in();
        assert!(xor_decrypt(&key, "!!! not base64 !!!").is_err());
    }
}
