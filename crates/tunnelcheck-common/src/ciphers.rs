//! ESP cipher presets and key material.

use rand_core::{OsRng, RngCore};
use serde::Serialize;

use crate::error::ConfigError;

// ── Presets ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyShape {
    /// Combined-mode cipher. The key carries a trailing salt.
    Aead {
        algorithm: &'static str,
        key_len: usize,
        salt_len: usize,
        icv_bits: u32,
    },
    /// Separate encryption and truncated-HMAC keys.
    Split {
        enc_algorithm: &'static str,
        enc_key_len: usize,
        auth_algorithm: &'static str,
        auth_key_len: usize,
        trunc_bits: u32,
    },
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct CipherSuite {
    pub name: &'static str,
    pub shape: KeyShape,
}

pub static AES_GCM_128: CipherSuite = CipherSuite {
    name: "AES-GCM-128",
    shape: KeyShape::Aead {
        algorithm: "rfc4106(gcm(aes))",
        key_len: 16,
        salt_len: 4,
        icv_bits: 128,
    },
};

pub static AES_CBC_HMAC_SHA256: CipherSuite = CipherSuite {
    name: "AES-CBC-HMAC-SHA256",
    shape: KeyShape::Split {
        enc_algorithm: "cbc(aes)",
        enc_key_len: 16,
        auth_algorithm: "hmac(sha256)",
        auth_key_len: 32,
        trunc_bits: 128,
    },
};

pub static CHACHA20_POLY1305: CipherSuite = CipherSuite {
    name: "CHACHA20-POLY1305",
    shape: KeyShape::Aead {
        algorithm: "rfc7539esp(chacha20,poly1305)",
        key_len: 32,
        salt_len: 4,
        icv_bits: 128,
    },
};

/// All presets, in matrix order.
pub static CIPHER_SUITES: [&CipherSuite; 3] =
    [&AES_GCM_128, &AES_CBC_HMAC_SHA256, &CHACHA20_POLY1305];

impl CipherSuite {
    /// Case-insensitive lookup by preset name or short alias
    /// (`gcm`, `cbc`, `chacha`).
    pub fn lookup(name: &str) -> Option<&'static CipherSuite> {
        let wanted = name.trim().to_ascii_uppercase();
        let alias = match wanted.as_str() {
            "GCM" | "AES-GCM" => "AES-GCM-128",
            "CBC" | "AES-CBC" => "AES-CBC-HMAC-SHA256",
            "CHACHA" | "CHACHA20" => "CHACHA20-POLY1305",
            other => other,
        };
        CIPHER_SUITES.iter().copied().find(|s| s.name == alias)
    }

    /// Position in [`CIPHER_SUITES`], used to keep default SPI ranges of
    /// different presets apart.
    pub fn index(&self) -> usize {
        CIPHER_SUITES
            .iter()
            .position(|s| s.name == self.name)
            .unwrap_or(0)
    }

    /// Fresh random keys from the OS CSPRNG.
    pub fn generate_keys(&self) -> KeyMaterial {
        match self.shape {
            KeyShape::Aead {
                key_len, salt_len, ..
            } => KeyMaterial::Aead {
                key: random_bytes(key_len + salt_len),
            },
            KeyShape::Split {
                enc_key_len,
                auth_key_len,
                ..
            } => KeyMaterial::Split {
                auth_key: random_bytes(auth_key_len),
                enc_key: random_bytes(enc_key_len),
            },
        }
    }

    /// Parse a hex key template. AEAD suites take one key (salt included);
    /// split suites take `AUTH,ENC`. A `0x` prefix is optional.
    pub fn parse_keys(&self, text: &str) -> Result<KeyMaterial, ConfigError> {
        match self.shape {
            KeyShape::Aead {
                key_len, salt_len, ..
            } => Ok(KeyMaterial::Aead {
                key: parse_hex(text, key_len + salt_len, "aead key")?,
            }),
            KeyShape::Split {
                enc_key_len,
                auth_key_len,
                ..
            } => {
                let (auth, enc) = text.split_once(',').ok_or_else(|| {
                    ConfigError::new(format!("{} keys must be given as AUTH,ENC", self.name))
                })?;
                Ok(KeyMaterial::Split {
                    auth_key: parse_hex(auth, auth_key_len, "auth key")?,
                    enc_key: parse_hex(enc, enc_key_len, "enc key")?,
                })
            }
        }
    }

    /// The algorithm arguments of `ip xfrm state add` for these keys.
    pub fn xfrm_args(&self, keys: &KeyMaterial) -> Result<Vec<String>, ConfigError> {
        match (self.shape, keys) {
            (
                KeyShape::Aead {
                    algorithm,
                    icv_bits,
                    ..
                },
                KeyMaterial::Aead { key },
            ) => Ok(vec![
                "aead".into(),
                algorithm.into(),
                format!("0x{}", hex::encode(key)),
                icv_bits.to_string(),
            ]),
            (
                KeyShape::Split {
                    enc_algorithm,
                    auth_algorithm,
                    trunc_bits,
                    ..
                },
                KeyMaterial::Split { auth_key, enc_key },
            ) => Ok(vec![
                "auth-trunc".into(),
                auth_algorithm.into(),
                format!("0x{}", hex::encode(auth_key)),
                trunc_bits.to_string(),
                "enc".into(),
                enc_algorithm.into(),
                format!("0x{}", hex::encode(enc_key)),
            ]),
            _ => Err(ConfigError::new(format!(
                "key material does not match cipher {}",
                self.name
            ))),
        }
    }
}

impl std::fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

fn parse_hex(text: &str, expected: usize, what: &str) -> Result<Vec<u8>, ConfigError> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let bytes = hex::decode(digits).map_err(|e| ConfigError::new(format!("{what}: {e}")))?;
    if bytes.len() != expected {
        return Err(ConfigError::new(format!(
            "{what}: expected {expected} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

// ── Key material ────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    Aead { key: Vec<u8> },
    Split { auth_key: Vec<u8>, enc_key: Vec<u8> },
}

impl KeyMaterial {
    /// Copy of these keys with the last two bytes of every key replaced by
    /// `variant` (big-endian).
    ///
    /// Only for capacity probing: the resulting keys share all but 16 bits
    /// and must never protect real traffic.
    pub fn varied(&self, variant: u16) -> KeyMaterial {
        let bump = |key: &[u8]| {
            let mut key = key.to_vec();
            let n = key.len();
            if n >= 2 {
                key[n - 2..].copy_from_slice(&variant.to_be_bytes());
            }
            key
        };
        match self {
            KeyMaterial::Aead { key } => KeyMaterial::Aead { key: bump(key) },
            KeyMaterial::Split { auth_key, enc_key } => KeyMaterial::Split {
                auth_key: bump(auth_key),
                enc_key: bump(enc_key),
            },
        }
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMaterial::Aead { key } => write!(f, "Aead {{ key: <{} bytes> }}", key.len()),
            KeyMaterial::Split { auth_key, enc_key } => write!(
                f,
                "Split {{ auth_key: <{} bytes>, enc_key: <{} bytes> }}",
                auth_key.len(),
                enc_key.len()
            ),
        }
    }
}
