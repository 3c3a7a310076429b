//! Encrypted on-disk mirror of the key store.
//!
//! The store is pickled into a [`StoreSnapshot`], serialized with postcard
//! and sealed with AES-256-GCM under a key derived from the user's
//! passphrase with PBKDF2-HMAC-SHA256. The key is derived once per open;
//! each save draws a fresh nonce.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::session::SessionDirection;

const MAGIC: &[u8; 4] = b"MXKS"; // "Matrix Key Store"
const VERSION: u8 = 0x01;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 4 + 1 + SALT_LEN + NONCE_LEN + 4; // 53 bytes

#[derive(Serialize, Deserialize)]
pub struct OlmSessionRecord {
    pub peer_identity_key: String,
    pub direction: SessionDirection,
    pub created_at: u64,
    pub last_used: u64,
    pub pickle: Zeroizing<String>,
}

#[derive(Serialize, Deserialize)]
pub struct OutboundGroupSessionRecord {
    pub room_id: String,
    pub created_at: u64,
    pub pickle: Zeroizing<String>,
}

#[derive(Serialize, Deserialize)]
pub struct InboundGroupSessionRecord {
    pub room_id: String,
    pub sender_key: Option<String>,
    pub signing_key: Option<String>,
    pub forwarding_chain: Vec<String>,
    pub imported: bool,
    pub pickle: Zeroizing<String>,
}

/// Everything the key store holds, in pickled form.
#[derive(Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub account: Option<Zeroizing<String>>,
    pub olm_sessions: Vec<OlmSessionRecord>,
    pub outbound_group_sessions: Vec<OutboundGroupSessionRecord>,
    pub inbound_group_sessions: Vec<InboundGroupSessionRecord>,
}

/// Derive a 256-bit AES-GCM key from passphrase and salt.
fn derive_key(passphrase: &str, salt: &[u8; SALT_LEN], iterations: u32) -> anyhow::Result<LessSafeKey> {
    let iterations = NonZeroU32::new(iterations)
        .ok_or_else(|| anyhow::anyhow!("kdf iterations must be non-zero"))?;
    let mut key_bytes = Zeroizing::new([0u8; 32]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase.as_bytes(),
        &mut key_bytes[..],
    );
    let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes[..])
        .map_err(|_| anyhow::anyhow!("invalid AES-256-GCM key length"))?;
    Ok(LessSafeKey::new(unbound))
}

fn aad() -> [u8; 5] {
    let mut aad_bytes = [0u8; 5];
    aad_bytes[..4].copy_from_slice(MAGIC);
    aad_bytes[4] = VERSION;
    aad_bytes
}

/// Check if file data starts with a valid MXKS header.
pub fn has_valid_header(file_data: &[u8]) -> bool {
    file_data.len() >= HEADER_LEN && &file_data[0..4] == MAGIC && file_data[4] == VERSION
}

/// An encrypted file holding one [`StoreSnapshot`].
///
/// File format: [MXKS magic(4)] [version(1)] [salt(32)] [nonce(12)] [length(4)] [encrypted payload + tag(16)]
pub struct EncryptedFileStore {
    path: PathBuf,
    key: LessSafeKey,
    salt: [u8; SALT_LEN],
    rng: SystemRandom,
}

impl std::fmt::Debug for EncryptedFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFileStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl EncryptedFileStore {
    /// Open `path`, decrypting its snapshot if the file exists.
    ///
    /// A missing file yields a store with a fresh salt and no snapshot.
    pub fn open(
        path: &Path,
        passphrase: &str,
        kdf_iterations: u32,
    ) -> anyhow::Result<(Self, Option<StoreSnapshot>)> {
        let rng = SystemRandom::new();

        if !path.exists() {
            let mut salt = [0u8; SALT_LEN];
            rng.fill(&mut salt)
                .map_err(|_| anyhow::anyhow!("RNG failed"))?;
            let key = derive_key(passphrase, &salt, kdf_iterations)?;
            debug!(path = %path.display(), "creating new key store file");
            return Ok((
                Self {
                    path: path.to_path_buf(),
                    key,
                    salt,
                    rng,
                },
                None,
            ));
        }

        let file_data = std::fs::read(path)?;
        if file_data.len() < HEADER_LEN {
            anyhow::bail!("key store file too short");
        }
        if &file_data[0..4] != MAGIC {
            anyhow::bail!("invalid file format (expected MXKS header)");
        }
        if file_data[4] != VERSION {
            anyhow::bail!("unsupported key store version {}", file_data[4]);
        }

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&file_data[5..5 + SALT_LEN]);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&file_data[37..37 + NONCE_LEN]);

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&file_data[49..HEADER_LEN]);
        let payload_len = u32::from_be_bytes(len_bytes) as usize;

        if file_data.len() < HEADER_LEN + payload_len {
            anyhow::bail!("key store file truncated");
        }

        let key = derive_key(passphrase, &salt, kdf_iterations)?;

        let mut ciphertext = Zeroizing::new(file_data[HEADER_LEN..HEADER_LEN + payload_len].to_vec());
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        let plaintext = key
            .open_in_place(nonce, Aad::from(&aad()), ciphertext.as_mut_slice())
            .map_err(|_| anyhow::anyhow!("incorrect passphrase or corrupted key store"))?;

        let snapshot: StoreSnapshot = postcard::from_bytes(plaintext)
            .map_err(|e| anyhow::anyhow!("deserialization failed: {e}"))?;

        debug!(
            path = %path.display(),
            olm_sessions = snapshot.olm_sessions.len(),
            inbound_group_sessions = snapshot.inbound_group_sessions.len(),
            "loaded key store"
        );
        Ok((
            Self {
                path: path.to_path_buf(),
                key,
                salt,
                rng,
            },
            Some(snapshot),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encrypt and write a snapshot. The previous file is replaced only once
    /// the new one is fully written.
    pub fn save(&self, snapshot: &StoreSnapshot) -> anyhow::Result<()> {
        let mut in_out = Zeroizing::new(
            postcard::to_allocvec(snapshot)
                .map_err(|e| anyhow::anyhow!("serialization failed: {e}"))?,
        );

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| anyhow::anyhow!("RNG failed"))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        self.key
            .seal_in_place_append_tag(nonce, Aad::from(&aad()), &mut *in_out)
            .map_err(|_| anyhow::anyhow!("encryption failed"))?;

        let payload_len = u32::try_from(in_out.len())
            .map_err(|_| anyhow::anyhow!("key store snapshot too large"))?;
        let mut file_data = Vec::with_capacity(HEADER_LEN + in_out.len());
        file_data.extend_from_slice(MAGIC);
        file_data.push(VERSION);
        file_data.extend_from_slice(&self.salt);
        file_data.extend_from_slice(&nonce_bytes);
        file_data.extend_from_slice(&payload_len.to_be_bytes());
        file_data.extend_from_slice(&in_out);

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &file_data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITERATIONS: u32 = 1_000;

    fn sample() -> StoreSnapshot {
        StoreSnapshot {
            account: Some(Zeroizing::new("account-pickle".into())),
            olm_sessions: vec![OlmSessionRecord {
                peer_identity_key: "peer".into(),
                direction: SessionDirection::Inbound,
                created_at: 1,
                last_used: 2,
                pickle: Zeroizing::new("olm-pickle".into()),
            }],
            outbound_group_sessions: Vec::new(),
            inbound_group_sessions: vec![InboundGroupSessionRecord {
                room_id: "!r:x".into(),
                sender_key: Some("curve".into()),
                signing_key: None,
                forwarding_chain: vec!["fwd".into()],
                imported: true,
                pickle: Zeroizing::new("megolm-pickle".into()),
            }],
        }
    }

    #[test]
    fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (_, snapshot) =
            EncryptedFileStore::open(&dir.path().join("keys.bin"), "pw", ITERATIONS).unwrap();
        assert!(snapshot.is_none());
    }

    #[test]
    fn save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.bin");
        let (store, _) = EncryptedFileStore::open(&path, "pw", ITERATIONS).unwrap();
        store.save(&sample()).unwrap();
        // Saving twice keeps the salt, so the same passphrase still opens it.
        store.save(&sample()).unwrap();

        let data = std::fs::read(&path).unwrap();
        assert!(has_valid_header(&data));

        let (_, snapshot) = EncryptedFileStore::open(&path, "pw", ITERATIONS).unwrap();
        let snapshot = snapshot.unwrap();
        assert_eq!(snapshot.account.as_deref().map(String::as_str), Some("account-pickle"));
        assert_eq!(snapshot.olm_sessions[0].direction, SessionDirection::Inbound);
        assert_eq!(snapshot.inbound_group_sessions[0].forwarding_chain, vec!["fwd"]);
        assert!(!dir.path().join("keys.tmp").exists());
    }

    #[test]
    fn wrong_passphrase_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.bin");
        let (store, _) = EncryptedFileStore::open(&path, "right", ITERATIONS).unwrap();
        store.save(&sample()).unwrap();

        let err = EncryptedFileStore::open(&path, "wrong", ITERATIONS).err().unwrap();
        assert!(err.to_string().contains("incorrect passphrase"));
    }

    #[test]
    fn bad_header_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.bin");
        std::fs::write(&path, [0u8; HEADER_LEN + 8]).unwrap();
        assert!(EncryptedFileStore::open(&path, "pw", ITERATIONS).is_err());
        assert!(!has_valid_header(&[0u8; 10]));
    }

    #[test]
    fn truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.bin");
        let (store, _) = EncryptedFileStore::open(&path, "pw", ITERATIONS).unwrap();
        store.save(&sample()).unwrap();
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 5]).unwrap();

        let err = EncryptedFileStore::open(&path, "pw", ITERATIONS).err().unwrap();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn zero_iterations_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EncryptedFileStore::open(&dir.path().join("k"), "pw", 0).is_err());
    }
}
