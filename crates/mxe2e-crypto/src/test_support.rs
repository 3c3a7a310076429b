//! Helpers shared by unit tests.

use vodozemac::{base64_decode, base64_encode};

/// Length of the Ed25519 public key at the end of an exported Megolm key.
const SESSION_PUBLIC_KEY_LEN: usize = 32;

/// `ratchet_from` with its public key swapped for the one in `key_from`.
///
/// The result imports fine and reports `key_from`'s session id, but holds an
/// unrelated ratchet.
pub(crate) fn relabel_export(ratchet_from: &str, key_from: &str) -> String {
    let key_from = base64_decode(key_from).unwrap();
    let mut relabelled = base64_decode(ratchet_from).unwrap();
    let start = relabelled.len() - SESSION_PUBLIC_KEY_LEN;
    relabelled[start..].copy_from_slice(&key_from[key_from.len() - SESSION_PUBLIC_KEY_LEN..]);
    base64_encode(relabelled)
}

/// A directory for a file-backed key store that can be taken away to make
/// every flush fail, and put back afterwards.
pub(crate) struct RemovableDir {
    _root: tempfile::TempDir,
    dir: std::path::PathBuf,
}

impl RemovableDir {
    pub(crate) fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("keys");
        std::fs::create_dir(&dir).unwrap();
        Self { _root: root, dir }
    }

    pub(crate) fn store_path(&self) -> std::path::PathBuf {
        self.dir.join("store.bin")
    }

    pub(crate) fn remove(&self) {
        std::fs::remove_dir_all(&self.dir).unwrap();
    }

    pub(crate) fn restore(&self) {
        std::fs::create_dir(&self.dir).unwrap();
    }
}
