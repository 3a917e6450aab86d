//! Secure credential files.
//!
//! Files live in a memory-backed directory, are owner read/write only, and
//! are named after a hash of the token they embed:
//!
//! `<dir>/kubeconfig-<last8(tenant)>-<last8(user)>-<first8(sha256(token))>`
//!
//! Writes go to `<target>.tmp.<pid>.<epoch_ms>.<n>` and are renamed into place.
//! Every path handed out is tracked in [`ActiveFiles`] until released.

use kubecred_core::{CredentialError, CredentialResult, StorageSettings};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::kubeconfig;

/// Owner read/write only.
pub const CREDENTIAL_FILE_MODE: u32 = 0o600;

const FILE_PREFIX: &str = "kubeconfig";

// ============================================================================
// ACTIVE FILE REGISTRY
// ============================================================================

/// Reference-counted set of credential files this process owns.
///
/// Two generations of a cache entry can share one content-addressed path, so
/// a file is deleted only when its last holder releases it.
#[derive(Debug, Default)]
pub struct ActiveFiles {
    state: Mutex<Tracked>,
}

#[derive(Debug, Default)]
struct Tracked {
    files: HashMap<PathBuf, usize>,
    /// Bumped by every sweep. Leases taken before a sweep no longer count.
    sweeps: u64,
}

impl ActiveFiles {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the sweep generation the claim belongs to.
    fn acquire(&self, path: &Path) -> u64 {
        let mut state = self.lock();
        *state.files.entry(path.to_path_buf()).or_insert(0) += 1;
        state.sweeps
    }

    /// Drop one reference; delete the file when none remain.
    ///
    /// A claim from before the last sweep still deletes its path, since
    /// whatever it wrote after the sweep is not tracked anywhere else.
    fn release(&self, path: &Path, generation: u64) {
        let mut state = self.lock();
        if generation != state.sweeps {
            if !state.files.contains_key(path) {
                remove_quietly(path);
            }
            return;
        }
        let remaining = match state.files.get_mut(path) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining == 0 {
            state.files.remove(path);
            // Unlink under the lock so a concurrent acquire of the same path
            // cannot have its fresh file removed.
            remove_quietly(path);
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.lock().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().files.is_empty()
    }

    /// Delete every tracked file regardless of holders. Returns how many
    /// paths were tracked.
    pub fn sweep(&self) -> usize {
        let mut state = self.lock();
        let count = state.files.len();
        for path in state.files.keys() {
            remove_quietly(path);
        }
        state.files.clear();
        state.sweeps += 1;
        count
    }
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "credential file deleted"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to delete credential file"),
    }
}

// ============================================================================
// FILE LEASE
// ============================================================================

/// One holder's claim on a tracked credential file.
///
/// Releasing is idempotent. There is no release on drop: the owner decides.
#[derive(Debug)]
pub struct FileLease {
    path: PathBuf,
    active: Arc<ActiveFiles>,
    generation: u64,
    released: AtomicBool,
}

impl FileLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Give up the claim. Only the first call has an effect.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.active.release(&self.path, self.generation);
        }
    }
}

// ============================================================================
// SECURE FILE STORE
// ============================================================================

pub struct SecureFileStore {
    dir: PathBuf,
    verify_reused_content: bool,
    active: Arc<ActiveFiles>,
}

impl SecureFileStore {
    pub fn new(settings: &StorageSettings, active: Arc<ActiveFiles>) -> Self {
        Self {
            dir: settings.credential_dir.clone(),
            verify_reused_content: settings.verify_reused_content,
            active,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn active_files(&self) -> &Arc<ActiveFiles> {
        &self.active
    }

    /// Content-addressed target path for a token.
    pub fn target_path(&self, tenant_id: &str, user_object_id: &str, token: &str) -> PathBuf {
        let hash = hex::encode(Sha256::digest(token.as_bytes()));
        let name = [
            FILE_PREFIX,
            last_chars(tenant_id, 8),
            last_chars(user_object_id, 8),
            &hash[..8],
        ]
        .join("-");
        self.dir.join(name)
    }

    /// Register a claim on `path` before anything is written there.
    pub fn lease(&self, path: PathBuf) -> FileLease {
        let generation = self.active.acquire(&path);
        FileLease {
            path,
            active: Arc::clone(&self.active),
            generation,
            released: AtomicBool::new(false),
        }
    }

    /// # Errors
    /// `TempFileCreationFailed` if the directory is missing or this process
    /// cannot create files in it.
    pub async fn ensure_dir_writable(&self) -> CredentialResult<()> {
        let unavailable = || {
            CredentialError::temp_file_creation_failed(format!(
                "{} is not available for secure file storage",
                self.dir.display()
            ))
        };
        let meta = tokio::fs::metadata(&self.dir).await.map_err(|_| unavailable())?;
        if !meta.is_dir() || meta.permissions().readonly() {
            return Err(unavailable());
        }
        // Mode bits do not say whether this uid may write here (owner, ACLs,
        // read-only mounts), so create and remove a marker file.
        let marker = self.dir.join(format!(".{FILE_PREFIX}-write-check.{}", unique_suffix()));
        if let Err(e) = write_private(&marker, "").await {
            tracing::warn!(dir = %self.dir.display(), error = %e, "credential directory is not writable");
            return Err(unavailable());
        }
        remove_quietly_async(&marker).await;
        Ok(())
    }

    /// Whether the file at `path` can be used as-is for `user_object_id`
    /// and `token`: a regular file with mode 0600 and, unless disabled, the
    /// same embedded identity.
    pub async fn is_reusable(&self, path: &Path, user_object_id: &str, token: &str) -> bool {
        let Ok(meta) = tokio::fs::symlink_metadata(path).await else {
            return false;
        };
        if !meta.is_file() || meta.permissions().mode() & 0o777 != CREDENTIAL_FILE_MODE {
            return false;
        }
        if !self.verify_reused_content {
            return true;
        }
        let Ok(contents) = tokio::fs::read_to_string(path).await else {
            return false;
        };
        match kubeconfig::embedded_identity(&contents) {
            Some(identity) => identity.user_name == user_object_id && identity.token == token,
            None => false,
        }
    }

    /// Atomically place `contents` at `target` with mode 0600.
    ///
    /// If the rename fails but a usable file for the same identity is
    /// already at `target`, that file is kept.
    pub async fn write_atomic(
        &self,
        target: &Path,
        contents: &str,
        user_object_id: &str,
        token: &str,
    ) -> CredentialResult<()> {
        self.ensure_dir_writable().await?;

        let temp = temp_path_for(target);
        if let Err(e) = write_private(&temp, contents).await {
            remove_quietly_async(&temp).await;
            return Err(CredentialError::temp_file_creation_failed(format!(
                "Failed to create secure kubeconfig: {e}"
            )));
        }

        if let Err(rename_error) = tokio::fs::rename(&temp, target).await {
            remove_quietly_async(&temp).await;
            if self.is_reusable(target, user_object_id, token).await {
                tracing::debug!(path = %target.display(), "rename failed, reusing existing credential file");
                return Ok(());
            }
            return Err(CredentialError::temp_file_creation_failed(format!(
                "Failed to create secure kubeconfig: {rename_error}"
            )));
        }

        tracing::debug!(path = %target.display(), bytes = contents.len(), "credential file written");
        Ok(())
    }
}

impl std::fmt::Debug for SecureFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureFileStore")
            .field("dir", &self.dir)
            .field("verify_reused_content", &self.verify_reused_content)
            .field("active_files", &self.active.len())
            .finish()
    }
}

fn last_chars(value: &str, n: usize) -> &str {
    let count = value.chars().count();
    match value.char_indices().nth(count.saturating_sub(n)) {
        Some((idx, _)) => &value[idx..],
        None => value,
    }
}

/// `<pid>.<epoch_ms>.<n>`, distinct for every call within this process.
fn unique_suffix() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}.{}.{}", std::process::id(), millis, n)
}

fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(format!(".tmp.{}", unique_suffix()));
    PathBuf::from(name)
}

async fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(CREDENTIAL_FILE_MODE)
        .open(path)
        .await?;
    file.write_all(contents.as_bytes()).await?;
    file.sync_all().await?;
    // umask cannot widen the mode, but an inherited ACL default could
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(CREDENTIAL_FILE_MODE)).await
}

async fn remove_quietly_async(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to delete temporary file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubecred_core::ErrorKind;
    use proptest::prelude::*;

    fn store_in(dir: &Path, verify: bool) -> SecureFileStore {
        let settings = StorageSettings {
            credential_dir: dir.to_path_buf(),
            verify_reused_content: verify,
        };
        SecureFileStore::new(&settings, Arc::new(ActiveFiles::new()))
    }

    fn document(user: &str, token: &str) -> String {
        format!("users:\n- name: {user}\n  user:\n    token: {token}\ncontexts:\n- name: c\n  context:\n    user: {user}\n")
    }

    fn mode_of(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn test_target_path_format() {
        let store = store_in(Path::new("/dev/shm"), true);
        let path = store.target_path(
            "72f988bf-86f1-41af-91ab-2d7cd011db47",
            "00000000-0000-0000-0000-0000abcd1234",
            "token",
        );
        let expected_hash = &hex::encode(Sha256::digest(b"token"))[..8];
        assert_eq!(
            path,
            PathBuf::from(format!("/dev/shm/kubeconfig-d011db47-abcd1234-{expected_hash}"))
        );
    }

    #[test]
    fn test_short_ids_used_whole() {
        let store = store_in(Path::new("/x"), true);
        let path = store.target_path("t1", "u1", "tok");
        assert!(path.to_string_lossy().starts_with("/x/kubeconfig-t1-u1-"));
    }

    #[tokio::test]
    async fn test_written_file_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), true);
        let target = store.target_path("tenant", "user", "tok");

        store.write_atomic(&target, &document("user", "tok"), "user", "tok").await.unwrap();

        assert_eq!(mode_of(&target), 0o600);
        // no temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_reuse_requires_0600() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), false);
        let target = dir.path().join("kubeconfig-a-b-c");
        std::fs::write(&target, document("user", "tok")).unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(!store.is_reusable(&target, "user", "tok").await);

        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o600)).unwrap();
        assert!(store.is_reusable(&target, "user", "tok").await);
    }

    #[tokio::test]
    async fn test_reuse_verifies_embedded_token() {
        let dir = tempfile::tempdir().unwrap();
        let verifying = store_in(dir.path(), true);
        let permissive = store_in(dir.path(), false);
        let target = dir.path().join("kubeconfig-a-b-c");
        verifying
            .write_atomic(&target, &document("user", "stale"), "user", "stale")
            .await
            .unwrap();

        assert!(!verifying.is_reusable(&target, "user", "fresh").await);
        assert!(!verifying.is_reusable(&target, "other-user", "stale").await);
        assert!(verifying.is_reusable(&target, "user", "stale").await);
        assert!(permissive.is_reusable(&target, "user", "fresh").await);
    }

    #[tokio::test]
    async fn test_missing_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir.path().join("absent"), true);
        let target = store.target_path("t", "u", "tok");
        let err = store.write_atomic(&target, "x", "u", "tok").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TempFileCreationFailed);
        assert_eq!(err.public_message(), "System configuration error");
    }

    #[tokio::test]
    async fn test_rename_failure_reuses_valid_target() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), true);
        // a directory at the target makes the rename fail
        let blocked = dir.path().join("kubeconfig-blocked");
        std::fs::create_dir(&blocked).unwrap();
        let err = store.write_atomic(&blocked, "x", "u", "t").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TempFileCreationFailed);
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_lease_release_is_idempotent_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), true);
        let path = dir.path().join("kubeconfig-x");
        std::fs::write(&path, "x").unwrap();

        let lease = store.lease(path.clone());
        assert!(store.active_files().contains(&path));
        lease.release();
        lease.release();
        assert!(lease.is_released());
        assert!(!path.exists());
        assert!(store.active_files().is_empty());
    }

    #[test]
    fn test_shared_path_deleted_by_last_holder() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), true);
        let path = dir.path().join("kubeconfig-shared");
        std::fs::write(&path, "x").unwrap();

        let first = store.lease(path.clone());
        let second = store.lease(path.clone());
        first.release();
        assert!(path.exists());
        second.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_sweep_deletes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), true);
        let paths: Vec<PathBuf> = (0..3).map(|i| dir.path().join(format!("kubeconfig-{i}"))).collect();
        let leases: Vec<FileLease> = paths
            .iter()
            .map(|p| {
                std::fs::write(p, "x").unwrap();
                store.lease(p.clone())
            })
            .collect();

        assert_eq!(store.active_files().sweep(), 3);
        assert!(paths.iter().all(|p| !p.exists()));
        // releasing after a sweep is harmless
        leases.iter().for_each(FileLease::release);
    }

    #[test]
    fn test_lease_from_before_sweep_deletes_late_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), true);
        let path = dir.path().join("kubeconfig-late");

        let lease = store.lease(path.clone());
        store.active_files().sweep();
        // the holder finishes its write after the sweep ran
        std::fs::write(&path, "x").unwrap();
        lease.release();

        assert!(!path.exists());
        assert!(store.active_files().is_empty());
    }

    #[test]
    fn test_stale_lease_spares_path_claimed_after_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), true);
        let path = dir.path().join("kubeconfig-reclaimed");

        let stale = store.lease(path.clone());
        store.active_files().sweep();
        let fresh = store.lease(path.clone());
        std::fs::write(&path, "x").unwrap();

        stale.release();
        assert!(path.exists());
        fresh.release();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_writable_check_leaves_no_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), true);
        store.ensure_dir_writable().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unwritable_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();
        if std::fs::write(locked.join("canary"), "x").is_ok() {
            // privileged users ignore mode bits
            std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let store = store_in(&locked, true);
        let err = store.ensure_dir_writable().await.unwrap_err();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(err.kind, ErrorKind::TempFileCreationFailed);
    }

    #[tokio::test]
    async fn test_regular_file_as_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("plain");
        std::fs::write(&not_a_dir, "x").unwrap();
        let store = store_in(&not_a_dir, true);
        let err = store.ensure_dir_writable().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TempFileCreationFailed);
    }

    #[test]
    fn test_last_chars_handles_multibyte() {
        assert_eq!(last_chars("abcdefghij", 8), "cdefghij");
        assert_eq!(last_chars("äöü", 8), "äöü");
        assert_eq!(last_chars("xxäöüäöüäö", 8), "äöüäöüäö");
    }

    proptest! {
        #[test]
        fn prop_tenants_never_share_paths(
            tenant_a in "[0-9a-f]{8}", tenant_b in "[0-9a-f]{8}", user in "[0-9a-f]{8}"
        ) {
            prop_assume!(tenant_a != tenant_b);
            let store = store_in(Path::new("/dev/shm"), true);
            prop_assert_ne!(
                store.target_path(&tenant_a, &user, "same-token"),
                store.target_path(&tenant_b, &user, "same-token")
            );
        }
    }
}
