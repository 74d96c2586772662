use std::path::Path;

use rand::RngCore;

use crate::error::StoreError;

const KEY_LEN: usize = 32;

/// Loads the audit HMAC key from `path`, generating and persisting a fresh
/// one on first boot. The key lives beside the database, never inside it —
/// a dump of the database alone must not be enough to forge a chain entry.
pub async fn load_or_create(path: &Path) -> Result<[u8; KEY_LEN], StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.len() == KEY_LEN => {
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&bytes);
            Ok(key)
        }
        Ok(_) => Err(StoreError::AuditKey(format!(
            "audit key file {} has unexpected length",
            path.display()
        ))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let mut key = [0u8; KEY_LEN];
            rand::thread_rng().fill_bytes(&mut key);
            write_key_file(path, &key).await?;
            Ok(key)
        }
        Err(err) => Err(StoreError::Io(err)),
    }
}

#[cfg(unix)]
async fn write_key_file(path: &Path, key: &[u8; KEY_LEN]) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, key).await?;
    let perms = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn write_key_file(path: &Path, key: &[u8; KEY_LEN]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, key).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn generates_and_reloads_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.key");

        let first = load_or_create(&path).await.unwrap();
        let second = load_or_create(&path).await.unwrap();
        assert_eq!(first, second);
    }
}
