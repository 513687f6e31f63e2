use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::error::{ProxyError, ProxyResult};

const BEGIN_MARKER: &str = "# BEGIN rai-connect";
const END_MARKER: &str = "# END rai-connect";

const LOCK_RETRIES: u32 = 3;
const LOCK_BACKOFF_BASE_MS: u64 = 50;

/// Owns the delimited block of `127.0.0.1 <alias>` lines this proxy needs in
/// the OS hosts file. Lines outside the block are never touched.
pub struct HostsFileManager {
    hosts_path: PathBuf,
}

impl HostsFileManager {
    pub fn new(hosts_path: impl Into<PathBuf>) -> Self {
        Self {
            hosts_path: hosts_path.into(),
        }
    }

    #[cfg(windows)]
    pub fn system_default() -> Self {
        let system_root =
            std::env::var("SystemRoot").unwrap_or_else(|_| "C:\\Windows".to_owned());
        Self::new(PathBuf::from(system_root).join("System32\\drivers\\etc\\hosts"))
    }

    #[cfg(not(windows))]
    pub fn system_default() -> Self {
        Self::new("/etc/hosts")
    }

    /// Replace the block's contents with `aliases`, writing one
    /// `127.0.0.1 <alias>` line per entry. Appends a new block if none
    /// exists. Idempotent: calling this twice with the same input leaves the
    /// file byte-identical.
    pub async fn ensure_aliases(&self, aliases: &[String]) -> ProxyResult<()> {
        let _lock = self.acquire_lock().await?;

        let original = read_to_string_or_empty(&self.hosts_path).await?;
        let updated = replace_block(&original, aliases);

        if updated != original {
            write_atomic(&self.hosts_path, &updated).await?;
            info!(alias_count = aliases.len(), "updated hosts file block");
        }

        Ok(())
    }

    /// Delete the block, including its markers, if present.
    pub async fn remove_block(&self) -> ProxyResult<()> {
        let _lock = self.acquire_lock().await?;

        let original = read_to_string_or_empty(&self.hosts_path).await?;
        let updated = remove_block(&original);

        if updated != original {
            write_atomic(&self.hosts_path, &updated).await?;
            info!("removed hosts file block");
        }

        Ok(())
    }

    async fn acquire_lock(&self) -> ProxyResult<LockGuard> {
        let lock_path = lock_path_for(&self.hosts_path);
        let mut attempt = 0;

        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(_) => return Ok(LockGuard { lock_path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    attempt += 1;
                    if attempt > LOCK_RETRIES {
                        return Err(ProxyError::setup(format!(
                            "could not acquire hosts file lock after {LOCK_RETRIES} retries"
                        )));
                    }
                    let backoff = LOCK_BACKOFF_BASE_MS * 3u64.pow(attempt - 1);
                    warn!(attempt, backoff, "hosts file locked, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => {
                    return Err(ProxyError::setup(format!(
                        "failed to create hosts file lock: {e}"
                    )))
                }
            }
        }
    }
}

struct LockGuard {
    lock_path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

fn lock_path_for(hosts_path: &Path) -> PathBuf {
    let mut name = hosts_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "hosts".to_owned());
    name.push_str(".rai-connect.lock");
    hosts_path
        .parent()
        .map(|p| p.join(&name))
        .unwrap_or_else(|| PathBuf::from(name))
}

async fn read_to_string_or_empty(path: &Path) -> ProxyResult<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(ProxyError::setup(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

/// Replace (or append) the delimited block, preserving everything outside it
/// byte-for-byte.
fn replace_block(original: &str, aliases: &[String]) -> String {
    let block_body: String = aliases
        .iter()
        .map(|alias| format!("127.0.0.1 {alias}\n"))
        .collect();
    let new_block = format!("{BEGIN_MARKER}\n{block_body}{END_MARKER}\n");

    match find_block_span(original) {
        Some((start, end)) => {
            let mut out = String::with_capacity(original.len() + new_block.len());
            out.push_str(&original[..start]);
            out.push_str(&new_block);
            out.push_str(&original[end..]);
            out
        }
        None => {
            let mut out = original.to_owned();
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&new_block);
            out
        }
    }
}

fn remove_block(original: &str) -> String {
    match find_block_span(original) {
        Some((start, end)) => {
            let mut out = String::with_capacity(original.len());
            out.push_str(&original[..start]);
            // Drop exactly one adjacent trailing newline the block owned,
            // leave any further surrounding whitespace untouched.
            let rest = &original[end..];
            out.push_str(rest);
            out
        }
        None => original.to_owned(),
    }
}

/// Byte offsets of `[start_of_begin_marker_line, end_after_end_marker_line)`.
fn find_block_span(original: &str) -> Option<(usize, usize)> {
    let begin_idx = original.find(BEGIN_MARKER)?;
    let after_begin = begin_idx + BEGIN_MARKER.len();
    let end_marker_idx = original[after_begin..].find(END_MARKER)? + after_begin;
    let after_end = end_marker_idx + END_MARKER.len();

    // Consume the newline right after END_MARKER, if any, so the block owns
    // exactly its own trailing newline.
    let after_end = if original[after_end..].starts_with('\n') {
        after_end + 1
    } else {
        after_end
    };

    Some((begin_idx, after_end))
}

async fn write_atomic(path: &Path, contents: &str) -> ProxyResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| ProxyError::setup("hosts path has no parent directory"))?;
    let pid = std::process::id();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let file_name = path.file_name().unwrap_or_default().to_string_lossy();
    let tmp_path = parent.join(format!(".{file_name}.tmp.{pid}.{nanos}"));

    tokio::fs::write(&tmp_path, contents)
        .await
        .map_err(|e| ProxyError::setup(format!("failed to write {}: {e}", tmp_path.display())))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| ProxyError::setup(format!("failed to rename into {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_hosts_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "rai-connect-hosts-test-{tag}-{}",
            std::process::id()
        ))
    }

    #[tokio::test]
    async fn ensure_aliases_appends_block_when_absent() {
        let path = temp_hosts_path("append");
        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();

        let mgr = HostsFileManager::new(&path);
        mgr.ensure_aliases(&["osu.ppy.sh".to_owned()]).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("127.0.0.1 localhost\n"));
        assert!(contents.contains(BEGIN_MARKER));
        assert!(contents.contains("127.0.0.1 osu.ppy.sh"));
        assert!(contents.contains(END_MARKER));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn ensure_aliases_is_idempotent() {
        let path = temp_hosts_path("idempotent");
        std::fs::write(&path, "").unwrap();

        let mgr = HostsFileManager::new(&path);
        let aliases = vec!["osu.ppy.sh".to_owned(), "c.ppy.sh".to_owned()];
        mgr.ensure_aliases(&aliases).await.unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        mgr.ensure_aliases(&aliases).await.unwrap();
        let second = std::fs::read_to_string(&path).unwrap();

        assert_eq!(first, second);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn ensure_aliases_converges_on_new_set() {
        let path = temp_hosts_path("converge");
        std::fs::write(&path, "").unwrap();

        let mgr = HostsFileManager::new(&path);
        mgr.ensure_aliases(&["osu.ppy.sh".to_owned()]).await.unwrap();
        mgr.ensure_aliases(&["c.ppy.sh".to_owned()]).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("osu.ppy.sh"));
        assert!(contents.contains("c.ppy.sh"));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn remove_block_preserves_surrounding_lines() {
        let path = temp_hosts_path("remove");
        std::fs::write(&path, "127.0.0.1 localhost\n::1 localhost\n").unwrap();

        let mgr = HostsFileManager::new(&path);
        mgr.ensure_aliases(&["osu.ppy.sh".to_owned()]).await.unwrap();
        mgr.remove_block().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "127.0.0.1 localhost\n::1 localhost\n");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn remove_block_is_noop_when_absent() {
        let path = temp_hosts_path("remove-noop");
        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();

        let mgr = HostsFileManager::new(&path);
        mgr.remove_block().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "127.0.0.1 localhost\n");

        let _ = std::fs::remove_file(&path);
    }
}
