//! Metadata persistence: a flat directory of vpc documents.
//!
//! One pretty-printed JSON file per vpc, named by a filesystem-safe encoding
//! of the vpc name. Writes go to a temp file in the same directory and are
//! renamed into place, so a document is only ever observable fully formed.
//! Mutating operations serialize on an exclusive flock held for their whole
//! duration; readers skip the lock and may observe intermediate states.

use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::error::{Error, Result};
use crate::policy::PolicyDoc;
use crate::types::VpcDoc;

/// Default data directory, relative to the working directory.
pub const DEFAULT_DATA_DIR: &str = ".vpcctl_data";

pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn doc_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_file_name(name)))
    }

    /// Log path for a workload running inside `ns`.
    pub fn app_log_path(&self, ns: &str) -> PathBuf {
        self.dir.join("logs").join(format!("{ns}.log"))
    }

    /// Block until this process holds the store's exclusive lock.
    ///
    /// The guard holds the lock until dropped.
    pub async fn lock(&self) -> Result<Flock<std::fs::File>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(".lock");
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::options()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)?;
            Flock::lock(file, FlockArg::LockExclusive)
                .map_err(|(_file, errno)| Error::Io(std::io::Error::from_raw_os_error(errno as i32)))
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(format!("lock task: {e}"))))?
    }

    /// Load a document; `Ok(None)` when the vpc does not exist.
    pub async fn load(&self, name: &str) -> Result<Option<VpcDoc>> {
        let path = self.doc_path(name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let doc: VpcDoc = serde_json::from_str(&content)
            .map_err(|e| Error::StateCorrupt(format!("{}: {e}", path.display())))?;
        Ok(Some(doc))
    }

    /// Load a document or fail with `NotFound`.
    pub async fn must_load(&self, name: &str) -> Result<VpcDoc> {
        self.load(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("vpc {name}")))
    }

    /// Atomically write a document.
    pub async fn save(&self, doc: &VpcDoc) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| Error::StateCorrupt(format!("serialize {}: {e}", doc.name)))?;
        write_atomic(&self.doc_path(&doc.name), format!("{json}\n").as_bytes()).await
    }

    /// Remove a document; absent is not an error.
    pub async fn remove(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.doc_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of all stored vpcs, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file = entry.file_name();
            let Some(file) = file.to_str() else { continue };
            if let Some(encoded) = file.strip_suffix(".json") {
                names.push(decode_file_name(encoded));
            }
        }
        names.sort();
        Ok(names)
    }

    /// Write an inspection copy of a policy applied to `vpc`/`subnet`.
    ///
    /// The authoritative record lives inside the vpc document; this copy
    /// exists so an operator can read what was applied without parsing it
    /// back out.
    pub async fn save_policy(&self, vpc: &str, subnet: &str, policy: &PolicyDoc) -> Result<()> {
        let dir = self.dir.join("policies");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!(
            "{}-{}.json",
            encode_file_name(vpc),
            encode_file_name(subnet)
        ));
        let json = serde_json::to_string_pretty(policy)
            .map_err(|e| Error::StateCorrupt(format!("serialize policy: {e}")))?;
        write_atomic(&path, format!("{json}\n").as_bytes()).await
    }
}

/// Temp file in the same directory, then rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Encode a vpc name into a filename, escaping anything outside
/// `[A-Za-z0-9._-]` as `%XX`.
fn encode_file_name(name: &str) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        let c = byte as char;
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
            out.push(c);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

fn decode_file_name(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len());
    let mut chars = encoded.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let hi = chars.next();
        let lo = chars.next();
        if let (Some(hi), Some(lo)) = (hi, lo)
            && let (Some(h), Some(l)) = (hi.to_digit(16), lo.to_digit(16))
        {
            out.push((h * 16 + l) as u8 as char);
            continue;
        }
        // Malformed escape: keep the raw characters.
        out.push('%');
        out.extend(hi);
        out.extend(lo);
    }
    out
}
