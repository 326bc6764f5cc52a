use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

/// Extension of submission files dropped into the spool root by producers.
pub const SUBMISSION_EXT: &str = ".json";

/// Suffix appended to a submission file while a worker owns it.
const WORKING_SUFFIX: &str = ".working";

/// Enumeration of errors for spool directory operations.
/// Errors wrap the underlying `io::Error` to provide path context.
#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("failed to create spool directory {path}: {error}")]
    CreateDir { path: PathBuf, error: io::Error },
    #[error("spool directory {path} is not writable: {error}")]
    NotWritable { path: PathBuf, error: io::Error },
    #[error("failed to list spool directory {path}: {error}")]
    List { path: PathBuf, error: io::Error },
    #[error("failed to move {from} to {to}: {error}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        error: io::Error,
    },
}

/// Terminal sub-directory for a processed submission file.
/// Every claimed file ends up in exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Archive,
    Failed,
    PendingRetry,
}

impl Disposition {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Disposition::Archive => "archive",
            Disposition::Failed => "failed",
            Disposition::PendingRetry => "pending_retry",
        }
    }
}

/// A submission file claimed by a worker via an atomic rename.
/// Holds the on-disk working path and the name to restore on routing.
#[derive(Debug)]
pub struct ClaimedFile {
    pub name: String,
    pub path: PathBuf,
    /// How many times this file has been requeued from `pending_retry/`.
    pub attempt: u32,
}

/// Counts from one `pending_retry/` requeue sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetrySweep {
    pub requeued: usize,
    pub quarantined: usize,
}

/// The spool root acting as a durable work queue: loose submission files in
/// the root, plus the `failed/`, `archive/` and `pending_retry/` outcome
/// sub-directories.
#[derive(Debug, Clone)]
pub struct SpoolDir {
    root: PathBuf,
}

impl SpoolDir {
    /// Verify or create the spool root and its outcome sub-directories,
    /// probing each for writability. Also renames back any `*.working` file
    /// left behind by a crashed worker so it is dispatched again.
    pub fn ensure(root: impl Into<PathBuf>) -> Result<Self, SpoolError> {
        let root = root.into();
        let spool = Self { root };

        spool.ensure_writable_dir(&spool.root)?;
        for disposition in [
            Disposition::Archive,
            Disposition::Failed,
            Disposition::PendingRetry,
        ] {
            spool.ensure_writable_dir(&spool.dir_for(disposition))?;
        }
        spool.recover_stale_claims()?;

        Ok(spool)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir_for(&self, disposition: Disposition) -> PathBuf {
        self.root.join(disposition.dir_name())
    }

    /// Snapshot of submission filenames directly in the root, non-recursive.
    /// A point-in-time read with no locking: files may be added or claimed
    /// concurrently, so callers must treat the result as advisory.
    pub fn list_pending(&self) -> Result<Vec<String>, SpoolError> {
        self.list_submissions(&self.root)
    }

    /// Claim a pending file by renaming it to its working name. Returns
    /// `Ok(None)` if another worker won the race, which is not an error.
    pub fn claim(&self, name: &str) -> Result<Option<ClaimedFile>, SpoolError> {
        let from = self.root.join(name);
        let to = self.root.join(format!("{name}{WORKING_SUFFIX}"));

        match fs::rename(&from, &to) {
            Ok(()) => Ok(Some(ClaimedFile {
                name: name.to_owned(),
                attempt: retry_attempt(name),
                path: to,
            })),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(SpoolError::Move { from, to, error }),
        }
    }

    /// Move a claimed file into the sub-directory matching its outcome.
    /// Exactly one rename, never a delete. A move failure is propagated so
    /// the worker stops rather than silently losing the file.
    pub fn route(
        &self,
        claimed: &ClaimedFile,
        disposition: Disposition,
    ) -> Result<PathBuf, SpoolError> {
        let to = self.dir_for(disposition).join(&claimed.name);

        if let Err(error) = fs::rename(&claimed.path, &to) {
            warn!(
                "failed to route {} to {}/: {}",
                claimed.name,
                disposition.dir_name(),
                error
            );
            return Err(SpoolError::Move {
                from: claimed.path.clone(),
                to,
                error,
            });
        }
        Ok(to)
    }

    /// Move files from `pending_retry/` back into the root for another
    /// attempt, bumping the retry marker in their name. Files that have
    /// exhausted `max_retries` are quarantined to `failed/` instead.
    pub fn requeue_pending_retries(&self, max_retries: u32) -> Result<RetrySweep, SpoolError> {
        let retry_dir = self.dir_for(Disposition::PendingRetry);
        let mut sweep = RetrySweep::default();

        for name in self.list_submissions(&retry_dir)? {
            let from = retry_dir.join(&name);
            let attempt = retry_attempt(&name) + 1;

            if attempt > max_retries {
                let to = self.dir_for(Disposition::Failed).join(&name);
                fs::rename(&from, &to).map_err(|error| SpoolError::Move {
                    from: from.clone(),
                    to,
                    error,
                })?;
                warn!("{} exhausted {} retries, quarantined", name, max_retries);
                sweep.quarantined += 1;
            } else {
                let to = self.root.join(with_retry_marker(&name, attempt));
                fs::rename(&from, &to).map_err(|error| SpoolError::Move {
                    from: from.clone(),
                    to,
                    error,
                })?;
                sweep.requeued += 1;
            }
        }
        Ok(sweep)
    }

    fn list_submissions(&self, dir: &Path) -> Result<Vec<String>, SpoolError> {
        let entries = fs::read_dir(dir).map_err(|error| SpoolError::List {
            path: dir.to_owned(),
            error,
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|error| SpoolError::List {
                path: dir.to_owned(),
                error,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(SUBMISSION_EXT) && entry.path().is_file() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn ensure_writable_dir(&self, dir: &Path) -> Result<(), SpoolError> {
        fs::create_dir_all(dir).map_err(|error| SpoolError::CreateDir {
            path: dir.to_owned(),
            error,
        })?;

        // Probe with an actual file creation: a read-only mount or bad
        // permissions must fail startup, not the first routed file.
        let probe = dir.join(".probe");
        fs::write(&probe, b"").map_err(|error| SpoolError::NotWritable {
            path: dir.to_owned(),
            error,
        })?;
        fs::remove_file(&probe).map_err(|error| SpoolError::NotWritable {
            path: dir.to_owned(),
            error,
        })?;
        Ok(())
    }

    fn recover_stale_claims(&self) -> Result<(), SpoolError> {
        let entries = fs::read_dir(&self.root).map_err(|error| SpoolError::List {
            path: self.root.clone(),
            error,
        })?;

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(original) = name.strip_suffix(WORKING_SUFFIX) else {
                continue;
            };
            if !original.ends_with(SUBMISSION_EXT) {
                continue;
            }
            let to = self.root.join(original);
            fs::rename(entry.path(), &to).map_err(|error| SpoolError::Move {
                from: entry.path(),
                to,
                error,
            })?;
            info!("recovered stale claim {}", original);
        }
        Ok(())
    }
}

/// Parse the requeue count out of a `name.retry-N.json` filename.
/// Plain `name.json` files are attempt 0.
pub fn retry_attempt(name: &str) -> u32 {
    let Some(stem) = name.strip_suffix(SUBMISSION_EXT) else {
        return 0;
    };
    match stem.rsplit_once(".retry-") {
        Some((_, n)) => n.parse().unwrap_or(0),
        None => 0,
    }
}

/// Rewrite a submission filename to carry the given requeue count.
pub fn with_retry_marker(name: &str, attempt: u32) -> String {
    let stem = name.strip_suffix(SUBMISSION_EXT).unwrap_or(name);
    let base = match stem.rsplit_once(".retry-") {
        Some((base, n)) if n.chars().all(|c| c.is_ascii_digit()) => base,
        _ => stem,
    };
    format!("{base}.retry-{attempt}{SUBMISSION_EXT}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spool() -> (tempfile::TempDir, SpoolDir) {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let spool = SpoolDir::ensure(dir.path()).expect("failed to ensure spool");
        (dir, spool)
    }

    fn drop_file(spool: &SpoolDir, name: &str) {
        fs::write(spool.root().join(name), b"{}").expect("failed to write file");
    }

    #[test]
    fn ensure_creates_outcome_directories() {
        let (_dir, spool) = spool();
        for disposition in [
            Disposition::Archive,
            Disposition::Failed,
            Disposition::PendingRetry,
        ] {
            assert!(spool.dir_for(disposition).is_dir());
        }
    }

    #[test]
    fn list_pending_is_nonrecursive_and_filtered() {
        let (_dir, spool) = spool();
        drop_file(&spool, "b.json");
        drop_file(&spool, "a.json");
        fs::write(spool.root().join("notes.txt"), b"x").unwrap();
        fs::write(spool.dir_for(Disposition::Archive).join("c.json"), b"{}").unwrap();

        assert_eq!(spool.list_pending().unwrap(), vec!["a.json", "b.json"]);
    }

    #[test]
    fn claim_is_won_exactly_once() {
        let (_dir, spool) = spool();
        drop_file(&spool, "one.json");

        let claimed = spool.claim("one.json").unwrap().expect("first claim");
        assert_eq!(claimed.name, "one.json");
        assert_eq!(claimed.attempt, 0);
        assert!(claimed.path.exists());

        assert!(spool.claim("one.json").unwrap().is_none());
    }

    #[test]
    fn route_moves_to_matching_directory() {
        let (_dir, spool) = spool();
        drop_file(&spool, "one.json");
        let claimed = spool.claim("one.json").unwrap().unwrap();

        let dest = spool.route(&claimed, Disposition::Archive).unwrap();
        assert_eq!(dest, spool.dir_for(Disposition::Archive).join("one.json"));
        assert!(dest.is_file());
        assert!(!claimed.path.exists());
        assert!(spool.list_pending().unwrap().is_empty());
    }

    #[test]
    fn stale_claims_are_recovered_on_ensure() {
        let (dir, spool) = spool();
        drop_file(&spool, "one.json");
        let _claimed = spool.claim("one.json").unwrap().unwrap();

        // Simulate a crash: the working file is still there on restart.
        let spool = SpoolDir::ensure(dir.path()).unwrap();
        assert_eq!(spool.list_pending().unwrap(), vec!["one.json"]);
    }

    #[test]
    fn retry_marker_roundtrip() {
        assert_eq!(retry_attempt("sub.json"), 0);
        assert_eq!(with_retry_marker("sub.json", 1), "sub.retry-1.json");
        assert_eq!(retry_attempt("sub.retry-1.json"), 1);
        assert_eq!(with_retry_marker("sub.retry-1.json", 2), "sub.retry-2.json");
        assert_eq!(retry_attempt("sub.retry-2.json"), 2);
    }

    #[test]
    fn requeue_sweep_caps_attempts() {
        let (_dir, spool) = spool();
        let retry_dir = spool.dir_for(Disposition::PendingRetry);
        fs::write(retry_dir.join("fresh.json"), b"{}").unwrap();
        fs::write(retry_dir.join("tired.retry-3.json"), b"{}").unwrap();

        let sweep = spool.requeue_pending_retries(3).unwrap();
        assert_eq!(
            sweep,
            RetrySweep {
                requeued: 1,
                quarantined: 1
            }
        );
        assert_eq!(spool.list_pending().unwrap(), vec!["fresh.retry-1.json"]);
        assert!(spool
            .dir_for(Disposition::Failed)
            .join("tired.retry-3.json")
            .is_file());
    }
}
