use crate::ids::SessionId;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// First-chunk multiplier for the pre-size estimate.
pub const PRESIZE_FACTOR: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadState {
    #[default]
    Idle,
    InProgress,
    Interrupted,
}

/// System error that interrupted an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadError {
    pub kind: io::ErrorKind,
    pub os_code: Option<i32>,
}

impl From<&io::Error> for UploadError {
    fn from(e: &io::Error) -> Self {
        Self {
            kind: e.kind(),
            os_code: e.raw_os_error(),
        }
    }
}

/// An open upload destination.
pub trait UploadFile: Write + Send {
    /// Flush and cut the file to exactly `len` bytes.
    fn finish(&mut self, len: u64) -> io::Result<()>;
}

impl UploadFile for File {
    fn finish(&mut self, len: u64) -> io::Result<()> {
        self.flush()?;
        self.set_len(len)?;
        self.sync_data()
    }
}

/// Where uploads are written.
pub trait UploadTarget: Send + Sync {
    /// Create a uniquely named destination pre-sized to `estimate` bytes.
    fn create(
        &self,
        session: &SessionId,
        filename: &str,
        estimate: u64,
    ) -> io::Result<(PathBuf, Box<dyn UploadFile>)>;

    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// Uploads into a shared temporary directory.
#[derive(Debug, Clone)]
pub struct TempDirTarget {
    dir: PathBuf,
}

impl TempDirTarget {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Keep the client's name recognisable but filesystem-safe.
    fn sanitize(filename: &str) -> String {
        let base = filename
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default();
        let cleaned: String = base
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .take(64)
            .collect();
        if cleaned.trim_matches('.').is_empty() {
            "upload".to_string()
        } else {
            cleaned
        }
    }
}

impl UploadTarget for TempDirTarget {
    fn create(
        &self,
        session: &SessionId,
        filename: &str,
        estimate: u64,
    ) -> io::Result<(PathBuf, Box<dyn UploadFile>)> {
        fs::create_dir_all(&self.dir)?;
        let name = format!(
            "{}-{}-{}",
            session,
            ulid::Ulid::new().to_string().to_ascii_lowercase(),
            Self::sanitize(filename)
        );
        let path = self.dir.join(name);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(estimate)?;
        Ok((path, Box::new(file)))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// Notified once per successfully finalized upload.
pub trait UploadListener: Send + Sync {
    fn on_upload_complete(&self, session: &SessionId, upload: &CompletedUpload);
}

/// Default listener: log the upload.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogUploadListener;

impl UploadListener for LogUploadListener {
    fn on_upload_complete(&self, session: &SessionId, upload: &CompletedUpload) {
        info!(
            session_id = %session,
            key = %upload.key,
            path = %upload.path.display(),
            size = upload.size,
            "Upload completed"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    pub key: String,
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Nothing was in progress.
    None,
    Completed(CompletedUpload),
    /// Interrupted or unfinishable; the partial file was deleted.
    Discarded {
        key: String,
        written: u64,
        error: Option<UploadError>,
    },
}

/// A single file being streamed to disk for one session.
///
/// The handle is open only while `InProgress`. After a write error the upload
/// is `Interrupted`: the handle is closed, bytes already written stay on disk
/// until the upload is finalized, and further writes are refused.
#[derive(Default)]
pub struct Upload {
    state: UploadState,
    key: String,
    filename: String,
    path: Option<PathBuf>,
    file: Option<Box<dyn UploadFile>>,
    target: Option<Arc<dyn UploadTarget>>,
    declared: u64,
    written: u64,
    error: Option<UploadError>,
}

impl fmt::Debug for Upload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upload")
            .field("state", &self.state)
            .field("key", &self.key)
            .field("path", &self.path)
            .field("declared", &self.declared)
            .field("written", &self.written)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl Upload {
    #[must_use]
    pub fn state(&self) -> UploadState {
        self.state
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn declared(&self) -> u64 {
        self.declared
    }

    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    #[must_use]
    pub fn error(&self) -> Option<UploadError> {
        self.error
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Open the destination and write the first chunk.
    pub(crate) fn begin(
        &mut self,
        target: Arc<dyn UploadTarget>,
        session: &SessionId,
        key: &str,
        filename: &str,
        declared: Option<u64>,
        first: &[u8],
    ) -> io::Result<bool> {
        let declared = declared.unwrap_or(0);
        let estimate = declared.max(PRESIZE_FACTOR * first.len() as u64);
        let (path, file) = target.create(session, filename, estimate)?;
        debug!(
            session_id = %session,
            key,
            path = %path.display(),
            estimate,
            "Upload started"
        );
        *self = Upload {
            state: UploadState::InProgress,
            key: key.to_string(),
            filename: filename.to_string(),
            path: Some(path),
            file: Some(file),
            target: Some(target),
            declared,
            written: 0,
            error: None,
        };
        Ok(self.write(first))
    }

    /// Append a chunk. Returns `false` once the upload is not writable.
    pub(crate) fn write(&mut self, data: &[u8]) -> bool {
        if self.state != UploadState::InProgress {
            return false;
        }
        let Some(file) = self.file.as_mut() else {
            return false;
        };
        if data.is_empty() {
            return true;
        }
        match file.write_all(data) {
            Ok(()) => {
                self.written += data.len() as u64;
                true
            }
            Err(e) => {
                warn!(
                    key = %self.key,
                    written = self.written,
                    error = %e,
                    "Upload write failed; upload interrupted"
                );
                self.error = Some(UploadError::from(&e));
                self.state = UploadState::Interrupted;
                self.file = None;
                false
            }
        }
    }

    /// Close the upload: truncate to the bytes actually written, or delete
    /// the partial file if interrupted. Always returns to `Idle`.
    pub(crate) fn finish(&mut self) -> UploadOutcome {
        let upload = std::mem::take(self);
        let Upload {
            state,
            key,
            filename,
            path,
            file,
            target,
            written,
            error,
            ..
        } = upload;

        match state {
            UploadState::Idle => UploadOutcome::None,
            UploadState::InProgress => {
                let finished = match file {
                    Some(mut f) => f.finish(written),
                    None => Err(io::Error::other("upload handle missing")),
                };
                match (finished, path) {
                    (Ok(()), Some(path)) => UploadOutcome::Completed(CompletedUpload {
                        key,
                        filename,
                        path,
                        size: written,
                    }),
                    (result, path) => {
                        let error = result.as_ref().err().map(UploadError::from);
                        if let Err(e) = &result {
                            warn!(key = %key, error = %e, "Upload could not be finalized");
                        }
                        discard(target.as_deref(), path.as_deref());
                        UploadOutcome::Discarded {
                            key,
                            written,
                            error,
                        }
                    }
                }
            }
            UploadState::Interrupted => {
                drop(file);
                discard(target.as_deref(), path.as_deref());
                UploadOutcome::Discarded {
                    key,
                    written,
                    error,
                }
            }
        }
    }

    /// Drop whatever is in progress, deleting the partial file.
    pub(crate) fn abandon(&mut self) -> UploadOutcome {
        if self.state == UploadState::InProgress {
            self.file = None;
            self.state = UploadState::Interrupted;
        }
        self.finish()
    }
}

fn discard(target: Option<&dyn UploadTarget>, path: Option<&Path>) {
    let (Some(target), Some(path)) = (target, path) else {
        return;
    };
    match target.remove(path) {
        Ok(()) => debug!(path = %path.display(), "Partial upload deleted"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Partial upload not deleted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        "up1".parse().unwrap()
    }

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(TempDirTarget::sanitize("../../etc/passwd"), "passwd");
        assert_eq!(TempDirTarget::sanitize("C:\\x\\my song.mp3"), "my_song.mp3");
        assert_eq!(TempDirTarget::sanitize(".."), "upload");
    }

    #[test]
    fn test_truncates_to_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let target: Arc<dyn UploadTarget> = Arc::new(TempDirTarget::new(dir.path()));
        let mut up = Upload::default();
        assert!(up
            .begin(Arc::clone(&target), &sid(), "file", "a.bin", Some(10_000), b"hello")
            .unwrap());
        let path = up.path().unwrap().to_path_buf();
        assert_eq!(fs::metadata(&path).unwrap().len(), 10_000);
        assert!(up.write(b" world"));

        match up.finish() {
            UploadOutcome::Completed(done) => {
                assert_eq!(done.size, 11);
                assert_eq!(fs::read(&done.path).unwrap(), b"hello world");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(up.state(), UploadState::Idle);
        assert!(!up.is_open());
    }

    #[test]
    fn test_presize_uses_first_chunk_estimate() {
        let dir = tempfile::tempdir().unwrap();
        let target: Arc<dyn UploadTarget> = Arc::new(TempDirTarget::new(dir.path()));
        let mut up = Upload::default();
        up.begin(target, &sid(), "file", "b.bin", None, &[7u8; 100])
            .unwrap();
        let len = fs::metadata(up.path().unwrap()).unwrap().len();
        assert_eq!(len, 500);
        up.abandon();
    }

    #[test]
    fn test_unique_names() {
        let dir = tempfile::tempdir().unwrap();
        let target = TempDirTarget::new(dir.path());
        let (a, _) = target.create(&sid(), "same.txt", 0).unwrap();
        let (b, _) = target.create(&sid(), "same.txt", 0).unwrap();
        assert_ne!(a, b);
    }
}
