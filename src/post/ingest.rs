use super::form::{FieldAccumulator, FieldVerdict, PostState};
use super::upload::{
    CompletedUpload, LogUploadListener, Upload, UploadError, UploadListener, UploadOutcome,
    UploadState, UploadTarget,
};
use super::ParamVec;
use crate::request::{PostMode, Request};
use crate::session::Session;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// Session value recording the path of the last completed upload.
pub const UPLOAD_PATH_KEY: &str = "upload.path";
/// Session value recording the size of the last completed upload.
pub const UPLOAD_SIZE_KEY: &str = "upload.size";

/// One demultiplexed body callback from the HTTP layer.
///
/// An empty `data` slice at the accumulated offset ends the field (or file).
#[derive(Debug, Clone, Copy, Default)]
pub struct Chunk<'a> {
    pub key: Option<&'a str>,
    pub data: &'a [u8],
    pub offset: u64,
    pub filename: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub content_length: Option<u64>,
}

impl<'a> Chunk<'a> {
    #[must_use]
    pub fn field(key: &'a str, data: &'a [u8], offset: u64) -> Self {
        Self {
            key: Some(key),
            data,
            offset,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn file(key: &'a str, filename: &'a str, data: &'a [u8], offset: u64) -> Self {
        Self {
            key: Some(key),
            data,
            offset,
            filename: Some(filename),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: &'a str) -> Self {
        self.content_type = Some(content_type);
        self
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn key(&self) -> Option<&'a str> {
        self.key.filter(|k| !k.is_empty())
    }
}

/// Per-session POST sub-state: at most one field and one upload in flight.
#[derive(Debug, Default)]
pub struct IngestState {
    field: FieldAccumulator,
    params: ParamVec,
    upload: Upload,
    completed: Vec<CompletedUpload>,
    last_error: Option<UploadError>,
}

impl IngestState {
    /// A field or upload is mid-flight, or parameters await dispatch.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.field.state() == PostState::InProgress
            || self.upload.state() != UploadState::Idle
            || !self.params.is_empty()
    }

    #[must_use]
    pub fn post_state(&self) -> PostState {
        self.field.state()
    }

    #[must_use]
    pub fn upload_state(&self) -> UploadState {
        self.upload.state()
    }

    #[must_use]
    pub fn upload(&self) -> &Upload {
        &self.upload
    }

    /// Completed pairs waiting for dispatch.
    #[must_use]
    pub fn params(&self) -> &ParamVec {
        &self.params
    }

    #[must_use]
    pub fn last_error(&self) -> Option<UploadError> {
        self.last_error
    }

    fn clear_post(&mut self) {
        self.field.clear();
        self.params.clear();
    }
}

/// A finished body, ready for the dispatcher.
#[derive(Debug, Default)]
pub struct Submission {
    pub params: ParamVec,
    pub uploads: Vec<CompletedUpload>,
}

impl Submission {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.uploads.is_empty()
    }
}

/// Drives the POST and upload state machines for every session.
pub struct Ingestor {
    target: Arc<dyn UploadTarget>,
    listener: RwLock<Arc<dyn UploadListener>>,
}

impl Ingestor {
    pub fn new(target: Arc<dyn UploadTarget>) -> Self {
        Self {
            target,
            listener: RwLock::new(Arc::new(LogUploadListener)),
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn UploadListener>) {
        *self.listener.write() = listener;
    }

    /// Apply one chunk for `session`. `false` means the request must fail.
    ///
    /// Offset desynchronization drops the current field but keeps the
    /// request alive. Data without a key, or a continuation nobody expects,
    /// clears the pending POST state and rejects the chunk.
    pub fn feed(&self, req: &Request, session: &Session, chunk: &Chunk<'_>) -> bool {
        req.touch();
        let (accepted, done) = {
            let mut st = session.ingest();
            match (chunk.key(), chunk.filename) {
                (None, _) if chunk.data.is_empty() => (true, None),
                (None, _) => {
                    warn!(
                        session_id = %session.id(),
                        bytes = chunk.data.len(),
                        "Body data without a field key; POST state cleared"
                    );
                    st.clear_post();
                    session.set_busy(false);
                    (false, None)
                }
                (Some(key), Some(filename)) => {
                    session.set_busy(true);
                    req.set_post_mode(PostMode::RawUpload);
                    self.feed_upload(session, &mut st, key, filename, chunk)
                }
                (Some(key), None) => {
                    session.set_busy(true);
                    req.set_post_mode(PostMode::FormData);
                    (Self::feed_field(session, &mut st, key, chunk), None)
                }
            }
        };
        if let Some(upload) = done {
            self.announce(session, &upload);
        }
        accepted
    }

    fn feed_field(session: &Session, st: &mut IngestState, key: &str, chunk: &Chunk<'_>) -> bool {
        match st.field.feed(key, chunk.data, chunk.offset, &mut st.params) {
            FieldVerdict::Accepted => true,
            FieldVerdict::Desync { expected, got } => {
                warn!(
                    session_id = %session.id(),
                    key,
                    expected,
                    got,
                    "POST offset mismatch; field dropped"
                );
                true
            }
            FieldVerdict::Unexpected => {
                warn!(
                    session_id = %session.id(),
                    key,
                    offset = chunk.offset,
                    "Unexpected POST continuation; POST state cleared"
                );
                st.clear_post();
                false
            }
        }
    }

    fn feed_upload(
        &self,
        session: &Session,
        st: &mut IngestState,
        key: &str,
        filename: &str,
        chunk: &Chunk<'_>,
    ) -> (bool, Option<CompletedUpload>) {
        match st.upload.state() {
            UploadState::Idle if chunk.offset != 0 => {
                warn!(
                    session_id = %session.id(),
                    key,
                    filename,
                    offset = chunk.offset,
                    "Upload continuation without an open upload; POST state cleared"
                );
                st.clear_post();
                (false, None)
            }
            UploadState::Idle => {
                let started = st.upload.begin(
                    Arc::clone(&self.target),
                    session.id(),
                    key,
                    filename,
                    chunk.content_length,
                    chunk.data,
                );
                match started {
                    Ok(ok) => {
                        if !ok {
                            st.last_error = st.upload.error();
                        }
                        (ok, None)
                    }
                    Err(e) => {
                        warn!(
                            session_id = %session.id(),
                            key,
                            filename,
                            error = %e,
                            "Upload could not be created"
                        );
                        st.last_error = Some(UploadError::from(&e));
                        (false, None)
                    }
                }
            }
            UploadState::InProgress if st.upload.key() != key => {
                warn!(
                    session_id = %session.id(),
                    key,
                    active = st.upload.key(),
                    "Second upload while one is in progress"
                );
                (false, None)
            }
            UploadState::InProgress if chunk.data.is_empty() => {
                let outcome = st.upload.finish();
                (true, Self::complete(session, st, outcome))
            }
            UploadState::InProgress => {
                let ok = st.upload.write(chunk.data);
                if !ok {
                    st.last_error = st.upload.error();
                }
                (ok, None)
            }
            UploadState::Interrupted => {
                if chunk.data.is_empty() {
                    st.upload.finish();
                }
                (false, None)
            }
        }
    }

    /// Record a finished upload as a parameter and in the session matrix.
    fn complete(
        session: &Session,
        st: &mut IngestState,
        outcome: UploadOutcome,
    ) -> Option<CompletedUpload> {
        match outcome {
            UploadOutcome::Completed(done) => {
                st.params.push((
                    Arc::from(done.key.as_str()),
                    done.path.display().to_string(),
                ));
                st.completed.push(done.clone());
                session.set_value(UPLOAD_PATH_KEY, done.path.display().to_string());
                session.set_value(UPLOAD_SIZE_KEY, done.size.to_string());
                Some(done)
            }
            UploadOutcome::Discarded { key, written, error } => {
                debug!(
                    session_id = %session.id(),
                    key,
                    written,
                    ?error,
                    "Upload discarded"
                );
                if error.is_some() {
                    st.last_error = error;
                }
                None
            }
            UploadOutcome::None => None,
        }
    }

    fn announce(&self, session: &Session, upload: &CompletedUpload) {
        let listener = Arc::clone(&*self.listener.read());
        listener.on_upload_complete(session.id(), upload);
    }

    /// End of body: flush the open field, close any open upload and hand
    /// back everything accumulated. Clears the busy flag.
    pub fn finish(&self, req: &Request, session: &Session) -> Submission {
        req.touch();
        let (submission, done) = {
            let mut st = session.ingest();
            if let Some(pair) = st.field.take() {
                st.params.push(pair);
            }
            let outcome = st.upload.finish();
            let done = Self::complete(session, &mut st, outcome);
            let submission = Submission {
                params: std::mem::take(&mut st.params),
                uploads: std::mem::take(&mut st.completed),
            };
            (submission, done)
        };
        session.set_busy(false);
        if let Some(upload) = done {
            self.announce(session, &upload);
        }
        debug!(
            session_id = %session.id(),
            params = submission.params.len(),
            uploads = submission.uploads.len(),
            "POST body complete"
        );
        submission
    }

    /// Discard everything in flight (client went away mid-body).
    /// Returns whether there was anything to discard.
    pub fn abort(&self, session: &Session) -> bool {
        let had_state = {
            let st = session.ingest();
            st.is_active() || !st.completed.is_empty()
        };
        teardown(session);
        session.set_busy(false);
        if had_state {
            debug!(session_id = %session.id(), "POST state discarded");
        }
        had_state
    }
}

/// Drop a session's POST sub-state and delete any partial upload.
pub(crate) fn teardown(session: &Session) {
    let mut st = session.ingest();
    st.clear_post();
    st.completed.clear();
    st.upload.abandon();
}
