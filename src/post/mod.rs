//! # POST Ingestion
//!
//! Reassembles form fields and streams file uploads from the demultiplexed
//! body callbacks the HTTP layer delivers. The layer does the framing; this
//! module only sees `(key, data, offset, filename?)` chunks, in order, for one
//! request at a time per session.
//!
//! ## Form fields
//!
//! A chunk at offset 0 starts a field and flushes any field still in
//! progress into the session's pending parameter list. Continuations must
//! report the accumulated size as their offset; an empty chunk at that offset
//! completes the field. At end of body, [`Ingestor::finish`] flushes whatever
//! is left and returns a [`Submission`] for the dispatcher.
//!
//! ## Uploads
//!
//! A chunk carrying a filename goes to disk through an [`UploadTarget`]. The
//! destination is pre-sized to the larger of the declared length and five
//! times the first chunk, then truncated to the bytes actually written when
//! the upload closes. A write failure interrupts the upload; the partial file
//! is deleted when it is finalized.
//!
//! ## Errors
//!
//! Nothing here returns an error to the caller. A chunk is either accepted or
//! rejected (`bool`), and an upload failure is recorded on the session as an
//! [`UploadError`].

mod form;
mod ingest;
mod upload;

use smallvec::SmallVec;
use std::sync::Arc;

pub use form::{FieldAccumulator, PostState};
pub use ingest::{
    Chunk, IngestState, Ingestor, Submission, UPLOAD_PATH_KEY, UPLOAD_SIZE_KEY,
};
pub(crate) use ingest::teardown;
pub use upload::{
    CompletedUpload, LogUploadListener, TempDirTarget, Upload, UploadError, UploadFile,
    UploadListener, UploadOutcome, UploadState, UploadTarget, PRESIZE_FACTOR,
};

/// Inline capacity for parameter lists; typical panel forms stay below it.
pub const MAX_INLINE_PARAMS: usize = 8;

/// Completed `(key, value)` pairs of one submission, in arrival order.
pub type ParamVec = SmallVec<[(Arc<str>, String); MAX_INLINE_PARAMS]>;
