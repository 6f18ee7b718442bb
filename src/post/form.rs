use super::ParamVec;
use std::sync::Arc;

/// Accumulation state of the current form field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostState {
    #[default]
    Idle,
    InProgress,
}

/// What a chunk did to the field accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldVerdict {
    Accepted,
    /// Offset did not match the accumulated size; the field was dropped.
    Desync { expected: u64, got: u64 },
    /// Continuation for a field that is not being accumulated.
    Unexpected,
}

/// Buffers one key/value pair across chunk boundaries.
#[derive(Debug, Default)]
pub struct FieldAccumulator {
    state: PostState,
    key: String,
    value: Vec<u8>,
}

impl FieldAccumulator {
    #[must_use]
    pub fn state(&self) -> PostState {
        self.state
    }

    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self.state {
            PostState::InProgress => Some(&self.key),
            PostState::Idle => None,
        }
    }

    /// Bytes accumulated for the current field.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.value.len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn clear(&mut self) {
        self.state = PostState::Idle;
        self.key.clear();
        self.value.clear();
    }

    /// Hand out the in-progress pair, if any, and go idle.
    pub fn take(&mut self) -> Option<(Arc<str>, String)> {
        if self.state == PostState::Idle {
            return None;
        }
        let pair = (
            Arc::from(self.key.as_str()),
            String::from_utf8_lossy(&self.value).into_owned(),
        );
        self.clear();
        Some(pair)
    }

    fn start(&mut self, key: &str, data: &[u8]) {
        self.state = PostState::InProgress;
        self.key.clear();
        self.key.push_str(key);
        self.value.clear();
        self.value.extend_from_slice(data);
    }

    /// Apply one chunk. Completed pairs are appended to `params`.
    ///
    /// Offset 0 starts a field (flushing any field still in progress); a
    /// continuation must carry the accumulated size as its offset; an empty
    /// chunk at that offset completes the field. An empty field is therefore
    /// started and completed by two empty chunks at offset 0.
    pub(crate) fn feed(
        &mut self,
        key: &str,
        data: &[u8],
        offset: u64,
        params: &mut ParamVec,
    ) -> FieldVerdict {
        if offset == 0 {
            let completes_empty = self.state == PostState::InProgress
                && self.key == key
                && self.value.is_empty()
                && data.is_empty();
            if let Some(prior) = self.take() {
                params.push(prior);
            }
            if !completes_empty {
                self.start(key, data);
            }
            return FieldVerdict::Accepted;
        }

        if self.state != PostState::InProgress || self.key != key {
            return FieldVerdict::Unexpected;
        }
        if offset != self.len() {
            let expected = self.len();
            self.clear();
            return FieldVerdict::Desync {
                expected,
                got: offset,
            };
        }
        if data.is_empty() {
            if let Some(done) = self.take() {
                params.push(done);
            }
        } else {
            self.value.extend_from_slice(data);
        }
        FieldVerdict::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_of<'a>(params: &'a ParamVec, key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_reassembles_across_chunks() {
        let mut acc = FieldAccumulator::default();
        let mut params = ParamVec::new();
        assert_eq!(acc.feed("name", b"Al", 0, &mut params), FieldVerdict::Accepted);
        assert_eq!(acc.feed("name", b"ice", 2, &mut params), FieldVerdict::Accepted);
        assert_eq!(acc.state(), PostState::InProgress);
        assert_eq!(acc.feed("name", b"", 5, &mut params), FieldVerdict::Accepted);
        assert_eq!(acc.state(), PostState::Idle);
        assert_eq!(value_of(&params, "name"), Some("Alice"));
    }

    #[test]
    fn test_new_key_flushes_prior() {
        let mut acc = FieldAccumulator::default();
        let mut params = ParamVec::new();
        acc.feed("a", b"1", 0, &mut params);
        acc.feed("b", b"2", 0, &mut params);
        assert_eq!(value_of(&params, "a"), Some("1"));
        assert_eq!(acc.key(), Some("b"));
        assert_eq!(acc.take(), Some((Arc::from("b"), "2".to_string())));
    }

    #[test]
    fn test_offset_mismatch_clears_field() {
        let mut acc = FieldAccumulator::default();
        let mut params = ParamVec::new();
        acc.feed("msg", b"1234567", 0, &mut params);
        assert_eq!(
            acc.feed("msg", b"x", 10, &mut params),
            FieldVerdict::Desync {
                expected: 7,
                got: 10
            }
        );
        assert_eq!(acc.state(), PostState::Idle);
        assert!(params.is_empty());
    }

    #[test]
    fn test_continuation_without_start_is_unexpected() {
        let mut acc = FieldAccumulator::default();
        let mut params = ParamVec::new();
        assert_eq!(acc.feed("x", b"1", 3, &mut params), FieldVerdict::Unexpected);
        acc.feed("a", b"1", 0, &mut params);
        assert_eq!(acc.feed("b", b"1", 1, &mut params), FieldVerdict::Unexpected);
    }

    #[test]
    fn test_empty_field() {
        let mut acc = FieldAccumulator::default();
        let mut params = ParamVec::new();
        acc.feed("flag", b"", 0, &mut params);
        assert_eq!(acc.state(), PostState::InProgress);
        assert!(params.is_empty());
        assert_eq!(acc.feed("flag", b"", 0, &mut params), FieldVerdict::Accepted);
        assert_eq!(acc.state(), PostState::Idle);
        assert_eq!(params.len(), 1);
        assert_eq!(value_of(&params, "flag"), Some(""));
    }

    #[test]
    fn test_unterminated_empty_field_flushed_by_next_key() {
        let mut acc = FieldAccumulator::default();
        let mut params = ParamVec::new();
        acc.feed("mute", b"", 0, &mut params);
        acc.feed("volume", b"5", 0, &mut params);
        assert_eq!(value_of(&params, "mute"), Some(""));
        assert_eq!(acc.take(), Some((Arc::from("volume"), "5".to_string())));
    }
}
