//! Conditional write batches.
//!
//! A [`WriteBatch`] pairs a set of preconditions with a set of writes. The
//! backend applies the writes only if every precondition still holds at
//! commit time, which is how callers implement optimistic concurrency
//! (compare-and-swap on the bytes they read earlier).

/// Expected state of a single key at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    /// The key being checked.
    pub key: String,
    /// `None` requires the key to be absent; `Some(bytes)` requires the
    /// stored value to equal `bytes` exactly.
    pub expected: Option<Vec<u8>>,
}

impl Precondition {
    /// Check this precondition against the current stored value.
    #[must_use]
    pub fn holds(&self, current: Option<&[u8]>) -> bool {
        match (&self.expected, current) {
            (None, None) => true,
            (Some(expected), Some(current)) => expected.as_slice() == current,
            _ => false,
        }
    }
}

/// An atomic set of conditional writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    preconditions: Vec<Precondition>,
    writes: Vec<(String, Vec<u8>)>,
}

impl WriteBatch {
    /// Create an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to be absent at commit time.
    pub fn expect_absent(&mut self, key: impl Into<String>) -> &mut Self {
        self.preconditions.push(Precondition {
            key: key.into(),
            expected: None,
        });
        self
    }

    /// Require `key` to hold exactly `value` at commit time.
    pub fn expect_value(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.preconditions.push(Precondition {
            key: key.into(),
            expected: Some(value),
        });
        self
    }

    /// Write `value` at `key` when the batch commits.
    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.writes.push((key.into(), value));
        self
    }

    /// Preconditions in insertion order.
    #[must_use]
    pub fn preconditions(&self) -> &[Precondition] {
        &self.preconditions
    }

    /// Writes in insertion order.
    #[must_use]
    pub fn writes(&self) -> &[(String, Vec<u8>)] {
        &self.writes
    }

    /// Whether the batch writes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Split the batch into its preconditions and writes.
    #[must_use]
    pub fn into_parts(self) -> (Vec<Precondition>, Vec<(String, Vec<u8>)>) {
        (self.preconditions, self.writes)
    }
}
