//! Frame metadata and operation history
//!
//! Every frame carries a [`Metadata`] value describing where it came from and
//! which transformations produced it. The operation history is a persistent
//! singly linked list: extending it allocates one node that points at the
//! previous chain, so frames derived from a common ancestor share the
//! ancestor's history and can be read concurrently without locking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// A named transformation step
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Operation(Arc<str>);

impl Operation {
    /// Create an operation from a description
    pub fn new(description: impl AsRef<str>) -> Self {
        Self(Arc::from(description.as_ref()))
    }

    /// The empty operation, which is never recorded
    pub fn nop() -> Self {
        Self::new("")
    }

    /// Whether this is the empty operation
    pub fn is_nop(&self) -> bool {
        self.0.is_empty()
    }

    /// Get the description
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Operation {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Operation {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

#[derive(Debug)]
struct OpNode {
    op: Operation,
    prev: OpChain,
}

/// Immutable, structurally shared history of operations
///
/// Cloning is a reference count bump. [`OpChain::with`] never mutates the
/// receiver.
#[derive(Debug, Clone, Default)]
pub struct OpChain {
    head: Option<Arc<OpNode>>,
}

impl OpChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a chain with a single root operation
    pub fn root(op: impl Into<Operation>) -> Self {
        Self::new().with(op)
    }

    /// Return a new chain extended by `op`.
    ///
    /// The empty operation leaves the chain unchanged.
    pub fn with(&self, op: impl Into<Operation>) -> Self {
        let op = op.into();
        if op.is_nop() {
            return self.clone();
        }
        Self {
            head: Some(Arc::new(OpNode {
                op,
                prev: self.clone(),
            })),
        }
    }

    /// Most recent operation
    pub fn last(&self) -> Option<&Operation> {
        self.head.as_ref().map(|node| &node.op)
    }

    /// Number of operations in the chain
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether no operations have been recorded
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Iterate from the most recent operation back to the root
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        let mut cursor = self.head.as_deref();
        std::iter::from_fn(move || {
            let node = cursor?;
            cursor = node.prev.head.as_deref();
            Some(&node.op)
        })
    }

    /// Operations in the order they were applied (root first)
    pub fn linearize(&self) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self.iter().cloned().collect();
        ops.reverse();
        ops
    }

    /// Whether two chains share the same head node
    pub fn ptr_eq(&self, other: &OpChain) -> bool {
        match (&self.head, &other.head) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

/// Per-frame encode settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// JPEG quality, valid in [1, 100]
    pub jpeg_quality: i64,
}

impl Settings {
    /// Settings with the given JPEG quality
    pub fn with_quality(jpeg_quality: i64) -> Self {
        Self { jpeg_quality }
    }

    /// Validated quality as the encoder expects it
    pub fn validated_quality(&self) -> Result<u8> {
        if (1..=100).contains(&self.jpeg_quality) {
            Ok(self.jpeg_quality as u8)
        } else {
            Err(Error::InvalidQuality(self.jpeg_quality))
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        // Zero is deliberately invalid: encoders must be told a quality
        Self { jpeg_quality: 0 }
    }
}

/// Header fields copied from the source of a frame
pub type SourceHeaders = BTreeMap<String, Vec<String>>;

/// Metadata attached to every frame
#[derive(Debug, Clone)]
pub struct Metadata {
    /// Header fields from the source (e.g. multipart part headers)
    pub source_headers: Arc<SourceHeaders>,
    /// When the frame entered the pipeline
    pub received_at: DateTime<Utc>,
    /// Transformation history
    pub operations: OpChain,
    /// Encode settings
    pub settings: Settings,
}

impl Metadata {
    /// Metadata for a frame received now, with `origin` as its first operation
    pub fn new(origin: impl Into<Operation>) -> Self {
        Self::received_at(Utc::now(), origin)
    }

    /// Metadata for a frame received at a specific time
    pub fn received_at(received_at: DateTime<Utc>, origin: impl Into<Operation>) -> Self {
        Self {
            source_headers: Arc::new(SourceHeaders::new()),
            received_at,
            operations: OpChain::root(origin),
            settings: Settings::default(),
        }
    }

    /// Attach source headers
    pub fn with_source_headers(mut self, headers: SourceHeaders) -> Self {
        self.source_headers = Arc::new(headers);
        self
    }

    /// Return a copy with `op` appended to the operation chain
    pub fn with_op(&self, op: impl Into<Operation>) -> Self {
        Self {
            source_headers: Arc::clone(&self.source_headers),
            received_at: self.received_at,
            operations: self.operations.with(op),
            settings: self.settings,
        }
    }

    /// Return a copy with different encode settings
    pub fn with_settings(&self, settings: Settings) -> Self {
        Self {
            source_headers: Arc::clone(&self.source_headers),
            received_at: self.received_at,
            operations: self.operations.clone(),
            settings,
        }
    }

    /// First value of a source header
    pub fn source_header(&self, name: &str) -> Option<&str> {
        self.source_headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }
}
