//! Provides an immutable view of cached bytes.
//!
//! All values handed out by a [Group](crate::group::Group) are wrapped in a [ByteView]. Storing
//! plain bytes permits to cache arbitrary payloads (strings, serialized structs, images, ...).
//! The view itself is backed by a shared buffer, therefore cloning is cheap (a pointer copy and
//! a reference count increment) which matters, as every cache hit clones the stored view.
//!
//! The contents of a view can never change. The buffer is only reachable through the view and
//! the view only hands out copies ([ByteView::to_vec]) or read-only renderings (**Display**).
//!
//! # Example
//!
//! ```
//! # use callisto::byteview::ByteView;
//! let view = ByteView::new("630".as_bytes().to_vec());
//!
//! assert_eq!(view.len(), 3);
//! assert_eq!(view.to_vec(), b"630".to_vec());
//! assert_eq!(view.to_string(), "630");
//! ```
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::lru::ByteSize;

/// Holds an immutable view of a byte buffer.
///
/// A view reports its footprint via [ByteSize] so that it can be stored in the size constrained
/// [LRUCache](crate::lru::LRUCache).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteView {
    data: Arc<[u8]>,
}

impl ByteView {
    /// Creates a view by taking ownership of the given buffer.
    ///
    /// As the buffer is moved into the view, no other party can retain a mutable handle on the
    /// underlying bytes.
    pub fn new(data: Vec<u8>) -> Self {
        ByteView { data: data.into() }
    }

    /// Creates an empty view.
    ///
    /// This is what a failed peer fetch yields to its callers.
    pub fn empty() -> Self {
        ByteView {
            data: Vec::new().into(),
        }
    }

    /// Returns the number of bytes being viewed.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Determines if the view contains no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a copy of the viewed bytes.
    ///
    /// We deliberately hand out a fresh buffer here, so that no caller can ever tamper with the
    /// cached contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }
}

impl Display for ByteView {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.data))
    }
}

impl ByteSize for ByteView {
    fn allocated_size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::byteview::ByteView;
    use crate::lru::ByteSize;

    #[test]
    fn views_report_their_size() {
        let view = ByteView::new(b"Hello".to_vec());
        assert_eq!(view.len(), 5);
        assert_eq!(view.is_empty(), false);
        assert_eq!(view.allocated_size(), 5);

        let empty = ByteView::empty();
        assert_eq!(empty.len(), 0);
        assert_eq!(empty.is_empty(), true);
    }

    #[test]
    fn copies_are_independent() {
        let view = ByteView::new(b"immutable".to_vec());

        // Mutating the copy must not shine through to the view...
        let mut copy = view.to_vec();
        copy[0] = b'X';
        assert_eq!(copy[0], b'X');

        assert_eq!(view.to_vec(), b"immutable".to_vec());
        assert_eq!(view.to_string(), "immutable");
    }

    #[test]
    fn clones_share_their_contents() {
        let view = ByteView::new(b"shared".to_vec());
        let clone = view.clone();

        assert_eq!(view, clone);
        assert_eq!(clone.to_vec(), b"shared".to_vec());
    }
}
