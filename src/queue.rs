//! Ordered, immutable-on-publish track queue snapshot.

use std::sync::Arc;

use crate::track::TrackDescriptor;

/// Byte-size ceiling of a published queue. Catalog windows larger than this
/// must be projected down with [`Queue::windowed`].
pub const MAX_SIZE: usize = 1000;

/// Replace-on-mutation snapshot of the play queue. Cloning is cheap and any
/// in-flight reader keeps a consistent view; only the queue coordinator ever
/// requests a new snapshot.
#[derive(Debug, Clone, Default)]
pub struct Queue {
    items: Arc<[TrackDescriptor]>,
}

impl Queue {
    /// Builds a queue from `items`, keeping at most the first [`MAX_SIZE`]
    /// entries.
    pub fn new(mut items: Vec<TrackDescriptor>) -> Self {
        items.truncate(MAX_SIZE);
        Self {
            items: items.into(),
        }
    }

    /// Projects an oversized catalog window onto a [`MAX_SIZE`] slice around
    /// `pivot`, extracting forward from the pivot first and backward only to
    /// fill the remainder. Returns the queue and the remapped pivot index.
    pub fn windowed(items: Vec<TrackDescriptor>, pivot: usize) -> (Self, usize) {
        let size = items.len();
        if size <= MAX_SIZE {
            let pivot = pivot.min(size.saturating_sub(1));
            return (Self::new(items), pivot);
        }

        let pivot = pivot.min(size - 1);
        let forward = (size - pivot).min(MAX_SIZE);
        let start = pivot - (MAX_SIZE - forward);
        let end = pivot + forward;

        let window: Vec<TrackDescriptor> = items[start..end].to_vec();
        (Self::new(window), pivot - start)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&TrackDescriptor> {
        self.items.get(position)
    }

    /// Position of the entry with the same identity token, if any.
    pub fn index_of(&self, track: &TrackDescriptor) -> Option<usize> {
        self.index_of_identity(track.identity())
    }

    pub fn index_of_identity(&self, identity: &str) -> Option<usize> {
        self.items.iter().position(|item| item.identity() == identity)
    }

    pub fn contains(&self, track: &TrackDescriptor) -> bool {
        self.index_of(track).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackDescriptor> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<TrackDescriptor> {
        self.items.to_vec()
    }
}
