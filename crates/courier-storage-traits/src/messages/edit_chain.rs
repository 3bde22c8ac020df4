//! Per-message edit history
//!
//! An [`EditChain`] holds one entry per accepted revision of a record, the
//! original body being revision 0. Entries are only ever appended. The chain
//! is audit data: classification of incoming edits compares revisions on the
//! record itself and never walks the chain.

use serde::{Deserialize, Serialize};

use super::types::Body;

/// One accepted revision of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EditEntry {
    /// Revision number, 0 for the original body
    pub revision: u32,
    /// Body at this revision
    pub body: Body,
    /// Local time the revision was applied, in milliseconds
    pub applied_at: u64,
}

/// Append-only edit history of a single record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditChain {
    entries: Vec<EditEntry>,
}

impl EditChain {
    /// Start a chain from the original body
    pub fn new(original: Body, applied_at: u64) -> Self {
        Self {
            entries: vec![EditEntry {
                revision: 0,
                body: original,
                applied_at,
            }],
        }
    }

    /// Rebuild a chain from stored entries, sorted by revision
    pub fn from_entries(mut entries: Vec<EditEntry>) -> Self {
        entries.sort_by_key(|entry| entry.revision);
        Self { entries }
    }

    /// Append an accepted revision.
    ///
    /// Callers validate the revision upstream; the chain itself never refuses
    /// an entry.
    pub fn record(&mut self, revision: u32, body: Body, applied_at: u64) {
        debug_assert!(
            self.current_revision().is_none_or(|current| revision > current),
            "edit chain revisions must strictly increase"
        );
        self.entries.push(EditEntry {
            revision,
            body,
            applied_at,
        });
    }

    /// Append a prepared entry
    pub fn push(&mut self, entry: EditEntry) {
        self.record(entry.revision, entry.body, entry.applied_at);
    }

    /// All entries, oldest revision first
    pub fn entries(&self) -> &[EditEntry] {
        &self.entries
    }

    /// Most recent revision
    pub fn latest(&self) -> Option<&EditEntry> {
        self.entries.last()
    }

    /// Revision number of the most recent entry
    pub fn current_revision(&self) -> Option<u32> {
        self.latest().map(|entry| entry.revision)
    }

    /// Whether the message was edited at least once, for "edited" badges
    pub fn is_edited(&self) -> bool {
        self.entries.len() > 1
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the chain has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consume the chain
    pub fn into_entries(self) -> Vec<EditEntry> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_chain_has_original() {
        let chain = EditChain::new(Body::text("hi"), 10);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.current_revision(), Some(0));
        assert!(!chain.is_edited());
        assert_eq!(chain.latest().unwrap().body, Body::text("hi"));
    }

    #[test]
    fn test_record_appends_in_order() {
        let mut chain = EditChain::new(Body::text("hi"), 10);
        chain.record(1, Body::text("hi!"), 11);
        chain.record(3, Body::text("hi!!!"), 12);

        assert!(chain.is_edited());
        assert_eq!(chain.current_revision(), Some(3));
        let revisions: Vec<u32> = chain.entries().iter().map(|e| e.revision).collect();
        assert_eq!(revisions, vec![0, 1, 3]);
    }

    #[test]
    fn test_from_entries_sorts_by_revision() {
        let chain = EditChain::from_entries(vec![
            EditEntry {
                revision: 2,
                body: Body::text("c"),
                applied_at: 3,
            },
            EditEntry {
                revision: 0,
                body: Body::text("a"),
                applied_at: 1,
            },
            EditEntry {
                revision: 1,
                body: Body::text("b"),
                applied_at: 2,
            },
        ]);
        assert_eq!(chain.latest().unwrap().body, Body::text("c"));
        assert_eq!(chain.entries()[0].revision, 0);
    }

    #[test]
    fn test_empty_chain() {
        let chain = EditChain::default();
        assert!(chain.is_empty());
        assert_eq!(chain.current_revision(), None);
        assert!(!chain.is_edited());
    }
}
