//! revtree - peer-to-peer version control for tracked items
//!
//! an embeddable history engine: the host application exposes its data as
//! tracked items, and revtree records their changes as a tree of
//! content-addressed revisions that peers exchange as encrypted packs and
//! merge without a central server.
//!
//! # Core concepts
//!
//! - **Delta**: one typed change to an item, keyed by kind
//! - **Revision**: an immutable node carrying per-item deltas and a message
//! - **Head**: the revision the live items are based on
//! - **Stash**: a detached revision set aside by name
//! - **Pack**: a compressed, encrypted bundle of revisions sent through a relay
//!
//! # Hash format
//!
//! revision id = SHA256("revtree/revision/v1" | parent_flag | parent? |
//! message_len | message | item_count | items...)
//!
//! where items are sorted by id, each is id_len | id | delta_count | deltas,
//! and deltas are sorted by kind, each kind_len | kind | tagged payload.
//! payloads use a tagged, length-prefixed value encoding in which map
//! entries are ordered by the digest of their key. the timestamp is not
//! hashed, so two peers that record the same change on the same parent
//! produce the same id. see `compute_revision_id`.
//!
//! # Example usage
//!
//! ```no_run
//! use revtree::{Selection, SectionItem, VersionControl, Workspace};
//!
//! let mut vc = VersionControl::new();
//! let mut ws = Workspace::new();
//! ws.insert(SectionItem::new("doc").with_field("title", "draft"));
//!
//! let first = vc.commit(&ws, &Selection::All, "first draft").unwrap();
//!
//! ws.section_mut("doc").unwrap().set("title", "final");
//! vc.commit(&ws, &Selection::All, "final title").unwrap();
//!
//! // bring the live items back to the first revision
//! vc.checkout(&mut ws, &first).unwrap();
//! ```

mod config;
mod error;
mod graph;
mod hash;
mod head;
mod item;
mod journal;
mod key;
mod pack;
mod stash;
mod store;
mod vcs;
mod workspace;

pub mod client;
pub mod fs;
pub mod merge;
pub mod types;

pub use client::{CancelToken, Client, DirTransport, MemoryTransport, PendingPull, Transport};
pub use config::{Config, MergeConfig, Remote};
pub use error::{Error, Result};
pub use graph::RevisionGraph;
pub use hash::{compute_fingerprint, compute_revision_id, Hash};
pub use head::{Head, Selection};
pub use item::{TrackedItem, TrackedItemsSource};
pub use key::Key;
pub use merge::{ConflictPolicy, MergeReport, PolicyKind};
pub use pack::Pack;
pub use stash::StashesRepository;
pub use store::{Store, StoreLock};
pub use types::{ChangeKind, Delta, DeltaSet, ItemChange, ItemDeltas, ItemId, Revision};
pub use vcs::{ChangeEvent, StashRef, VersionControl};
pub use workspace::{SectionItem, Workspace};
