mod delta;
mod revision;

pub use delta::{ChangeKind, Delta, DeltaSet, ItemChange, ItemId};
pub use revision::{ItemDeltas, Revision};
