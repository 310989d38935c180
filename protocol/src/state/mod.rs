//! # Ledger State
//!
//! - [`patricia`] — persistent binary radix tree, the state commitment
//! - [`view`] — UTXO / circulation views layered over the tree
//! - [`snapshot`] — the tree plus replay bookkeeping as of a block

pub mod patricia;
pub mod snapshot;
pub mod view;

pub use patricia::{Delta, Mutation, Node, NodeRecord, Tree, TreeError, Value};
pub use snapshot::{Snapshot, SnapshotError};
pub use view::{AssetState, MemView, StateError, ViewChanges, ViewReader, ViewWriter};
