//! Core of the Chalk whiteboard: the plain board model and the replicated
//! document that every collaborator edits.
//!
//! ```text
//!   editor ──▶ BoardDocument (yrs) ──▶ update blobs ──▶ other replicas
//!                  │
//!                  ├── observe_pages  ──▶ store synchronizer
//!                  └── on_change      ──▶ undo history
//! ```

pub mod document;
pub mod error;
pub mod event;
pub mod model;
pub mod ops;

pub use document::{origin_matches, BoardDocument};
pub use error::DocError;
pub use event::{EventListeners, ListenerHandle};
pub use model::{
    flatten_points, unflatten_points, Asset, AssetKind, AssetPatch, Background, BoardMeta, Page,
    Point, Stroke, StrokePatch, Tool, DEFAULT_PRESSURE,
};
pub use ops::{BoardOp, ChangeRecord};

/// Re-exported so callers can name transaction and subscription types
/// without depending on `yrs` directly.
pub use yrs;
