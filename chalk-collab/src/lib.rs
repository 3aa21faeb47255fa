//! # chalk-collab: Collaboration layer for Chalk boards
//!
//! Keeps an editor's local store in step with the replicated board
//! document, gives every collaborator their own undo history, and shares
//! cursors and selections through an awareness map.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  push_*(origin = me)  ┌───────────────┐  update blobs  ┌─────────┐
//! │ LocalStore  │ ────────────────────► │ BoardDocument │ ◄────────────► │  peers  │
//! │ (projection)│ ◄──────────────────── │ (yrs)         │                └─────────┘
//! └─────────────┘  full re-read on      └───────┬───────┘                     ▲
//!                  remote change                │ ChangeRecord                 │
//!                                               ▼                             │
//!                                       ┌───────────────┐                     │
//!                                       │ UndoManager   │                     │
//!                                       │ (per origin)  │                     │
//!                                       └───────────────┘                     │
//! ┌─────────────────┐   fields of local state  ┌───────────┐  awareness blobs  │
//! │ PresenceChannel │ ───────────────────────► │ Awareness │ ◄─────────────────┘
//! └─────────────────┘ ◄─── change events ───── └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`store`]: store adapter trait and the in-memory [`LocalStore`]
//! - [`sync`]: document ⇄ store synchronizer with loop prevention
//! - [`history`]: per-collaborator undo/redo with capture coalescing
//! - [`awareness`]: clocked per-client JSON states and their wire update
//! - [`presence`]: throttled cursors, selections and online users

pub mod awareness;
pub mod history;
pub mod presence;
pub mod store;
pub mod sync;

pub use awareness::{
    Awareness, AwarenessChange, AwarenessError, ChangeOrigin, ClientId, JsonMap,
    DEFAULT_OUTDATED_TIMEOUT, DEFAULT_RENEW_AFTER,
};
pub use history::{
    HistoryOptions, HistoryState, KeyInput, KeyTarget, StackEvent, StackKind, UndoManager,
    DEFAULT_CAPTURE_TIMEOUT,
};
pub use presence::{
    CursorState, OnlineUser, PresenceChannel, PresenceConfig, PresenceEntry, PresenceUser,
    RemoteCursor, RemoteSelection, SelectionState, CURSOR_THROTTLE, FADE_AFTER,
    STALE_CHECK_INTERVAL,
};
pub use store::{BoardStore, LocalStore, LocalStoreSnapshot, StorePatch};
pub use sync::{SyncHandle, Synchronizer};
