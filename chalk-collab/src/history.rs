//! Per-collaborator undo/redo over a [`BoardDocument`].
//!
//! ```text
//!   push_*(…, origin = "u1") ──▶ ChangeRecord { origin: "u1", inverse }
//!                                       │ tracked?
//!                                       ▼
//!                               undo stack (coalesced per origin
//!                                           within capture_timeout)
//!   undo() ──▶ apply_ops(inverse, origin = manager) ──▶ ChangeRecord ──▶ redo stack
//!   redo() ──▶ apply_ops(inverse, origin = manager) ──▶ ChangeRecord ──▶ undo stack
//! ```
//!
//! Only changes tagged with a tracked origin are captured, so undoing never
//! touches another collaborator's work. Replays run against the converged
//! document and are themselves ordinary changes that replicate to peers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chalk_core::{BoardDocument, BoardOp, ChangeRecord, EventListeners, ListenerHandle};
use log::{debug, info, warn};
use uuid::Uuid;

/// Changes from one origin closer together than this merge into one step.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_millis(500);

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HistoryOptions {
    /// Transaction origins whose changes are captured, typically the local
    /// collaborator id.
    pub tracked_origins: HashSet<String>,
    pub capture_timeout: Duration,
    /// Whether [`UndoManager::handle_key`] reacts to shortcuts.
    pub enable_shortcuts: bool,
    /// Use Cmd instead of Ctrl as the shortcut modifier.
    pub mac_shortcuts: bool,
}

impl HistoryOptions {
    pub fn tracking(origin: impl Into<String>) -> Self {
        Self {
            tracked_origins: HashSet::from([origin.into()]),
            ..Self::default()
        }
    }
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            tracked_origins: HashSet::new(),
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            enable_shortcuts: true,
            mac_shortcuts: cfg!(target_os = "macos"),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Public types
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryState {
    /// Both stacks empty.
    Idle,
    /// At least one undo or redo step available.
    Active,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    Undo,
    Redo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    ItemAdded { stack: StackKind },
    /// A capture was merged into the top item.
    ItemUpdated { stack: StackKind },
    ItemPopped { stack: StackKind },
    Cleared,
}

/// Element that had keyboard focus when a key was pressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyTarget {
    #[default]
    Canvas,
    /// Text field, text area or editable content. Shortcuts go to the field.
    TextInput,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyInput {
    pub key: String,
    pub ctrl: bool,
    pub meta: bool,
    pub shift: bool,
    pub target: KeyTarget,
}

impl KeyInput {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into(), ..Self::default() }
    }

    pub fn ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn meta(mut self) -> Self {
        self.meta = true;
        self
    }

    pub fn shift(mut self) -> Self {
        self.shift = true;
        self
    }

    pub fn in_text_input(mut self) -> Self {
        self.target = KeyTarget::TextInput;
        self
    }
}

// ───────────────────────────────────────────────────────────────────
// Stacks
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StackItem {
    origin: Option<String>,
    /// Applied in order, reverts the captured changes.
    inverse: Vec<BoardOp>,
}

#[derive(Debug, Default)]
struct Stacks {
    undo: Vec<StackItem>,
    redo: Vec<StackItem>,
    /// Per-origin end of the current capture window.
    deadlines: HashMap<String, Instant>,
    /// Stack the next replay record goes to.
    replay_target: Option<StackKind>,
    replay_captured: bool,
}

impl Stacks {
    fn stack_mut(&mut self, kind: StackKind) -> &mut Vec<StackItem> {
        match kind {
            StackKind::Undo => &mut self.undo,
            StackKind::Redo => &mut self.redo,
        }
    }
}

struct Inner {
    doc: BoardDocument,
    /// Origin of undo/redo replays. Never tracked.
    replay_origin: String,
    options: HistoryOptions,
    stacks: Mutex<Stacks>,
    events: EventListeners<StackEvent>,
    destroyed: AtomicBool,
    change_listener: Mutex<Option<ListenerHandle>>,
}

impl Inner {
    fn stacks(&self) -> MutexGuard<'_, Stacks> {
        self.stacks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn capture(&self, record: &ChangeRecord) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let event = if record.has_origin(&self.replay_origin) {
            self.capture_replay(record)
        } else if record
            .origin
            .as_ref()
            .is_some_and(|o| self.options.tracked_origins.contains(o))
        {
            if record.replaces_pages() {
                debug!("whole-board reset by {:?} not captured", record.origin);
                return;
            }
            Some(self.capture_tracked(record))
        } else {
            None
        };
        if let Some(event) = event {
            self.events.emit(&event);
        }
    }

    fn capture_replay(&self, record: &ChangeRecord) -> Option<StackEvent> {
        let mut stacks = self.stacks();
        let Some(target) = stacks.replay_target else {
            warn!("replay change outside undo/redo ignored");
            return None;
        };
        stacks.replay_captured = true;
        stacks.stack_mut(target).push(StackItem {
            origin: record.origin.clone(),
            inverse: record.inverse.clone(),
        });
        Some(StackEvent::ItemAdded { stack: target })
    }

    fn capture_tracked(&self, record: &ChangeRecord) -> StackEvent {
        let now = Instant::now();
        let timeout = self.options.capture_timeout;
        let mut stacks = self.stacks();
        stacks.redo.clear();

        let origin = record.origin.clone().unwrap_or_default();
        let open_window = stacks.deadlines.get(&origin).is_some_and(|deadline| now < *deadline);
        stacks.deadlines.insert(origin, now + timeout);

        if open_window {
            if let Some(top) = stacks.undo.last_mut() {
                if top.origin == record.origin {
                    // Newest change must be reverted first.
                    let mut merged = record.inverse.clone();
                    merged.append(&mut top.inverse);
                    top.inverse = merged;
                    return StackEvent::ItemUpdated { stack: StackKind::Undo };
                }
            }
        }
        stacks.undo.push(StackItem {
            origin: record.origin.clone(),
            inverse: record.inverse.clone(),
        });
        StackEvent::ItemAdded { stack: StackKind::Undo }
    }

    /// Pop from `from` and replay until one item actually changes the
    /// document. Items whose targets have all vanished are discarded.
    fn replay(&self, from: StackKind) -> bool {
        if self.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        let to = match from {
            StackKind::Undo => StackKind::Redo,
            StackKind::Redo => StackKind::Undo,
        };
        loop {
            let item = {
                let mut stacks = self.stacks();
                let Some(item) = stacks.stack_mut(from).pop() else {
                    return false;
                };
                stacks.replay_target = Some(to);
                stacks.replay_captured = false;
                // Replays close every capture window.
                stacks.deadlines.clear();
                item
            };
            self.events.emit(&StackEvent::ItemPopped { stack: from });

            self.doc.apply_ops(&item.inverse, Some(&self.replay_origin));

            let captured = {
                let mut stacks = self.stacks();
                stacks.replay_target = None;
                stacks.replay_captured
            };
            if captured {
                debug!("{from:?} replayed {} ops", item.inverse.len());
                return true;
            }
            debug!("{from:?} item had no remaining targets, discarded");
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Undo manager
// ───────────────────────────────────────────────────────────────────

/// Undo/redo scoped to the pages of one document and a set of origins.
pub struct UndoManager {
    inner: Arc<Inner>,
}

impl UndoManager {
    pub fn new(doc: &BoardDocument, options: HistoryOptions) -> Self {
        let inner = Arc::new(Inner {
            doc: doc.clone(),
            replay_origin: format!("undo-manager:{}", Uuid::new_v4()),
            options,
            stacks: Mutex::new(Stacks::default()),
            events: EventListeners::new(),
            destroyed: AtomicBool::new(false),
            change_listener: Mutex::new(None),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let listener = doc.on_change(move |record| {
            if let Some(inner) = weak.upgrade() {
                inner.capture(record);
            }
        });
        *inner.change_listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener);

        info!("undo manager tracking {:?}", inner.options.tracked_origins);
        Self { inner }
    }

    /// Origin tag carried by undo/redo replays.
    pub fn replay_origin(&self) -> &str {
        &self.inner.replay_origin
    }

    pub fn can_undo(&self) -> bool {
        self.undo_count() > 0
    }

    pub fn can_redo(&self) -> bool {
        self.redo_count() > 0
    }

    pub fn undo_count(&self) -> usize {
        self.inner.stacks().undo.len()
    }

    pub fn redo_count(&self) -> usize {
        self.inner.stacks().redo.len()
    }

    pub fn state(&self) -> HistoryState {
        if self.is_destroyed() {
            return HistoryState::Destroyed;
        }
        let stacks = self.inner.stacks();
        if stacks.undo.is_empty() && stacks.redo.is_empty() {
            HistoryState::Idle
        } else {
            HistoryState::Active
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    pub fn on_stack_change<F>(&self, f: F) -> ListenerHandle
    where
        F: Fn(&StackEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(f)
    }

    /// Revert the most recent captured step. Returns whether anything changed.
    pub fn undo(&self) -> bool {
        self.inner.replay(StackKind::Undo)
    }

    pub fn redo(&self) -> bool {
        self.inner.replay(StackKind::Redo)
    }

    /// Close every open capture window so the next change starts a new step.
    pub fn stop_capturing(&self) {
        self.inner.stacks().deadlines.clear();
    }

    pub fn clear(&self) {
        if self.is_destroyed() {
            return;
        }
        {
            let mut stacks = self.inner.stacks();
            stacks.undo.clear();
            stacks.redo.clear();
            stacks.deadlines.clear();
        }
        self.inner.events.emit(&StackEvent::Cleared);
    }

    /// Ctrl+Z undoes, Ctrl+Shift+Z redoes (Cmd on macOS). Returns whether
    /// the key was consumed as a shortcut.
    pub fn handle_key(&self, input: &KeyInput) -> bool {
        if self.is_destroyed() || !self.inner.options.enable_shortcuts {
            return false;
        }
        if input.target == KeyTarget::TextInput {
            return false;
        }
        let modifier = if self.inner.options.mac_shortcuts { input.meta } else { input.ctrl };
        if !modifier || !input.key.eq_ignore_ascii_case("z") {
            return false;
        }
        if input.shift {
            self.redo();
        } else {
            self.undo();
        }
        true
    }

    /// Detach from the document and drop both stacks. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let listener = self
            .inner
            .change_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(listener);
        *self.inner.stacks() = Stacks::default();
        info!("undo manager destroyed");
    }
}

impl Drop for UndoManager {
    fn drop(&mut self) {
        self.destroy();
    }
}
