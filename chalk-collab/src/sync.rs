//! Bidirectional sync between a [`BoardDocument`] and a [`BoardStore`].
//!
//! ```text
//!   remote update ──▶ BoardDocument ──observe_pages──▶ store.patch(pages)
//!                          ▲                              (suppressed)
//!                          │
//!   store action ──▶ push_*(…) ──▶ store.patch(pages)   one patch per push
//!                    tagged with local_id, echo skipped by the observer
//! ```
//!
//! Document changes reach the store as a full re-read of every page. Local
//! pushes are tagged with the collaborator id and write the store once after
//! the document commits; the observer drops their echo by origin.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chalk_core::{origin_matches, Asset, AssetPatch, BoardDocument, Page, Stroke, StrokePatch};
use log::{debug, info};
use yrs::Subscription;

use crate::store::{BoardStore, StorePatch};

fn lock<S>(store: &Mutex<S>) -> MutexGuard<'_, S> {
    store.lock().unwrap_or_else(|e| e.into_inner())
}

/// Raises the suppression flag for its lifetime.
struct Suppress<'a>(&'a AtomicBool);

impl<'a> Suppress<'a> {
    fn engage(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Suppress(flag)
    }
}

impl Drop for Suppress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Entry point for wiring a document to a store.
pub struct Synchronizer;

impl Synchronizer {
    /// Start syncing `doc` with `store` on behalf of collaborator `local_id`.
    ///
    /// Registers the page observer first, then performs the one-time
    /// hydration: a non-empty document overwrites the store, otherwise a
    /// non-empty store seeds the document.
    pub fn setup<S>(doc: &BoardDocument, store: Arc<Mutex<S>>, local_id: impl Into<String>) -> SyncHandle<S>
    where
        S: BoardStore + Send + 'static,
    {
        let local_id = local_id.into();
        let applying_remote = Arc::new(AtomicBool::new(false));
        let destroyed = Arc::new(AtomicBool::new(false));

        let subscription = {
            let reader = doc.clone();
            let store = store.clone();
            let applying_remote = applying_remote.clone();
            let destroyed = destroyed.clone();
            let local_id = local_id.clone();
            doc.observe_pages(move |txn| {
                if destroyed.load(Ordering::SeqCst) || origin_matches(txn, &local_id) {
                    return;
                }
                let pages = reader.read_all_pages_in(txn);
                debug!("remote page change, re-reading {} pages", pages.len());
                let _suppress = Suppress::engage(&applying_remote);
                lock(&store).patch(StorePatch::pages(pages));
            })
        };

        let handle = SyncHandle {
            doc: doc.clone(),
            store,
            local_id,
            applying_remote,
            destroyed,
            subscription: Mutex::new(Some(subscription)),
        };
        handle.hydrate();
        handle
    }
}

/// Live sync between one document and one store.
///
/// Dropping the handle has the same effect as [`SyncHandle::destroy`].
pub struct SyncHandle<S> {
    doc: BoardDocument,
    store: Arc<Mutex<S>>,
    local_id: String,
    applying_remote: Arc<AtomicBool>,
    destroyed: Arc<AtomicBool>,
    subscription: Mutex<Option<Subscription>>,
}

impl<S: BoardStore> SyncHandle<S> {
    fn hydrate(&self) {
        let doc_pages = self.doc.page_count();
        if doc_pages > 0 {
            info!("hydrating store from document ({doc_pages} pages)");
            let pages = self.doc.read_all_pages();
            let _suppress = Suppress::engage(&self.applying_remote);
            lock(&self.store).patch(StorePatch::pages(pages));
            return;
        }

        // Copy out before touching the document; the observer may lock the store.
        let store_pages = lock(&self.store).pages().to_vec();
        if !store_pages.is_empty() {
            info!("hydrating document from store ({} pages)", store_pages.len());
            self.doc.hydrate_from_state(&store_pages, Some(&self.local_id));
        }
    }

    /// Collaborator id used as the origin of every push.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn store(&self) -> &Arc<Mutex<S>> {
        &self.store
    }

    /// True while a document change is being written into the store.
    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn origin(&self) -> Option<&str> {
        if self.is_destroyed() || self.is_applying_remote() {
            return None;
        }
        Some(&self.local_id)
    }

    /// Run a tagged mutation, then write the result into the store once.
    fn push<F>(&self, mutation: F)
    where
        F: FnOnce(&BoardDocument, &str) -> bool,
    {
        let Some(origin) = self.origin() else {
            return;
        };
        if !mutation(&self.doc, origin) {
            return;
        }
        let pages = self.doc.read_all_pages();
        debug!("local push by {}, patching store", self.local_id);
        let _suppress = Suppress::engage(&self.applying_remote);
        lock(&self.store).patch(StorePatch::pages(pages));
    }

    pub fn push_add_stroke(&self, page_index: usize, stroke: &Stroke) {
        self.push(|doc, origin| doc.add_stroke(page_index, stroke, Some(origin)));
    }

    pub fn push_remove_stroke(&self, page_index: usize, stroke_id: &str) {
        self.push(|doc, origin| doc.remove_stroke(page_index, stroke_id, Some(origin)));
    }

    pub fn push_update_stroke(&self, page_index: usize, stroke_id: &str, patch: &StrokePatch) {
        self.push(|doc, origin| doc.update_stroke(page_index, stroke_id, patch, Some(origin)));
    }

    pub fn push_add_asset(&self, page_index: usize, asset: &Asset) {
        self.push(|doc, origin| doc.add_asset(page_index, asset, Some(origin)));
    }

    pub fn push_remove_asset(&self, page_index: usize, asset_id: &str) {
        self.push(|doc, origin| doc.remove_asset(page_index, asset_id, Some(origin)));
    }

    pub fn push_update_asset(&self, page_index: usize, asset_id: &str, patch: &AssetPatch) {
        self.push(|doc, origin| doc.update_asset(page_index, asset_id, patch, Some(origin)));
    }

    pub fn push_add_page(&self, page: &Page) {
        self.push(|doc, origin| doc.add_page(page, Some(origin)));
    }

    pub fn push_remove_page(&self, page_index: usize) {
        self.push(|doc, origin| doc.remove_page(page_index, Some(origin)));
    }
}

impl<S> SyncHandle<S> {
    /// Stop observing the document. Pushes become no-ops. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(subscription);
        info!("synchronizer for {} destroyed", self.local_id);
    }
}

impl<S> Drop for SyncHandle<S> {
    fn drop(&mut self) {
        self.destroy();
    }
}
