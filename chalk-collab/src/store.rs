//! Local board store the editor renders from.
//!
//! Once collaboration is active the store is a projection of the replicated
//! document: the synchronizer is its only writer.

use chalk_core::Page;
use log::debug;

/// What the synchronizer needs from the editor's state store.
pub trait BoardStore {
    fn pages(&self) -> &[Page];
    fn current_page_index(&self) -> usize;
    fn is_dirty(&self) -> bool;

    /// Replace the fields present in `patch`.
    fn patch(&mut self, patch: StorePatch);
    fn mark_dirty(&mut self);
    fn go_to_page(&mut self, index: usize);
}

/// Partial store update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorePatch {
    pub pages: Option<Vec<Page>>,
    pub current_page_index: Option<usize>,
    pub is_dirty: Option<bool>,
}

impl StorePatch {
    pub fn pages(pages: Vec<Page>) -> Self {
        Self { pages: Some(pages), ..Self::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalStoreSnapshot {
    pub pages: Vec<Page>,
    pub current_page_index: usize,
    pub is_dirty: bool,
}

/// In-memory [`BoardStore`].
#[derive(Debug, Default)]
pub struct LocalStore {
    state: LocalStoreSnapshot,
    patch_count: usize,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pages(pages: Vec<Page>) -> Self {
        Self {
            state: LocalStoreSnapshot { pages, ..LocalStoreSnapshot::default() },
            patch_count: 0,
        }
    }

    pub fn snapshot(&self) -> LocalStoreSnapshot {
        self.state.clone()
    }

    /// Number of `patch` calls received so far.
    pub fn patch_count(&self) -> usize {
        self.patch_count
    }

    fn clamp_page_index(&mut self) {
        let last = self.state.pages.len().saturating_sub(1);
        if self.state.current_page_index > last {
            self.state.current_page_index = last;
        }
    }
}

impl BoardStore for LocalStore {
    fn pages(&self) -> &[Page] {
        &self.state.pages
    }

    fn current_page_index(&self) -> usize {
        self.state.current_page_index
    }

    fn is_dirty(&self) -> bool {
        self.state.is_dirty
    }

    fn patch(&mut self, patch: StorePatch) {
        self.patch_count += 1;
        if let Some(pages) = patch.pages {
            debug!("store patch: {} pages", pages.len());
            self.state.pages = pages;
        }
        if let Some(index) = patch.current_page_index {
            self.state.current_page_index = index;
        }
        if let Some(dirty) = patch.is_dirty {
            self.state.is_dirty = dirty;
        }
        self.clamp_page_index();
    }

    fn mark_dirty(&mut self) {
        self.state.is_dirty = true;
    }

    fn go_to_page(&mut self, index: usize) {
        if index < self.state.pages.len() {
            self.state.current_page_index = index;
        }
    }
}
