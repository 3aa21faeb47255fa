//! Replicated board document on top of a `yrs::Doc`.
//!
//! ```text
//!   root
//!    ├── meta : Map   { sessionId, name, createdAt, rev }
//!    └── pages: Array [ Map { id, name, background, width?, height?,
//!                             strokes: Array [ Map { id, tool, color, size, opacity,
//!                                                    text?, width?, height?,
//!                                                    points: Array [x0, y0, p0, ...] } ],
//!                             assets:  Array [ Map { id, type, src, x, y, w, h, rotation } ] } ]
//! ```
//!
//! Every page mutation runs in a single transaction tagged with the caller's
//! origin. Before it touches anything it records the inverse operations, and
//! once the transaction commits a [`ChangeRecord`] is emitted to `on_change`
//! listeners. Remote updates never produce change records.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, DeepObservable, Doc, In, Map, MapPrelim, MapRef, Origin,
    Out, ReadTxn, StateVector, Subscription, Transact, TransactionMut, Update,
};

use crate::error::DocError;
use crate::event::{EventListeners, ListenerHandle};
use crate::model::{
    flatten_points, unflatten_points, Asset, AssetKind, AssetPatch, Background, BoardMeta, Page,
    Point, Stroke, StrokePatch, Tool,
};
use crate::ops::{BoardOp, ChangeRecord};

const META: &str = "meta";
const PAGES: &str = "pages";

const SESSION_ID: &str = "sessionId";
const CREATED_AT: &str = "createdAt";
const REVISION: &str = "rev";

const ID: &str = "id";
const NAME: &str = "name";
const BACKGROUND: &str = "background";
const WIDTH: &str = "width";
const HEIGHT: &str = "height";
const STROKES: &str = "strokes";
const ASSETS: &str = "assets";

const TOOL: &str = "tool";
const COLOR: &str = "color";
const SIZE: &str = "size";
const OPACITY: &str = "opacity";
const TEXT: &str = "text";
const POINTS: &str = "points";

const KIND: &str = "type";
const SRC: &str = "src";
const X: &str = "x";
const Y: &str = "y";
const W: &str = "w";
const H: &str = "h";
const ROTATION: &str = "rotation";

const PDF_TYPE: &str = "pdf";
const PDF_URL: &str = "url";
const PDF_ASSET_ID: &str = "assetId";

const DEFAULT_COLOR: &str = "#000000";
const DEFAULT_SIZE: f64 = 2.0;
const DEFAULT_OPACITY: f64 = 1.0;
const DEFAULT_ASSET_EXTENT: f64 = 100.0;

/// Handle to one replicated board. Clones share the same underlying document.
#[derive(Clone)]
pub struct BoardDocument {
    doc: Doc,
    meta: MapRef,
    pages: ArrayRef,
    changes: EventListeners<ChangeRecord>,
}

impl BoardDocument {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Document with a fixed replica id. Two replicas must never share one.
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id.into()))
    }

    fn from_doc(doc: Doc) -> Self {
        let meta = doc.get_or_insert_map(META);
        let pages = doc.get_or_insert_array(PAGES);
        Self { doc, meta, pages, changes: EventListeners::new() }
    }

    /// The underlying yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    // ─── Transactions ───────────────────────────────────────────────

    fn transact_with(&self, origin: Option<&str>) -> TransactionMut<'_> {
        match origin {
            Some(origin) => self.doc.transact_mut_with(origin),
            None => self.doc.transact_mut(),
        }
    }

    /// Run `f` in one tagged transaction. `f` returns inverses in the order
    /// it applied its mutations; they are reversed so replaying them in
    /// sequence reverts the whole transaction. Returns whether anything
    /// changed.
    fn mutate<F>(&self, origin: Option<&str>, f: F) -> bool
    where
        F: FnOnce(&mut TransactionMut<'_>) -> Vec<BoardOp>,
    {
        let mut inverse = {
            let mut txn = self.transact_with(origin);
            f(&mut txn)
        };
        if inverse.is_empty() {
            return false;
        }
        inverse.reverse();
        self.changes.emit(&ChangeRecord { origin: origin.map(str::to_owned), inverse });
        true
    }

    /// Listen for committed page mutations made through this handle (or any
    /// clone of it).
    pub fn on_change<F>(&self, f: F) -> ListenerHandle
    where
        F: Fn(&ChangeRecord) + Send + Sync + 'static,
    {
        self.changes.subscribe(f)
    }

    /// Deep observer over the page tree. The callback gets the committing
    /// transaction; read through it with the `*_in` methods, since opening
    /// another transaction from inside the callback would block.
    pub fn observe_pages<F>(&self, f: F) -> Subscription
    where
        F: Fn(&TransactionMut<'_>) + Send + Sync + 'static,
    {
        self.pages.observe_deep(move |txn, _events| f(txn))
    }

    // ─── Meta ───────────────────────────────────────────────────────

    pub fn set_meta(&self, meta: &BoardMeta, origin: Option<&str>) {
        let mut txn = self.transact_with(origin);
        self.meta.insert(&mut txn, SESSION_ID, meta.session_id.as_str());
        self.meta.insert(&mut txn, NAME, meta.name.as_str());
        self.meta.insert(&mut txn, CREATED_AT, meta.created_at as f64);
        self.meta.insert(&mut txn, REVISION, meta.revision as f64);
    }

    pub fn meta(&self) -> BoardMeta {
        let txn = self.doc.transact();
        self.meta_in(&txn)
    }

    pub fn meta_in<T: ReadTxn>(&self, txn: &T) -> BoardMeta {
        let defaults = BoardMeta::default();
        BoardMeta {
            session_id: read_str(&self.meta, txn, SESSION_ID).unwrap_or(defaults.session_id),
            name: read_str(&self.meta, txn, NAME).unwrap_or(defaults.name),
            created_at: read_num(&self.meta, txn, CREATED_AT).map_or(defaults.created_at, |n| n as i64),
            revision: read_num(&self.meta, txn, REVISION)
                .filter(|n| *n >= 0.0)
                .map_or(defaults.revision, |n| n as u64),
        }
    }

    /// Increment the stored revision and return the new value.
    pub fn bump_revision(&self, origin: Option<&str>) -> u64 {
        let mut txn = self.transact_with(origin);
        let next = self.meta_in(&txn).revision + 1;
        self.meta.insert(&mut txn, REVISION, next as f64);
        next
    }

    // ─── Pages ──────────────────────────────────────────────────────

    pub fn add_page(&self, page: &Page, origin: Option<&str>) -> bool {
        self.mutate(origin, |txn| vec![self.insert_page(txn, None, page)])
    }

    pub fn remove_page(&self, index: usize, origin: Option<&str>) -> bool {
        self.mutate(origin, |txn| {
            let removed = to_index(index).and_then(|i| self.remove_page_at(txn, i));
            if removed.is_none() {
                warn!("remove_page: no page at index {index}");
            }
            removed.into_iter().collect()
        })
    }

    /// Replace every page in one transaction.
    pub fn hydrate_from_state(&self, pages: &[Page], origin: Option<&str>) {
        self.mutate(origin, |txn| self.replace_pages(txn, pages).into_iter().collect());
        debug!("hydrated document with {} pages", pages.len());
    }

    // ─── Strokes ────────────────────────────────────────────────────

    pub fn add_stroke(&self, page_index: usize, stroke: &Stroke, origin: Option<&str>) -> bool {
        self.mutate(origin, |txn| {
            let Some((page, page_id)) = self.page_with_id(txn, page_index, "add_stroke") else {
                return Vec::new();
            };
            self.insert_stroke(txn, &page, &page_id, None, stroke)
                .into_iter()
                .collect()
        })
    }

    pub fn remove_stroke(&self, page_index: usize, stroke_id: &str, origin: Option<&str>) -> bool {
        self.mutate(origin, |txn| {
            let Some((page, page_id)) = self.page_with_id(txn, page_index, "remove_stroke") else {
                return Vec::new();
            };
            self.delete_stroke(txn, &page, &page_id, stroke_id)
                .into_iter()
                .collect()
        })
    }

    pub fn update_stroke(
        &self,
        page_index: usize,
        stroke_id: &str,
        patch: &StrokePatch,
        origin: Option<&str>,
    ) -> bool {
        self.mutate(origin, |txn| {
            let Some((page, page_id)) = self.page_with_id(txn, page_index, "update_stroke") else {
                return Vec::new();
            };
            self.patch_stroke(txn, &page, &page_id, stroke_id, patch)
                .into_iter()
                .collect()
        })
    }

    // ─── Assets ─────────────────────────────────────────────────────

    pub fn add_asset(&self, page_index: usize, asset: &Asset, origin: Option<&str>) -> bool {
        self.mutate(origin, |txn| {
            let Some((page, page_id)) = self.page_with_id(txn, page_index, "add_asset") else {
                return Vec::new();
            };
            self.insert_asset(txn, &page, &page_id, None, asset)
                .into_iter()
                .collect()
        })
    }

    pub fn remove_asset(&self, page_index: usize, asset_id: &str, origin: Option<&str>) -> bool {
        self.mutate(origin, |txn| {
            let Some((page, page_id)) = self.page_with_id(txn, page_index, "remove_asset") else {
                return Vec::new();
            };
            self.delete_asset(txn, &page, &page_id, asset_id)
                .into_iter()
                .collect()
        })
    }

    pub fn update_asset(
        &self,
        page_index: usize,
        asset_id: &str,
        patch: &AssetPatch,
        origin: Option<&str>,
    ) -> bool {
        self.mutate(origin, |txn| {
            let Some((page, page_id)) = self.page_with_id(txn, page_index, "update_asset") else {
                return Vec::new();
            };
            self.patch_asset(txn, &page, &page_id, asset_id, patch)
                .into_iter()
                .collect()
        })
    }

    // ─── Batches ────────────────────────────────────────────────────

    /// Apply page-id addressed operations in one transaction. Operations whose
    /// target no longer exists are skipped.
    pub fn apply_ops(&self, ops: &[BoardOp], origin: Option<&str>) -> bool {
        self.mutate(origin, |txn| {
            ops.iter().filter_map(|op| self.apply_op(txn, op)).collect()
        })
    }

    fn apply_op(&self, txn: &mut TransactionMut<'_>, op: &BoardOp) -> Option<BoardOp> {
        match op {
            BoardOp::InsertPage { index, page } => Some(self.insert_page(txn, Some(*index), page)),
            BoardOp::RemovePage { page_id } => {
                let index = position_by_id(&self.pages, txn, page_id)?;
                self.remove_page_at(txn, index)
            }
            BoardOp::ReplacePages { pages } => self.replace_pages(txn, pages),
            BoardOp::InsertStroke { page_id, index, stroke } => {
                let page = self.page_by_id(txn, page_id)?;
                self.insert_stroke(txn, &page, page_id, *index, stroke)
            }
            BoardOp::RemoveStroke { page_id, stroke_id } => {
                let page = self.page_by_id(txn, page_id)?;
                self.delete_stroke(txn, &page, page_id, stroke_id)
            }
            BoardOp::UpdateStroke { page_id, stroke_id, patch } => {
                let page = self.page_by_id(txn, page_id)?;
                self.patch_stroke(txn, &page, page_id, stroke_id, patch)
            }
            BoardOp::InsertAsset { page_id, index, asset } => {
                let page = self.page_by_id(txn, page_id)?;
                self.insert_asset(txn, &page, page_id, *index, asset)
            }
            BoardOp::RemoveAsset { page_id, asset_id } => {
                let page = self.page_by_id(txn, page_id)?;
                self.delete_asset(txn, &page, page_id, asset_id)
            }
            BoardOp::UpdateAsset { page_id, asset_id, patch } => {
                let page = self.page_by_id(txn, page_id)?;
                self.patch_asset(txn, &page, page_id, asset_id, patch)
            }
        }
    }

    // ─── Reads ──────────────────────────────────────────────────────

    pub fn page_count(&self) -> usize {
        let txn = self.doc.transact();
        self.page_count_in(&txn)
    }

    pub fn page_count_in<T: ReadTxn>(&self, txn: &T) -> usize {
        self.pages.len(txn) as usize
    }

    pub fn read_all_pages(&self) -> Vec<Page> {
        let txn = self.doc.transact();
        self.read_all_pages_in(&txn)
    }

    pub fn read_all_pages_in<T: ReadTxn>(&self, txn: &T) -> Vec<Page> {
        decode_maps(&self.pages, txn, decode_page)
    }

    pub fn read_page(&self, index: usize) -> Option<Page> {
        let txn = self.doc.transact();
        let page = self.page_at(&txn, to_index(index)?)?;
        Some(decode_page(&page, &txn))
    }

    /// Strokes of the page at `index`; empty when there is no such page.
    pub fn read_page_strokes(&self, index: usize) -> Vec<Stroke> {
        let txn = self.doc.transact();
        self.read_page_strokes_in(&txn, index)
    }

    pub fn read_page_strokes_in<T: ReadTxn>(&self, txn: &T, index: usize) -> Vec<Stroke> {
        to_index(index)
            .and_then(|i| self.page_at(txn, i))
            .and_then(|page| child_array(&page, txn, STROKES))
            .map(|strokes| decode_maps(&strokes, txn, decode_stroke))
            .unwrap_or_default()
    }

    pub fn read_page_assets(&self, index: usize) -> Vec<Asset> {
        let txn = self.doc.transact();
        self.read_page_assets_in(&txn, index)
    }

    pub fn read_page_assets_in<T: ReadTxn>(&self, txn: &T, index: usize) -> Vec<Asset> {
        to_index(index)
            .and_then(|i| self.page_at(txn, i))
            .and_then(|page| child_array(&page, txn, ASSETS))
            .map(|assets| decode_maps(&assets, txn, decode_asset))
            .unwrap_or_default()
    }

    // ─── Update blobs ───────────────────────────────────────────────

    /// Full document state as a v1 update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that the owner of `remote_state_vector` lacks.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(remote_state_vector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Merge a v1 update produced by another replica.
    pub fn apply_update(&self, update: &[u8], origin: Option<&str>) -> Result<(), DocError> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.transact_with(origin);
        txn.apply_update(update)
            .map_err(|e| DocError::Apply(e.to_string()))
    }

    // ─── Internals ──────────────────────────────────────────────────

    fn page_at<T: ReadTxn>(&self, txn: &T, index: u32) -> Option<MapRef> {
        match self.pages.get(txn, index)? {
            Out::YMap(page) => Some(page),
            _ => None,
        }
    }

    fn page_by_id<T: ReadTxn>(&self, txn: &T, page_id: &str) -> Option<MapRef> {
        let index = position_by_id(&self.pages, txn, page_id)?;
        self.page_at(txn, index)
    }

    fn page_with_id<T: ReadTxn>(&self, txn: &T, index: usize, op: &str) -> Option<(MapRef, String)> {
        let page = to_index(index).and_then(|i| self.page_at(txn, i));
        match page {
            Some(page) => {
                let id = read_str(&page, txn, ID).unwrap_or_default();
                Some((page, id))
            }
            None => {
                warn!("{op}: no page at index {index}");
                None
            }
        }
    }

    fn insert_page(&self, txn: &mut TransactionMut<'_>, index: Option<u32>, page: &Page) -> BoardOp {
        let len = self.pages.len(txn);
        let at = index.map_or(len, |i| i.min(len));
        self.pages.insert(txn, at, page_prelim(page));
        BoardOp::RemovePage { page_id: page.id.clone() }
    }

    fn remove_page_at(&self, txn: &mut TransactionMut<'_>, index: u32) -> Option<BoardOp> {
        let page = self.page_at(txn, index)?;
        let page = decode_page(&page, txn);
        self.pages.remove(txn, index);
        Some(BoardOp::InsertPage { index, page })
    }

    fn replace_pages(&self, txn: &mut TransactionMut<'_>, pages: &[Page]) -> Option<BoardOp> {
        let before = self.read_all_pages_in(txn);
        let len = self.pages.len(txn);
        if len > 0 {
            self.pages.remove_range(txn, 0, len);
        }
        for page in pages {
            self.pages.push_back(txn, page_prelim(page));
        }
        if before.is_empty() && pages.is_empty() {
            None
        } else {
            Some(BoardOp::ReplacePages { pages: before })
        }
    }

    fn insert_stroke(
        &self,
        txn: &mut TransactionMut<'_>,
        page: &MapRef,
        page_id: &str,
        index: Option<u32>,
        stroke: &Stroke,
    ) -> Option<BoardOp> {
        let strokes = child_array(page, txn, STROKES)?;
        let len = strokes.len(txn);
        let at = index.map_or(len, |i| i.min(len));
        strokes.insert(txn, at, stroke_prelim(stroke));
        Some(BoardOp::RemoveStroke { page_id: page_id.to_string(), stroke_id: stroke.id.clone() })
    }

    fn delete_stroke(
        &self,
        txn: &mut TransactionMut<'_>,
        page: &MapRef,
        page_id: &str,
        stroke_id: &str,
    ) -> Option<BoardOp> {
        let strokes = child_array(page, txn, STROKES)?;
        let index = position_by_id(&strokes, txn, stroke_id)?;
        let stroke = match strokes.get(txn, index)? {
            Out::YMap(map) => decode_stroke(&map, txn),
            _ => return None,
        };
        strokes.remove(txn, index);
        Some(BoardOp::InsertStroke { page_id: page_id.to_string(), index: Some(index), stroke })
    }

    fn patch_stroke(
        &self,
        txn: &mut TransactionMut<'_>,
        page: &MapRef,
        page_id: &str,
        stroke_id: &str,
        patch: &StrokePatch,
    ) -> Option<BoardOp> {
        if patch.is_empty() {
            return None;
        }
        let strokes = child_array(page, txn, STROKES)?;
        let index = position_by_id(&strokes, txn, stroke_id)?;
        let map = match strokes.get(txn, index)? {
            Out::YMap(map) => map,
            _ => return None,
        };
        let before = decode_stroke(&map, txn);
        write_stroke_patch(&map, txn, patch);
        Some(BoardOp::UpdateStroke {
            page_id: page_id.to_string(),
            stroke_id: stroke_id.to_string(),
            patch: patch.inverse_for(&before),
        })
    }

    fn insert_asset(
        &self,
        txn: &mut TransactionMut<'_>,
        page: &MapRef,
        page_id: &str,
        index: Option<u32>,
        asset: &Asset,
    ) -> Option<BoardOp> {
        let assets = child_array(page, txn, ASSETS)?;
        let len = assets.len(txn);
        let at = index.map_or(len, |i| i.min(len));
        assets.insert(txn, at, asset_prelim(asset));
        Some(BoardOp::RemoveAsset { page_id: page_id.to_string(), asset_id: asset.id.clone() })
    }

    fn delete_asset(
        &self,
        txn: &mut TransactionMut<'_>,
        page: &MapRef,
        page_id: &str,
        asset_id: &str,
    ) -> Option<BoardOp> {
        let assets = child_array(page, txn, ASSETS)?;
        let index = position_by_id(&assets, txn, asset_id)?;
        let asset = match assets.get(txn, index)? {
            Out::YMap(map) => decode_asset(&map, txn),
            _ => return None,
        };
        assets.remove(txn, index);
        Some(BoardOp::InsertAsset { page_id: page_id.to_string(), index: Some(index), asset })
    }

    fn patch_asset(
        &self,
        txn: &mut TransactionMut<'_>,
        page: &MapRef,
        page_id: &str,
        asset_id: &str,
        patch: &AssetPatch,
    ) -> Option<BoardOp> {
        if patch.is_empty() {
            return None;
        }
        let assets = child_array(page, txn, ASSETS)?;
        let index = position_by_id(&assets, txn, asset_id)?;
        let map = match assets.get(txn, index)? {
            Out::YMap(map) => map,
            _ => return None,
        };
        let before = decode_asset(&map, txn);
        write_asset_patch(&map, txn, patch);
        Some(BoardOp::UpdateAsset {
            page_id: page_id.to_string(),
            asset_id: asset_id.to_string(),
            patch: patch.inverse_for(&before),
        })
    }
}

impl Default for BoardDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BoardDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardDocument")
            .field("change_listeners", &self.changes.len())
            .finish_non_exhaustive()
    }
}

/// Whether `txn` was opened with `origin`.
pub fn origin_matches(txn: &TransactionMut<'_>, origin: &str) -> bool {
    txn.origin() == Some(&Origin::from(origin))
}

fn to_index(index: usize) -> Option<u32> {
    u32::try_from(index).ok()
}

// ─── Decoding ───────────────────────────────────────────────────────

fn read_str<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<String> {
    match map.get(txn, key)? {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

fn read_num<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<f64> {
    match map.get(txn, key)? {
        Out::Any(Any::Number(n)) => Some(n),
        Out::Any(Any::BigInt(n)) => Some(n as f64),
        _ => None,
    }
}

fn child_array<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<ArrayRef> {
    match map.get(txn, key)? {
        Out::YArray(array) => Some(array),
        _ => None,
    }
}

fn position_by_id<T: ReadTxn>(array: &ArrayRef, txn: &T, id: &str) -> Option<u32> {
    array
        .iter(txn)
        .position(|item| match item {
            Out::YMap(map) => read_str(&map, txn, ID).as_deref() == Some(id),
            _ => false,
        })
        .and_then(|i| u32::try_from(i).ok())
}

/// Decode every map element of `array`, skipping anything that is not a map.
fn decode_maps<T: ReadTxn, R>(array: &ArrayRef, txn: &T, decode: fn(&MapRef, &T) -> R) -> Vec<R> {
    array
        .iter(txn)
        .filter_map(|item| match item {
            Out::YMap(map) => Some(decode(&map, txn)),
            _ => {
                warn!("skipping non-map element in board array");
                None
            }
        })
        .collect()
}

fn decode_page<T: ReadTxn>(map: &MapRef, txn: &T) -> Page {
    Page {
        id: read_str(map, txn, ID).unwrap_or_default(),
        name: read_str(map, txn, NAME).unwrap_or_default(),
        background: decode_background(map.get(txn, BACKGROUND), txn),
        width: read_num(map, txn, WIDTH),
        height: read_num(map, txn, HEIGHT),
        strokes: child_array(map, txn, STROKES)
            .map(|strokes| decode_maps(&strokes, txn, decode_stroke))
            .unwrap_or_default(),
        assets: child_array(map, txn, ASSETS)
            .map(|assets| decode_maps(&assets, txn, decode_asset))
            .unwrap_or_default(),
    }
}

fn decode_background<T: ReadTxn>(raw: Option<Out>, txn: &T) -> Background {
    let pdf = match raw {
        Some(Out::Any(Any::String(name))) => return Background::from_flat(&name),
        Some(Out::Any(Any::Map(fields))) => {
            let field = |key: &str| match fields.get(key) {
                Some(Any::String(s)) => Some(s.to_string()),
                _ => None,
            };
            pdf_background(field(KIND), field(PDF_URL), field(PDF_ASSET_ID))
        }
        Some(Out::YMap(map)) => pdf_background(
            read_str(&map, txn, KIND),
            read_str(&map, txn, PDF_URL),
            read_str(&map, txn, PDF_ASSET_ID),
        ),
        _ => None,
    };
    pdf.unwrap_or_default()
}

fn pdf_background(kind: Option<String>, url: Option<String>, asset_id: Option<String>) -> Option<Background> {
    if kind.as_deref() != Some(PDF_TYPE) {
        return None;
    }
    Some(Background::Pdf { url: url?, asset_id: asset_id? })
}

fn decode_stroke<T: ReadTxn>(map: &MapRef, txn: &T) -> Stroke {
    let flat: Vec<f64> = child_array(map, txn, POINTS)
        .map(|points| {
            points
                .iter(txn)
                .filter_map(|v| match v {
                    Out::Any(Any::Number(n)) => Some(n),
                    Out::Any(Any::BigInt(n)) => Some(n as f64),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Stroke {
        id: read_str(map, txn, ID).unwrap_or_default(),
        tool: read_str(map, txn, TOOL).map_or(Tool::Pen, |t| Tool::parse(&t)),
        color: read_str(map, txn, COLOR).unwrap_or_else(|| DEFAULT_COLOR.to_string()),
        size: read_num(map, txn, SIZE).unwrap_or(DEFAULT_SIZE),
        opacity: read_num(map, txn, OPACITY).unwrap_or(DEFAULT_OPACITY),
        points: unflatten_points(&flat),
        text: read_str(map, txn, TEXT),
        width: read_num(map, txn, WIDTH),
        height: read_num(map, txn, HEIGHT),
    }
}

fn decode_asset<T: ReadTxn>(map: &MapRef, txn: &T) -> Asset {
    Asset {
        id: read_str(map, txn, ID).unwrap_or_default(),
        kind: read_str(map, txn, KIND).map_or(AssetKind::Image, |k| AssetKind::parse(&k)),
        src: read_str(map, txn, SRC).unwrap_or_default(),
        x: read_num(map, txn, X).unwrap_or(0.0),
        y: read_num(map, txn, Y).unwrap_or(0.0),
        w: read_num(map, txn, W).unwrap_or(DEFAULT_ASSET_EXTENT),
        h: read_num(map, txn, H).unwrap_or(DEFAULT_ASSET_EXTENT),
        rotation: read_num(map, txn, ROTATION).unwrap_or(0.0),
    }
}

// ─── Encoding ───────────────────────────────────────────────────────

fn text(value: &str) -> In {
    In::Any(Any::String(value.into()))
}

fn number(value: f64) -> In {
    In::Any(Any::Number(value))
}

fn background_value(background: &Background) -> Any {
    match background {
        Background::Pdf { url, asset_id } => {
            let mut fields = HashMap::new();
            fields.insert(KIND.to_string(), Any::String(PDF_TYPE.into()));
            fields.insert(PDF_URL.to_string(), Any::String(url.as_str().into()));
            fields.insert(PDF_ASSET_ID.to_string(), Any::String(asset_id.as_str().into()));
            Any::Map(Arc::new(fields))
        }
        flat => Any::String(flat.flat_name().unwrap_or("white").into()),
    }
}

fn points_prelim(points: &[Point]) -> ArrayPrelim {
    flatten_points(points).into_iter().map(number).collect()
}

fn page_prelim(page: &Page) -> MapPrelim {
    let mut entries: Vec<(&str, In)> = vec![
        (ID, text(&page.id)),
        (NAME, text(&page.name)),
        (BACKGROUND, In::Any(background_value(&page.background))),
        (STROKES, In::Array(page.strokes.iter().map(|s| In::Map(stroke_prelim(s))).collect())),
        (ASSETS, In::Array(page.assets.iter().map(|a| In::Map(asset_prelim(a))).collect())),
    ];
    if let Some(width) = page.width {
        entries.push((WIDTH, number(width)));
    }
    if let Some(height) = page.height {
        entries.push((HEIGHT, number(height)));
    }
    entries.into_iter().collect()
}

fn stroke_prelim(stroke: &Stroke) -> MapPrelim {
    let mut entries: Vec<(&str, In)> = vec![
        (ID, text(&stroke.id)),
        (TOOL, text(stroke.tool.as_str())),
        (COLOR, text(&stroke.color)),
        (SIZE, number(stroke.size)),
        (OPACITY, number(stroke.opacity)),
        (POINTS, In::Array(points_prelim(&stroke.points))),
    ];
    if let Some(content) = &stroke.text {
        entries.push((TEXT, text(content)));
    }
    if let Some(width) = stroke.width {
        entries.push((WIDTH, number(width)));
    }
    if let Some(height) = stroke.height {
        entries.push((HEIGHT, number(height)));
    }
    entries.into_iter().collect()
}

fn asset_prelim(asset: &Asset) -> MapPrelim {
    let entries: Vec<(&str, In)> = vec![
        (ID, text(&asset.id)),
        (KIND, text(asset.kind.as_str())),
        (SRC, text(&asset.src)),
        (X, number(asset.x)),
        (Y, number(asset.y)),
        (W, number(asset.w)),
        (H, number(asset.h)),
        (ROTATION, number(asset.rotation)),
    ];
    entries.into_iter().collect()
}

fn write_optional_num(map: &MapRef, txn: &mut TransactionMut<'_>, key: &str, value: Option<f64>) {
    match value {
        Some(v) => {
            map.insert(txn, key, v);
        }
        None => {
            map.remove(txn, key);
        }
    }
}

fn write_stroke_patch(map: &MapRef, txn: &mut TransactionMut<'_>, patch: &StrokePatch) {
    if let Some(tool) = patch.tool {
        map.insert(txn, TOOL, tool.as_str());
    }
    if let Some(color) = &patch.color {
        map.insert(txn, COLOR, color.as_str());
    }
    if let Some(size) = patch.size {
        map.insert(txn, SIZE, size);
    }
    if let Some(opacity) = patch.opacity {
        map.insert(txn, OPACITY, opacity);
    }
    match &patch.text {
        Some(Some(content)) => {
            map.insert(txn, TEXT, content.as_str());
        }
        Some(None) => {
            map.remove(txn, TEXT);
        }
        None => {}
    }
    if let Some(width) = patch.width {
        write_optional_num(map, txn, WIDTH, width);
    }
    if let Some(height) = patch.height {
        write_optional_num(map, txn, HEIGHT, height);
    }
    if let Some(points) = &patch.points {
        match child_array(map, txn, POINTS) {
            Some(existing) => {
                let len = existing.len(txn);
                if len > 0 {
                    existing.remove_range(txn, 0, len);
                }
                existing.insert_range(txn, 0, flatten_points(points));
            }
            None => {
                map.insert(txn, POINTS, points_prelim(points));
            }
        }
    }
}

fn write_asset_patch(map: &MapRef, txn: &mut TransactionMut<'_>, patch: &AssetPatch) {
    if let Some(src) = &patch.src {
        map.insert(txn, SRC, src.as_str());
    }
    let numbers = [
        (X, patch.x),
        (Y, patch.y),
        (W, patch.w),
        (H, patch.h),
        (ROTATION, patch.rotation),
    ];
    for (key, value) in numbers {
        if let Some(v) = value {
            map.insert(txn, key, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn doc_with_page() -> (BoardDocument, Page) {
        let doc = BoardDocument::new();
        let page = Page::new("Page 1").with_id("p1");
        doc.add_page(&page, None);
        (doc, page)
    }

    fn pen(id: &str) -> Stroke {
        Stroke::new(Tool::Pen, "#112233", 4.0)
            .with_id(id)
            .with_points(vec![Point::with_pressure(1.0, 2.0, 0.7), Point::new(3.0, 4.0)])
    }

    fn record_changes(doc: &BoardDocument) -> (Arc<Mutex<Vec<ChangeRecord>>>, ListenerHandle) {
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = records.clone();
        let handle = doc.on_change(move |r| sink.lock().unwrap().push(r.clone()));
        (records, handle)
    }

    #[test]
    fn test_new_document_is_empty() {
        let doc = BoardDocument::new();
        assert_eq!(doc.page_count(), 0);
        assert!(doc.read_all_pages().is_empty());
        assert_eq!(doc.meta(), BoardMeta::default());
    }

    #[test]
    fn test_meta_roundtrip_and_revision() {
        let doc = BoardDocument::new();
        let meta = BoardMeta {
            session_id: "sess-1".into(),
            name: "Physics".into(),
            created_at: 1_700_000_000_000,
            revision: 4,
        };
        doc.set_meta(&meta, None);
        assert_eq!(doc.meta(), meta);

        assert_eq!(doc.bump_revision(None), 5);
        assert_eq!(doc.meta().revision, 5);
    }

    #[test]
    fn test_add_and_read_stroke() {
        let (doc, _) = doc_with_page();
        let mut stroke = pen("s1");
        stroke.text = Some("label".into());
        stroke.width = Some(120.0);
        doc.add_stroke(0, &stroke, None);

        let strokes = doc.read_page_strokes(0);
        assert_eq!(strokes.len(), 1);
        assert_eq!(strokes[0].id, "s1");
        assert_eq!(strokes[0].color, "#112233");
        assert_eq!(strokes[0].text.as_deref(), Some("label"));
        assert_eq!(strokes[0].width, Some(120.0));
        assert_eq!(strokes[0].height, None);
        assert_eq!(strokes[0].points[1], Point::with_pressure(3.0, 4.0, 0.5));
    }

    #[test]
    fn test_stroke_on_missing_page_is_noop() {
        let (doc, _) = doc_with_page();
        let (records, _h) = record_changes(&doc);
        doc.add_stroke(3, &pen("s1"), None);
        assert!(doc.read_page_strokes(3).is_empty());
        assert!(doc.read_page_strokes(0).is_empty());
        assert!(records.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remove_absent_stroke_is_noop() {
        let (doc, _) = doc_with_page();
        doc.add_stroke(0, &pen("s1"), None);
        doc.remove_stroke(0, "missing", None);
        doc.remove_stroke(0, "s1", None);
        doc.remove_stroke(0, "s1", None);
        assert!(doc.read_page_strokes(0).is_empty());
    }

    #[test]
    fn test_update_stroke_fields() {
        let (doc, _) = doc_with_page();
        let mut stroke = pen("s1");
        stroke.text = Some("old".into());
        doc.add_stroke(0, &stroke, None);

        let patch = StrokePatch {
            color: Some("#ffffff".into()),
            text: Some(None),
            points: Some(vec![Point::with_pressure(9.0, 9.0, 1.0)]),
            ..StrokePatch::default()
        };
        doc.update_stroke(0, "s1", &patch, None);

        let updated = &doc.read_page_strokes(0)[0];
        assert_eq!(updated.color, "#ffffff");
        assert_eq!(updated.text, None);
        assert_eq!(updated.points, vec![Point::with_pressure(9.0, 9.0, 1.0)]);
        assert_eq!(updated.size, 4.0);
    }

    #[test]
    fn test_asset_crud() {
        let (doc, _) = doc_with_page();
        let asset = Asset::image("https://cdn/x.png", 10.0, 20.0, 300.0, 200.0).with_id("a1");
        doc.add_asset(0, &asset, None);
        assert_eq!(doc.read_page_assets(0), vec![asset.clone()]);

        let patch = AssetPatch { x: Some(50.0), rotation: Some(90.0), ..AssetPatch::default() };
        doc.update_asset(0, "a1", &patch, None);
        let moved = &doc.read_page_assets(0)[0];
        assert_eq!(moved.x, 50.0);
        assert_eq!(moved.rotation, 90.0);
        assert_eq!(moved.w, 300.0);

        doc.remove_asset(0, "a1", None);
        assert!(doc.read_page_assets(0).is_empty());
    }

    #[test]
    fn test_remove_page_invalid_index_is_noop() {
        let (doc, _) = doc_with_page();
        doc.remove_page(7, None);
        assert_eq!(doc.page_count(), 1);
        doc.remove_page(0, None);
        assert_eq!(doc.page_count(), 0);
    }

    #[test]
    fn test_pdf_background_roundtrip() {
        let doc = BoardDocument::new();
        let mut page = Page::new("Slides").with_id("p1");
        page.background = Background::Pdf { url: "https://cdn/doc.pdf".into(), asset_id: "a9".into() };
        page.width = Some(800.0);
        doc.add_page(&page, None);

        let read = doc.read_page(0).unwrap();
        assert_eq!(read.background, page.background);
        assert_eq!(read.width, Some(800.0));
        assert_eq!(read.height, None);
    }

    #[test]
    fn test_malformed_background_decodes_white() {
        let (doc, _) = doc_with_page();
        {
            let mut txn = doc.doc.transact_mut();
            let page = doc.page_at(&txn, 0).unwrap();
            page.insert(&mut txn, BACKGROUND, 42.0);
        }
        assert_eq!(doc.read_page(0).unwrap().background, Background::White);

        {
            let mut txn = doc.doc.transact_mut();
            let page = doc.page_at(&txn, 0).unwrap();
            page.insert(&mut txn, BACKGROUND, "checkered");
        }
        assert_eq!(doc.read_page(0).unwrap().background, Background::White);
    }

    #[test]
    fn test_missing_stroke_fields_use_defaults() {
        let (doc, _) = doc_with_page();
        {
            let mut txn = doc.doc.transact_mut();
            let page = doc.page_at(&txn, 0).unwrap();
            let strokes = child_array(&page, &txn, STROKES).unwrap();
            let bare: MapPrelim = vec![(ID, text("bare")), (TOOL, text("laser"))].into_iter().collect();
            strokes.push_back(&mut txn, bare);
        }
        let stroke = &doc.read_page_strokes(0)[0];
        assert_eq!(stroke.tool, Tool::Pen);
        assert_eq!(stroke.color, "#000000");
        assert_eq!(stroke.size, 2.0);
        assert_eq!(stroke.opacity, 1.0);
        assert!(stroke.points.is_empty());
    }

    #[test]
    fn test_hydrate_replaces_pages() {
        let (doc, _) = doc_with_page();
        let pages = vec![Page::new("A").with_id("a"), Page::new("B").with_id("b")];
        doc.hydrate_from_state(&pages, None);

        let ids: Vec<String> = doc.read_all_pages().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_change_record_carries_origin_and_inverse() {
        let (doc, _) = doc_with_page();
        let (records, _h) = record_changes(&doc);
        doc.add_stroke(0, &pen("s1"), Some("u1"));

        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].has_origin("u1"));
        assert_eq!(
            records[0].inverse,
            vec![BoardOp::RemoveStroke { page_id: "p1".into(), stroke_id: "s1".into() }]
        );
    }

    #[test]
    fn test_inverse_reverts_update() {
        let (doc, _) = doc_with_page();
        doc.add_stroke(0, &pen("s1"), None);
        let original = doc.read_page_strokes(0);

        let (records, _h) = record_changes(&doc);
        let patch = StrokePatch { size: Some(12.0), width: Some(Some(5.0)), ..StrokePatch::default() };
        doc.update_stroke(0, "s1", &patch, None);
        let inverse = records.lock().unwrap()[0].inverse.clone();

        doc.apply_ops(&inverse, None);
        assert_eq!(doc.read_page_strokes(0), original);
    }

    #[test]
    fn test_inverse_reverts_hydrate() {
        let (doc, page) = doc_with_page();
        doc.add_stroke(0, &pen("s1"), None);
        let before = doc.read_all_pages();

        let (records, _h) = record_changes(&doc);
        doc.hydrate_from_state(&[Page::new("Other")], None);
        let inverse = records.lock().unwrap()[0].inverse.clone();

        doc.apply_ops(&inverse, None);
        assert_eq!(doc.read_all_pages(), before);
        assert_eq!(doc.read_all_pages()[0].id, page.id);
    }

    #[test]
    fn test_removed_page_restores_at_index() {
        let doc = BoardDocument::new();
        for id in ["a", "b", "c"] {
            doc.add_page(&Page::new(id).with_id(id), None);
        }
        let (records, _h) = record_changes(&doc);
        doc.remove_page(1, None);
        let inverse = records.lock().unwrap()[0].inverse.clone();
        doc.apply_ops(&inverse, None);

        let ids: Vec<String> = doc.read_all_pages().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ops_on_vanished_page_are_skipped() {
        let (doc, _) = doc_with_page();
        let (records, _h) = record_changes(&doc);
        let changed = doc.apply_ops(
            &[BoardOp::RemoveStroke { page_id: "gone".into(), stroke_id: "s1".into() }],
            None,
        );
        assert!(!changed);
        assert!(records.lock().unwrap().is_empty());
        assert!(doc.add_stroke(0, &pen("s1"), None));
        assert!(!doc.remove_stroke(0, "missing", None));
    }

    #[test]
    fn test_update_blob_sync() {
        let (a, _) = doc_with_page();
        a.add_stroke(0, &pen("s1"), None);

        let b = BoardDocument::new();
        b.apply_update(&a.encode_state_as_update(), Some("remote")).unwrap();
        assert_eq!(b.read_all_pages(), a.read_all_pages());

        b.add_stroke(0, &pen("s2"), None);
        let diff = b.encode_diff(&a.state_vector()).unwrap();
        a.apply_update(&diff, None).unwrap();
        assert_eq!(a.read_page_strokes(0).len(), 2);
    }

    #[test]
    fn test_malformed_update_is_error() {
        let doc = BoardDocument::new();
        assert!(doc.apply_update(&[0xff, 0xff, 0xff], None).is_err());
        assert!(doc.encode_diff(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_observe_pages_sees_origin() {
        let (doc, _) = doc_with_page();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = doc.observe_pages(move |txn| {
            sink.lock().unwrap().push(origin_matches(txn, "u1"));
        });

        doc.add_stroke(0, &pen("s1"), Some("u1"));
        doc.add_stroke(0, &pen("s2"), Some("u2"));
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }
}
