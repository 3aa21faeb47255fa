//! Presence channel for live cursors, selections and the online-user list.
//!
//! Rides on the shared [`Awareness`] map: the local collaborator publishes
//! its cursor and selection as fields of its awareness state, and the
//! remote read model is re-derived from the whole map on every change.
//!
//! ## Architecture
//!
//! ```text
//! Local pointer move
//!       │
//!       ▼
//! PresenceChannel::update_cursor()
//!       │  (throttled: 50ms, rounded to 0.1)
//!       ▼
//! Awareness::set_local_state_field("cursor", …)
//!       │
//!       ▼   (awareness update blob, transport not included)
//! Remote Awareness::apply_update()
//!       │
//!       ▼
//! PresenceChannel::rederive()  ──▶ remote_cursors / remote_selections / online_users
//!       ▲
//!       │  every 2s (tokio interval), so cursors fade without new traffic;
//!       │  the same tick renews a local state older than `renew_after`
//! ```
//!
//! ## Local state shape
//!
//! | Field       | JSON                                                  |
//! |-------------|-------------------------------------------------------|
//! | `user`      | `{ id, name, color }`                                 |
//! | `cursor`    | `{ x, y, pageIndex, tool, timestamp }` or `null`      |
//! | `selection` | `{ strokeIds: [...] }`                                |

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chalk_core::{ListenerHandle, Tool};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::awareness::{Awareness, ClientId, JsonMap, DEFAULT_RENEW_AFTER};

/// Minimum spacing between published cursor updates.
pub const CURSOR_THROTTLE: Duration = Duration::from_millis(50);
/// Remote cursors idle for longer than this are shown faded.
pub const FADE_AFTER: Duration = Duration::from_secs(5);
/// Period of the re-derivation that keeps `is_faded` current.
pub const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(2);

const USER_FIELD: &str = "user";
const CURSOR_FIELD: &str = "cursor";
const SELECTION_FIELD: &str = "selection";

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub cursor_throttle: Duration,
    pub fade_after: Duration,
    /// Zero disables the periodic refresh.
    pub stale_check_interval: Duration,
    /// The periodic refresh also re-publishes the local state once it is
    /// this old, so peers do not sweep an idle collaborator.
    pub renew_after: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            cursor_throttle: CURSOR_THROTTLE,
            fade_after: FADE_AFTER,
            stale_check_interval: STALE_CHECK_INTERVAL,
            renew_after: DEFAULT_RENEW_AFTER,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Payload types
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub color: String,
}

impl PresenceUser {
    pub fn new(id: impl Into<String>, name: impl Into<String>, color: impl Into<String>) -> Self {
        Self { id: id.into(), name: name.into(), color: color.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorState {
    pub x: f64,
    pub y: f64,
    pub page_index: usize,
    pub tool: Tool,
    /// Wall-clock Unix milliseconds at publication.
    pub timestamp: i64,
}

/// Cursor as it arrives from a peer. Unknown tools are tolerated.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCursor {
    x: f64,
    y: f64,
    page_index: usize,
    #[serde(default)]
    tool: String,
    #[serde(default)]
    timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionState {
    #[serde(rename = "strokeIds", default)]
    pub stroke_ids: BTreeSet<String>,
}

/// One peer's awareness state, decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub user: PresenceUser,
    pub cursor: Option<CursorState>,
    pub selection: SelectionState,
}

impl PresenceEntry {
    /// Decode a raw awareness state. `None` when there is no usable user id;
    /// a malformed cursor reads as absent and a malformed selection as empty.
    pub fn decode(state: &JsonMap) -> Option<Self> {
        let user: PresenceUser = state
            .get(USER_FIELD)
            .and_then(|v| serde_json::from_value(v.clone()).ok())?;
        if user.id.is_empty() {
            return None;
        }
        let cursor = state
            .get(CURSOR_FIELD)
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value::<WireCursor>(v.clone()).ok())
            .map(|c| CursorState {
                x: c.x,
                y: c.y,
                page_index: c.page_index,
                tool: Tool::parse(&c.tool),
                timestamp: c.timestamp,
            });
        let selection = state
            .get(SELECTION_FIELD)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        Some(Self { user, cursor, selection })
    }
}

// ───────────────────────────────────────────────────────────────────
// Read model
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub client_id: ClientId,
    pub user: PresenceUser,
    pub x: f64,
    pub y: f64,
    pub page_index: usize,
    pub tool: Tool,
    pub last_update: i64,
    pub is_faded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSelection {
    pub client_id: ClientId,
    pub user: PresenceUser,
    pub stroke_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineUser {
    pub client_id: ClientId,
    pub user: PresenceUser,
    /// From the user's cursor, when they have one.
    pub tool: Option<Tool>,
    pub page_index: Option<usize>,
}

#[derive(Debug, Default)]
struct Views {
    cursors: Vec<RemoteCursor>,
    selections: Vec<RemoteSelection>,
    users: Vec<OnlineUser>,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

fn round_tenth(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ───────────────────────────────────────────────────────────────────
// Channel
// ───────────────────────────────────────────────────────────────────

struct ChannelInner {
    awareness: Arc<Awareness>,
    user: PresenceUser,
    config: PresenceConfig,
    last_cursor_sent: Mutex<Option<Instant>>,
    views: Mutex<Views>,
    destroyed: AtomicBool,
}

impl ChannelInner {
    fn views(&self) -> MutexGuard<'_, Views> {
        self.views.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rederive(&self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let local = self.awareness.client_id();
        let now = now_millis();
        let fade_ms = i64::try_from(self.config.fade_after.as_millis()).unwrap_or(i64::MAX);

        let mut states: Vec<(ClientId, JsonMap)> = self
            .awareness
            .states()
            .into_iter()
            .filter(|(client, _)| *client != local)
            .collect();
        states.sort_by_key(|(client, _)| *client);

        let mut views = Views::default();
        for (client_id, state) in states {
            let Some(entry) = PresenceEntry::decode(&state) else {
                debug!("ignoring presence state without user id from {client_id}");
                continue;
            };
            views.users.push(OnlineUser {
                client_id,
                user: entry.user.clone(),
                tool: entry.cursor.as_ref().map(|c| c.tool),
                page_index: entry.cursor.as_ref().map(|c| c.page_index),
            });
            if let Some(cursor) = entry.cursor {
                views.cursors.push(RemoteCursor {
                    client_id,
                    user: entry.user.clone(),
                    x: cursor.x,
                    y: cursor.y,
                    page_index: cursor.page_index,
                    tool: cursor.tool,
                    last_update: cursor.timestamp,
                    // Remote clocks are untrusted.
                    is_faded: now.saturating_sub(cursor.timestamp) > fade_ms,
                });
            }
            if !entry.selection.stroke_ids.is_empty() {
                views.selections.push(RemoteSelection {
                    client_id,
                    user: entry.user,
                    stroke_ids: entry.selection.stroke_ids,
                });
            }
        }
        *self.views() = views;
    }
}

/// Local collaborator's view of everyone else's presence.
pub struct PresenceChannel {
    inner: Arc<ChannelInner>,
    listener: Mutex<Option<ListenerHandle>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceChannel {
    /// Publish `user` with no cursor and an empty selection, then start
    /// tracking remote states. The periodic refresh only runs when called
    /// inside a tokio runtime.
    pub fn attach(awareness: Arc<Awareness>, user: PresenceUser, config: PresenceConfig) -> Self {
        awareness.set_local_state_field(USER_FIELD, json!(user));
        awareness.set_local_state_field(CURSOR_FIELD, Value::Null);
        awareness.set_local_state_field(SELECTION_FIELD, json!(SelectionState::default()));

        let inner = Arc::new(ChannelInner {
            awareness,
            user,
            config,
            last_cursor_sent: Mutex::new(None),
            views: Mutex::new(Views::default()),
            destroyed: AtomicBool::new(false),
        });

        let weak: Weak<ChannelInner> = Arc::downgrade(&inner);
        let listener = inner.awareness.on_change(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.rederive();
            }
        });
        inner.rederive();

        let timer = Self::spawn_stale_check(&inner);
        info!("presence attached for {}", inner.user.id);

        Self {
            inner,
            listener: Mutex::new(Some(listener)),
            timer: Mutex::new(timer),
        }
    }

    fn spawn_stale_check(inner: &Arc<ChannelInner>) -> Option<JoinHandle<()>> {
        let period = inner.config.stale_check_interval;
        if period.is_zero() {
            return None;
        }
        let handle = Handle::try_current().ok()?;
        let weak = Arc::downgrade(inner);
        Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.destroyed.load(Ordering::SeqCst) {
                    inner.awareness.renew_local_state(inner.config.renew_after);
                }
                inner.rederive();
            }
        }))
    }

    pub fn user(&self) -> &PresenceUser {
        &self.inner.user
    }

    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.inner.awareness
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Publish the local cursor. Returns `false` when throttled or destroyed.
    pub fn update_cursor(&self, x: f64, y: f64, page_index: usize, tool: Tool) -> bool {
        if self.is_destroyed() {
            return false;
        }
        {
            let mut last = self
                .inner
                .last_cursor_sent
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            if last.is_some_and(|t| now.duration_since(t) < self.inner.config.cursor_throttle) {
                return false;
            }
            *last = Some(now);
        }

        let cursor = CursorState {
            x: round_tenth(x),
            y: round_tenth(y),
            page_index,
            tool,
            timestamp: now_millis(),
        };
        self.inner.awareness.set_local_state_field(CURSOR_FIELD, json!(cursor));
        true
    }

    /// Publish the local selection. Not throttled.
    pub fn update_selection<I, S>(&self, stroke_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.is_destroyed() {
            return;
        }
        let selection = SelectionState { stroke_ids: stroke_ids.into_iter().map(Into::into).collect() };
        self.inner.awareness.set_local_state_field(SELECTION_FIELD, json!(selection));
    }

    /// Remote cursors, ordered by client id.
    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        self.inner.views().cursors.clone()
    }

    /// Remote non-empty selections.
    pub fn remote_selections(&self) -> Vec<RemoteSelection> {
        self.inner.views().selections.clone()
    }

    pub fn online_users(&self) -> Vec<OnlineUser> {
        self.inner.views().users.clone()
    }

    /// Re-derive the read model now.
    pub fn refresh(&self) {
        self.inner.rederive();
    }

    /// Stop tracking and clear the read model. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(listener);
        if let Some(timer) = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            timer.abort();
        }
        *self.inner.views() = Views::default();
        info!("presence destroyed for {}", self.inner.user.id);
    }
}

impl Drop for PresenceChannel {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn no_timer() -> PresenceConfig {
        PresenceConfig { stale_check_interval: Duration::ZERO, ..PresenceConfig::default() }
    }

    fn object(value: Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    /// Awareness with a local channel and one raw remote state delivered.
    fn with_remote(remote_state: Value) -> (Arc<Awareness>, PresenceChannel) {
        let local = Arc::new(Awareness::new(1));
        let channel = PresenceChannel::attach(local.clone(), PresenceUser::new("me", "Me", "#000"), no_timer());

        let remote = Awareness::new(2);
        remote.set_local_state(Some(object(remote_state)));
        local.apply_update(&remote.encode_update(&[2]).unwrap()).unwrap();
        (local, channel)
    }

    #[test]
    fn test_attach_publishes_initial_state() {
        let awareness = Arc::new(Awareness::new(7));
        let _channel = PresenceChannel::attach(
            awareness.clone(),
            PresenceUser::new("u1", "Ada", "#ff0000"),
            no_timer(),
        );

        let state = awareness.local_state().unwrap();
        assert_eq!(state["user"]["id"], "u1");
        assert!(state["cursor"].is_null());
        assert_eq!(state["selection"]["strokeIds"], json!([]));
    }

    #[test]
    fn test_cursor_rounded_and_throttled() {
        let awareness = Arc::new(Awareness::new(1));
        let channel = PresenceChannel::attach(
            awareness.clone(),
            PresenceUser::new("u1", "Ada", "#f00"),
            PresenceConfig { cursor_throttle: Duration::from_millis(30), ..no_timer() },
        );

        assert!(channel.update_cursor(10.26, 20.04, 2, Tool::Highlighter));
        assert!(!channel.update_cursor(99.0, 99.0, 2, Tool::Pen));

        let cursor = &awareness.local_state().unwrap()["cursor"];
        assert_eq!(cursor["x"], 10.3);
        assert_eq!(cursor["y"], 20.0);
        assert_eq!(cursor["pageIndex"], 2);
        assert_eq!(cursor["tool"], "highlighter");

        thread::sleep(Duration::from_millis(40));
        assert!(channel.update_cursor(99.0, 99.0, 0, Tool::Pen));
    }

    #[test]
    fn test_remote_views_derived() {
        let now = now_millis();
        let (_awareness, channel) = with_remote(json!({
            "user": {"id": "bob", "name": "Bob", "color": "#00f"},
            "cursor": {"x": 5.0, "y": 6.0, "pageIndex": 1, "tool": "eraser", "timestamp": now},
            "selection": {"strokeIds": ["s1", "s2"]}
        }));

        let cursors = channel.remote_cursors();
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].user.id, "bob");
        assert_eq!(cursors[0].tool, Tool::Eraser);
        assert!(!cursors[0].is_faded);

        let selections = channel.remote_selections();
        assert_eq!(selections[0].stroke_ids.len(), 2);

        let users = channel.online_users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].page_index, Some(1));
        assert_eq!(users[0].tool, Some(Tool::Eraser));
    }

    #[test]
    fn test_local_client_excluded() {
        let awareness = Arc::new(Awareness::new(1));
        let channel = PresenceChannel::attach(awareness, PresenceUser::new("me", "Me", "#000"), no_timer());
        channel.update_cursor(1.0, 1.0, 0, Tool::Pen);
        channel.update_selection(["s1"]);

        assert!(channel.remote_cursors().is_empty());
        assert!(channel.remote_selections().is_empty());
        assert!(channel.online_users().is_empty());
    }

    #[test]
    fn test_entries_without_user_id_skipped() {
        let (_a, channel) = with_remote(json!({"user": {"name": "ghost"}, "cursor": null}));
        assert!(channel.online_users().is_empty());

        let (_a, channel) = with_remote(json!({"user": {"id": ""}}));
        assert!(channel.online_users().is_empty());
    }

    #[test]
    fn test_malformed_cursor_and_selection_tolerated() {
        let (_a, channel) = with_remote(json!({
            "user": {"id": "carol"},
            "cursor": {"x": "left"},
            "selection": {"strokeIds": "all"}
        }));

        let users = channel.online_users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].tool, None);
        assert!(channel.remote_cursors().is_empty());
        assert!(channel.remote_selections().is_empty());
    }

    #[test]
    fn test_old_cursor_is_faded() {
        let (_a, channel) = with_remote(json!({
            "user": {"id": "dave"},
            "cursor": {"x": 0.0, "y": 0.0, "pageIndex": 0, "tool": "pen", "timestamp": now_millis() - 6_000}
        }));
        assert!(channel.remote_cursors()[0].is_faded);
    }

    #[test]
    fn test_extreme_cursor_timestamps_tolerated() {
        let (_a, channel) = with_remote(json!({
            "user": {"id": "frank"},
            "cursor": {"x": 0.0, "y": 0.0, "pageIndex": 0, "tool": "pen", "timestamp": i64::MIN}
        }));
        assert!(channel.remote_cursors()[0].is_faded);

        let (_a, channel) = with_remote(json!({
            "user": {"id": "grace"},
            "cursor": {"x": 0.0, "y": 0.0, "pageIndex": 0, "tool": "pen", "timestamp": i64::MAX}
        }));
        assert!(!channel.remote_cursors()[0].is_faded);
        channel.refresh();
        assert_eq!(channel.remote_cursors().len(), 1);
    }

    #[test]
    fn test_vanished_entry_disappears() {
        let (awareness, channel) = with_remote(json!({"user": {"id": "erin"}}));
        assert_eq!(channel.online_users().len(), 1);

        awareness.remove_states(&[2]);
        assert!(channel.online_users().is_empty());
    }

    #[test]
    fn test_destroy_clears_and_ignores_updates() {
        let (awareness, channel) = with_remote(json!({"user": {"id": "frank"}}));
        channel.destroy();
        channel.destroy();

        assert!(channel.online_users().is_empty());
        assert!(!channel.update_cursor(1.0, 1.0, 0, Tool::Pen));
        assert!(awareness.local_state().unwrap()["cursor"].is_null());

        channel.refresh();
        assert!(channel.online_users().is_empty());
    }

    #[tokio::test]
    async fn test_timer_runs_inside_runtime() {
        let awareness = Arc::new(Awareness::new(1));
        let channel = PresenceChannel::attach(
            awareness,
            PresenceUser::new("me", "Me", "#000"),
            PresenceConfig::default(),
        );
        assert!(channel.timer.lock().unwrap().is_some());
        channel.destroy();
        assert!(channel.timer.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timer_renews_idle_local_state() {
        let awareness = Arc::new(Awareness::new(1));
        let channel = PresenceChannel::attach(
            awareness.clone(),
            PresenceUser::new("me", "Me", "#000"),
            PresenceConfig {
                stale_check_interval: Duration::from_millis(20),
                renew_after: Duration::ZERO,
                ..PresenceConfig::default()
            },
        );
        let before = awareness.clock(1).unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(awareness.clock(1).unwrap() > before);
        assert_eq!(awareness.local_state().unwrap()["user"]["id"], "me");

        channel.destroy();
        let after_destroy = awareness.clock(1).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(awareness.clock(1), Some(after_destroy));
    }
}
