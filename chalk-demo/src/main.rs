//! Chalk demo: two collaborators editing one board in-process.
//!
//! Each side owns a document, a store, a synchronizer, an undo history and a
//! presence channel. Update blobs travel over tokio channels in place of a
//! network transport. Run with `RUST_LOG=debug` for per-event detail.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chalk_collab::{
    Awareness, BoardStore, HistoryOptions, KeyInput, LocalStore, PresenceChannel,
    PresenceConfig, PresenceUser, SyncHandle, Synchronizer, UndoManager,
};
use chalk_core::{BoardDocument, BoardMeta, Page, Point, Stroke, Tool};
use log::info;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Messages one collaborator sends another.
#[derive(Debug)]
enum Wire {
    Document(Vec<u8>),
    Awareness(Vec<u8>),
}

struct Collaborator {
    name: &'static str,
    doc: BoardDocument,
    store: Arc<Mutex<LocalStore>>,
    sync: SyncHandle<LocalStore>,
    history: UndoManager,
    awareness: Arc<Awareness>,
    presence: PresenceChannel,
    /// State vector of the peer as of the last flush.
    peer_state: Vec<u8>,
}

impl Collaborator {
    fn new(name: &'static str, client_id: u64, color: &str, pages: Vec<Page>) -> Self {
        let user_id = format!("{name}-{}", Uuid::new_v4());
        let doc = BoardDocument::with_client_id(client_id);
        let store = Arc::new(Mutex::new(LocalStore::with_pages(pages)));
        let sync = Synchronizer::setup(&doc, store.clone(), user_id.clone());
        let history = UndoManager::new(&doc, HistoryOptions::tracking(user_id.clone()));
        let awareness = Arc::new(Awareness::new(client_id));
        let presence = PresenceChannel::attach(
            awareness.clone(),
            PresenceUser::new(user_id, name, color),
            PresenceConfig::default(),
        );
        let peer_state = BoardDocument::new().state_vector();
        Self { name, doc, store, sync, history, awareness, presence, peer_state }
    }

    /// Send everything the peer has not seen yet.
    async fn flush(&mut self, tx: &mpsc::Sender<Wire>) -> Result<(), Box<dyn std::error::Error>> {
        let delta = self.doc.encode_diff(&self.peer_state)?;
        tx.send(Wire::Document(delta)).await?;
        let presence = self.awareness.encode_update(&[self.awareness.client_id()])?;
        tx.send(Wire::Awareness(presence)).await?;
        Ok(())
    }

    fn receive(&mut self, message: Wire) -> Result<(), Box<dyn std::error::Error>> {
        match message {
            Wire::Document(update) => self.doc.apply_update(&update, Some("network"))?,
            Wire::Awareness(update) => {
                self.awareness.apply_update(&update)?;
            }
        }
        Ok(())
    }

    fn report(&self) {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let strokes: Vec<usize> = store.pages().iter().map(|p| p.strokes.len()).collect();
        info!(
            "[{}] pages={} strokes/page={:?} undo={} redo={} peers={:?}",
            self.name,
            store.pages().len(),
            strokes,
            self.history.undo_count(),
            self.history.redo_count(),
            self.presence
                .online_users()
                .iter()
                .map(|u| u.user.name.clone())
                .collect::<Vec<_>>(),
        );
    }
}

/// Deliver pending messages in both directions and remember each side's
/// state vector for the next delta.
async fn exchange(
    a: &mut Collaborator,
    b: &mut Collaborator,
) -> Result<(), Box<dyn std::error::Error>> {
    let (to_b, mut b_inbox) = mpsc::channel(8);
    let (to_a, mut a_inbox) = mpsc::channel(8);
    a.flush(&to_b).await?;
    b.flush(&to_a).await?;
    drop((to_a, to_b));

    while let Some(message) = b_inbox.recv().await {
        b.receive(message)?;
    }
    while let Some(message) = a_inbox.recv().await {
        a.receive(message)?;
    }
    a.peer_state = b.doc.state_vector();
    b.peer_state = a.doc.state_vector();
    Ok(())
}

fn scribble(id: &str, offset: f64) -> Stroke {
    let points = (0..8)
        .map(|i| Point::with_pressure(offset + i as f64 * 4.0, offset + (i as f64).sin() * 3.0, 0.6))
        .collect();
    Stroke::new(Tool::Pen, "#1e88e5", 3.0).with_id(id).with_points(points)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting Chalk demo");

    let mut alice = Collaborator::new("alice", 1, "#e53935", vec![Page::new("Page 1")]);
    alice.doc.set_meta(
        &BoardMeta { session_id: Uuid::new_v4().to_string(), name: "Physics 101".into(), ..BoardMeta::default() },
        None,
    );
    let mut bob = Collaborator::new("bob", 2, "#43a047", Vec::new());
    exchange(&mut alice, &mut bob).await?;
    info!("bob joined board '{}'", bob.doc.meta().name);

    alice.sync.push_add_stroke(0, &scribble("alice-1", 10.0));
    bob.sync.push_add_stroke(0, &scribble("bob-1", 100.0));
    alice.presence.update_cursor(42.17, 88.01, 0, Tool::Pen);
    bob.presence.update_selection(["alice-1"]);
    exchange(&mut alice, &mut bob).await?;
    alice.report();
    bob.report();

    info!("alice presses Ctrl+Z");
    alice.history.handle_key(&KeyInput::new("z").ctrl().meta());
    exchange(&mut alice, &mut bob).await?;
    alice.report();
    bob.report();

    for cursor in bob.presence.remote_cursors() {
        info!(
            "bob sees {} at ({}, {}) faded={}",
            cursor.user.name, cursor.x, cursor.y, cursor.is_faded
        );
    }

    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.presence.destroy();
    bob.presence.destroy();
    alice.history.destroy();
    bob.history.destroy();
    alice.sync.destroy();
    bob.sync.destroy();
    info!("Chalk demo finished");
    Ok(())
}
