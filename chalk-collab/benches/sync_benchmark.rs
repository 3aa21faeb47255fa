use criterion::{black_box, criterion_group, criterion_main, Criterion};
use chalk_collab::{Awareness, LocalStore, PresenceChannel, PresenceConfig, PresenceUser, Synchronizer};
use chalk_core::{BoardDocument, Page, Point, Stroke, Tool};
use std::sync::{Arc, Mutex};

fn large_board(pages: usize, strokes_per_page: usize) -> Vec<Page> {
    (0..pages)
        .map(|p| {
            let mut page = Page::new(format!("Page {}", p + 1));
            page.strokes = (0..strokes_per_page)
                .map(|s| {
                    let points = (0..16).map(|i| Point::new(i as f64, s as f64)).collect();
                    Stroke::new(Tool::Pen, "#000000", 2.0).with_points(points)
                })
                .collect();
            page
        })
        .collect()
}

/// Cost of one remote stroke landing in a 200-page board, including the
/// full re-read into the store.
fn bench_remote_edit_reread(c: &mut Criterion) {
    let source = BoardDocument::new();
    source.hydrate_from_state(&large_board(200, 10), None);
    let base = source.encode_state_as_update();

    let local = BoardDocument::new();
    local.apply_update(&base, None).unwrap();
    let store = Arc::new(Mutex::new(LocalStore::new()));
    let _sync = Synchronizer::setup(&local, store, "bench-user");

    let mut n = 0u64;
    c.bench_function("remote_edit_reread_200_pages", |b| {
        b.iter(|| {
            n += 1;
            let sv = local.state_vector();
            source.add_stroke(0, &Stroke::new(Tool::Pen, "#ff0000", 1.0).with_id(format!("s{n}")), None);
            let delta = source.encode_diff(&sv).unwrap();
            local.apply_update(black_box(&delta), Some("remote")).unwrap();
        })
    });
}

fn bench_local_push(c: &mut Criterion) {
    let doc = BoardDocument::new();
    let store = Arc::new(Mutex::new(LocalStore::with_pages(large_board(200, 10))));
    let sync = Synchronizer::setup(&doc, store, "bench-user");

    c.bench_function("local_push_stroke_200_pages", |b| {
        b.iter(|| {
            sync.push_add_stroke(black_box(0), &Stroke::new(Tool::Pen, "#00ff00", 1.0));
        })
    });
}

fn bench_presence_rederive(c: &mut Criterion) {
    let local = Arc::new(Awareness::new(0));
    let channel = PresenceChannel::attach(
        local.clone(),
        PresenceUser::new("me", "Me", "#000"),
        PresenceConfig { stale_check_interval: std::time::Duration::ZERO, ..PresenceConfig::default() },
    );
    for id in 1..=50u64 {
        let peer = Arc::new(Awareness::new(id));
        let peer_channel = PresenceChannel::attach(
            peer.clone(),
            PresenceUser::new(format!("user-{id}"), format!("User {id}"), "#123456"),
            PresenceConfig { stale_check_interval: std::time::Duration::ZERO, ..PresenceConfig::default() },
        );
        peer_channel.update_cursor(id as f64, id as f64, 0, Tool::Pen);
        local.apply_update(&peer.encode_update(&[id]).unwrap()).unwrap();
    }

    c.bench_function("presence_rederive_50_peers", |b| {
        b.iter(|| {
            channel.refresh();
            black_box(channel.remote_cursors());
        })
    });
}

criterion_group!(benches, bench_remote_edit_reread, bench_local_push, bench_presence_rederive);
criterion_main!(benches);
