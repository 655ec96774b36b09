//! Durable keyed storage for the play queue.
//!
//! All reads and mutations run on a single background worker thread, which
//! serializes them: listeners observe structural changes in exactly the order
//! the mutations were submitted. Listener callbacks run on the worker and
//! are expected to only marshal the event onward (e.g. post a bus message).

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, error, warn};
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::queue::Queue;
use crate::storage::default_db_path;
use crate::track::TrackDescriptor;

/// Structural change notification. Exactly one event fires per mutating call;
/// no-op calls (e.g. moving an entry onto itself) fire nothing. Positions are
/// in pre-mutation coordinates.
#[derive(Debug, Clone)]
pub enum QueueStoreEvent {
    Replaced { position: usize, autoplay: bool },
    Inserted { position: usize, count: usize },
    Moved { from: usize, to: usize },
    Removed { positions: Vec<usize> },
}

type Listener = Box<dyn Fn(QueueStoreEvent) + Send>;
type StoreJob = Box<dyn FnOnce(&mut StoreWorker) + Send>;

pub struct QueueStore {
    jobs: Sender<StoreJob>,
    size: Arc<AtomicUsize>,
    listener: Arc<Mutex<Option<Listener>>>,
}

struct StoreWorker {
    conn: Connection,
    size: Arc<AtomicUsize>,
    listener: Arc<Mutex<Option<Listener>>>,
}

impl QueueStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens the store at the platform data directory, namespaced by `name`.
    pub fn open_default(name: &str) -> Result<Self> {
        Self::open(&default_db_path(&format!("{name}-queue.db")))
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS queue (
                identity TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                music_id TEXT NOT NULL,
                title TEXT NOT NULL,
                artist TEXT NOT NULL,
                album TEXT NOT NULL,
                source_uri TEXT NOT NULL,
                icon_uri TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                forbid_seek INTEGER NOT NULL,
                extension TEXT
            )",
            [],
        )?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?;
        let size = Arc::new(AtomicUsize::new(count.max(0) as usize));
        let listener: Arc<Mutex<Option<Listener>>> = Arc::new(Mutex::new(None));

        let (jobs, job_rx) = channel::<StoreJob>();
        let mut worker = StoreWorker {
            conn,
            size: size.clone(),
            listener: listener.clone(),
        };
        thread::spawn(move || {
            while let Ok(job) = job_rx.recv() {
                job(&mut worker);
            }
        });

        Ok(Self {
            jobs,
            size,
            listener,
        })
    }

    /// Current entry count. O(1); tracked across mutations.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers the structural-change listener, replacing any previous one.
    pub fn set_listener(&self, listener: impl Fn(QueueStoreEvent) + Send + 'static) {
        *self.listener.lock().unwrap() = Some(Box::new(listener));
    }

    fn submit(&self, job: impl FnOnce(&mut StoreWorker) + Send + 'static) {
        if self.jobs.send(Box::new(job)).is_err() {
            error!("QueueStore: worker is gone, dropping operation");
        }
    }

    /// Asynchronous full fetch. The callback runs on the store worker; it
    /// should only hand the snapshot off.
    pub fn get(&self, callback: impl FnOnce(Queue) + Send + 'static) {
        self.submit(move |worker| {
            let items = match worker.load_items() {
                Ok(items) => items,
                Err(e) => {
                    error!("QueueStore: failed to load queue: {}", e);
                    return;
                }
            };
            callback(Queue::new(items));
        });
    }

    /// Replaces the whole queue; `position` and `autoplay` travel with the
    /// notification so the coordinator can adopt them.
    pub fn replace(&self, queue: Queue, position: usize, autoplay: bool) {
        self.submit(move |worker| {
            let items = queue.to_vec();
            if let Err(e) = worker.write_all(&items) {
                error!("QueueStore: failed to replace queue: {}", e);
                return;
            }
            worker.notify(QueueStoreEvent::Replaced { position, autoplay });
        });
    }

    /// Inserts `track` at `position`. If an entry with the same identity is
    /// already present, the operation degenerates into a move of the existing
    /// entry (observers see `Moved`, never a duplicate `Inserted`); a move
    /// onto its own slot is ignored entirely.
    pub fn insert(&self, position: usize, track: TrackDescriptor) {
        self.submit(move |worker| {
            let mut items = match worker.load_items() {
                Ok(items) => items,
                Err(e) => {
                    error!("QueueStore: failed to load queue for insert: {}", e);
                    return;
                }
            };

            if let Some(from) = items.iter().position(|item| item.same_entry(&track)) {
                let to = position.min(items.len().saturating_sub(1));
                if from == to {
                    debug!("QueueStore: insert of existing entry at its own slot, ignoring");
                    return;
                }
                let entry = items.remove(from);
                items.insert(to, entry);
                if let Err(e) = worker.write_all(&items) {
                    error!("QueueStore: failed to persist dedup move: {}", e);
                    return;
                }
                worker.notify(QueueStoreEvent::Moved { from, to });
                return;
            }

            let position = position.min(items.len());
            items.insert(position, track);
            if let Err(e) = worker.write_all(&items) {
                error!("QueueStore: failed to persist insert: {}", e);
                return;
            }
            worker.notify(QueueStoreEvent::Inserted { position, count: 1 });
        });
    }

    /// Inserts a batch at `position` (no dedup; batch callers own their data).
    pub fn insert_all(&self, position: usize, tracks: Vec<TrackDescriptor>) {
        if tracks.is_empty() {
            return;
        }
        self.submit(move |worker| {
            let mut items = match worker.load_items() {
                Ok(items) => items,
                Err(e) => {
                    error!("QueueStore: failed to load queue for batch insert: {}", e);
                    return;
                }
            };
            let position = position.min(items.len());
            let count = tracks.len();
            for (offset, track) in tracks.into_iter().enumerate() {
                items.insert(position + offset, track);
            }
            if let Err(e) = worker.write_all(&items) {
                error!("QueueStore: failed to persist batch insert: {}", e);
                return;
            }
            worker.notify(QueueStoreEvent::Inserted { position, count });
        });
    }

    /// Moves the entry at `from` to `to`. `from == to` is ignored without an
    /// event.
    pub fn move_track(&self, from: usize, to: usize) {
        if from == to {
            return;
        }
        self.submit(move |worker| {
            let mut items = match worker.load_items() {
                Ok(items) => items,
                Err(e) => {
                    error!("QueueStore: failed to load queue for move: {}", e);
                    return;
                }
            };
            if from >= items.len() {
                warn!(
                    "QueueStore: move from out-of-bounds position {} (len {})",
                    from,
                    items.len()
                );
                return;
            }
            let to = to.min(items.len() - 1);
            if from == to {
                return;
            }
            let entry = items.remove(from);
            items.insert(to, entry);
            if let Err(e) = worker.write_all(&items) {
                error!("QueueStore: failed to persist move: {}", e);
                return;
            }
            worker.notify(QueueStoreEvent::Moved { from, to });
        });
    }

    /// Removes the entries at `positions` as one batch.
    pub fn remove_positions(&self, positions: Vec<usize>) {
        self.submit(move |worker| {
            let mut items = match worker.load_items() {
                Ok(items) => items,
                Err(e) => {
                    error!("QueueStore: failed to load queue for remove: {}", e);
                    return;
                }
            };

            let mut valid: Vec<usize> = positions
                .into_iter()
                .filter(|&p| p < items.len())
                .collect();
            valid.sort_unstable();
            valid.dedup();
            if valid.is_empty() {
                return;
            }

            for &position in valid.iter().rev() {
                items.remove(position);
            }
            if let Err(e) = worker.write_all(&items) {
                error!("QueueStore: failed to persist remove: {}", e);
                return;
            }
            worker.notify(QueueStoreEvent::Removed { positions: valid });
        });
    }

    /// Removes the entry matching `track` by identity, if present.
    pub fn remove(&self, track: &TrackDescriptor) {
        let identity = track.identity().to_string();
        self.submit(move |worker| {
            let items = match worker.load_items() {
                Ok(items) => items,
                Err(e) => {
                    error!("QueueStore: failed to load queue for remove: {}", e);
                    return;
                }
            };
            let Some(position) = items.iter().position(|item| item.identity() == identity)
            else {
                debug!("QueueStore: remove of absent entry, ignoring");
                return;
            };
            let mut items = items;
            items.remove(position);
            if let Err(e) = worker.write_all(&items) {
                error!("QueueStore: failed to persist remove: {}", e);
                return;
            }
            worker.notify(QueueStoreEvent::Removed {
                positions: vec![position],
            });
        });
    }
}

impl StoreWorker {
    fn load_items(&self) -> rusqlite::Result<Vec<TrackDescriptor>> {
        let mut stmt = self.conn.prepare(
            "SELECT identity, music_id, title, artist, album, source_uri, icon_uri,
                    duration_ms, forbid_seek, extension
             FROM queue ORDER BY position ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let extension: Option<String> = row.get(9)?;
            let mut builder = TrackDescriptor::builder()
                .identity(row.get::<_, String>(0)?)
                .music_id(row.get::<_, String>(1)?)
                .title(row.get::<_, String>(2)?)
                .artist(row.get::<_, String>(3)?)
                .album(row.get::<_, String>(4)?)
                .source_uri(row.get::<_, String>(5)?)
                .icon_uri(row.get::<_, String>(6)?)
                .duration_ms(row.get::<_, i64>(7)?)
                .forbid_seek(row.get::<_, bool>(8)?);
            if let Some(extension) = extension {
                match serde_json::from_str(&extension) {
                    Ok(value) => builder = builder.extension(value),
                    Err(e) => warn!("QueueStore: dropping unreadable extension blob: {}", e),
                }
            }
            Ok(builder.build())
        })?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    fn write_all(&mut self, items: &[TrackDescriptor]) -> rusqlite::Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM queue", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO queue (identity, position, music_id, title, artist, album,
                                    source_uri, icon_uri, duration_ms, forbid_seek, extension)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for (position, track) in items.iter().enumerate() {
                let extension = track
                    .extension()
                    .map(|value| value.to_string());
                stmt.execute(params![
                    track.identity(),
                    position as i64,
                    track.music_id(),
                    track.title(),
                    track.artist(),
                    track.album(),
                    track.source_uri(),
                    track.icon_uri(),
                    track.duration_ms() as i64,
                    track.forbid_seek(),
                    extension,
                ])?;
            }
        }
        tx.commit()?;
        self.size.store(items.len(), Ordering::SeqCst);
        Ok(())
    }

    fn notify(&self, event: QueueStoreEvent) {
        let listener = self.listener.lock().unwrap();
        if let Some(listener) = listener.as_ref() {
            listener(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{channel as std_channel, Receiver};
    use std::time::Duration;

    fn track(n: usize) -> TrackDescriptor {
        TrackDescriptor::builder()
            .music_id(format!("m-{n}"))
            .title(format!("Track {n}"))
            .source_uri(format!("file:///tmp/{n}.mp3"))
            .identity(format!("id-{n}"))
            .duration_ms(1_000)
            .build()
    }

    fn seeded_store(n: usize) -> (QueueStore, Receiver<QueueStoreEvent>) {
        let store = QueueStore::open_in_memory().unwrap();
        let (tx, rx) = std_channel();
        store.set_listener(move |event| {
            let _ = tx.send(event);
        });
        store.replace(Queue::new((0..n).map(track).collect()), 0, false);
        // Drain the replace event the seeding produced.
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        (store, rx)
    }

    /// Waits until every previously submitted job has run.
    fn barrier(store: &QueueStore) -> Queue {
        let (tx, rx) = std_channel();
        store.get(move |queue| {
            let _ = tx.send(queue);
        });
        rx.recv_timeout(Duration::from_secs(1)).unwrap()
    }

    fn identities(queue: &Queue) -> Vec<String> {
        queue.iter().map(|t| t.identity().to_string()).collect()
    }

    #[test]
    fn test_replace_persists_and_notifies_once() {
        let (store, rx) = seeded_store(0);
        store.replace(Queue::new(vec![track(0), track(1)]), 1, true);
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            event,
            QueueStoreEvent::Replaced {
                position: 1,
                autoplay: true
            }
        ));
        let queue = barrier(&store);
        assert_eq!(queue.len(), 2);
        assert_eq!(store.len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_insert_of_new_track_notifies_inserted() {
        let (store, rx) = seeded_store(3);
        store.insert(1, track(9));
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            event,
            QueueStoreEvent::Inserted {
                position: 1,
                count: 1
            }
        ));
        let queue = barrier(&store);
        assert_eq!(identities(&queue), vec!["id-0", "id-9", "id-1", "id-2"]);
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_insert_of_existing_track_degenerates_into_move() {
        let (store, rx) = seeded_store(10);
        store.insert(5, track(0));
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(event, QueueStoreEvent::Moved { from: 0, to: 5 }));
        let queue = barrier(&store);
        assert_eq!(queue.len(), 10);
        assert_eq!(queue.index_of_identity("id-0"), Some(5));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_insert_of_existing_track_at_own_slot_is_silent() {
        let (store, rx) = seeded_store(3);
        store.insert(1, track(1));
        let queue = barrier(&store);
        assert_eq!(identities(&queue), vec!["id-0", "id-1", "id-2"]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_move_onto_self_is_silent() {
        let (store, rx) = seeded_store(3);
        store.move_track(2, 2);
        barrier(&store);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_move_relocates_and_notifies() {
        let (store, rx) = seeded_store(10);
        store.move_track(2, 8);
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(event, QueueStoreEvent::Moved { from: 2, to: 8 }));
        let queue = barrier(&store);
        assert_eq!(queue.index_of_identity("id-2"), Some(8));
        assert_eq!(queue.index_of_identity("id-3"), Some(2));
    }

    #[test]
    fn test_remove_positions_filters_and_sorts() {
        let (store, rx) = seeded_store(10);
        store.remove_positions(vec![6, 2, 0, 42]);
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        match event {
            QueueStoreEvent::Removed { positions } => assert_eq!(positions, vec![0, 2, 6]),
            other => panic!("expected Removed, got {:?}", other),
        }
        let queue = barrier(&store);
        assert_eq!(queue.len(), 7);
        assert_eq!(store.len(), 7);
        assert_eq!(queue.index_of_identity("id-0"), None);
        assert_eq!(queue.index_of_identity("id-4"), Some(2));
    }

    #[test]
    fn test_remove_by_track_uses_identity() {
        let (store, rx) = seeded_store(3);
        store.remove(&track(1));
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        match event {
            QueueStoreEvent::Removed { positions } => assert_eq!(positions, vec![1]),
            other => panic!("expected Removed, got {:?}", other),
        }
        store.remove(&track(42));
        let queue = barrier(&store);
        assert_eq!(identities(&queue), vec!["id-0", "id-2"]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_events_arrive_in_submission_order() {
        let (store, rx) = seeded_store(5);
        store.insert(5, track(9));
        store.move_track(0, 3);
        store.remove_positions(vec![1]);
        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let third = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(first, QueueStoreEvent::Inserted { .. }));
        assert!(matches!(second, QueueStoreEvent::Moved { .. }));
        assert!(matches!(third, QueueStoreEvent::Removed { .. }));
    }

    #[test]
    fn test_reopening_the_same_file_restores_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        {
            let store = QueueStore::open(&path).unwrap();
            store.replace(Queue::new(vec![track(0), track(1), track(2)]), 0, false);
            barrier(&store);
        }
        let store = QueueStore::open(&path).unwrap();
        assert_eq!(store.len(), 3);
        let queue = barrier(&store);
        assert_eq!(identities(&queue), vec!["id-0", "id-1", "id-2"]);
    }
}
