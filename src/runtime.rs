//! Engine wiring.
//!
//! Spawns the coordinator on its own thread (the "controller thread", the
//! only place component state mutates), fans notifications out to registered
//! listeners, and exposes the whole command surface through a cloneable
//! handle.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::{self, Receiver, Sender};

use crate::coordinator::QueueCoordinator;
use crate::error::Result;
use crate::listener::{ListenerRegistry, Subscription};
use crate::playback::engine::{MediaEngineFactory, NetworkMonitor};
use crate::playback::PlaybackController;
use crate::protocol::{ControlMessage, Message, PlayMode, PlayerEvent, SleepTimerAction};
use crate::queue::Queue;
use crate::queue_store::QueueStore;
use crate::radio::{RadioCoordinator, RadioProvider, StationContext};
use crate::state::StateRecorder;
use crate::storage::KvStore;
use crate::track::TrackDescriptor;

const BUS_CAPACITY: usize = 1024;

/// A running playback engine instance.
pub struct PlayerRuntime {
    bus: Sender<Message>,
    listeners: ListenerRegistry,
    store: Option<Arc<QueueStore>>,
    coordinator_thread: Option<JoinHandle<()>>,
    dispatch_thread: Option<JoinHandle<()>>,
}

impl PlayerRuntime {
    /// Starts a queue-backed engine with storage at the platform data
    /// directory, keyed by `instance_id`.
    pub fn start(
        instance_id: &str,
        factory: Box<dyn MediaEngineFactory>,
        network: Box<dyn NetworkMonitor>,
    ) -> Result<Self> {
        let store = Arc::new(QueueStore::open_default(instance_id)?);
        let kv = Arc::new(KvStore::open_default(instance_id)?);
        Ok(Self::start_with_stores(
            instance_id,
            factory,
            network,
            store,
            kv,
        ))
    }

    /// Starts a queue-backed engine on explicit stores (tests use in-memory
    /// ones).
    pub fn start_with_stores(
        instance_id: &str,
        factory: Box<dyn MediaEngineFactory>,
        network: Box<dyn NetworkMonitor>,
        store: Arc<QueueStore>,
        kv: Arc<KvStore>,
    ) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        let listeners = ListenerRegistry::new();
        let dispatch_thread = spawn_dispatcher(bus.subscribe(), listeners.clone());

        let recorder = StateRecorder::new(kv, instance_id);
        let controller = PlaybackController::new(factory, network, recorder, bus.clone());

        // Construct on the calling thread so the store listener is registered
        // before this returns; mutations issued right after cannot slip past.
        let consumer = bus.subscribe();
        let producer = bus.clone();
        let mut coordinator = QueueCoordinator::new(controller, store.clone(), consumer, producer);
        let coordinator_thread = thread::spawn(move || coordinator.run());

        info!("PlayerRuntime: started queue engine '{}'", instance_id);
        Self {
            bus,
            listeners,
            store: Some(store),
            coordinator_thread: Some(coordinator_thread),
            dispatch_thread: Some(dispatch_thread),
        }
    }

    /// Starts a radio engine: same controller, tracks sourced on demand from
    /// `provider` instead of a stored queue.
    pub fn start_radio(
        instance_id: &str,
        factory: Box<dyn MediaEngineFactory>,
        network: Box<dyn NetworkMonitor>,
        provider: Arc<dyn RadioProvider>,
        station: StationContext,
        kv: Arc<KvStore>,
    ) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        let listeners = ListenerRegistry::new();
        let dispatch_thread = spawn_dispatcher(bus.subscribe(), listeners.clone());

        let recorder = StateRecorder::new(kv, instance_id);
        let controller = PlaybackController::new(factory, network, recorder, bus.clone());

        let consumer = bus.subscribe();
        let producer = bus.clone();
        let mut coordinator = RadioCoordinator::new(controller, provider, station, consumer, producer);
        let coordinator_thread = thread::spawn(move || coordinator.run());

        info!("PlayerRuntime: started radio engine '{}'", instance_id);
        Self {
            bus,
            listeners,
            store: None,
            coordinator_thread: Some(coordinator_thread),
            dispatch_thread: Some(dispatch_thread),
        }
    }

    pub fn handle(&self) -> PlayerHandle {
        PlayerHandle {
            bus: self.bus.clone(),
            store: self.store.clone(),
            listeners: self.listeners.clone(),
        }
    }

    /// Stops playback and tears the engine threads down.
    pub fn shutdown(mut self) {
        let _ = self.bus.send(Message::Control(ControlMessage::Shutdown));
        if let Some(thread) = self.coordinator_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.dispatch_thread.take() {
            let _ = thread.join();
        }
        self.listeners.clear();
        debug!("PlayerRuntime: shut down");
    }
}

fn spawn_dispatcher(mut rx: Receiver<Message>, listeners: ListenerRegistry) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match rx.blocking_recv() {
            Ok(Message::Notify(event)) => listeners.dispatch(&event),
            Ok(Message::Control(ControlMessage::Shutdown)) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("PlayerRuntime: event dispatch lagged, skipped {}", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    })
}

/// Cloneable command surface over a running engine.
#[derive(Clone)]
pub struct PlayerHandle {
    bus: Sender<Message>,
    store: Option<Arc<QueueStore>>,
    listeners: ListenerRegistry,
}

impl PlayerHandle {
    fn send(&self, control: ControlMessage) {
        let _ = self.bus.send(Message::Control(control));
    }

    pub fn play(&self) {
        self.send(ControlMessage::Play);
    }

    pub fn pause(&self) {
        self.send(ControlMessage::Pause);
    }

    pub fn stop(&self) {
        self.send(ControlMessage::Stop);
    }

    pub fn play_or_pause(&self) {
        self.send(ControlMessage::PlayOrPause);
    }

    pub fn play_or_pause_at(&self, position: usize) {
        self.send(ControlMessage::PlayOrPauseAt(position));
    }

    pub fn seek_to(&self, progress_ms: u64) {
        self.send(ControlMessage::SeekTo(progress_ms));
    }

    pub fn fast_forward(&self) {
        self.send(ControlMessage::FastForward);
    }

    pub fn rewind(&self) {
        self.send(ControlMessage::Rewind);
    }

    pub fn skip_to_next(&self) {
        self.send(ControlMessage::SkipToNext);
    }

    pub fn skip_to_previous(&self) {
        self.send(ControlMessage::SkipToPrevious);
    }

    pub fn set_play_mode(&self, mode: PlayMode) {
        self.send(ControlMessage::SetPlayMode(mode));
    }

    pub fn quiet(&self) {
        self.send(ControlMessage::Quiet);
    }

    pub fn dismiss_quiet(&self) {
        self.send(ControlMessage::DismissQuiet);
    }

    pub fn start_sleep_timer(&self, duration_ms: u64, action: SleepTimerAction) {
        self.send(ControlMessage::StartSleepTimer {
            duration_ms,
            action,
        });
    }

    pub fn cancel_sleep_timer(&self) {
        self.send(ControlMessage::CancelSleepTimer);
    }

    /// Insert-or-move `track` into the slot right after the current position.
    pub fn set_next_play(&self, track: TrackDescriptor) {
        self.send(ControlMessage::SetNextPlay(track));
    }

    fn with_store(&self, op: impl FnOnce(&QueueStore)) {
        match &self.store {
            Some(store) => op(store),
            None => warn!("PlayerHandle: queue mutation ignored, no queue store (radio mode)"),
        }
    }

    pub fn replace_queue(&self, queue: Queue, position: usize, autoplay: bool) {
        self.with_store(|store| store.replace(queue, position, autoplay));
    }

    pub fn insert(&self, position: usize, track: TrackDescriptor) {
        self.with_store(|store| store.insert(position, track));
    }

    pub fn insert_all(&self, position: usize, tracks: Vec<TrackDescriptor>) {
        self.with_store(|store| store.insert_all(position, tracks));
    }

    pub fn move_track(&self, from: usize, to: usize) {
        self.with_store(|store| store.move_track(from, to));
    }

    pub fn remove(&self, track: &TrackDescriptor) {
        self.with_store(|store| store.remove(track));
    }

    pub fn remove_positions(&self, positions: Vec<usize>) {
        self.with_store(|store| store.remove_positions(positions));
    }

    /// Current queue size; O(1).
    pub fn queue_len(&self) -> usize {
        self.store.as_ref().map(|store| store.len()).unwrap_or(0)
    }

    /// Registers a listener under a caller-supplied id; multiple remote
    /// clients register independently. Returns the capability handle needed
    /// to unregister.
    pub fn add_listener(
        &self,
        id: impl Into<String>,
        listener: impl Fn(&PlayerEvent) + Send + 'static,
    ) -> Subscription {
        self.listeners.add(id, listener)
    }

    pub fn remove_listener(&self, subscription: &Subscription) {
        self.listeners.remove(subscription);
    }
}
