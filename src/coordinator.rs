//! Queue-domain orchestrator.
//!
//! Composes the playback controller with the durable queue store: translates
//! structural mutation events and navigation commands into controller
//! transitions, remapping the playing position against each new snapshot.
//!
//! Queue reloads are asynchronous, so a navigation command that arrives while
//! a reload is in flight is captured in a single pending slot (last submitted
//! wins) and re-invoked the instant the fresh snapshot lands. It is never
//! applied against stale data and never silently dropped.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::{Receiver, Sender};

use crate::playback::PlaybackController;
use crate::protocol::{
    now_ms, ControlMessage, Message, PlayMode, PlayerEvent, QueueMessage, SleepTimerAction,
    TimerMessage,
};
use crate::queue::Queue;
use crate::queue_store::{QueueStore, QueueStoreEvent};
use crate::state::SleepTimerRecord;
use crate::track::TrackDescriptor;

/// Deferred command applied once the in-flight reload completes.
#[derive(Debug, Clone)]
enum PendingAction {
    SkipToNext,
    SkipToPrevious,
    PlayOrPauseAt(usize),
    /// Restart playback after the playing entry was removed; `shifted` is the
    /// old position minus the entries removed before it, wrapped against the
    /// new snapshot length on application.
    RestartAt { shifted: usize, autoplay: bool },
    /// Adopt the position supplied by a wholesale queue replacement, clamped
    /// against the new snapshot length.
    AdoptPosition { position: usize, autoplay: bool },
}

pub struct QueueCoordinator {
    controller: PlaybackController,
    store: Arc<QueueStore>,
    bus_consumer: Receiver<Message>,
    bus_producer: Sender<Message>,
    queue: Queue,
    loading: bool,
    load_generation: u64,
    pending: Option<PendingAction>,
    sleep_generation: u64,
    rng: StdRng,
}

impl QueueCoordinator {
    /// Creates a coordinator bound to bus channels and the queue store, and
    /// kicks off the initial snapshot load.
    pub fn new(
        controller: PlaybackController,
        store: Arc<QueueStore>,
        bus_consumer: Receiver<Message>,
        bus_producer: Sender<Message>,
    ) -> Self {
        let listener_bus = bus_producer.clone();
        store.set_listener(move |event| {
            let message = match event {
                QueueStoreEvent::Replaced { position, autoplay } => {
                    QueueMessage::Replaced { position, autoplay }
                }
                QueueStoreEvent::Inserted { position, count } => {
                    QueueMessage::Inserted { position, count }
                }
                QueueStoreEvent::Moved { from, to } => QueueMessage::Moved { from, to },
                QueueStoreEvent::Removed { positions } => QueueMessage::Removed { positions },
            };
            let _ = listener_bus.send(Message::Queue(message));
        });

        let mut seed = [0u8; 32];
        getrandom::fill(&mut seed).expect("Failed to generate random seed");

        let mut coordinator = Self {
            controller,
            store,
            bus_consumer,
            bus_producer,
            queue: Queue::default(),
            loading: false,
            load_generation: 0,
            pending: None,
            sleep_generation: 0,
            rng: StdRng::from_seed(seed),
        };
        let looping = coordinator.controller.recorder().play_mode() == PlayMode::Loop;
        coordinator.controller.set_loop_current(looping);
        coordinator.reload_queue();
        coordinator
    }

    pub fn controller(&self) -> &PlaybackController {
        &self.controller
    }

    /// Consumes bus traffic until shutdown.
    pub fn run(&mut self) {
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(Message::Control(ControlMessage::Shutdown)) => {
                    debug!("QueueCoordinator: shutting down");
                    self.controller.stop();
                    break;
                }
                Ok(message) => self.handle_message(message),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("QueueCoordinator: bus lagged, skipped {} messages", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    pub(crate) fn handle_message(&mut self, message: Message) {
        match message {
            Message::Control(control) => self.handle_control(control),
            Message::Queue(queue) => self.handle_queue(queue),
            Message::Engine(engine) => {
                if self.controller.handle_engine_message(&engine) {
                    self.on_play_complete();
                }
            }
            Message::Timer(timer) => self.handle_timer(timer),
            Message::Radio(_) | Message::Notify(_) => {}
        }
    }

    fn handle_control(&mut self, control: ControlMessage) {
        match control {
            ControlMessage::Play => self.controller.play(),
            ControlMessage::Pause => self.controller.pause(),
            ControlMessage::Stop => {
                // An explicit stop is terminal: whatever was queued behind an
                // in-flight reload must not resurrect playback.
                self.pending = None;
                self.controller.stop();
            }
            ControlMessage::PlayOrPause => self.controller.play_or_pause(),
            ControlMessage::PlayOrPauseAt(position) => self.play_or_pause_at(position),
            ControlMessage::SeekTo(progress_ms) => self.controller.seek_to(progress_ms),
            ControlMessage::FastForward => self.controller.fast_forward(),
            ControlMessage::Rewind => self.controller.rewind(),
            ControlMessage::SkipToNext => self.skip_to_next(),
            ControlMessage::SkipToPrevious => self.skip_to_previous(),
            ControlMessage::SetPlayMode(mode) => self.set_play_mode(mode),
            ControlMessage::SetNextPlay(track) => self.set_next_play(track),
            ControlMessage::Quiet => self.controller.quiet(),
            ControlMessage::DismissQuiet => self.controller.dismiss_quiet(),
            ControlMessage::StartSleepTimer {
                duration_ms,
                action,
            } => self.start_sleep_timer(duration_ms, action),
            ControlMessage::CancelSleepTimer => self.cancel_sleep_timer(),
            ControlMessage::Shutdown => {}
        }
    }

    fn handle_queue(&mut self, message: QueueMessage) {
        match message {
            QueueMessage::Replaced { position, autoplay } => {
                self.pending = Some(PendingAction::AdoptPosition { position, autoplay });
                self.publish(PlayerEvent::QueueChanged {
                    position: Some(position),
                });
                self.reload_queue();
            }
            QueueMessage::Inserted { position, count } => {
                if let Some(playing) = self.controller.recorder().queue_position() {
                    if position <= playing {
                        self.update_position(playing + count);
                    }
                }
                self.publish_queue_changed();
                self.reload_queue();
            }
            QueueMessage::Moved { from, to } => {
                if let Some(playing) = self.controller.recorder().queue_position() {
                    if let Some(remapped) = remap_after_move(playing, from, to) {
                        self.update_position(remapped);
                    }
                }
                self.publish_queue_changed();
                self.reload_queue();
            }
            QueueMessage::Removed { positions } => {
                self.on_removed(&positions);
                self.publish_queue_changed();
                self.reload_queue();
            }
            QueueMessage::Snapshot { queue, generation } => {
                self.on_snapshot(queue, generation);
            }
        }
    }

    fn handle_timer(&mut self, message: TimerMessage) {
        match message {
            TimerMessage::VolumeTick { generation, step } => {
                self.controller.on_volume_tick(generation, step);
            }
            TimerMessage::SleepTimerElapsed { generation } => {
                if generation != self.sleep_generation {
                    return;
                }
                let action = self
                    .controller
                    .recorder()
                    .sleep_timer()
                    .map(|record| record.action);
                self.controller.recorder_mut().set_sleep_timer(None);
                match action {
                    Some(SleepTimerAction::Pause) => self.controller.pause(),
                    Some(SleepTimerAction::Stop) => self.controller.stop(),
                    None => {}
                }
            }
        }
    }

    fn publish(&self, event: PlayerEvent) {
        let _ = self.bus_producer.send(Message::Notify(event));
    }

    fn publish_queue_changed(&self) {
        self.publish(PlayerEvent::QueueChanged {
            position: self.controller.recorder().queue_position(),
        });
    }

    fn update_position(&mut self, position: usize) {
        self.controller
            .recorder_mut()
            .set_queue_position(Some(position));
        self.publish(PlayerEvent::PositionChanged(Some(position)));
    }

    fn current_position(&self) -> usize {
        self.controller.recorder().queue_position().unwrap_or(0)
    }

    /// Loads `queue[position]` into the controller as the new current track.
    fn apply_position(&mut self, position: usize, autoplay: bool) {
        let track = self.queue.get(position).cloned();
        if track.is_none() {
            warn!(
                "QueueCoordinator: position {} outside queue of {}",
                position,
                self.queue.len()
            );
        }
        self.controller
            .recorder_mut()
            .set_queue_position(Some(position));
        self.controller.set_current_track(track, autoplay);
        self.publish(PlayerEvent::PositionChanged(Some(position)));
    }

    /// Unloads the current track after the queue emptied.
    fn clear_current(&mut self) {
        self.controller.recorder_mut().set_queue_position(None);
        self.controller.set_current_track(None, false);
        self.publish(PlayerEvent::PositionChanged(None));
    }

    pub(crate) fn skip_to_next(&mut self) {
        if self.loading {
            self.pending = Some(PendingAction::SkipToNext);
            return;
        }
        if self.queue.is_empty() {
            debug!("QueueCoordinator: skip_to_next on empty queue, ignoring");
            return;
        }
        let next = self.next_position(self.current_position());
        self.apply_position(next, true);
    }

    pub(crate) fn skip_to_previous(&mut self) {
        if self.loading {
            self.pending = Some(PendingAction::SkipToPrevious);
            return;
        }
        if self.queue.is_empty() {
            debug!("QueueCoordinator: skip_to_previous on empty queue, ignoring");
            return;
        }
        let previous = self.previous_position(self.current_position());
        self.apply_position(previous, true);
    }

    fn play_or_pause_at(&mut self, position: usize) {
        if self.loading {
            self.pending = Some(PendingAction::PlayOrPauseAt(position));
            return;
        }
        if position == self.current_position()
            && self.controller.recorder().current_track().is_some()
        {
            self.controller.play_or_pause();
            return;
        }
        if position >= self.queue.len() {
            warn!(
                "QueueCoordinator: play_or_pause at {} outside queue of {}",
                position,
                self.queue.len()
            );
            return;
        }
        self.apply_position(position, true);
    }

    fn next_position(&mut self, position: usize) -> usize {
        match self.controller.recorder().play_mode() {
            PlayMode::Sequential | PlayMode::Loop => (position + 1) % self.queue.len(),
            PlayMode::Shuffle => self.random_other_position(position),
        }
    }

    fn previous_position(&mut self, position: usize) -> usize {
        let len = self.queue.len();
        match self.controller.recorder().play_mode() {
            PlayMode::Sequential | PlayMode::Loop => (position + len - 1) % len,
            PlayMode::Shuffle => self.random_other_position(position),
        }
    }

    /// Uniformly random index different from `current`; reject-and-resample
    /// on collision. Degenerates to 0 when the queue has fewer than 2 entries.
    fn random_other_position(&mut self, current: usize) -> usize {
        let len = self.queue.len();
        if len < 2 {
            return 0;
        }
        loop {
            let candidate = self.rng.random_range(0..len);
            if candidate != current {
                return candidate;
            }
        }
    }

    fn set_play_mode(&mut self, mode: PlayMode) {
        if mode == self.controller.recorder().play_mode() {
            return;
        }
        self.controller.recorder_mut().set_play_mode(mode);
        self.controller.set_loop_current(mode == PlayMode::Loop);
        self.publish(PlayerEvent::PlayModeChanged(mode));
    }

    /// Insert-or-move semantics targeting the slot right after the current
    /// position; the store degenerates duplicates into a move.
    fn set_next_play(&mut self, track: TrackDescriptor) {
        let slot = self
            .controller
            .recorder()
            .queue_position()
            .map(|position| position + 1)
            .unwrap_or(0);
        self.store.insert(slot, track);
    }

    fn on_play_complete(&mut self) {
        if self.controller.recorder().play_mode() == PlayMode::Loop {
            // Native engine looping normally absorbs completion; if the
            // backend reported one anyway, replay the same track.
            let track = self.controller.recorder().current_track().cloned();
            self.controller.set_current_track(track, true);
            return;
        }
        self.skip_to_next();
    }

    fn on_removed(&mut self, positions: &[usize]) {
        let Some(playing) = self.controller.recorder().queue_position() else {
            return;
        };

        let removed_before = positions.iter().filter(|&&p| p < playing).count();

        if positions.contains(&playing) {
            let autoplay = self.controller.play_intent();
            self.pending = Some(PendingAction::RestartAt {
                shifted: playing - removed_before,
                autoplay,
            });
            return;
        }

        if removed_before > 0 {
            self.update_position(playing - removed_before);
        }
    }

    /// Requests a fresh snapshot from the store; completion is marshaled back
    /// through the bus with the generation it was requested under.
    fn reload_queue(&mut self) {
        self.loading = true;
        self.load_generation += 1;
        let generation = self.load_generation;
        let bus = self.bus_producer.clone();
        self.store.get(move |queue| {
            let _ = bus.send(Message::Queue(QueueMessage::Snapshot { queue, generation }));
        });
    }

    fn on_snapshot(&mut self, queue: Queue, generation: u64) {
        if generation != self.load_generation {
            debug!(
                "QueueCoordinator: discarding stale snapshot (generation {} < {})",
                generation, self.load_generation
            );
            return;
        }

        self.queue = queue;
        self.loading = false;

        if let Some(action) = self.pending.take() {
            self.run_pending(action);
        }
    }

    fn run_pending(&mut self, action: PendingAction) {
        match action {
            PendingAction::SkipToNext => self.skip_to_next(),
            PendingAction::SkipToPrevious => self.skip_to_previous(),
            PendingAction::PlayOrPauseAt(position) => self.play_or_pause_at(position),
            PendingAction::RestartAt { shifted, autoplay } => {
                if self.queue.is_empty() {
                    self.clear_current();
                } else {
                    let position = shifted % self.queue.len();
                    self.apply_position(position, autoplay);
                }
            }
            PendingAction::AdoptPosition { position, autoplay } => {
                if self.queue.is_empty() {
                    self.clear_current();
                } else {
                    let position = position.min(self.queue.len() - 1);
                    self.apply_position(position, autoplay);
                }
            }
        }
    }

    fn start_sleep_timer(&mut self, duration_ms: u64, action: SleepTimerAction) {
        self.sleep_generation += 1;
        let generation = self.sleep_generation;
        self.controller
            .recorder_mut()
            .set_sleep_timer(Some(SleepTimerRecord {
                duration_ms,
                start_time_ms: now_ms(),
                action,
            }));

        let bus = self.bus_producer.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(duration_ms));
            let elapsed = Message::Timer(TimerMessage::SleepTimerElapsed { generation });
            if bus.send(elapsed).is_err() {
                error!("QueueCoordinator: bus gone before sleep timer fired");
            }
        });
    }

    fn cancel_sleep_timer(&mut self) {
        self.sleep_generation += 1;
        self.controller.recorder_mut().set_sleep_timer(None);
    }
}

/// Playing-position remap for a single-entry move, in pre-mutation
/// coordinates. Returns the new position when it changed.
fn remap_after_move(playing: usize, from: usize, to: usize) -> Option<usize> {
    if from == playing {
        return Some(to);
    }
    let (low, high) = (from.min(to), from.max(to));
    if playing < low || playing > high {
        return None;
    }
    if from < playing {
        Some(playing - 1)
    } else {
        Some(playing + 1)
    }
}
