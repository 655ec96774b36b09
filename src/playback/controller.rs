//! Core playback state machine.
//!
//! Drives a single loaded track through prepare → play → pause → stop →
//! error transitions, independent of queue semantics. The queue layer owns
//! the advance-on-completion decision; this type only reports that a valid
//! completion arrived.

use std::thread;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::sync::broadcast::Sender;

use crate::playback::engine::{EngineEvents, MediaEngine, MediaEngineFactory, NetworkMonitor};
use crate::playback::volume::{RampDirection, VolumeEase, RAMP_STEPS, RAMP_STEP_INTERVAL_MS};
use crate::protocol::{
    now_ms, EngineMessage, Message, PlaybackError, PlaybackState, PlayerEvent, TimerMessage,
};
use crate::state::StateRecorder;
use crate::track::TrackDescriptor;

/// Transport intent captured while the engine is still preparing, applied the
/// instant PREPARED arrives. Single slot, last submitted wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingIntent {
    Play,
    Pause,
}

pub struct PlaybackController {
    factory: Box<dyn MediaEngineFactory>,
    network: Box<dyn NetworkMonitor>,
    bus: Sender<Message>,
    recorder: StateRecorder,
    engine: Option<Box<dyn MediaEngine>>,
    engine_generation: u64,
    preparing: bool,
    prepared: bool,
    pending_intent: Option<PendingIntent>,
    intent_after_seek: bool,
    volume: VolumeEase,
    pause_at_ramp_end: bool,
    loop_current: bool,
}

impl PlaybackController {
    pub fn new(
        factory: Box<dyn MediaEngineFactory>,
        network: Box<dyn NetworkMonitor>,
        recorder: StateRecorder,
        bus: Sender<Message>,
    ) -> Self {
        Self {
            factory,
            network,
            bus,
            recorder,
            engine: None,
            engine_generation: 0,
            preparing: false,
            prepared: false,
            pending_intent: None,
            intent_after_seek: false,
            volume: VolumeEase::new(),
            pause_at_ramp_end: false,
            loop_current: false,
        }
    }

    pub fn recorder(&self) -> &StateRecorder {
        &self.recorder
    }

    pub fn recorder_mut(&mut self) -> &mut StateRecorder {
        &mut self.recorder
    }

    pub fn is_preparing(&self) -> bool {
        self.preparing
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn is_playing(&self) -> bool {
        self.recorder.playback_state() == PlaybackState::Playing
    }

    /// Whether the controller intends to produce sound: currently playing, or
    /// preparing with a queued play intent.
    pub fn play_intent(&self) -> bool {
        self.is_playing()
            || (self.preparing && self.pending_intent == Some(PendingIntent::Play))
    }

    fn publish(&self, event: PlayerEvent) {
        let _ = self.bus.send(Message::Notify(event));
    }

    /// Loads `track` as the current one, releasing any engine in flight.
    /// `None` means "nothing to play" and transitions straight to STOPPED
    /// without touching the factory.
    pub fn set_current_track(&mut self, track: Option<TrackDescriptor>, autostart: bool) {
        self.release_engine();

        self.recorder.set_current_track(track.clone());
        self.recorder.set_play_progress(0, now_ms());
        self.publish(PlayerEvent::PlayingTrackChanged(track.clone()));

        match track {
            None => self.notify_stopped(),
            Some(_) => {
                let pending = autostart.then_some(PendingIntent::Play);
                self.prepare_engine(pending);
            }
        }
    }

    fn prepare_engine(&mut self, pending: Option<PendingIntent>) {
        self.release_engine();

        self.recorder.set_buffering_percent(0);
        self.publish(PlayerEvent::BufferingUpdated(0));

        let Some(track) = self.recorder.current_track().cloned() else {
            return;
        };

        if self.recorder.only_wifi_network() && !self.network.is_wifi() {
            self.playback_error(PlaybackError::OnlyWifiNetwork);
            return;
        }

        self.engine_generation += 1;
        let events = EngineEvents::new(self.bus.clone(), self.engine_generation);
        match self.factory.create(track.source_uri(), events) {
            Ok(mut engine) => {
                self.pending_intent = pending;
                self.notify_preparing();
                if let Err(e) = engine.prepare() {
                    error!("PlaybackController: prepare failed: {}", e);
                    self.playback_error(PlaybackError::DataLoadFailed);
                    return;
                }
                self.engine = Some(engine);
            }
            Err(e) => {
                error!("PlaybackController: engine creation failed: {}", e);
                self.playback_error(PlaybackError::DataLoadFailed);
            }
        }
    }

    /// Releases the engine handle. The handle is moved out and dropped, never
    /// to be reused, and its generation is retired so late callbacks become
    /// no-ops. Outstanding ramp ticks and queued intents die with it.
    fn release_engine(&mut self) {
        self.engine = None;
        self.engine_generation += 1;
        self.preparing = false;
        self.prepared = false;
        self.pending_intent = None;
        self.intent_after_seek = false;
        self.pause_at_ramp_end = false;
        self.volume.cancel();
    }

    pub fn play(&mut self) {
        if self.is_playing() {
            return;
        }

        if self.preparing {
            self.pending_intent = Some(PendingIntent::Play);
            return;
        }

        if self.prepared {
            if let Some(engine) = self.engine.as_mut() {
                engine.set_volume(0.0);
                engine.start();
                let progress = engine.position_ms();
                self.pause_at_ramp_end = false;
                self.start_ramp(RampDirection::In);
                self.notify_playing(progress, now_ms());
            }
            return;
        }

        self.prepare_engine(Some(PendingIntent::Play));
    }

    pub fn pause(&mut self) {
        if matches!(
            self.recorder.playback_state(),
            PlaybackState::Paused | PlaybackState::Stopped | PlaybackState::Error
        ) {
            return;
        }

        if self.preparing {
            self.pending_intent = Some(PendingIntent::Pause);
            return;
        }

        if self.is_playing() {
            if self.volume.is_quiet() {
                // Already near-silent, fading adds nothing.
                self.volume.cancel();
                self.pause_at_ramp_end = false;
                if let Some(engine) = self.engine.as_mut() {
                    engine.pause();
                }
            } else {
                self.pause_at_ramp_end = true;
                self.start_ramp(RampDirection::Out);
            }
        }

        self.notify_paused();
    }

    pub fn stop(&mut self) {
        if self.recorder.playback_state() == PlaybackState::Stopped {
            return;
        }

        if self.prepared {
            if let Some(engine) = self.engine.as_mut() {
                engine.stop();
            }
        }

        self.release_engine();
        self.notify_stopped();
    }

    pub fn play_or_pause(&mut self) {
        if self.is_playing() || self.preparing {
            self.pause();
        } else {
            self.play();
        }
    }

    /// No effect before PREPARED; clamped into the track duration; refused
    /// entirely for forbid-seek tracks.
    pub fn seek_to(&mut self, progress_ms: u64) {
        if self.recorder.forbid_seek() {
            debug!("PlaybackController: seek refused, current track forbids it");
            return;
        }

        if !self.prepared {
            return;
        }

        if let Some(engine) = self.engine.as_mut() {
            let clamped = progress_ms.min(engine.duration_ms());
            engine.seek_to(clamped);
        }
    }

    const SEEK_STEP_MS: u64 = 15_000;

    pub fn fast_forward(&mut self) {
        if !self.prepared {
            return;
        }
        let target = self
            .engine
            .as_ref()
            .map(|engine| engine.position_ms() + Self::SEEK_STEP_MS)
            .unwrap_or(0);
        self.seek_to(target);
    }

    pub fn rewind(&mut self) {
        if !self.prepared {
            return;
        }
        let target = self
            .engine
            .as_ref()
            .map(|engine| engine.position_ms().saturating_sub(Self::SEEK_STEP_MS))
            .unwrap_or(0);
        self.seek_to(target);
    }

    /// Transient ducking: halves the volume. Composes with any active ramp.
    pub fn quiet(&mut self) {
        self.volume.set_quiet(true);
        if self.prepared && self.volume.direction().is_none() {
            if let Some(engine) = self.engine.as_mut() {
                engine.set_volume(self.volume.base_volume());
            }
        }
    }

    pub fn dismiss_quiet(&mut self) {
        self.volume.set_quiet(false);
        if self.volume.is_ramping_out() {
            // A pause fade is in flight; restoring volume would fight it.
            return;
        }
        if self.prepared && self.volume.direction().is_none() {
            if let Some(engine) = self.engine.as_mut() {
                engine.set_volume(self.volume.base_volume());
            }
        }
    }

    /// Applied at PREPARED; when the play mode is Loop the backend replays
    /// natively without reporting completion.
    pub fn set_loop_current(&mut self, looping: bool) {
        self.loop_current = looping;
        if self.prepared {
            if let Some(engine) = self.engine.as_mut() {
                engine.set_looping(looping);
            }
        }
    }

    /// Routes an engine callback. Returns true when a completion from the
    /// live engine generation arrived; the queue layer advances on it.
    pub fn handle_engine_message(&mut self, message: &EngineMessage) -> bool {
        match *message {
            EngineMessage::Prepared {
                generation,
                audio_session_id,
            } => {
                if generation == self.engine_generation {
                    self.on_prepared(audio_session_id);
                }
            }
            EngineMessage::Completed { generation } => {
                if generation == self.engine_generation {
                    self.on_completed();
                    return true;
                }
            }
            EngineMessage::SeekComplete {
                generation,
                position_ms,
            } => {
                if generation == self.engine_generation {
                    self.on_seek_complete(position_ms);
                }
            }
            EngineMessage::Stalled {
                generation,
                stalled,
            } => {
                if generation == self.engine_generation {
                    self.on_stalled(stalled);
                }
            }
            EngineMessage::BufferingUpdate {
                generation,
                percent,
            } => {
                if generation == self.engine_generation {
                    self.recorder.set_buffering_percent(percent);
                    self.publish(PlayerEvent::BufferingUpdated(percent));
                }
            }
            EngineMessage::Error { generation, code } => {
                if generation == self.engine_generation {
                    warn!("PlaybackController: engine reported error code {}", code);
                    self.playback_error(PlaybackError::PlayerError);
                }
            }
        }
        false
    }

    pub fn on_volume_tick(&mut self, generation: u64, step: u32) {
        if generation != self.volume.generation() {
            return;
        }
        let Some(volume) = self.volume.volume_at(step) else {
            return;
        };
        if let Some(engine) = self.engine.as_mut() {
            engine.set_volume(volume);
        }
        if step >= RAMP_STEPS {
            let ramped_out = self.volume.is_ramping_out();
            self.volume.finish();
            if ramped_out && self.pause_at_ramp_end {
                self.pause_at_ramp_end = false;
                if let Some(engine) = self.engine.as_mut() {
                    engine.pause();
                }
            }
        }
    }

    fn start_ramp(&mut self, direction: RampDirection) {
        let generation = self.volume.begin(direction);
        let bus = self.bus.clone();
        thread::spawn(move || {
            for step in 1..=RAMP_STEPS {
                thread::sleep(Duration::from_millis(RAMP_STEP_INTERVAL_MS));
                let tick = Message::Timer(TimerMessage::VolumeTick { generation, step });
                if bus.send(tick).is_err() {
                    break;
                }
            }
        });
    }

    fn on_prepared(&mut self, audio_session_id: i32) {
        self.preparing = false;
        self.prepared = true;

        if let Some(engine) = self.engine.as_mut() {
            engine.set_looping(self.loop_current);
        }

        self.recorder.set_playback_state(PlaybackState::Prepared);
        self.publish(PlayerEvent::PlaybackStateChanged(PlaybackState::Prepared));
        self.publish(PlayerEvent::AudioSessionChanged(audio_session_id));

        let progress = self.recorder.play_progress_ms();
        if progress > 0 && !self.recorder.forbid_seek() {
            // Restore the persisted position before acting on the intent.
            self.intent_after_seek = true;
            if let Some(engine) = self.engine.as_mut() {
                let clamped = progress.min(engine.duration_ms());
                engine.seek_to(clamped);
            }
            return;
        }

        self.run_pending_intent();
    }

    fn run_pending_intent(&mut self) {
        match self.pending_intent.take() {
            Some(PendingIntent::Play) => self.play(),
            Some(PendingIntent::Pause) => self.pause(),
            None => {}
        }
    }

    fn on_completed(&mut self) {
        if let Some(engine) = self.engine.as_ref() {
            let duration = engine.duration_ms();
            self.recorder.set_play_progress(duration, now_ms());
        }
    }

    fn on_seek_complete(&mut self, position_ms: u64) {
        let update_time_ms = now_ms();
        self.recorder.set_play_progress(position_ms, update_time_ms);
        self.publish(PlayerEvent::SeekComplete {
            progress_ms: self.recorder.play_progress_ms(),
            update_time_ms,
        });

        if self.intent_after_seek {
            self.intent_after_seek = false;
            self.run_pending_intent();
        }
    }

    fn on_stalled(&mut self, stalled: bool) {
        if !self.prepared {
            // The stalled overlay only means something once prepared.
            return;
        }
        self.recorder.set_stalled(stalled);
        self.publish(PlayerEvent::StalledChanged(stalled));
    }

    /// Converts a failure into the taxonomy, invalidates the engine, and
    /// broadcasts exactly once. Terminal until the next `set_current_track`.
    pub fn playback_error(&mut self, error: PlaybackError) {
        self.release_engine();

        let message = error.message().to_string();
        self.recorder.set_error(error, message.clone());
        self.recorder.set_playback_state(PlaybackState::Error);
        self.recorder.set_play_progress(0, now_ms());

        self.publish(PlayerEvent::PlaybackErrorOccurred { error, message });
        self.publish(PlayerEvent::PlaybackStateChanged(PlaybackState::Error));
    }

    fn notify_preparing(&mut self) {
        self.preparing = true;
        self.prepared = false;
        self.recorder.set_playback_state(PlaybackState::Preparing);
        self.publish(PlayerEvent::PlaybackStateChanged(PlaybackState::Preparing));
    }

    fn notify_playing(&mut self, progress_ms: u64, update_time_ms: u64) {
        self.recorder.set_play_progress(progress_ms, update_time_ms);
        self.recorder.set_playback_state(PlaybackState::Playing);
        self.publish(PlayerEvent::PlaybackStateChanged(PlaybackState::Playing));
    }

    fn notify_paused(&mut self) {
        if let Some(engine) = self.engine.as_ref() {
            self.recorder
                .set_play_progress(engine.position_ms(), now_ms());
        }
        self.recorder.set_playback_state(PlaybackState::Paused);
        self.publish(PlayerEvent::PlaybackStateChanged(PlaybackState::Paused));
    }

    fn notify_stopped(&mut self) {
        self.recorder.set_play_progress(0, now_ms());
        self.recorder.set_playback_state(PlaybackState::Stopped);
        self.publish(PlayerEvent::PlaybackStateChanged(PlaybackState::Stopped));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::engine::AlwaysWifi;
    use crate::storage::KvStore;
    use crate::test_support::{CallLog, FakeFactory, NoWifi};
    use std::sync::Arc;
    use tokio::sync::broadcast::{self, Receiver};

    fn controller_with(
        fail: bool,
        network: Box<dyn NetworkMonitor>,
    ) -> (PlaybackController, CallLog, Receiver<Message>) {
        let (bus, rx) = broadcast::channel(1024);
        let log = CallLog::default();
        let mut factory = FakeFactory::new(log.clone());
        factory.fail = fail;
        let recorder = StateRecorder::new(
            Arc::new(KvStore::open_in_memory().unwrap()),
            "controller-test",
        );
        let controller = PlaybackController::new(Box::new(factory), network, recorder, bus);
        (controller, log, rx)
    }

    fn controller() -> (PlaybackController, CallLog, Receiver<Message>) {
        controller_with(false, Box::new(AlwaysWifi))
    }

    fn track(forbid_seek: bool) -> TrackDescriptor {
        TrackDescriptor::builder()
            .music_id("m-1")
            .title("Track")
            .source_uri("file:///tmp/track.mp3")
            .identity("id-1")
            .duration_ms(200_000)
            .forbid_seek(forbid_seek)
            .build()
    }

    fn drain_state_events(rx: &mut Receiver<Message>) -> Vec<PlaybackState> {
        let mut states = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Message::Notify(PlayerEvent::PlaybackStateChanged(state)) = message {
                states.push(state);
            }
        }
        states
    }

    fn prepared_controller() -> (PlaybackController, CallLog, Receiver<Message>) {
        let (mut controller, log, rx) = controller();
        controller.set_current_track(Some(track(false)), false);
        let generation = controller.engine_generation;
        controller.handle_engine_message(&EngineMessage::Prepared {
            generation,
            audio_session_id: 7,
        });
        (controller, log, rx)
    }

    #[test]
    fn test_set_current_track_none_goes_straight_to_stopped() {
        let (mut controller, log, _rx) = controller();
        controller.set_current_track(None, true);
        assert_eq!(
            controller.recorder().playback_state(),
            PlaybackState::Stopped
        );
        assert!(log.calls().is_empty());
    }

    #[test]
    fn test_set_current_track_prepares_through_the_factory() {
        let (mut controller, log, _rx) = controller();
        controller.set_current_track(Some(track(false)), false);
        assert_eq!(
            controller.recorder().playback_state(),
            PlaybackState::Preparing
        );
        assert!(log.contains("create:file:///tmp/track.mp3"));
        assert!(log.contains("prepare"));
    }

    #[test]
    fn test_play_before_prepared_queues_the_intent() {
        let (mut controller, log, _rx) = controller();
        controller.set_current_track(Some(track(false)), false);
        controller.play();
        assert!(!log.contains("start"));
        assert!(controller.play_intent());

        let generation = controller.engine_generation;
        controller.handle_engine_message(&EngineMessage::Prepared {
            generation,
            audio_session_id: 7,
        });
        assert!(log.contains("start"));
        assert_eq!(
            controller.recorder().playback_state(),
            PlaybackState::Playing
        );
    }

    #[test]
    fn test_pause_twice_emits_a_single_notification() {
        let (mut controller, _log, mut rx) = prepared_controller();
        controller.play();
        drain_state_events(&mut rx);

        controller.pause();
        controller.pause();
        let states = drain_state_events(&mut rx);
        assert_eq!(states, vec![PlaybackState::Paused]);
    }

    #[test]
    fn test_stop_twice_emits_a_single_notification() {
        let (mut controller, _log, mut rx) = prepared_controller();
        controller.play();
        drain_state_events(&mut rx);

        controller.stop();
        controller.stop();
        let states = drain_state_events(&mut rx);
        assert_eq!(states, vec![PlaybackState::Stopped]);
    }

    #[test]
    fn test_seek_is_clamped_into_the_duration() {
        let (mut controller, log, _rx) = prepared_controller();
        controller.seek_to(999_999_999);
        assert!(log.contains("seek_to:200000"));
    }

    #[test]
    fn test_seek_refused_for_forbid_seek_tracks() {
        let (mut controller, log, _rx) = controller();
        controller.set_current_track(Some(track(true)), false);
        let generation = controller.engine_generation;
        controller.handle_engine_message(&EngineMessage::Prepared {
            generation,
            audio_session_id: 7,
        });
        controller.seek_to(10_000);
        assert!(!log.calls().iter().any(|c| c.starts_with("seek_to")));
    }

    #[test]
    fn test_seek_before_prepared_is_a_no_op() {
        let (mut controller, log, _rx) = controller();
        controller.set_current_track(Some(track(false)), false);
        controller.seek_to(10_000);
        assert!(!log.calls().iter().any(|c| c.starts_with("seek_to")));
    }

    #[test]
    fn test_engine_error_is_terminal_and_invalidates_the_handle() {
        let (mut controller, log, _rx) = prepared_controller();
        let generation = controller.engine_generation;
        controller.handle_engine_message(&EngineMessage::Error {
            generation,
            code: -38,
        });

        assert_eq!(controller.recorder().playback_state(), PlaybackState::Error);
        assert_eq!(controller.recorder().error(), PlaybackError::PlayerError);
        assert!(log.contains("released"));

        // Late callbacks from the released generation are noise.
        let advanced = controller.handle_engine_message(&EngineMessage::Completed { generation });
        assert!(!advanced);
        assert_eq!(controller.recorder().playback_state(), PlaybackState::Error);
    }

    #[test]
    fn test_error_cleared_by_next_set_current_track() {
        let (mut controller, _log, _rx) = prepared_controller();
        let generation = controller.engine_generation;
        controller.handle_engine_message(&EngineMessage::Error {
            generation,
            code: 1,
        });
        controller.set_current_track(Some(track(false)), false);
        assert_eq!(controller.recorder().error(), PlaybackError::NoError);
        assert_eq!(
            controller.recorder().playback_state(),
            PlaybackState::Preparing
        );
    }

    #[test]
    fn test_wifi_only_policy_rejects_without_touching_factory() {
        let (mut controller, log, _rx) = controller_with(false, Box::new(NoWifi));
        controller.set_current_track(Some(track(false)), true);
        assert_eq!(controller.recorder().playback_state(), PlaybackState::Error);
        assert_eq!(
            controller.recorder().error(),
            PlaybackError::OnlyWifiNetwork
        );
        assert!(log.calls().is_empty());
    }

    #[test]
    fn test_factory_failure_maps_to_data_load_failed() {
        let (mut controller, _log, _rx) = controller_with(true, Box::new(AlwaysWifi));
        controller.set_current_track(Some(track(false)), true);
        assert_eq!(
            controller.recorder().error(),
            PlaybackError::DataLoadFailed
        );
    }

    #[test]
    fn test_prepared_restores_persisted_progress_before_intent() {
        let (mut controller, log, _rx) = controller();
        controller.set_current_track(Some(track(false)), false);
        controller.recorder_mut().set_play_progress(42_000, 1);
        controller.play();

        let generation = controller.engine_generation;
        controller.handle_engine_message(&EngineMessage::Prepared {
            generation,
            audio_session_id: 7,
        });
        assert!(log.contains("seek_to:42000"));
        assert!(!log.contains("start"));

        controller.handle_engine_message(&EngineMessage::SeekComplete {
            generation,
            position_ms: 42_000,
        });
        assert!(log.contains("start"));
        assert_eq!(
            controller.recorder().playback_state(),
            PlaybackState::Playing
        );
    }

    #[test]
    fn test_final_ramp_in_tick_reaches_full_volume() {
        let (mut controller, log, _rx) = prepared_controller();
        controller.play();
        let generation = controller.volume.generation();
        controller.on_volume_tick(generation, RAMP_STEPS);
        assert!(log.contains("set_volume:1"));
    }

    #[test]
    fn test_quiet_composes_with_the_ramp_target() {
        let (mut controller, log, _rx) = prepared_controller();
        controller.quiet();
        controller.play();
        let generation = controller.volume.generation();
        controller.on_volume_tick(generation, RAMP_STEPS);
        assert!(log.contains("set_volume:0.5"));
    }

    #[test]
    fn test_pause_fades_out_then_pauses_the_engine() {
        let (mut controller, log, mut rx) = prepared_controller();
        controller.play();
        drain_state_events(&mut rx);

        controller.pause();
        assert!(!log.contains("engine_pause"));
        assert_eq!(
            controller.recorder().playback_state(),
            PlaybackState::Paused
        );

        let generation = controller.volume.generation();
        controller.on_volume_tick(generation, RAMP_STEPS);
        assert!(log.contains("engine_pause"));
    }

    #[test]
    fn test_stale_ramp_tick_is_ignored() {
        let (mut controller, log, _rx) = prepared_controller();
        controller.play();
        let stale = controller.volume.generation();
        controller.pause();
        let before = log.calls().len();
        controller.on_volume_tick(stale, RAMP_STEPS);
        assert_eq!(log.calls().len(), before);
        assert!(!log.contains("engine_pause"));
    }

    #[test]
    fn test_stalled_before_prepared_has_no_observable_effect() {
        let (mut controller, _log, mut rx) = controller();
        controller.set_current_track(Some(track(false)), false);
        let generation = controller.engine_generation;
        while rx.try_recv().is_ok() {}
        controller.handle_engine_message(&EngineMessage::Stalled {
            generation,
            stalled: true,
        });
        assert!(!controller.recorder().is_stalled());
        while let Ok(message) = rx.try_recv() {
            assert!(!matches!(
                message,
                Message::Notify(PlayerEvent::StalledChanged(_))
            ));
        }
    }

    #[test]
    fn test_completion_from_live_generation_reports_advance() {
        let (mut controller, _log, _rx) = prepared_controller();
        controller.play();
        let generation = controller.engine_generation;
        assert!(controller.handle_engine_message(&EngineMessage::Completed { generation }));
    }
}
