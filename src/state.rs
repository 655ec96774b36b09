//! Durable, incrementally-written snapshot of controller and coordinator
//! state, restored at construction time.

use std::sync::Arc;

use log::error;
use serde::{Deserialize, Serialize};

use crate::protocol::{PlayMode, PlaybackError, PlaybackState, SleepTimerAction};
use crate::storage::KvStore;
use crate::track::TrackDescriptor;

/// Persisted sleep timer record, kept so a restart can surface the pending
/// timer to the resume collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepTimerRecord {
    pub duration_ms: u64,
    pub start_time_ms: u64,
    pub action: SleepTimerAction,
}

/// The state surviving process restarts, plus the runtime-only overlay fields
/// (playback state, stalled, buffering) that are rebuilt from scratch.
#[derive(Debug, Clone)]
pub struct PersistedState {
    pub play_progress_ms: u64,
    pub play_progress_update_time_ms: u64,
    pub current_track: Option<TrackDescriptor>,
    pub queue_position: Option<usize>,
    pub play_mode: PlayMode,
    pub sleep_timer: Option<SleepTimerRecord>,
    pub error: PlaybackError,
    pub error_message: String,
    pub only_wifi_network: bool,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            play_progress_ms: 0,
            play_progress_update_time_ms: 0,
            current_track: None,
            queue_position: None,
            play_mode: PlayMode::Sequential,
            sleep_timer: None,
            error: PlaybackError::NoError,
            error_message: String::new(),
            only_wifi_network: true,
        }
    }
}

/// Write-through recorder: every setter persists immediately, so a process
/// crash loses at most the in-flight call. Keys are namespaced by the engine
/// instance id so several instances can share one backing store.
pub struct StateRecorder {
    store: Arc<KvStore>,
    prefix: String,
    state: PersistedState,
    playback_state: PlaybackState,
    stalled: bool,
    buffering_percent: u8,
}

impl StateRecorder {
    /// Restores the state recorded under `instance_id`, applying documented
    /// defaults for anything missing. A restored forbid-seek track zeroes the
    /// restored progress.
    pub fn new(store: Arc<KvStore>, instance_id: &str) -> Self {
        let prefix = format!("PlayerState:{instance_id}:");
        let mut recorder = Self {
            store,
            prefix,
            state: PersistedState::default(),
            playback_state: PlaybackState::None,
            stalled: false,
            buffering_percent: 0,
        };
        recorder.restore();
        recorder
    }

    fn restore(&mut self) {
        self.state.current_track = self.decode("current_track");
        self.state.queue_position = self.decode("queue_position");
        self.state.play_mode = self
            .decode::<i64>("play_mode")
            .map(PlayMode::from_serial_id)
            .unwrap_or(PlayMode::Sequential);
        self.state.sleep_timer = self.decode("sleep_timer");
        self.state.error = self
            .decode::<i64>("error_code")
            .map(PlaybackError::from_code)
            .unwrap_or(PlaybackError::NoError);
        self.state.error_message = self.decode("error_message").unwrap_or_default();
        self.state.only_wifi_network = self.decode("only_wifi_network").unwrap_or(true);
        self.state.play_progress_update_time_ms =
            self.decode("play_progress_update_time").unwrap_or(0);

        if self.forbid_seek() {
            self.state.play_progress_ms = 0;
        } else {
            self.state.play_progress_ms = self.decode("play_progress").unwrap_or(0);
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.get(&format!("{}{key}", self.prefix)) {
            Ok(value) => value,
            Err(e) => {
                error!("StateRecorder: failed to decode '{}': {}", key, e);
                None
            }
        }
    }

    fn encode<T: Serialize>(&self, key: &str, value: &T) {
        if let Err(e) = self.store.put(&format!("{}{key}", self.prefix), value) {
            error!("StateRecorder: failed to persist '{}': {}", key, e);
        }
    }

    fn erase(&self, key: &str) {
        if let Err(e) = self.store.remove(&format!("{}{key}", self.prefix)) {
            error!("StateRecorder: failed to remove '{}': {}", key, e);
        }
    }

    /// Whether the currently recorded track forbids seeking.
    pub fn forbid_seek(&self) -> bool {
        self.state
            .current_track
            .as_ref()
            .map(TrackDescriptor::forbid_seek)
            .unwrap_or(false)
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn current_track(&self) -> Option<&TrackDescriptor> {
        self.state.current_track.as_ref()
    }

    pub fn play_progress_ms(&self) -> u64 {
        self.state.play_progress_ms
    }

    pub fn queue_position(&self) -> Option<usize> {
        self.state.queue_position
    }

    pub fn play_mode(&self) -> PlayMode {
        self.state.play_mode
    }

    pub fn sleep_timer(&self) -> Option<&SleepTimerRecord> {
        self.state.sleep_timer.as_ref()
    }

    pub fn error(&self) -> PlaybackError {
        self.state.error
    }

    pub fn error_message(&self) -> &str {
        &self.state.error_message
    }

    pub fn only_wifi_network(&self) -> bool {
        self.state.only_wifi_network
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.playback_state
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn buffering_percent(&self) -> u8 {
        self.buffering_percent
    }

    /// Records progress. While the current track forbids seeking, the
    /// persisted progress is pinned to 0 no matter what was passed; callers
    /// must therefore record the track before its progress.
    pub fn set_play_progress(&mut self, progress_ms: u64, update_time_ms: u64) {
        let progress_ms = if self.forbid_seek() { 0 } else { progress_ms };
        self.state.play_progress_ms = progress_ms;
        self.state.play_progress_update_time_ms = update_time_ms;
        self.encode("play_progress", &progress_ms);
        self.encode("play_progress_update_time", &update_time_ms);
    }

    pub fn set_current_track(&mut self, track: Option<TrackDescriptor>) {
        match &track {
            Some(track) => self.encode("current_track", track),
            None => self.erase("current_track"),
        }
        self.state.current_track = track;
    }

    pub fn set_queue_position(&mut self, position: Option<usize>) {
        self.state.queue_position = position;
        self.encode("queue_position", &position);
    }

    pub fn set_play_mode(&mut self, play_mode: PlayMode) {
        self.state.play_mode = play_mode;
        self.encode("play_mode", &play_mode.serial_id());
    }

    pub fn set_sleep_timer(&mut self, record: Option<SleepTimerRecord>) {
        match &record {
            Some(record) => self.encode("sleep_timer", record),
            None => self.erase("sleep_timer"),
        }
        self.state.sleep_timer = record;
    }

    pub fn set_error(&mut self, error: PlaybackError, message: impl Into<String>) {
        let message = message.into();
        self.state.error = error;
        self.state.error_message = message.clone();
        self.encode("error_code", &error.code());
        self.encode("error_message", &message);
    }

    pub fn set_only_wifi_network(&mut self, only_wifi_network: bool) {
        self.state.only_wifi_network = only_wifi_network;
        self.encode("only_wifi_network", &only_wifi_network);
    }

    /// Runtime-only transition; any non-error state clears a prior error.
    pub fn set_playback_state(&mut self, playback_state: PlaybackState) {
        self.playback_state = playback_state;
        if playback_state != PlaybackState::Error && self.state.error != PlaybackError::NoError {
            self.set_error(PlaybackError::NoError, "");
        }
    }

    pub fn set_stalled(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    pub fn set_buffering_percent(&mut self, percent: u8) {
        self.buffering_percent = percent;
    }

    /// Discards everything recorded under this instance id.
    pub fn reset(&mut self) {
        if let Err(e) = self.store.remove_prefix(&self.prefix) {
            error!("StateRecorder: failed to reset '{}': {}", self.prefix, e);
        }
        self.state = PersistedState::default();
        self.playback_state = PlaybackState::None;
        self.stalled = false;
        self.buffering_percent = 0;
    }
}
