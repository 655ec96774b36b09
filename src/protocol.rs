//! Event-bus protocol shared by all engine components.
//!
//! This module defines all message payloads exchanged between the playback
//! controller, queue coordination, durable stores, and listener fan-out.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::queue::Queue;
use crate::track::TrackDescriptor;

/// Track traversal strategy applied when navigating beyond the current track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum PlayMode {
    Sequential, // Advance through the queue in order, wrapping at the end
    Loop,       // Repeat the current track
    Shuffle,    // Pick a random track different from the current one
}

impl PlayMode {
    /// Stable id used for persistence.
    pub fn serial_id(self) -> i64 {
        match self {
            PlayMode::Sequential => 0,
            PlayMode::Loop => 1,
            PlayMode::Shuffle => 2,
        }
    }

    /// Decodes a persisted id, falling back to [`PlayMode::Sequential`].
    pub fn from_serial_id(id: i64) -> Self {
        match id {
            1 => PlayMode::Loop,
            2 => PlayMode::Shuffle,
            _ => PlayMode::Sequential,
        }
    }
}

/// Lifecycle position of the currently loaded track.
///
/// Stalled (buffering underrun) is carried separately as an overlay flag on
/// top of [`PlaybackState::Prepared`] and [`PlaybackState::Playing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum PlaybackState {
    None,
    Preparing,
    Prepared,
    Playing,
    Paused,
    Stopped,
    Error,
}

/// Playback failure taxonomy carried in persisted state and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum PlaybackError {
    NoError,
    OnlyWifiNetwork,
    PlayerError,
    NetworkError,
    DataLoadFailed,
    UnknownError,
}

impl PlaybackError {
    /// Stable code used for persistence.
    pub fn code(self) -> i64 {
        match self {
            PlaybackError::NoError => 0,
            PlaybackError::OnlyWifiNetwork => 1,
            PlaybackError::PlayerError => 2,
            PlaybackError::NetworkError => 3,
            PlaybackError::DataLoadFailed => 4,
            PlaybackError::UnknownError => 5,
        }
    }

    /// Decodes a persisted code, falling back to [`PlaybackError::UnknownError`]
    /// for codes written by a newer version.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => PlaybackError::NoError,
            1 => PlaybackError::OnlyWifiNetwork,
            2 => PlaybackError::PlayerError,
            3 => PlaybackError::NetworkError,
            4 => PlaybackError::DataLoadFailed,
            _ => PlaybackError::UnknownError,
        }
    }

    /// User-presentable message for this error.
    pub fn message(self) -> &'static str {
        match self {
            PlaybackError::NoError => "no error",
            PlaybackError::OnlyWifiNetwork => "playback rejected: wifi-only network policy",
            PlaybackError::PlayerError => "media engine error",
            PlaybackError::NetworkError => "network error",
            PlaybackError::DataLoadFailed => "failed to load track data",
            PlaybackError::UnknownError => "unknown error",
        }
    }

    /// Whether a caller retry (a fresh `set_current_track`) is worth attempting.
    /// The wifi-only policy rejection is not retryable until the policy or the
    /// network changes.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            PlaybackError::PlayerError
                | PlaybackError::NetworkError
                | PlaybackError::DataLoadFailed
                | PlaybackError::UnknownError
        )
    }
}

/// What the sleep timer does when it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum SleepTimerAction {
    Pause,
    Stop,
}

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Control(ControlMessage),
    Queue(QueueMessage),
    Engine(EngineMessage),
    Radio(RadioMessage),
    Timer(TimerMessage),
    Notify(PlayerEvent),
}

/// Commands accepted by the coordinator run loop.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    Play,
    Pause,
    Stop,
    PlayOrPause,
    /// Toggle when `position` is the current one, otherwise switch to it
    /// with autoplay.
    PlayOrPauseAt(usize),
    SeekTo(u64),
    FastForward,
    Rewind,
    SkipToNext,
    SkipToPrevious,
    SetPlayMode(PlayMode),
    /// Insert-or-move the track into the slot right after the current position.
    SetNextPlay(TrackDescriptor),
    Quiet,
    DismissQuiet,
    StartSleepTimer {
        duration_ms: u64,
        action: SleepTimerAction,
    },
    CancelSleepTimer,
    Shutdown,
}

/// Structural queue traffic: store mutation events and snapshot arrivals.
///
/// Mutation positions are expressed in pre-mutation coordinates; `Snapshot`
/// carries the reload generation so stale loads can be discarded.
#[derive(Debug, Clone)]
pub enum QueueMessage {
    Replaced { position: usize, autoplay: bool },
    Inserted { position: usize, count: usize },
    Moved { from: usize, to: usize },
    Removed { positions: Vec<usize> },
    Snapshot { queue: Queue, generation: u64 },
}

/// Callbacks from the media engine, tagged with the generation of the engine
/// instance that produced them. Events from a released generation are noise.
#[derive(Debug, Clone)]
pub enum EngineMessage {
    Prepared {
        generation: u64,
        audio_session_id: i32,
    },
    Completed {
        generation: u64,
    },
    SeekComplete {
        generation: u64,
        position_ms: u64,
    },
    Stalled {
        generation: u64,
        stalled: bool,
    },
    BufferingUpdate {
        generation: u64,
        percent: u8,
    },
    Error {
        generation: u64,
        code: i32,
    },
}

/// Completion of an asynchronous radio provider fetch.
#[derive(Debug, Clone)]
pub enum RadioMessage {
    Fetched {
        track: Option<TrackDescriptor>,
        failed: bool,
        generation: u64,
    },
}

/// Ticks from background timer threads.
#[derive(Debug, Clone)]
pub enum TimerMessage {
    VolumeTick { generation: u64, step: u32 },
    SleepTimerElapsed { generation: u64 },
}

/// Outward notifications fanned out to registered listeners.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    PlaybackStateChanged(PlaybackState),
    StalledChanged(bool),
    BufferingUpdated(u8),
    PlayingTrackChanged(Option<TrackDescriptor>),
    PositionChanged(Option<usize>),
    PlayModeChanged(PlayMode),
    /// The queue structure changed; `position` is the playing position against
    /// the new structure (None when the queue emptied).
    QueueChanged {
        position: Option<usize>,
    },
    SeekComplete {
        progress_ms: u64,
        update_time_ms: u64,
    },
    AudioSessionChanged(i32),
    PlaybackErrorOccurred {
        error: PlaybackError,
        message: String,
    },
}

/// Milliseconds since the unix epoch, used for progress update timestamps.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
