//! Radio-station playback: an unbounded queue sourced on demand from a
//! provider callback instead of a fixed list.
//!
//! Fetches run off the coordinator thread. Only one fetch is live at a time:
//! a newer skip bumps the fetch generation, and a result arriving under a
//! superseded generation is discarded without touching playback.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::{Receiver, Sender};

use crate::playback::PlaybackController;
use crate::protocol::{
    now_ms, ControlMessage, Message, PlaybackError, RadioMessage, SleepTimerAction, TimerMessage,
};
use crate::state::SleepTimerRecord;
use crate::track::TrackDescriptor;

/// Identity and caller-owned context of the tuned station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationContext {
    pub station_id: String,
    pub name: String,
    #[serde(default)]
    pub extension: Option<serde_json::Value>,
}

/// Source of the station's tracks. `Ok(None)` means the station has nothing
/// further to play; playback stops rather than erroring.
pub trait RadioProvider: Send + Sync {
    fn next_track(&self, station: &StationContext) -> crate::Result<Option<TrackDescriptor>>;
}

pub struct RadioCoordinator {
    controller: PlaybackController,
    provider: Arc<dyn RadioProvider>,
    station: StationContext,
    bus_consumer: Receiver<Message>,
    bus_producer: Sender<Message>,
    fetch_generation: u64,
    sleep_generation: u64,
}

impl RadioCoordinator {
    pub fn new(
        controller: PlaybackController,
        provider: Arc<dyn RadioProvider>,
        station: StationContext,
        bus_consumer: Receiver<Message>,
        bus_producer: Sender<Message>,
    ) -> Self {
        Self {
            controller,
            provider,
            station,
            bus_consumer,
            bus_producer,
            fetch_generation: 0,
            sleep_generation: 0,
        }
    }

    pub fn controller(&self) -> &PlaybackController {
        &self.controller
    }

    pub fn run(&mut self) {
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(Message::Control(ControlMessage::Shutdown)) => {
                    debug!("RadioCoordinator: shutting down");
                    // Retire any in-flight fetch along with the engine.
                    self.fetch_generation += 1;
                    self.controller.stop();
                    break;
                }
                Ok(message) => self.handle_message(message),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("RadioCoordinator: bus lagged, skipped {} messages", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    pub(crate) fn handle_message(&mut self, message: Message) {
        match message {
            Message::Control(control) => self.handle_control(control),
            Message::Radio(RadioMessage::Fetched {
                track,
                failed,
                generation,
            }) => self.on_fetched(track, failed, generation),
            Message::Engine(engine) => {
                if self.controller.handle_engine_message(&engine) {
                    self.skip_to_next();
                }
            }
            Message::Timer(timer) => self.handle_timer(timer),
            Message::Queue(_) | Message::Notify(_) => {}
        }
    }

    fn handle_control(&mut self, control: ControlMessage) {
        match control {
            ControlMessage::Play => self.controller.play(),
            ControlMessage::Pause => self.controller.pause(),
            ControlMessage::Stop => {
                // An explicit stop also cancels whatever fetch is in flight.
                self.fetch_generation += 1;
                self.controller.stop();
            }
            ControlMessage::PlayOrPause => self.controller.play_or_pause(),
            ControlMessage::SeekTo(progress_ms) => self.controller.seek_to(progress_ms),
            ControlMessage::FastForward => self.controller.fast_forward(),
            ControlMessage::Rewind => self.controller.rewind(),
            ControlMessage::SkipToNext => self.skip_to_next(),
            ControlMessage::Quiet => self.controller.quiet(),
            ControlMessage::DismissQuiet => self.controller.dismiss_quiet(),
            ControlMessage::StartSleepTimer {
                duration_ms,
                action,
            } => self.start_sleep_timer(duration_ms, action),
            ControlMessage::CancelSleepTimer => self.cancel_sleep_timer(),
            ControlMessage::SkipToPrevious => {
                debug!("RadioCoordinator: a radio station has no previous track");
            }
            ControlMessage::PlayOrPauseAt(_)
            | ControlMessage::SetPlayMode(_)
            | ControlMessage::SetNextPlay(_) => {
                debug!("RadioCoordinator: queue command ignored in radio mode");
            }
            ControlMessage::Shutdown => {}
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

    /// Tunes a new station and immediately fetches its first track.
    pub fn set_station(&mut self, station: StationContext) {
        self.station = station;
        self.skip_to_next();
    }

    pub fn station(&self) -> &StationContext {
        &self.station
    }

    /// Requests the next track from the provider, superseding any fetch that
    /// has not resolved yet.
    pub(crate) fn skip_to_next(&mut self) {
        self.fetch_generation += 1;
        let generation = self.fetch_generation;
        let provider = self.provider.clone();
        let station = self.station.clone();
        let bus = self.bus_producer.clone();

        thread::spawn(move || {
            let message = match provider.next_track(&station) {
                Ok(track) => RadioMessage::Fetched {
                    track,
                    failed: false,
                    generation,
                },
                Err(e) => {
                    error!("RadioCoordinator: next-track fetch failed: {}", e);
                    RadioMessage::Fetched {
                        track: None,
                        failed: true,
                        generation,
                    }
                }
            };
            let _ = bus.send(Message::Radio(message));
        });
    }

    fn on_fetched(&mut self, track: Option<TrackDescriptor>, failed: bool, generation: u64) {
        if generation != self.fetch_generation {
            debug!("RadioCoordinator: discarding superseded fetch result");
            return;
        }

        if failed {
            self.controller.playback_error(PlaybackError::UnknownError);
            return;
        }

        match track {
            Some(track) => self.controller.set_current_track(Some(track), true),
            None => {
                debug!("RadioCoordinator: station yielded no track, stopping");
                self.controller.set_current_track(None, false);
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
            let _ = bus.send(Message::Timer(TimerMessage::SleepTimerElapsed { generation }));
        });
    }

    fn cancel_sleep_timer(&mut self) {
        self.sleep_generation += 1;
        self.controller.recorder_mut().set_sleep_timer(None);
    }
}
