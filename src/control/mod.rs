//! Scene-switching policy: a 50ms tick loop that decides which source
//! should be active and drives the splicer and the published scene
//! name accordingly.

pub mod api;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::source::{FIFOInput, SourceKind};
use crate::splicer::SegmentCommand;

const TICK_INTERVAL: Duration = Duration::from_millis(50);
const READY_WAIT_TIMEOUT: Duration = Duration::from_secs(2);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

const MODE_FALLBACK: u8 = 0;
const MODE_CAMERA: u8 = 1;
const MODE_DRONE: u8 = 2;

fn mode_to_kind(mode: u8) -> SourceKind {
    match mode {
        MODE_CAMERA => SourceKind::Camera,
        MODE_DRONE => SourceKind::Drone,
        _ => SourceKind::Fallback,
    }
}

fn kind_to_mode(kind: SourceKind) -> u8 {
    match kind {
        SourceKind::Camera => MODE_CAMERA,
        SourceKind::Drone => MODE_DRONE,
        SourceKind::Fallback => MODE_FALLBACK,
    }
}

/// Shared, lock-free control-plane state read and written by
/// [`SwitchController`]'s tick loop and by [`api`]'s HTTP handlers —
/// the only mutable state shared across those two subsystems.
#[derive(Debug, Default)]
pub struct ControlState {
    requested: AtomicU8,
    privacy: AtomicBool,
    scene: AtomicU8,
}

impl ControlState {
    /// Builds the default control state: requested source camera,
    /// privacy off, published scene fallback (matching the cold-start
    /// sequence the controller's tick loop actually runs).
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requested: AtomicU8::new(MODE_CAMERA),
            privacy: AtomicBool::new(false),
            scene: AtomicU8::new(MODE_FALLBACK),
        })
    }

    /// The source an operator has asked to go live with (camera or
    /// drone only; fallback is never requested, only fallen back to).
    pub fn requested_source(&self) -> SourceKind {
        mode_to_kind(self.requested.load(Ordering::Acquire))
    }

    /// Records an operator's `/input` request for the next tick to act on.
    pub fn set_requested_source(&self, kind: SourceKind) {
        self.requested.store(kind_to_mode(kind), Ordering::Release);
    }

    /// Whether privacy mode is currently active.
    pub fn privacy_enabled(&self) -> bool {
        self.privacy.load(Ordering::Acquire)
    }

    /// Sets privacy mode, forcing the next tick to fall back if active.
    pub fn set_privacy_enabled(&self, enabled: bool) {
        self.privacy.store(enabled, Ordering::Release);
    }

    /// Currently-published scene name, one of `fallback` / `live-camera`
    /// / `live-drone`.
    pub fn scene(&self) -> &'static str {
        scene_name(mode_to_kind(self.scene.load(Ordering::Acquire)))
    }

    fn publish_scene(&self, kind: SourceKind) {
        self.scene.store(kind_to_mode(kind), Ordering::Release);
    }
}

pub(crate) fn scene_name(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Fallback => "fallback",
        SourceKind::Camera => "live-camera",
        SourceKind::Drone => "live-drone",
    }
}

/// A published scene transition, carrying the privacy flag's value at
/// the moment of the switch so the notifier doesn't need to reach back
/// into [`ControlState`] (and risk reporting a flag value from after a
/// later, unrelated `/privacy` call).
#[derive(Debug, Clone, Copy)]
pub struct SceneChangeEvent {
    /// The newly active source.
    pub source: SourceKind,
    /// Privacy flag value at the moment of this switch.
    pub privacy_enabled: bool,
}

/// Runs the FALLBACK/CAMERA/DRONE transition table described by the
/// control surface, issuing [`SegmentCommand`]s to the splicer and
/// publishing scene changes for [`api`] to notify externally.
pub struct SwitchController {
    camera: Arc<FIFOInput>,
    drone: Arc<FIFOInput>,
    fallback: Arc<FIFOInput>,
    state: Arc<ControlState>,
    commands: Sender<SegmentCommand>,
    scene_changes: Sender<SceneChangeEvent>,
    current_mode: u8,
    fallback_generation: u64,
}

impl SwitchController {
    /// Builds a controller over the three source handles, starting in
    /// fallback mode. Call [`SwitchController::run`] to drive it.
    pub fn new(
        camera: Arc<FIFOInput>,
        drone: Arc<FIFOInput>,
        fallback: Arc<FIFOInput>,
        state: Arc<ControlState>,
        commands: Sender<SegmentCommand>,
        scene_changes: Sender<SceneChangeEvent>,
    ) -> Self {
        Self {
            camera,
            drone,
            fallback,
            state,
            commands,
            scene_changes,
            current_mode: MODE_FALLBACK,
            fallback_generation: 0,
        }
    }

    fn handle(&self, kind: SourceKind) -> &Arc<FIFOInput> {
        match kind {
            SourceKind::Camera => &self.camera,
            SourceKind::Drone => &self.drone,
            SourceKind::Fallback => &self.fallback,
        }
    }

    /// Runs the tick loop until `shutdown` is observed. Begins by
    /// splicing to fallback so the output carries something the moment
    /// the process is healthy.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        self.switch_to(SourceKind::Fallback);
        self.fallback_generation = self.fallback.generation();
        while !shutdown.load(Ordering::Acquire) {
            self.tick();
            std::thread::sleep(TICK_INTERVAL);
        }
    }

    fn tick(&mut self) {
        let privacy = self.state.privacy_enabled();
        let requested = self.state.requested_source();

        match mode_to_kind(self.current_mode) {
            SourceKind::Fallback => {
                // The fallback asset loops; a bumped generation means
                // its producer wrapped (or reconnected) since the last
                // check. Re-splice so the new loop iteration gets its
                // own IDR cut-in and timestamp rebase rather than
                // silently passing the seam through to the output.
                let generation = self.fallback.generation();
                if generation != self.fallback_generation {
                    self.switch_to(SourceKind::Fallback);
                    return;
                }
                if privacy {
                    return;
                }
                if requested == SourceKind::Camera && self.camera.is_ready() {
                    self.switch_to(SourceKind::Camera);
                } else if requested == SourceKind::Drone && self.drone.is_ready() {
                    self.switch_to(SourceKind::Drone);
                }
            }
            SourceKind::Camera => {
                if privacy || !self.camera.is_ready() {
                    self.switch_to(SourceKind::Fallback);
                } else if requested == SourceKind::Drone && self.drone.is_ready() {
                    self.switch_to(SourceKind::Drone);
                }
            }
            SourceKind::Drone => {
                if privacy || !self.drone.is_ready() {
                    self.switch_to(SourceKind::Fallback);
                } else if requested == SourceKind::Camera && self.camera.is_ready() {
                    self.switch_to(SourceKind::Camera);
                }
            }
        }
    }

    /// Resets `kind`'s FIFOInput, waits (bounded) for it to report
    /// ready, and if it does, asks the splicer to begin a new segment
    /// on it and publishes the new scene name. If the wait times out,
    /// the switch is abandoned and re-evaluated on the next tick.
    fn switch_to(&mut self, kind: SourceKind) {
        let handle = self.handle(kind);
        handle.reset();

        let deadline = Instant::now() + READY_WAIT_TIMEOUT;
        while !handle.is_ready() {
            if Instant::now() >= deadline {
                log::warn!("controller: {kind} did not become ready in time, abandoning switch");
                return;
            }
            std::thread::sleep(READY_POLL_INTERVAL);
        }

        if self
            .commands
            .send(SegmentCommand { source: kind })
            .is_err()
        {
            log::error!("controller: splicer command channel closed");
            return;
        }

        self.current_mode = kind_to_mode(kind);
        if kind == SourceKind::Fallback {
            self.fallback_generation = self.fallback.generation();
        }
        self.state.publish_scene(kind);
        let _ = self.scene_changes.send(SceneChangeEvent {
            source: kind,
            privacy_enabled: self.state.privacy_enabled(),
        });
        log::info!("controller: now live on {kind}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_names_match_spec_vocabulary() {
        assert_eq!(scene_name(SourceKind::Fallback), "fallback");
        assert_eq!(scene_name(SourceKind::Camera), "live-camera");
        assert_eq!(scene_name(SourceKind::Drone), "live-drone");
    }

    #[test]
    fn control_state_round_trips() {
        let state = ControlState::new();
        assert_eq!(state.requested_source(), SourceKind::Camera);
        state.set_requested_source(SourceKind::Drone);
        assert_eq!(state.requested_source(), SourceKind::Drone);
        assert!(!state.privacy_enabled());
        state.set_privacy_enabled(true);
        assert!(state.privacy_enabled());
        assert_eq!(state.scene(), "fallback");
    }
}
