//! Per-client volume-state machine.
//!
//! ```text
//!   Normal ──► WrongMedia ──┐
//!     │  ╲                  ▼
//!     │   ──► MediaError ─► Fatal
//!     └────────────────────►
//! ```
//!
//! `Fatal` is a sink. Commands already in flight when a client leaves
//! `Normal` stay where they are; nothing further is dispatched for the
//! client until it is recreated.

use core::fmt;

/// Health of the storage behind a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VolumeState {
    #[default]
    Normal,
    WrongMedia,
    MediaError,
    Fatal,
}

impl VolumeState {
    /// Whether the machine may move from `self` to `next`.
    pub fn can_enter(self, next: VolumeState) -> bool {
        match (self, next) {
            (from, to) if from == to => false,
            (VolumeState::Normal, _) => true,
            (VolumeState::WrongMedia | VolumeState::MediaError, VolumeState::Fatal) => true,
            _ => false,
        }
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeState::Normal => write!(f, "normal"),
            VolumeState::WrongMedia => write!(f, "wrong media"),
            VolumeState::MediaError => write!(f, "media error"),
            VolumeState::Fatal => write!(f, "fatal"),
        }
    }
}

/// Called with (old, new) on every state change.
pub type StateChangeCallback = std::sync::Arc<dyn Fn(VolumeState, VolumeState) + Send + Sync>;

/// Volume-state tracker with transition rules enforced.
#[derive(Debug, Default)]
pub struct VolumeFsm {
    state: VolumeState,
    transitions: u64,
}

impl VolumeFsm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> VolumeState {
        self.state
    }

    /// Number of transitions taken so far.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Moves to `next` if allowed, returning the previous state.
    pub fn enter(&mut self, next: VolumeState) -> Option<VolumeState> {
        if !self.state.can_enter(next) {
            return None;
        }

        let old = self.state;
        self.state = next;
        self.transitions += 1;
        Some(old)
    }
}
