use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    api::api_types::{ChatMessage, MessageRef},
    engagement::keep_alive::KeepAlive,
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EngagementMode {
    #[default]
    Idle,
    /// waiting on the engagement decision
    Pending,
    /// a reply is being streamed
    Streaming,
}

/// What an interrupted generation needs to be continued later.
#[derive(Clone, Debug, PartialEq)]
pub struct ResumeSnapshot {
    pub history: Vec<ChatMessage>,
    pub context: String,
}

/// Mutable per-user state.  Only ever touched with the user's lock held.
#[derive(Default)]
pub(crate) struct EngagementState {
    pub mode: EngagementMode,

    /// Bumped whenever a message starts or interrupts a cycle.  A task
    /// whose generation is stale must not touch the state any more.
    pub generation: u64,

    pub keep_alive: Option<KeepAlive>,
    pub cancel: Option<CancellationToken>,
    pub active_response: Option<MessageRef>,
    pub last_response: Option<MessageRef>,
    pub saved: Option<ResumeSnapshot>,
}

/// What an interruption left behind for the caller to clean up.
pub(crate) struct Interrupted {
    pub was: EngagementMode,
    pub response: Option<MessageRef>,
}

impl EngagementState {
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.mode != EngagementMode::Idle
    }

    /// Idle -> Pending.  Returns the generation of the new cycle.
    pub fn begin_pending(&mut self, keep_alive: KeepAlive, cancel: CancellationToken) -> u64 {
        self.generation += 1;
        self.mode = EngagementMode::Pending;
        self.keep_alive = Some(keep_alive);
        self.cancel = Some(cancel);
        self.active_response = None;
        self.generation
    }

    /// Pending/Streaming -> Idle because a newer message arrived.
    /// The saved snapshot is left alone so the reply can be continued.
    pub fn interrupt(&mut self) -> Interrupted {
        let was = self.mode;
        self.generation += 1;
        self.mode = EngagementMode::Idle;
        self.keep_alive = None;
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        Interrupted {
            was,
            response: self.active_response.take(),
        }
    }

    /// Pending -> Streaming.
    pub fn begin_streaming(&mut self, generation: u64) -> Option<CancellationToken> {
        if !self.is_current(generation) {
            return None;
        }
        self.mode = EngagementMode::Streaming;
        self.cancel.clone()
    }

    /// Any terminal transition back to Idle.  Returns false if the
    /// cycle had already been superseded.
    pub fn finish(&mut self, generation: u64, clear_saved: bool) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.mode = EngagementMode::Idle;
        self.keep_alive = None;
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.active_response = None;
        if clear_saved {
            self.saved = None;
        }
        true
    }
}

/// Engagement state of one user.
#[derive(Default)]
pub struct UserEngagement {
    state: Mutex<EngagementState>,
}

impl UserEngagement {
    pub fn mode(&self) -> EngagementMode {
        self.state.lock().mode
    }

    pub fn saved_snapshot(&self) -> Option<ResumeSnapshot> {
        self.state.lock().saved.clone()
    }

    pub fn active_response(&self) -> Option<MessageRef> {
        self.state.lock().active_response
    }

    pub fn last_response(&self) -> Option<MessageRef> {
        self.state.lock().last_response
    }

    pub fn is_typing(&self) -> bool {
        self.state
            .lock()
            .keep_alive
            .as_ref()
            .is_some_and(|keep_alive| keep_alive.is_running())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EngagementState> {
        self.state.lock()
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.state.lock().is_current(generation)
    }
}

/// Lets a streaming completion announce the message it is writing to,
/// so that a newer message can delete it mid-stream.
#[derive(Clone)]
pub struct ResponseHandle {
    user: Arc<UserEngagement>,
    generation: u64,
    orphan: Arc<Mutex<Option<MessageRef>>>,
}

impl ResponseHandle {
    pub(crate) fn new(user: Arc<UserEngagement>, generation: u64) -> Self {
        Self {
            user,
            generation,
            orphan: Arc::new(Mutex::new(None)),
        }
    }

    /// Records the message being streamed.  Returns false if the
    /// generation has already been interrupted; the caller should stop,
    /// and the message will be deleted when the stream returns.
    pub fn bind(&self, message: MessageRef) -> bool {
        let mut state = self.user.lock();
        if state.is_current(self.generation) && state.mode == EngagementMode::Streaming {
            state.active_response = Some(message);
            true
        } else {
            *self.orphan.lock() = Some(message);
            false
        }
    }

    pub fn is_current(&self) -> bool {
        self.user.is_current(self.generation)
    }

    /// A message bound after its generation was interrupted.
    pub(crate) fn take_orphan(&self) -> Option<MessageRef> {
        self.orphan.lock().take()
    }
}
