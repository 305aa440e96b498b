//! Outstanding commands and their completion state machine.
//!
//! A [`CmdVar`] tracks one command sent to an actor: its text, target,
//! optional timeout, and the callbacks to run as replies arrive. Submission
//! is non-blocking; the command enters `Running` immediately and completion
//! is observed via callbacks, never by waiting.
//!
//! State machine: `Ready -> Running -> {Done, Failed, Cancelled}`. A command
//! leaves `Running` exactly once, and exactly one terminal callback set
//! fires, ever. After the terminal transition the dispatcher drops the
//! command from its registry, so the id becomes reusable and late replies
//! are ignored as stale.
//!
//! Abort is advisory: the actor is not guaranteed to honor the cancel text,
//! so an aborted command stays `Running` (and keeps matching replies) until
//! a terminal reply or a timeout confirms the outcome. A failure or timeout
//! after an abort request lands in `Cancelled`; a success reply lands in
//! `Done`, because the command really did finish.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::reply::MsgCode;

// =============================================================================
// States and call types
// =============================================================================

/// Lifecycle state of a tracked command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmdState {
    /// Built but not yet submitted.
    Ready,
    /// Submitted; replies are being matched.
    Running,
    /// Terminal success.
    Done,
    /// Terminal failure (error reply or timeout).
    Failed,
    /// Terminal: abort requested and confirmed by a failure or timeout.
    Cancelled,
}

impl CmdState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CmdState::Done | CmdState::Failed | CmdState::Cancelled)
    }

    pub fn did_fail(self) -> bool {
        matches!(self, CmdState::Failed | CmdState::Cancelled)
    }
}

/// Which replies a callback wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    /// `i`/`>` replies while running.
    Info,
    /// `w` replies while running.
    Warning,
    /// Terminal success.
    Done,
    /// Terminal failure, cancellation, or timeout.
    Fail,
    /// Any terminal transition.
    All,
}

/// What a command callback is handed.
#[derive(Debug, Clone)]
pub struct CmdNotice {
    /// State after this event.
    pub state: CmdState,
    /// The reply code that caused it; `None` for synthetic events (timeout).
    pub code: Option<MsgCode>,
    /// Human-readable cause or the reply's keyword text.
    pub detail: String,
}

/// Command callback; errors are logged, never propagated into dispatch.
pub type CmdCallback = Box<dyn FnMut(&CmdNotice) -> anyhow::Result<()> + Send>;

struct CallbackEntry {
    types: Vec<CallType>,
    callback: CmdCallback,
}

// =============================================================================
// CmdVar
// =============================================================================

struct CmdVarInner {
    state: CmdState,
    commander: String,
    cmd_id: Option<u32>,
    abort_requested: bool,
    start_time: Option<DateTime<Utc>>,
    deadline: Option<Instant>,
    callbacks: Vec<CallbackEntry>,
}

struct CmdVarShared {
    actor: String,
    cmd_text: String,
    timeout: Option<Duration>,
    abort_text: Option<String>,
    inner: Mutex<CmdVarInner>,
}

/// Shared handle to one outstanding command. Cloning shares state, so the
/// submitter can keep a handle while the dispatcher owns the registry entry.
#[derive(Clone)]
pub struct CmdVar {
    shared: Arc<CmdVarShared>,
}

impl std::fmt::Debug for CmdVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("CmdVar")
            .field("actor", &self.shared.actor)
            .field("cmd_text", &self.shared.cmd_text)
            .field("cmd_id", &inner.cmd_id)
            .field("state", &inner.state)
            .field("abort_requested", &inner.abort_requested)
            .finish()
    }
}

impl CmdVar {
    /// Build a command for `actor`. Submit it with
    /// [`crate::dispatcher::Dispatcher::send_cmd`].
    pub fn new(actor: impl Into<String>, cmd_text: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(CmdVarShared {
                actor: actor.into(),
                cmd_text: cmd_text.into(),
                timeout: None,
                abort_text: None,
                inner: Mutex::new(CmdVarInner {
                    state: CmdState::Ready,
                    commander: String::new(),
                    cmd_id: None,
                    abort_requested: false,
                    start_time: None,
                    deadline: None,
                    callbacks: Vec::new(),
                }),
            }),
        }
    }

    /// Fail the command with a synthetic error if no terminal reply arrives
    /// within `timeout`.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.rebuild(Some(timeout), None)
    }

    /// Text to send to the actor when an abort is requested (best effort).
    pub fn with_abort_text(self, abort_text: impl Into<String>) -> Self {
        self.rebuild(None, Some(abort_text.into()))
    }

    fn rebuild(self, timeout: Option<Duration>, abort_text: Option<String>) -> Self {
        // Builder runs before submission; the inner state is still Ready.
        let inner = {
            let mut g = self.lock();
            CmdVarInner {
                state: g.state,
                commander: std::mem::take(&mut g.commander),
                cmd_id: g.cmd_id,
                abort_requested: g.abort_requested,
                start_time: g.start_time,
                deadline: g.deadline,
                callbacks: std::mem::take(&mut g.callbacks),
            }
        };
        Self {
            shared: Arc::new(CmdVarShared {
                actor: self.shared.actor.clone(),
                cmd_text: self.shared.cmd_text.clone(),
                timeout: timeout.or(self.shared.timeout),
                abort_text: abort_text.or_else(|| self.shared.abort_text.clone()),
                inner: Mutex::new(inner),
            }),
        }
    }

    /// Register a callback for the given call types. A callback matching
    /// several of an event's types still fires once per event.
    pub fn add_callback<F>(&self, types: &[CallType], callback: F)
    where
        F: FnMut(&CmdNotice) -> anyhow::Result<()> + Send + 'static,
    {
        self.lock().callbacks.push(CallbackEntry {
            types: types.to_vec(),
            callback: Box::new(callback),
        });
    }

    /// Shorthand for a callback on any terminal transition.
    pub fn on_finish<F>(&self, callback: F)
    where
        F: FnMut(&CmdNotice) -> anyhow::Result<()> + Send + 'static,
    {
        self.add_callback(&[CallType::All], callback);
    }

    pub fn actor(&self) -> &str {
        &self.shared.actor
    }

    pub fn cmd_text(&self) -> &str {
        &self.shared.cmd_text
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.shared.timeout
    }

    /// Assigned on submission.
    pub fn cmd_id(&self) -> Option<u32> {
        self.lock().cmd_id
    }

    /// The identity the command was submitted under; empty until submission.
    pub fn commander(&self) -> String {
        self.lock().commander.clone()
    }

    pub fn state(&self) -> CmdState {
        self.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn did_fail(&self) -> bool {
        self.state().did_fail()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.lock().start_time
    }

    fn lock(&self) -> MutexGuard<'_, CmdVarInner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------------------------------------------------------
    // Dispatcher-side transitions
    // -------------------------------------------------------------------------

    /// Enter `Running`. Called once, by the dispatcher, on submission.
    pub(crate) fn start(&self, commander: &str, cmd_id: u32, now: Instant) {
        let mut g = self.lock();
        g.state = CmdState::Running;
        g.commander = commander.to_string();
        g.cmd_id = Some(cmd_id);
        g.start_time = Some(Utc::now());
        g.deadline = self.shared.timeout.map(|t| now + t);
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.lock().deadline
    }

    /// Record an abort request; returns the cancel text to send, if any.
    /// The command stays `Running` until a terminal reply or timeout.
    pub(crate) fn request_abort(&self) -> Option<String> {
        self.lock().abort_requested = true;
        self.shared.abort_text.clone()
    }

    /// Apply one reply's message code. Returns `true` when the command
    /// reached a terminal state and should leave the active registry.
    pub(crate) fn deliver(&self, code: MsgCode, detail: &str) -> bool {
        let (notice, triggered) = {
            let mut g = self.lock();
            if g.state != CmdState::Running {
                return g.state.is_terminal();
            }

            let triggered: &[CallType] = if code.is_terminal() {
                g.state = if code.is_success() {
                    CmdState::Done
                } else if g.abort_requested {
                    CmdState::Cancelled
                } else {
                    CmdState::Failed
                };
                if code.is_success() {
                    &[CallType::Done, CallType::All]
                } else {
                    &[CallType::Fail, CallType::All]
                }
            } else {
                match code {
                    MsgCode::Warning => &[CallType::Warning],
                    _ => &[CallType::Info],
                }
            };
            (
                CmdNotice {
                    state: g.state,
                    code: Some(code),
                    detail: detail.to_string(),
                },
                triggered,
            )
        };

        self.fire(triggered, &notice);
        notice.state.is_terminal()
    }

    /// Synthetic failure when the deadline passed with no terminal reply.
    pub(crate) fn force_timeout(&self) {
        let timeout_secs = self
            .shared
            .timeout
            .map_or(0.0, |t| t.as_secs_f64());
        let notice = {
            let mut g = self.lock();
            if g.state != CmdState::Running {
                return;
            }
            g.state = if g.abort_requested {
                CmdState::Cancelled
            } else {
                CmdState::Failed
            };
            CmdNotice {
                state: g.state,
                code: None,
                detail: DispatchError::CommandTimeout(timeout_secs).to_string(),
            }
        };
        self.fire(&[CallType::Fail, CallType::All], &notice);
    }

    /// Run every callback subscribed to one of `triggered`, in registration
    /// order, at most once each, outside the lock.
    fn fire(&self, triggered: &[CallType], notice: &CmdNotice) {
        let mut taken = std::mem::take(&mut self.lock().callbacks);
        for entry in &mut taken {
            if entry.types.iter().any(|t| triggered.contains(t)) {
                if let Err(err) = (entry.callback)(notice) {
                    warn!(
                        "command callback for {} {:?} failed: {err:#}",
                        self.shared.actor, self.shared.cmd_text
                    );
                }
            }
        }
        let mut g = self.lock();
        let added = std::mem::take(&mut g.callbacks);
        g.callbacks = taken;
        g.callbacks.extend(added);
    }
}

// =============================================================================
// Tests
// =============================================================================
