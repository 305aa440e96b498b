//! Message-passing wrapper around the dispatcher.
//!
//! The core [`Dispatcher`] is synchronous and single-owner. This module
//! gives it the actor treatment: one async task owns the dispatcher and
//! processes requests from an `mpsc` channel, so every reply line, timer
//! sweep, and submission is serialized through a single worker. That is the
//! whole concurrency story — no lock is held across a dispatch step, and
//! observers keep their last-update-wins guarantee even with many producers.
//!
//! Timeout sweeps run on an interval on the same task, between requests;
//! a timer can never preempt a line mid-dispatch.

use std::time::{Duration, Instant};

use log::info;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::cmdvar::CmdVar;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, Result};
use crate::keyvar::KeyVar;

/// How often the actor sweeps for expired command deadlines.
const TIMEOUT_SWEEP: Duration = Duration::from_millis(100);

/// Requests the actor processes, in arrival order.
#[derive(Debug)]
pub enum DispatchRequest {
    /// One raw reply line.
    Line(String),
    /// A batch of reply lines, processed back to back.
    Lines(Vec<String>),
    /// Submit a command; the assigned id comes back on the channel.
    StartCmd {
        cmd: CmdVar,
        response: oneshot::Sender<Result<u32>>,
    },
    /// Request cancellation of an outstanding command.
    AbortCmd {
        cmd_id: u32,
        response: oneshot::Sender<Result<()>>,
    },
    /// Connection state change (drives refresh / staleness).
    SetConnected(bool),
    /// Look up a registered key variable handle.
    GetKeyVar {
        actor: String,
        keyword: String,
        response: oneshot::Sender<Option<KeyVar>>,
    },
    /// Stop the actor.
    Shutdown,
}

/// The task-side half: owns the dispatcher and runs the event loop.
pub struct DispatcherActor {
    dispatcher: Dispatcher,
}

impl DispatcherActor {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Run until `Shutdown` arrives or every handle is dropped.
    pub async fn run(mut self, mut request_rx: mpsc::Receiver<DispatchRequest>) {
        info!("dispatcher actor started for {}", self.dispatcher.commander());
        let mut sweep = interval(TIMEOUT_SWEEP);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = request_rx.recv() => {
                    match request {
                        Some(request) => {
                            if self.handle(request) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    self.dispatcher.check_timeouts(Instant::now());
                }
            }
        }
        info!("dispatcher actor stopped for {}", self.dispatcher.commander());
    }

    /// Process one request; returns `true` on shutdown.
    fn handle(&mut self, request: DispatchRequest) -> bool {
        match request {
            DispatchRequest::Line(line) => {
                self.dispatcher.process_line(&line);
            }
            DispatchRequest::Lines(lines) => {
                for line in &lines {
                    self.dispatcher.process_line(line);
                }
            }
            DispatchRequest::StartCmd { cmd, response } => {
                let _ = response.send(self.dispatcher.send_cmd(&cmd));
            }
            DispatchRequest::AbortCmd { cmd_id, response } => {
                let _ = response.send(self.dispatcher.abort_cmd(cmd_id));
            }
            DispatchRequest::SetConnected(connected) => {
                self.dispatcher.set_connected(connected);
            }
            DispatchRequest::GetKeyVar {
                actor,
                keyword,
                response,
            } => {
                let _ = response.send(self.dispatcher.keyvar(&actor, &keyword));
            }
            DispatchRequest::Shutdown => return true,
        }
        false
    }
}

/// Cheap, cloneable client side of the actor.
#[derive(Clone, Debug)]
pub struct DispatcherHandle {
    request_tx: mpsc::Sender<DispatchRequest>,
}

impl DispatcherHandle {
    async fn request(&self, request: DispatchRequest) -> Result<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| DispatchError::ActorGone)
    }

    /// Push one reply line.
    pub async fn process_line(&self, line: impl Into<String>) -> Result<()> {
        self.request(DispatchRequest::Line(line.into())).await
    }

    /// Push a batch of reply lines, dispatched back to back.
    pub async fn process_lines(&self, lines: Vec<String>) -> Result<()> {
        self.request(DispatchRequest::Lines(lines)).await
    }

    /// Submit a command; resolves to its assigned id. Completion still
    /// arrives through the command's callbacks, never by waiting here.
    pub async fn start_cmd(&self, cmd: CmdVar) -> Result<u32> {
        let (response, rx) = oneshot::channel();
        self.request(DispatchRequest::StartCmd { cmd, response })
            .await?;
        rx.await.map_err(|_| DispatchError::ActorGone)?
    }

    /// Request cancellation; advisory, confirmed later via callbacks.
    pub async fn abort_cmd(&self, cmd_id: u32) -> Result<()> {
        let (response, rx) = oneshot::channel();
        self.request(DispatchRequest::AbortCmd { cmd_id, response })
            .await?;
        rx.await.map_err(|_| DispatchError::ActorGone)?
    }

    pub async fn set_connected(&self, connected: bool) -> Result<()> {
        self.request(DispatchRequest::SetConnected(connected)).await
    }

    /// Look up a registered key variable handle.
    pub async fn keyvar(&self, actor: &str, keyword: &str) -> Result<Option<KeyVar>> {
        let (response, rx) = oneshot::channel();
        self.request(DispatchRequest::GetKeyVar {
            actor: actor.to_string(),
            keyword: keyword.to_string(),
            response,
        })
        .await?;
        rx.await.map_err(|_| DispatchError::ActorGone)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(DispatchRequest::Shutdown).await
    }
}

/// Spawn the actor task for a fully constructed dispatcher.
pub fn spawn(dispatcher: Dispatcher) -> (DispatcherHandle, JoinHandle<()>) {
    let (request_tx, request_rx) = mpsc::channel(64);
    let actor = DispatcherActor::new(dispatcher);
    let join = tokio::spawn(actor.run(request_rx));
    (DispatcherHandle { request_tx }, join)
}

// =============================================================================
// Tests
// =============================================================================
