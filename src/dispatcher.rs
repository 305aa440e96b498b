//! The dispatcher: demultiplexes reply lines into key variables and
//! outstanding commands.
//!
//! One dispatcher owns two registries: `(actor, keyword) -> KeyVar`,
//! populated by factories at model-construction time and fixed thereafter,
//! and `(commander, cmdID) -> CmdVar`, populated and depopulated as commands
//! are submitted and complete. All mutation happens through `&mut self`, so
//! a single owner (in production, the [`crate::actor`] task) serializes
//! every line, timer sweep, and submission; observers can therefore assume
//! last-update-wins without any locking discipline of their own.
//!
//! Failure policy per line: a bad header drops the line (logged), a bad
//! keyword group affects only that group, an unknown keyword is silently
//! ignored (models never subscribe to an actor's full vocabulary), and a
//! reply matching no active command is an expected completion race, logged
//! at debug level only.
//!
//! Outbound traffic goes through the [`CommandSink`] seam: production wires
//! the hub connection's writer, tests wire an `mpsc` sender and assert on
//! what would have hit the wire.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::cmdvar::CmdVar;
use crate::error::{DispatchError, Result};
use crate::keyvar::KeyVar;
use crate::reply::Reply;

/// How long a batched refresh command may run before it is abandoned.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound line writer. Sending is best-effort: the dispatcher logs a
/// rejected line and keeps the command registered, since the reply path is
/// what decides a command's fate.
pub trait CommandSink: Send {
    fn send_line(&mut self, line: &str) -> Result<()>;
}

impl CommandSink for mpsc::UnboundedSender<String> {
    fn send_line(&mut self, line: &str) -> Result<()> {
        self.send(line.to_string())
            .map_err(|_| DispatchError::SinkClosed(line.to_string()))
    }
}

struct RefreshEntry {
    actor: String,
    cmd_text: String,
    keywords: Vec<String>,
}

/// Demultiplexer for one hub connection.
pub struct Dispatcher {
    commander: String,
    keyvars: HashMap<(String, String), KeyVar>,
    commands: HashMap<(String, u32), CmdVar>,
    refreshers: Vec<RefreshEntry>,
    sink: Option<Box<dyn CommandSink>>,
    connected: bool,
    next_id: u32,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("commander", &self.commander)
            .field("keyvars", &self.keyvars.len())
            .field("active_commands", &self.commands.len())
            .field("connected", &self.connected)
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher for the given commander identity
    /// (conventionally `program.user`).
    pub fn new(commander: impl Into<String>) -> Self {
        Self {
            commander: commander.into(),
            keyvars: HashMap::new(),
            commands: HashMap::new(),
            refreshers: Vec::new(),
            sink: None,
            connected: false,
            next_id: 0,
        }
    }

    /// Wire the outbound line writer.
    pub fn with_sink(mut self, sink: impl CommandSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn set_sink(&mut self, sink: impl CommandSink + 'static) {
        self.sink = Some(Box::new(sink));
    }

    pub fn commander(&self) -> &str {
        &self.commander
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    // -------------------------------------------------------------------------
    // KeyVar registry
    // -------------------------------------------------------------------------

    /// Register a key variable. The registry is fixed for the model's
    /// lifetime, so a duplicate `(actor, keyword)` is a construction bug
    /// and is surfaced as an error.
    pub fn register_keyvar(&mut self, keyvar: &KeyVar) -> Result<()> {
        let key = registry_key(keyvar.actor(), keyvar.keyword());
        if self.keyvars.contains_key(&key) {
            return Err(DispatchError::DuplicateKeyVar {
                actor: keyvar.actor().to_string(),
                keyword: keyvar.keyword().to_string(),
            });
        }
        self.keyvars.insert(key, keyvar.clone());
        Ok(())
    }

    /// Look up a registered key variable. Keyword matching is
    /// case-insensitive, as hub vocabularies are.
    pub fn keyvar(&self, actor: &str, keyword: &str) -> Option<KeyVar> {
        self.keyvars.get(&registry_key(actor, keyword)).cloned()
    }

    // -------------------------------------------------------------------------
    // Line dispatch
    // -------------------------------------------------------------------------

    /// Consume one reply line: parse it, update matching key variables,
    /// and advance the matching command, in that order. Every failure is
    /// contained and logged; the next line is always accepted.
    pub fn process_line(&mut self, line: &str) {
        let reply = match Reply::parse(line) {
            Ok(reply) => reply,
            Err(err) => {
                warn!("dropping reply line: {err}");
                return;
            }
        };

        for bad in &reply.malformed {
            warn!(
                "{}: malformed keyword group {:?} skipped: {}",
                reply.actor, bad.raw, bad.reason
            );
        }

        for group in &reply.keywords {
            let Some(keyvar) = self.keyvars.get(&registry_key(&reply.actor, &group.name)) else {
                // Unknown keywords are expected; models subscribe to a
                // subset of each actor's vocabulary.
                continue;
            };
            if let Err(err) = keyvar.update(&group.fields, true) {
                warn!("{}: {err}", reply.actor);
            }
        }

        if reply.cmd_id == 0 {
            return;
        }
        let key = (reply.commander.clone(), reply.cmd_id);
        match self.commands.get(&key).cloned() {
            Some(cmd) => {
                if cmd.deliver(reply.code, &reply.raw_keywords) {
                    self.commands.remove(&key);
                }
            }
            None => {
                // Normal race: replies can trail a command's completion.
                debug!(
                    "stale reply for {} {} ignored",
                    reply.commander, reply.cmd_id
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Command lifecycle
    // -------------------------------------------------------------------------

    /// Next free command id for this commander (never 0; skips ids still
    /// outstanding).
    pub fn next_cmd_id(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1).max(1);
            let key = (self.commander.clone(), self.next_id);
            if !self.commands.contains_key(&key) {
                return self.next_id;
            }
        }
    }

    /// Submit a command under an automatically assigned id.
    pub fn send_cmd(&mut self, cmd: &CmdVar) -> Result<u32> {
        let cmd_id = self.next_cmd_id();
        self.start_cmd(cmd, cmd_id)?;
        Ok(cmd_id)
    }

    /// Submit a command under a caller-chosen id. Non-blocking: the command
    /// enters `Running`, the line goes to the sink best-effort, and
    /// completion arrives later through the command's callbacks. The id
    /// must not collide with a still-outstanding command; terminal commands
    /// free their id.
    pub fn start_cmd(&mut self, cmd: &CmdVar, cmd_id: u32) -> Result<()> {
        if cmd_id == 0 {
            return Err(DispatchError::ReservedCmdId);
        }
        let key = (self.commander.clone(), cmd_id);
        if self.commands.contains_key(&key) {
            return Err(DispatchError::DuplicateCmdId(cmd_id));
        }

        cmd.start(&self.commander, cmd_id, Instant::now());
        self.write_line(&format!("{cmd_id} {} {}", cmd.actor(), cmd.cmd_text()));
        self.commands.insert(key, cmd.clone());
        Ok(())
    }

    /// Request cancellation of an outstanding command. Advisory: the cancel
    /// text (if the command has one) is sent best-effort, and the command
    /// stays `Running` until a terminal reply or timeout confirms the
    /// outcome.
    pub fn abort_cmd(&mut self, cmd_id: u32) -> Result<()> {
        let key = (self.commander.clone(), cmd_id);
        let cmd = self
            .commands
            .get(&key)
            .ok_or(DispatchError::UnknownCmd(cmd_id))?
            .clone();
        if let Some(abort_text) = cmd.request_abort() {
            let abort_id = self.next_cmd_id();
            self.write_line(&format!("{abort_id} {} {abort_text}", cmd.actor()));
        }
        Ok(())
    }

    /// Fail every command whose deadline has passed. Called by the owning
    /// loop between lines; timers never preempt a line in progress.
    pub fn check_timeouts(&mut self, now: Instant) {
        let expired: Vec<(String, u32)> = self
            .commands
            .iter()
            .filter(|(_, cmd)| cmd.deadline().is_some_and(|d| d <= now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            if let Some(cmd) = self.commands.remove(&key) {
                warn!(
                    "command {} to {} timed out: {:?}",
                    key.1,
                    cmd.actor(),
                    cmd.cmd_text()
                );
                cmd.force_timeout();
            }
        }
    }

    /// Number of commands still outstanding.
    pub fn active_commands(&self) -> usize {
        self.commands.len()
    }

    // -------------------------------------------------------------------------
    // Connection state and refresh coordination
    // -------------------------------------------------------------------------

    /// Record the connection state. Connecting replays every registered
    /// refresh command so late subscribers converge on current state;
    /// disconnecting marks every key variable stale, since the cache can no
    /// longer be trusted.
    pub fn set_connected(&mut self, connected: bool) {
        if connected == self.connected {
            return;
        }
        self.connected = connected;
        if connected {
            info!("{}: connected, refreshing {} actor(s)", self.commander, self.refreshers.len());
            self.refresh_all();
        } else {
            info!("{}: disconnected, cached state is stale", self.commander);
            for keyvar in self.keyvars.values() {
                keyvar.mark_stale();
            }
        }
    }

    /// Register one actor's batched "get status" command, covering the
    /// given keywords. Issued on every connect; issued immediately if
    /// already connected (a model built after the connection came up).
    pub(crate) fn register_refresh(
        &mut self,
        actor: impl Into<String>,
        cmd_text: impl Into<String>,
        keywords: Vec<String>,
    ) {
        let entry = RefreshEntry {
            actor: actor.into(),
            cmd_text: cmd_text.into(),
            keywords,
        };
        if self.connected {
            self.issue_refresh(&entry);
        }
        self.refreshers.push(entry);
    }

    fn refresh_all(&mut self) {
        let entries = std::mem::take(&mut self.refreshers);
        for entry in &entries {
            self.issue_refresh(entry);
        }
        self.refreshers = entries;
    }

    fn issue_refresh(&mut self, entry: &RefreshEntry) {
        debug!(
            "refreshing {} keyword(s) of {}: {:?}",
            entry.keywords.len(),
            entry.actor,
            entry.cmd_text
        );
        let cmd = CmdVar::new(entry.actor.clone(), entry.cmd_text.clone())
            .with_timeout(REFRESH_TIMEOUT);
        if let Err(err) = self.send_cmd(&cmd) {
            warn!("refresh of {} failed to start: {err}", entry.actor);
        }
    }

    fn write_line(&mut self, line: &str) {
        match &mut self.sink {
            Some(sink) => {
                if let Err(err) = sink.send_line(line) {
                    warn!("{err}");
                }
            }
            None => debug!("no sink, dropping outbound line {line:?}"),
        }
    }
}

fn registry_key(actor: &str, keyword: &str) -> (String, String) {
    (actor.to_ascii_lowercase(), keyword.to_ascii_lowercase())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdvar::CmdState;
    use crate::convert::{Arity, Converter, Field};

    fn dispatcher_with_keyvar() -> (Dispatcher, KeyVar) {
        let mut dispatcher = Dispatcher::new("client");
        let kv = KeyVar::new("agile", "setpoint", Arity::Exactly(1), vec![Converter::Float]);
        dispatcher.register_keyvar(&kv).unwrap();
        (dispatcher, kv)
    }

    #[test]
    fn test_line_updates_registered_keyvar() {
        let (mut dispatcher, kv) = dispatcher_with_keyvar();
        dispatcher.process_line("client 0 agile i setpoint=21.5");
        assert_eq!(kv.get(), (vec![Field::Float(21.5)], true));
    }

    #[test]
    fn test_keyword_match_is_case_insensitive() {
        let (mut dispatcher, kv) = dispatcher_with_keyvar();
        dispatcher.process_line("client 0 AGILE i SETPOINT=3.0");
        assert_eq!(kv.get(), (vec![Field::Float(3.0)], true));
    }

    #[test]
    fn test_unknown_keyword_and_bad_line_are_ignored() {
        let (mut dispatcher, kv) = dispatcher_with_keyvar();
        dispatcher.process_line("client 0 agile i mystery=1, 2, 3");
        dispatcher.process_line("complete garbage");
        assert!(!kv.has_value());
    }

    #[test]
    fn test_duplicate_keyvar_rejected() {
        let (mut dispatcher, _kv) = dispatcher_with_keyvar();
        let dup = KeyVar::new("agile", "SetPoint", Arity::Exactly(1), vec![Converter::Str]);
        assert!(matches!(
            dispatcher.register_keyvar(&dup),
            Err(DispatchError::DuplicateKeyVar { .. })
        ));
    }

    #[test]
    fn test_command_done_and_stale_reply() {
        let mut dispatcher = Dispatcher::new("client");
        let cmd = CmdVar::new("agile", "home");
        dispatcher.start_cmd(&cmd, 5).unwrap();
        assert_eq!(cmd.state(), CmdState::Running);
        assert_eq!(dispatcher.active_commands(), 1);

        dispatcher.process_line("client 5 agile : ");
        assert_eq!(cmd.state(), CmdState::Done);
        assert_eq!(dispatcher.active_commands(), 0);

        // Late reply for the same id: dropped, state unchanged.
        dispatcher.process_line("client 5 agile f ");
        assert_eq!(cmd.state(), CmdState::Done);
    }

    #[test]
    fn test_foreign_commander_reply_not_matched() {
        let mut dispatcher = Dispatcher::new("client");
        let cmd = CmdVar::new("agile", "home");
        dispatcher.start_cmd(&cmd, 5).unwrap();

        dispatcher.process_line("somebody.else 5 agile : ");
        assert_eq!(cmd.state(), CmdState::Running);
    }

    #[test]
    fn test_duplicate_and_reserved_cmd_ids() {
        let mut dispatcher = Dispatcher::new("client");
        let first = CmdVar::new("agile", "home");
        dispatcher.start_cmd(&first, 5).unwrap();

        let second = CmdVar::new("agile", "status");
        assert!(matches!(
            dispatcher.start_cmd(&second, 5),
            Err(DispatchError::DuplicateCmdId(5))
        ));
        assert!(matches!(
            dispatcher.start_cmd(&second, 0),
            Err(DispatchError::ReservedCmdId)
        ));

        // Terminal transition frees the id.
        dispatcher.process_line("client 5 agile : ");
        dispatcher.start_cmd(&second, 5).unwrap();
    }

    #[test]
    fn test_next_cmd_id_skips_outstanding() {
        let mut dispatcher = Dispatcher::new("client");
        let first = CmdVar::new("agile", "a");
        let id = dispatcher.send_cmd(&first).unwrap();
        assert_eq!(id, 1);
        let second = CmdVar::new("agile", "b");
        assert_eq!(dispatcher.send_cmd(&second).unwrap(), 2);
    }

    #[test]
    fn test_timeout_sweep() {
        let mut dispatcher = Dispatcher::new("client");
        let quick = CmdVar::new("agile", "a").with_timeout(Duration::from_secs(2));
        let slow = CmdVar::new("agile", "b").with_timeout(Duration::from_secs(60));
        let start = Instant::now();
        dispatcher.start_cmd(&quick, 1).unwrap();
        dispatcher.start_cmd(&slow, 2).unwrap();

        dispatcher.check_timeouts(start + Duration::from_secs(3));
        assert_eq!(quick.state(), CmdState::Failed);
        assert_eq!(slow.state(), CmdState::Running);
        assert_eq!(dispatcher.active_commands(), 1);
    }

    #[test]
    fn test_sink_receives_outbound_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut dispatcher = Dispatcher::new("client").with_sink(tx);
        let cmd = CmdVar::new("agile", "move 3").with_abort_text("stop");
        dispatcher.start_cmd(&cmd, 9).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "9 agile move 3");

        dispatcher.abort_cmd(9).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "1 agile stop");
        assert_eq!(cmd.state(), CmdState::Running);
    }

    #[test]
    fn test_connect_issues_registered_refresh() {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut dispatcher = Dispatcher::new("client").with_sink(tx);
        dispatcher.register_refresh("agile", "getstatus", vec!["setpoint".to_string()]);
        assert!(rx.try_recv().is_err());

        dispatcher.set_connected(true);
        let line = rx.try_recv().unwrap();
        assert!(line.ends_with("agile getstatus"));

        // Registering after connect refreshes immediately.
        dispatcher.register_refresh("encl", "status", vec![]);
        let line = rx.try_recv().unwrap();
        assert!(line.ends_with("encl status"));
    }

    #[test]
    fn test_disconnect_marks_keyvars_stale() {
        let (mut dispatcher, kv) = dispatcher_with_keyvar();
        dispatcher.set_connected(true);
        dispatcher.process_line("client 0 agile i setpoint=21.5");
        assert!(kv.is_current());

        dispatcher.set_connected(false);
        let (value, is_current) = kv.get();
        assert_eq!(value, vec![Field::Float(21.5)]);
        assert!(!is_current);
    }
}
