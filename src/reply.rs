//! Reply line parsing.
//!
//! Every reply from the hub is one line of text:
//!
//! ```text
//! <commander> <cmdID> <actor> <msgCode> <kw1>=<f1>,<f2>[; <kw2>=<f1>...]
//! ```
//!
//! - Commander: the `program.user` identity the reply is addressed to.
//! - CmdID: integer id of the command this reply answers; `0` for
//!   unsolicited broadcasts.
//! - Actor: the subsystem controller that produced the reply.
//! - MsgCode: one character classifying the reply (see [`MsgCode`]).
//! - Keyword groups: `;`-separated, each `name=field,field,...`; fields are
//!   `,`-separated and may be quoted with `"` or `'` so that delimiters
//!   inside quotes do not split. A keyword with no `=` is a valid
//!   zero-field group (a flag).
//!
//! Failure policy: an unusable header fails the whole line. A keyword group
//! with mismatched quoting invalidates only that group; the parser
//! resynchronizes at the next `;` so sibling groups still parse. Bad groups
//! are reported on the [`Reply`] for the dispatcher to log.
//!
//! Fields are kept verbatim (quotes included, `?`/`NaN` untouched); typing
//! and quote stripping happen downstream in [`crate::convert`].

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

// =============================================================================
// MsgCode
// =============================================================================

/// One-character reply classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgCode {
    /// `i` - informational, non-terminal.
    Info,
    /// `>` - command queued, non-terminal.
    Queued,
    /// `:` - command finished successfully, terminal.
    Done,
    /// `w` - warning, non-terminal.
    Warning,
    /// `e` - error, terminal failure.
    Error,
    /// `f` - failure, terminal failure.
    Failed,
    /// `!` - fatal, terminal failure.
    Fatal,
}

impl MsgCode {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'i' => Some(MsgCode::Info),
            '>' => Some(MsgCode::Queued),
            ':' => Some(MsgCode::Done),
            'w' => Some(MsgCode::Warning),
            'e' => Some(MsgCode::Error),
            'f' => Some(MsgCode::Failed),
            '!' => Some(MsgCode::Fatal),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            MsgCode::Info => 'i',
            MsgCode::Queued => '>',
            MsgCode::Done => ':',
            MsgCode::Warning => 'w',
            MsgCode::Error => 'e',
            MsgCode::Failed => 'f',
            MsgCode::Fatal => '!',
        }
    }

    /// Terminal codes end a command's lifetime.
    pub fn is_terminal(self) -> bool {
        matches!(self, MsgCode::Done | MsgCode::Error | MsgCode::Failed | MsgCode::Fatal)
    }

    /// Only `:` reports success.
    pub fn is_success(self) -> bool {
        self == MsgCode::Done
    }

    pub fn is_failure(self) -> bool {
        self.is_terminal() && !self.is_success()
    }
}

impl std::fmt::Display for MsgCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

// =============================================================================
// Reply
// =============================================================================

/// One parsed keyword group: name plus raw (still-quoted) field strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordGroup {
    pub name: String,
    pub fields: Vec<String>,
}

/// A keyword group that failed to parse; carried for logging only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadGroup {
    pub raw: String,
    pub reason: String,
}

/// A parsed reply line. Transient: produced and consumed within a single
/// dispatch step, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub commander: String,
    pub cmd_id: u32,
    pub actor: String,
    pub code: MsgCode,
    pub keywords: Vec<KeywordGroup>,
    pub malformed: Vec<BadGroup>,
    /// The keyword section verbatim, for command notices and logging.
    pub raw_keywords: String,
}

impl Reply {
    /// Parse one reply line. An unusable header fails the whole line;
    /// keyword-group damage is isolated per group.
    pub fn parse(line: &str) -> Result<Self> {
        let parse_err = |what: &str| DispatchError::Parse(format!("{what} in {line:?}"));

        let (commander, rest) = next_token(line).ok_or_else(|| parse_err("missing commander"))?;
        let (id_tok, rest) = next_token(rest).ok_or_else(|| parse_err("missing command id"))?;
        let cmd_id = id_tok
            .parse::<u32>()
            .map_err(|_| parse_err("non-integer command id"))?;
        let (actor, rest) = next_token(rest).ok_or_else(|| parse_err("missing actor"))?;
        let (code_tok, rest) = next_token(rest).ok_or_else(|| parse_err("missing message code"))?;

        let mut code_chars = code_tok.chars();
        let code = match (code_chars.next(), code_chars.next()) {
            (Some(c), None) => MsgCode::from_char(c).ok_or_else(|| parse_err("unknown message code"))?,
            _ => return Err(parse_err("message code is not a single character")),
        };

        let raw_keywords = rest.trim().to_string();
        let (keywords, malformed) = parse_groups(&raw_keywords);

        Ok(Reply {
            commander: commander.to_string(),
            cmd_id,
            actor: actor.to_string(),
            code,
            keywords,
            malformed,
            raw_keywords,
        })
    }
}

/// Split off the next whitespace-delimited token.
fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    Some((&s[..end], &s[end..]))
}

/// Parse the `;`-separated keyword section, isolating quoting damage to the
/// group it occurs in.
fn parse_groups(text: &str) -> (Vec<KeywordGroup>, Vec<BadGroup>) {
    let mut groups = Vec::new();
    let mut malformed = Vec::new();
    let bytes = text.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        // Skip whitespace and empty groups between semicolons.
        while pos < bytes.len() && (bytes[pos].is_ascii_whitespace() || bytes[pos] == b';') {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }

        let group_start = pos;
        while pos < bytes.len() && bytes[pos] != b'=' && bytes[pos] != b';' {
            pos += 1;
        }
        let name = text[group_start..pos].trim().to_string();

        if pos >= bytes.len() || bytes[pos] == b';' {
            // Flag keyword: no value section.
            if !name.is_empty() {
                groups.push(KeywordGroup {
                    name,
                    fields: Vec::new(),
                });
            }
            continue;
        }

        // At '='.
        pos += 1;
        if name.is_empty() {
            let end = resync(bytes, pos);
            malformed.push(BadGroup {
                raw: text[group_start..end].to_string(),
                reason: "missing keyword name".to_string(),
            });
            pos = end;
            continue;
        }

        match parse_fields(text, pos) {
            Ok((fields, end)) => {
                groups.push(KeywordGroup { name, fields });
                pos = end;
            }
            Err((reason, err_pos)) => {
                let end = resync(bytes, err_pos);
                malformed.push(BadGroup {
                    raw: text[group_start..end].to_string(),
                    reason,
                });
                pos = end;
            }
        }
    }

    (groups, malformed)
}

/// Parse the `,`-separated field list of one group, starting just after the
/// `=`. Returns the fields and the position of the terminating `;` (or end
/// of text). On quoting damage, returns the reason and the position to
/// resynchronize from.
#[allow(clippy::type_complexity)]
fn parse_fields(
    text: &str,
    mut pos: usize,
) -> std::result::Result<(Vec<String>, usize), (String, usize)> {
    let bytes = text.as_bytes();
    let mut fields = Vec::new();

    loop {
        while pos < bytes.len() && bytes[pos] == b' ' {
            pos += 1;
        }

        if pos < bytes.len() && (bytes[pos] == b'"' || bytes[pos] == b'\'') {
            let quote = bytes[pos];
            let open = pos;
            let close = bytes[open + 1..]
                .iter()
                .position(|&b| b == quote)
                .map(|off| open + 1 + off)
                .ok_or_else(|| ("unterminated quote".to_string(), open + 1))?;
            fields.push(text[open..=close].to_string());
            pos = close + 1;

            while pos < bytes.len() && bytes[pos] == b' ' {
                pos += 1;
            }
            if pos < bytes.len() && bytes[pos] != b',' && bytes[pos] != b';' {
                return Err(("text after closing quote".to_string(), pos));
            }
        } else {
            let start = pos;
            while pos < bytes.len() && bytes[pos] != b',' && bytes[pos] != b';' {
                pos += 1;
            }
            fields.push(text[start..pos].trim().to_string());
        }

        if pos >= bytes.len() || bytes[pos] == b';' {
            return Ok((fields, pos));
        }
        // At ','.
        pos += 1;
    }
}

/// Best-effort recovery point after a malformed group: the next `;`.
fn resync(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|&b| b == b';')
        .map_or(bytes.len(), |off| from + off)
}

// =============================================================================
// Tests
// =============================================================================
