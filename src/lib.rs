//! Core library for keyword-variable dispatch against a hub of remote
//! subsystem controllers ("actors").
//!
//! Instrument models are built from two primitives: [`KeyVar`], the typed,
//! cached, observable value of one `(actor, keyword)` pair, and [`CmdVar`],
//! an outstanding command with a completion state machine. The
//! [`Dispatcher`] consumes raw reply lines from the hub, updates matching
//! key variables (firing their observers), and advances matching commands
//! (firing their callbacks). GUI and test code sit entirely outside this
//! loop: they build models with [`KeyVarFactory`], register callbacks, and
//! submit commands.

pub mod actor;
pub mod cmdvar;
pub mod convert;
pub mod dispatcher;
pub mod error;
pub mod factory;
pub mod keyvar;
pub mod reply;
pub mod testfeed;

pub use actor::{spawn, DispatcherActor, DispatcherHandle};
pub use cmdvar::{CallType, CmdNotice, CmdState, CmdVar};
pub use convert::{Arity, BoolTokens, Converter, Field};
pub use dispatcher::{CommandSink, Dispatcher};
pub use error::{DispatchError, Result};
pub use factory::KeyVarFactory;
pub use keyvar::KeyVar;
pub use reply::{KeywordGroup, MsgCode, Reply};
