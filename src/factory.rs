//! Key-variable factories.
//!
//! A model owns many key variables for one actor; the factory builds that
//! family with the actor name and dispatcher registration handled once, and
//! collects the keywords for the actor's batched refresh command. One
//! "get status" command per actor, not one per keyword, keeps refresh
//! traffic flat as models grow.

use crate::convert::{Arity, Converter};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::keyvar::KeyVar;

/// Builds a family of key variables sharing one actor and dispatcher.
///
/// Construction-time only: the factory borrows the dispatcher mutably and
/// is consumed by [`KeyVarFactory::set_keys_refresh_cmd`] (or simply
/// dropped for actors with no refresh command).
pub struct KeyVarFactory<'d> {
    dispatcher: &'d mut Dispatcher,
    actor: String,
    created: Vec<KeyVar>,
}

impl<'d> KeyVarFactory<'d> {
    pub fn new(dispatcher: &'d mut Dispatcher, actor: impl Into<String>) -> Self {
        Self {
            dispatcher,
            actor: actor.into(),
            created: Vec::new(),
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Build and register a key variable, eligible for batched refresh.
    pub fn keyvar(
        &mut self,
        keyword: impl Into<String>,
        arity: Arity,
        converters: Vec<Converter>,
    ) -> Result<KeyVar> {
        self.register(KeyVar::new(self.actor.clone(), keyword, arity, converters))
    }

    /// Build and register a key variable that refresh commands skip
    /// (computed or locally-driven keywords).
    pub fn keyvar_no_refresh(
        &mut self,
        keyword: impl Into<String>,
        arity: Arity,
        converters: Vec<Converter>,
    ) -> Result<KeyVar> {
        self.register(
            KeyVar::new(self.actor.clone(), keyword, arity, converters).no_refresh(),
        )
    }

    /// Convenience: a single free-text field, the most common keyword shape.
    pub fn string_keyvar(&mut self, keyword: impl Into<String>) -> Result<KeyVar> {
        self.keyvar(keyword, Arity::Exactly(1), vec![Converter::Str])
    }

    fn register(&mut self, keyvar: KeyVar) -> Result<KeyVar> {
        self.dispatcher.register_keyvar(&keyvar)?;
        self.created.push(keyvar.clone());
        Ok(keyvar)
    }

    /// Register this actor's batched "get status" command, covering every
    /// refresh-eligible key variable the factory built. Consumes the
    /// factory; call it last. If the dispatcher is already connected the
    /// refresh is issued immediately.
    pub fn set_keys_refresh_cmd(self, cmd_text: impl Into<String>) {
        let keywords: Vec<String> = self
            .created
            .iter()
            .filter(|kv| kv.allow_refresh())
            .map(|kv| kv.keyword().to_string())
            .collect();
        self.dispatcher
            .register_refresh(self.actor, cmd_text.into(), keywords);
    }
}

// =============================================================================
// Tests
// =============================================================================
