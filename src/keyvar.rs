//! Key variables: typed, cached, observable keyword values.
//!
//! A [`KeyVar`] is the live representation of one `(actor, keyword)` pair:
//! the latest typed value tuple, a freshness flag, and an ordered observer
//! list. KeyVars are built once at model-construction time (usually through
//! [`crate::factory::KeyVarFactory`]) and live for the life of the model;
//! only the dispatcher mutates them, on matching replies.
//!
//! Observers fire in registration order, deterministically, for both
//! production and test-driven updates. UIs rely on last-registered-wins
//! display semantics for composite widgets, so that ordering is a contract,
//! not an accident. One observer failing must not starve the rest: errors
//! are captured and logged, and delivery continues.
//!
//! A conversion failure does not silently freeze the display either: the
//! value keeps its previous tuple, the freshness flag drops, and observers
//! are still invoked so a UI can show a stale indicator.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use log::warn;

use crate::convert::{convert_fields, Arity, Converter, Field};
use crate::error::Result;

/// Observer callback: receives the value tuple and the freshness flag.
pub type Observer = Box<dyn FnMut(&[Field], bool) -> anyhow::Result<()> + Send>;

/// Observer callback for a single tuple slot.
pub type IndexedObserver = Box<dyn FnMut(&Field, bool) -> anyhow::Result<()> + Send>;

struct KeyVarInner {
    value: Vec<Field>,
    is_current: bool,
    has_value: bool,
    last_update: Option<DateTime<Utc>>,
    observers: Vec<Observer>,
}

struct KeyVarShared {
    actor: String,
    keyword: String,
    arity: Arity,
    converters: Vec<Converter>,
    allow_refresh: bool,
    inner: Mutex<KeyVarInner>,
}

/// Shared handle to one keyword's cached value. Cloning shares state.
#[derive(Clone)]
pub struct KeyVar {
    shared: Arc<KeyVarShared>,
}

impl std::fmt::Debug for KeyVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("KeyVar")
            .field("actor", &self.shared.actor)
            .field("keyword", &self.shared.keyword)
            .field("value", &inner.value)
            .field("is_current", &inner.is_current)
            .field("observers", &inner.observers.len())
            .finish()
    }
}

impl KeyVar {
    /// Create a key variable. Before the first update the value tuple is
    /// all-null (length = minimum arity) and not current.
    pub fn new(
        actor: impl Into<String>,
        keyword: impl Into<String>,
        arity: Arity,
        converters: Vec<Converter>,
    ) -> Self {
        Self {
            shared: Arc::new(KeyVarShared {
                actor: actor.into(),
                keyword: keyword.into(),
                arity,
                converters,
                allow_refresh: true,
                inner: Mutex::new(KeyVarInner {
                    value: vec![Field::None; arity.min()],
                    is_current: false,
                    has_value: false,
                    last_update: None,
                    observers: Vec::new(),
                }),
            }),
        }
    }

    /// Exclude this key variable from batched refresh commands.
    ///
    /// Must be called before the handle is cloned or registered; it rebuilds
    /// the shared allocation.
    pub fn no_refresh(self) -> Self {
        let inner = {
            let mut g = self.lock();
            KeyVarInner {
                value: std::mem::take(&mut g.value),
                is_current: g.is_current,
                has_value: g.has_value,
                last_update: g.last_update,
                observers: std::mem::take(&mut g.observers),
            }
        };
        Self {
            shared: Arc::new(KeyVarShared {
                actor: self.shared.actor.clone(),
                keyword: self.shared.keyword.clone(),
                arity: self.shared.arity,
                converters: self.shared.converters.clone(),
                allow_refresh: false,
                inner: Mutex::new(inner),
            }),
        }
    }

    pub fn actor(&self) -> &str {
        &self.shared.actor
    }

    pub fn keyword(&self) -> &str {
        &self.shared.keyword
    }

    pub fn arity(&self) -> Arity {
        self.shared.arity
    }

    /// Whether the refresh coordinator may request this keyword's state.
    pub fn allow_refresh(&self) -> bool {
        self.shared.allow_refresh
    }

    fn lock(&self) -> MutexGuard<'_, KeyVarInner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one reply's raw fields.
    ///
    /// On success the tuple is replaced, freshness and timestamp are set,
    /// and every observer fires in registration order with the new value.
    /// On conversion failure the previous tuple is kept, the freshness flag
    /// drops, observers still fire (stale indicator), and the error is
    /// returned for the dispatcher to log.
    pub fn update(&self, raw_fields: &[String], is_current: bool) -> Result<()> {
        match convert_fields(
            &self.shared.keyword,
            self.shared.arity,
            &self.shared.converters,
            raw_fields,
        ) {
            Ok(value) => {
                let snapshot = {
                    let mut g = self.lock();
                    g.value = value;
                    g.is_current = is_current;
                    g.has_value = true;
                    g.last_update = Some(Utc::now());
                    g.value.clone()
                };
                self.notify(&snapshot, is_current);
                Ok(())
            }
            Err(err) => {
                let snapshot = {
                    let mut g = self.lock();
                    g.is_current = false;
                    g.value.clone()
                };
                self.notify(&snapshot, false);
                Err(err)
            }
        }
    }

    /// Register a whole-tuple observer. With `call_now`, the observer is
    /// invoked immediately with the current `(value, is_current)` snapshot,
    /// so registration yields exactly what `get` would.
    pub fn add_observer<F>(&self, callback: F, call_now: bool)
    where
        F: FnMut(&[Field], bool) -> anyhow::Result<()> + Send + 'static,
    {
        let mut callback: Observer = Box::new(callback);
        if call_now {
            let (value, is_current) = self.get();
            if let Err(err) = callback(&value, is_current) {
                warn!(
                    "observer on {}.{} failed on initial delivery: {err:#}",
                    self.shared.actor, self.shared.keyword
                );
            }
        }
        self.lock().observers.push(callback);
    }

    /// Register an observer for one tuple slot. Index projection happens in
    /// a wrapping closure, so indexed observers share the whole-tuple
    /// delivery path (and its ordering). Out-of-range slots read as null.
    pub fn add_indexed_observer<F>(&self, index: usize, mut callback: F, call_now: bool)
    where
        F: FnMut(&Field, bool) -> anyhow::Result<()> + Send + 'static,
    {
        self.add_observer(
            move |value: &[Field], is_current: bool| {
                callback(value.get(index).unwrap_or(&Field::None), is_current)
            },
            call_now,
        );
    }

    /// Current `(value, is_current)` snapshot.
    pub fn get(&self) -> (Vec<Field>, bool) {
        let g = self.lock();
        (g.value.clone(), g.is_current)
    }

    /// One slot of the current value; out-of-range slots read as null.
    pub fn get_indexed(&self, index: usize) -> (Field, bool) {
        let g = self.lock();
        let field = g.value.get(index).cloned().unwrap_or(Field::None);
        (field, g.is_current)
    }

    pub fn is_current(&self) -> bool {
        self.lock().is_current
    }

    /// Whether at least one update has succeeded.
    pub fn has_value(&self) -> bool {
        self.lock().has_value
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.lock().last_update
    }

    /// The current value tuple as JSON, for generic (GUI/snapshot) access.
    pub fn value_json(&self) -> anyhow::Result<serde_json::Value> {
        let (value, _) = self.get();
        serde_json::to_value(&value).map_err(|e| {
            anyhow::anyhow!(
                "failed to serialize {}.{}: {e}",
                self.shared.actor,
                self.shared.keyword
            )
        })
    }

    /// Drop the freshness flag without touching the value. Used when the
    /// connection is lost and cached state can no longer be trusted.
    pub(crate) fn mark_stale(&self) {
        let snapshot = {
            let mut g = self.lock();
            if !g.is_current {
                return;
            }
            g.is_current = false;
            g.value.clone()
        };
        self.notify(&snapshot, false);
    }

    /// Invoke every observer in registration order, outside the lock so
    /// observers may call back into this key variable. Observers registered
    /// during delivery are appended after the existing list.
    fn notify(&self, value: &[Field], is_current: bool) {
        let mut taken = std::mem::take(&mut self.lock().observers);
        for callback in &mut taken {
            if let Err(err) = callback(value, is_current) {
                warn!(
                    "observer on {}.{} failed: {err:#}",
                    self.shared.actor, self.shared.keyword
                );
            }
        }
        let mut g = self.lock();
        let added = std::mem::take(&mut g.observers);
        g.observers = taken;
        g.observers.extend(added);
    }
}

// =============================================================================
// Tests
// =============================================================================
