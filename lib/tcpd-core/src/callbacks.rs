//! Callback registry.

use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use snafu::Snafu;
use tcpd_error::GenericError;

use crate::event::EventKind;

type LifecycleFn = dyn Fn() -> Result<(), GenericError> + Send + Sync;
type DispatchFn = dyn Fn(bool) -> Result<(), GenericError> + Send + Sync;

/// Shape of a hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookShape {
    /// Takes no arguments. Used for process lifecycle events.
    Lifecycle,

    /// Takes a success flag. Used for connection events.
    Dispatch,
}

impl HookShape {
    /// Returns the shape of hook that the given event kind accepts.
    pub const fn for_kind(kind: EventKind) -> Self {
        if kind.is_connection_event() {
            Self::Dispatch
        } else {
            Self::Lifecycle
        }
    }
}

impl fmt::Display for HookShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lifecycle => f.write_str("lifecycle"),
            Self::Dispatch => f.write_str("dispatch"),
        }
    }
}

/// A user-supplied hook.
#[derive(Clone)]
pub enum Hook {
    /// A lifecycle hook.
    Lifecycle(Arc<LifecycleFn>),

    /// A dispatch hook, called with `true` only if the dispatch succeeded.
    Dispatch(Arc<DispatchFn>),
}

impl Hook {
    /// Creates a lifecycle hook.
    pub fn lifecycle<F>(f: F) -> Self
    where
        F: Fn() -> Result<(), GenericError> + Send + Sync + 'static,
    {
        Self::Lifecycle(Arc::new(f))
    }

    /// Creates a dispatch hook.
    pub fn dispatch<F>(f: F) -> Self
    where
        F: Fn(bool) -> Result<(), GenericError> + Send + Sync + 'static,
    {
        Self::Dispatch(Arc::new(f))
    }

    /// Returns the shape of this hook.
    pub fn shape(&self) -> HookShape {
        match self {
            Self::Lifecycle(_) => HookShape::Lifecycle,
            Self::Dispatch(_) => HookShape::Dispatch,
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hook({})", self.shape())
    }
}

/// Callback registration errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum CallbackError {
    /// A hook is already registered for the event kind.
    #[snafu(display("A callback is already registered for '{}'.", kind))]
    Duplicate {
        /// Event kind.
        kind: EventKind,
    },

    /// The hook does not have the shape the event kind expects.
    #[snafu(display("Callback for '{}' must be a {} hook, got a {} hook.", kind, expected, actual))]
    ShapeMismatch {
        /// Event kind.
        kind: EventKind,

        /// Expected shape.
        expected: HookShape,

        /// Shape of the hook that was given.
        actual: HookShape,
    },

    /// The callback name does not match any event kind.
    #[snafu(display("Unknown callback '{}'.", name))]
    UnknownName {
        /// Name that was given.
        name: String,
    },
}

/// Optional hooks, at most one per event kind.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    hooks: IndexMap<EventKind, Hook>,
}

impl CallbackRegistry {
    /// Creates an empty `CallbackRegistry`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook for the given event kind.
    ///
    /// # Errors
    ///
    /// If a hook is already registered for `kind`, or the hook has the wrong shape for `kind`, an error is returned.
    pub fn register(&mut self, kind: EventKind, hook: Hook) -> Result<(), CallbackError> {
        let expected = HookShape::for_kind(kind);
        if hook.shape() != expected {
            return Err(CallbackError::ShapeMismatch {
                kind,
                expected,
                actual: hook.shape(),
            });
        }

        if self.hooks.contains_key(&kind) {
            return Err(CallbackError::Duplicate { kind });
        }

        self.hooks.insert(kind, hook);
        Ok(())
    }

    /// Registers a hook by its settings key, such as `receive_callback`.
    ///
    /// # Errors
    ///
    /// If the name is unknown, or registration fails, an error is returned.
    pub fn register_named(&mut self, name: &str, hook: Hook) -> Result<(), CallbackError> {
        let kind = EventKind::from_callback_key(name).ok_or_else(|| CallbackError::UnknownName {
            name: name.to_string(),
        })?;
        self.register(kind, hook)
    }

    /// Returns `true` if a hook is registered for `kind`.
    pub fn contains(&self, kind: EventKind) -> bool {
        self.hooks.contains_key(&kind)
    }

    /// Returns the event kinds that have a hook, in registration order.
    pub fn kinds(&self) -> impl Iterator<Item = EventKind> + '_ {
        self.hooks.keys().copied()
    }

    /// Invokes the hook for a lifecycle event, if one is registered.
    ///
    /// # Errors
    ///
    /// If the hook fails, its error is returned.
    pub fn notify(&self, kind: EventKind) -> Result<(), GenericError> {
        self.notify_with(kind, true)
    }

    /// Invokes the hook for an event with the given success flag, if one is registered.
    ///
    /// Lifecycle hooks ignore the flag.
    ///
    /// # Errors
    ///
    /// If the hook fails, its error is returned.
    pub fn notify_with(&self, kind: EventKind, success: bool) -> Result<(), GenericError> {
        match self.hooks.get(&kind) {
            None => Ok(()),
            Some(Hook::Lifecycle(f)) => f(),
            Some(Hook::Dispatch(f)) => f(success),
        }
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.hooks.keys()).finish()
    }
}
