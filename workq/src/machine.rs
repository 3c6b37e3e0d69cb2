use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Side effect attached to a transition. Receives `(from, to, transition)`.
pub type SideEffect<S, T> = Arc<dyn Fn(S, S, T) + Send + Sync + 'static>;

/// Where a transition's side effect runs relative to the machine's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectScope {
    /// Run the effect after the lock is released.
    ///
    /// This is the right choice almost everywhere: effects commonly re-enter
    /// the machine (a `Schedule` effect ends up triggering `RunStart` from
    /// another thread) and call into user code. Running them outside the lock
    /// removes the simplest deadlock class.
    Deferred,

    /// Run the effect while still holding the lock.
    ///
    /// The effect must not call back into this machine.
    Synchronous,
}

struct Edge<S, T> {
    to: S,
    scope: EffectScope,
    effect: SideEffect<S, T>,
}

struct Inner<S, T, D> {
    current: S,
    table: HashMap<(S, T), Edge<S, T>>,
    data: D,
}

/// A table-driven state machine executing at most one transition at a time.
///
/// `D` is an auxiliary payload guarded by the same mutex as the current
/// state. Callers that need to make a decision atomically against the state
/// ("append to this list unless the machine is already terminal") reach it
/// through [`StateMachine::with_data`] instead of keeping a second lock with
/// its own ordering rules.
pub struct StateMachine<S, T, D = ()> {
    inner: Mutex<Inner<S, T, D>>,
}

impl<S, T, D> StateMachine<S, T, D>
where
    S: Copy + Eq + Hash + fmt::Debug + 'static,
    T: Copy + Eq + Hash + fmt::Debug + 'static,
{
    pub fn new(initial: S) -> Self
    where
        D: Default,
    {
        Self {
            inner: Mutex::new(Inner {
                current: initial,
                table: HashMap::new(),
                data: D::default(),
            }),
        }
    }

    pub fn current_state(&self) -> S {
        self.inner.lock().current
    }

    /// Installs a new edge `(from, trans) -> to`.
    ///
    /// Duplicate `(from, trans)` keys are rejected: the existing edge is kept
    /// and `false` is returned.
    pub fn add_transition<F>(&self, from: S, to: S, trans: T, scope: EffectScope, effect: F) -> bool
    where
        F: Fn(S, S, T) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        match inner.table.entry((from, trans)) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(Edge {
                    to,
                    scope,
                    effect: Arc::new(effect),
                });
                true
            }
        }
    }

    /// Atomically looks up `(current, trans)` and advances the machine.
    ///
    /// If no edge matches, the current state is returned unchanged and no
    /// effect runs. Otherwise the state moves to the edge's target under the
    /// lock, the side effect runs according to its [`EffectScope`], and the
    /// new current state is returned.
    pub fn execute_transition(&self, trans: T) -> S {
        let mut inner = self.inner.lock();
        let from = inner.current;

        let Some(edge) = inner.table.get(&(from, trans)) else {
            tracing::trace!(?from, ?trans, "transition rejected");
            return from;
        };

        let to = edge.to;
        let scope = edge.scope;
        let effect = Arc::clone(&edge.effect);
        inner.current = to;

        match scope {
            EffectScope::Synchronous => effect(from, to, trans),
            EffectScope::Deferred => {
                drop(inner);
                effect(from, to, trans);
            }
        }

        to
    }

    /// Runs `f` with the current state and the payload, under the machine's
    /// mutex. `f` must not call back into this machine.
    pub fn with_data<R>(&self, f: impl FnOnce(S, &mut D) -> R) -> R {
        let mut inner = self.inner.lock();
        let current = inner.current;
        f(current, &mut inner.data)
    }
}

impl<S, T, D> fmt::Debug for StateMachine<S, T, D>
where
    S: Copy + Eq + Hash + fmt::Debug + 'static,
    T: Copy + Eq + Hash + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current_state())
            .finish()
    }
}
