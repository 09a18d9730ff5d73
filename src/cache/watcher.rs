//! Query watchers
//!
//! A [`QueryWatcher`] keeps a [`QueryCache`] current by listening to the
//! store and fans the updated snapshot out to its observers. Each batch of
//! events is classified into a [`Reaction`]:
//!
//! | relevance override | template matches | reaction |
//! |--------------------|------------------|----------|
//! | `Some(false)`      | any              | ignore   |
//! | `Some(true)`       | yes              | patch    |
//! | `Some(true)`       | no               | refresh  |
//! | `None`             | yes              | patch    |
//! | `None`             | no               | ignore   |

use super::{QueryCache, WatchTemplate};
use crate::graph::Value;
use crate::store::{Subscription, UpdateEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, trace};

/// Caller-supplied relevance decision for a batch of events
///
/// `None` defers to the snapshot's [`WatchTemplate`].
pub type Relevance = Arc<dyn Fn(&[UpdateEvent]) -> Option<bool> + Send + Sync>;

/// Receives each changed snapshot
pub type Observer = Arc<dyn Fn(Arc<Value>) + Send + Sync>;

/// What a watcher does while nobody observes it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnobservedPolicy {
    /// Stay subscribed and keep the snapshot current
    KeepUpdating,
    /// Unsubscribe; refresh from the table when observed again
    #[default]
    PauseUpdating,
}

/// How a watcher responds to a batch of events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    Ignore,
    Patch,
    Refresh,
}

/// Classify a batch of events for one snapshot
pub fn decide(
    template: &WatchTemplate,
    relevance: Option<&Relevance>,
    events: &[UpdateEvent],
) -> Reaction {
    let matched = template.matches_any(events);
    match relevance.and_then(|f| f(events)) {
        Some(false) => Reaction::Ignore,
        Some(true) if matched => Reaction::Patch,
        Some(true) => Reaction::Refresh,
        None if matched => Reaction::Patch,
        None => Reaction::Ignore,
    }
}

/// Watcher settings
#[derive(Clone, Default)]
pub struct WatchOptions {
    pub unobserved: UnobservedPolicy,
    pub relevance: Option<Relevance>,
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unobserved(mut self, policy: UnobservedPolicy) -> Self {
        self.unobserved = policy;
        self
    }

    pub fn relevance<F>(mut self, f: F) -> Self
    where
        F: Fn(&[UpdateEvent]) -> Option<bool> + Send + Sync + 'static,
    {
        self.relevance = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for WatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchOptions")
            .field("unobserved", &self.unobserved)
            .field("relevance", &self.relevance.is_some())
            .finish()
    }
}

struct WatcherState {
    cache: QueryCache,
    observers: Vec<(u64, Observer)>,
    subscription: Option<Subscription>,
    next_observer: u64,
}

struct WatcherInner {
    options: WatchOptions,
    state: Mutex<WatcherState>,
}

/// Keeps one query snapshot current and notifies observers
#[derive(Clone)]
pub struct QueryWatcher {
    inner: Arc<WatcherInner>,
}

impl QueryWatcher {
    pub fn new(cache: QueryCache, options: WatchOptions) -> Self {
        let keep_updating = options.unobserved == UnobservedPolicy::KeepUpdating;
        let watcher = Self {
            inner: Arc::new(WatcherInner {
                options,
                state: Mutex::new(WatcherState {
                    cache,
                    observers: Vec::new(),
                    subscription: None,
                    next_observer: 0,
                }),
            }),
        };
        if keep_updating {
            let mut state = watcher.inner.lock();
            WatcherInner::attach(&watcher.inner, &mut state);
        }
        watcher
    }

    /// Current snapshot
    pub fn current(&self) -> Option<Arc<Value>> {
        self.inner.lock().cache.get()
    }

    /// Whether the watcher is subscribed to the store
    pub fn is_active(&self) -> bool {
        self.inner.lock().subscription.is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }

    /// Register an observer
    ///
    /// A paused watcher resumes on its first observer, refreshing the snapshot
    /// from the table to pick up anything missed while paused.
    pub fn observe<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(Arc<Value>) + Send + Sync + 'static,
    {
        let mut state = self.inner.lock();
        let id = state.next_observer;
        state.next_observer += 1;
        state.observers.push((id, Arc::new(observer)));

        if state.subscription.is_none() {
            debug!("Resuming query watcher");
            state.cache.refresh();
            WatcherInner::attach(&self.inner, &mut state);
        }

        ObserverHandle {
            watcher: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// React to a batch of events as the store listener would
    pub fn handle(&self, events: &[UpdateEvent]) {
        self.inner.handle(events);
    }
}

impl fmt::Debug for QueryWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryWatcher")
            .field("options", &self.inner.options)
            .field("observers", &self.observer_count())
            .finish_non_exhaustive()
    }
}

impl WatcherInner {
    fn lock(&self) -> MutexGuard<'_, WatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // The store listener only holds a weak handle so a dropped watcher detaches
    fn attach(inner: &Arc<Self>, state: &mut WatcherState) {
        let weak: Weak<Self> = Arc::downgrade(inner);
        let subscription = state.cache.store().subscribe(move |events| {
            if let Some(inner) = weak.upgrade() {
                inner.handle(events);
            }
        });
        state.subscription = Some(subscription);
    }

    fn handle(&self, events: &[UpdateEvent]) {
        let (snapshot, observers) = {
            let mut state = self.lock();
            let before = state.cache.get();

            let reaction = decide(
                state.cache.watch_template(),
                self.options.relevance.as_ref(),
                events,
            );
            trace!(?reaction, events = events.len(), "Watcher reacting to updates");
            match reaction {
                Reaction::Ignore => return,
                Reaction::Patch => {
                    state.cache.apply_updates(events);
                }
                Reaction::Refresh => {
                    state.cache.refresh();
                }
            }

            let after = state.cache.get();
            let changed = match (&before, &after) {
                (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
                (None, None) => false,
                _ => true,
            };
            let Some(snapshot) = after.filter(|_| changed) else {
                return;
            };
            let observers: Vec<Observer> = state
                .observers
                .iter()
                .map(|(_, observer)| Arc::clone(observer))
                .collect();
            (snapshot, observers)
        };

        for observer in observers {
            observer(Arc::clone(&snapshot));
        }
    }

    fn remove_observer(&self, id: u64) {
        let mut state = self.lock();
        state.observers.retain(|(observer, _)| *observer != id);
        if state.observers.is_empty() && self.options.unobserved == UnobservedPolicy::PauseUpdating
        {
            debug!("Pausing query watcher");
            state.subscription = None;
        }
    }
}

/// Handle to a registered observer; dropping it stops notifications
#[must_use = "dropping an ObserverHandle removes the observer"]
pub struct ObserverHandle {
    watcher: Weak<WatcherInner>,
    id: u64,
}

impl ObserverHandle {
    pub fn stop(self) {}
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.watcher.upgrade() {
            inner.remove_observer(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Reference;

    fn template() -> WatchTemplate {
        let mut template = WatchTemplate::new();
        template.watch_prop("p1", "name");
        template
    }

    fn name_change() -> Vec<UpdateEvent> {
        vec![UpdateEvent::updated(Reference::new("p1", "Person"), "name")]
    }

    fn age_change() -> Vec<UpdateEvent> {
        vec![UpdateEvent::updated(Reference::new("p1", "Person"), "age")]
    }

    #[test]
    fn test_decide_without_override() {
        assert_eq!(decide(&template(), None, &name_change()), Reaction::Patch);
        assert_eq!(decide(&template(), None, &age_change()), Reaction::Ignore);
    }

    #[test]
    fn test_decide_with_override() {
        let always: Relevance = Arc::new(|_: &[UpdateEvent]| Some(true));
        let never: Relevance = Arc::new(|_: &[UpdateEvent]| Some(false));
        let defer: Relevance = Arc::new(|_: &[UpdateEvent]| None);

        assert_eq!(decide(&template(), Some(&always), &name_change()), Reaction::Patch);
        assert_eq!(decide(&template(), Some(&always), &age_change()), Reaction::Refresh);
        assert_eq!(decide(&template(), Some(&never), &name_change()), Reaction::Ignore);
        assert_eq!(decide(&template(), Some(&defer), &name_change()), Reaction::Patch);
    }

    #[test]
    fn test_unobserved_policy_serde() {
        let policy: UnobservedPolicy = serde_yaml::from_str("keep-updating").unwrap();
        assert_eq!(policy, UnobservedPolicy::KeepUpdating);
        assert_eq!(UnobservedPolicy::default(), UnobservedPolicy::PauseUpdating);
    }
}
