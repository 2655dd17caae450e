//! Authoritative collection of hazard reports.
//!
//! The store keeps the active reports and the history of removed ones behind a
//! single lock. Listener notification happens while that lock is held, so every
//! observer sees mutations in the order they were applied and never sees a
//! report in both sets, or in neither, at a notification point. Listeners must
//! return quickly and must not call back into the store.

use chrono::{DateTime, Utc};
use log::{error, warn};
use shared::{Poi, PoiType};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Change notification delivered to subscribed listeners
#[derive(Debug, Clone, PartialEq)]
pub enum PoiEvent {
    Added(Poi),
    Updated(Poi),
    Removed(Poi),
}

impl PoiEvent {
    pub fn poi(&self) -> &Poi {
        match self {
            PoiEvent::Added(poi) | PoiEvent::Updated(poi) | PoiEvent::Removed(poi) => poi,
        }
    }
}

#[derive(Debug, Error)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

/// Observer of store mutations
pub trait PoiListener: Send {
    fn on_event(&mut self, event: &PoiEvent) -> Result<(), ListenerError>;
}

impl<F> PoiListener for F
where
    F: FnMut(&PoiEvent) -> Result<(), ListenerError> + Send,
{
    fn on_event(&mut self, event: &PoiEvent) -> Result<(), ListenerError> {
        self(event)
    }
}

/// Forwards events into a channel so they can be consumed off the mutating
/// thread.
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<PoiEvent>,
}

impl ChannelListener {
    pub fn new(sender: mpsc::UnboundedSender<PoiEvent>) -> Self {
        Self { sender }
    }
}

impl PoiListener for ChannelListener {
    fn on_event(&mut self, event: &PoiEvent) -> Result<(), ListenerError> {
        self.sender
            .send(event.clone())
            .map_err(|_| ListenerError("event receiver dropped".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Proximity search over the active reports
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaQuery {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_meters: f64,
    pub poi_type: Option<PoiType>,
    pub created_at: Option<DateTime<Utc>>,
}

impl AreaQuery {
    pub fn around(latitude: f64, longitude: f64, radius_meters: f64) -> Self {
        Self {
            latitude,
            longitude,
            radius_meters,
            poi_type: None,
            created_at: None,
        }
    }

    pub fn with_type(mut self, poi_type: PoiType) -> Self {
        self.poi_type = Some(poi_type);
        self
    }

    /// Only match reports created at exactly this date
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn matches(&self, poi: &Poi) -> bool {
        self.poi_type.map_or(true, |t| poi.poi_type() == t)
            && self.created_at.map_or(true, |d| poi.created_at() == d)
            && poi.distance_to(self.latitude, self.longitude) <= self.radius_meters
    }
}

/// Both collections captured under one lock
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub active: Vec<Poi>,
    pub removed: Vec<Poi>,
}

/// Reports alive at a given date, for history browsing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryView {
    pub pois: Vec<Poi>,
    /// Earliest creation date among `pois`
    pub earliest: Option<DateTime<Utc>>,
}

/// What [`StoreTxn::modify`] should do with a report after changing it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modification {
    /// Keep it active and fire `Updated`
    Keep,
    /// Move it to the history and fire `Removed`
    Remove,
}

struct StoreState {
    active: Vec<Poi>,
    removed: Vec<Poi>,
    listeners: Vec<(ListenerId, Box<dyn PoiListener>)>,
    next_listener_id: u64,
}

impl StoreState {
    fn notify(&mut self, event: PoiEvent) {
        for (id, listener) in self.listeners.iter_mut() {
            match panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Listener {:?} failed on {:?}: {}", id, event, e),
                Err(_) => error!("Listener {:?} panicked on {:?}", id, event),
            }
        }
    }

    fn position(&self, poi: &Poi) -> Option<usize> {
        self.active.iter().position(|p| p.same_report(poi))
    }

    fn retire(&mut self, index: usize) -> Poi {
        let mut poi = self.active.remove(index);
        poi.mark_removed(Utc::now());
        self.removed.push(poi.clone());
        poi
    }
}

/// Store of active and removed hazard reports, safe to share between threads.
pub struct PoiStore {
    state: Mutex<StoreState>,
}

/// Exclusive access to the store for a multi-step operation.
///
/// Obtained through [`PoiStore::transaction`]; events fire as each step is
/// applied, still under the store lock.
pub struct StoreTxn<'a> {
    state: &'a mut StoreState,
}

impl<'a> StoreTxn<'a> {
    /// Appends a report to the active set
    pub fn add(&mut self, poi: Poi) {
        self.state.active.push(poi.clone());
        self.state.notify(PoiEvent::Added(poi));
    }

    /// Moves the active report with the same identity to the history,
    /// stamping its removal date.
    pub fn remove(&mut self, poi: &Poi) -> Option<Poi> {
        let index = self.state.position(poi)?;
        let removed = self.state.retire(index);
        self.state.notify(PoiEvent::Removed(removed.clone()));
        Some(removed)
    }

    /// Swaps an active report for an edited one. Fires `Removed(old)` then
    /// `Added(new)`; the old value does not enter the history.
    pub fn replace(&mut self, old: &Poi, new: Poi) -> bool {
        let index = match self.state.position(old) {
            Some(index) => index,
            None => return false,
        };
        let previous = self.state.active.remove(index);
        self.state.active.push(new.clone());
        self.state.notify(PoiEvent::Removed(previous));
        self.state.notify(PoiEvent::Added(new));
        true
    }

    /// Changes the active report with the same identity as `poi`, then keeps
    /// or removes it as `change` decides.
    pub fn modify<F>(&mut self, poi: &Poi, change: F) -> Option<(Poi, Modification)>
    where
        F: FnOnce(&mut Poi) -> Modification,
    {
        let index = self.state.position(poi)?;
        let modification = change(&mut self.state.active[index]);
        let result = match modification {
            Modification::Keep => {
                let updated = self.state.active[index].clone();
                self.state.notify(PoiEvent::Updated(updated.clone()));
                updated
            }
            Modification::Remove => {
                let removed = self.state.retire(index);
                self.state.notify(PoiEvent::Removed(removed.clone()));
                removed
            }
        };
        Some((result, modification))
    }

    /// Applies `change` to every active report matching `query`, in one pass.
    ///
    /// Reports sharing an identity are each changed once, unlike repeated
    /// calls to [`StoreTxn::modify`] which always land on the first of them.
    /// Returns the changed reports in store order.
    pub fn modify_matching<F>(
        &mut self,
        query: &AreaQuery,
        mut change: F,
    ) -> Vec<(Poi, Modification)>
    where
        F: FnMut(&mut Poi) -> Modification,
    {
        let mut changed = Vec::new();
        let mut index = 0;
        while index < self.state.active.len() {
            if !query.matches(&self.state.active[index]) {
                index += 1;
                continue;
            }
            let modification = change(&mut self.state.active[index]);
            let poi = match modification {
                Modification::Keep => {
                    let updated = self.state.active[index].clone();
                    self.state.notify(PoiEvent::Updated(updated.clone()));
                    index += 1;
                    updated
                }
                Modification::Remove => {
                    let removed = self.state.retire(index);
                    self.state.notify(PoiEvent::Removed(removed.clone()));
                    removed
                }
            };
            changed.push((poi, modification));
        }
        changed
    }

    pub fn pois_in_area(&self, query: &AreaQuery) -> Vec<Poi> {
        self.state
            .active
            .iter()
            .filter(|poi| query.matches(poi))
            .cloned()
            .collect()
    }
}

impl PoiStore {
    pub fn new() -> Self {
        Self::from_snapshot(StoreSnapshot::default())
    }

    /// Builds a store around previously saved collections. No events fire.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: Mutex::new(StoreState {
                active: snapshot.active,
                removed: snapshot.removed,
                listeners: Vec::new(),
                next_listener_id: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // Listener panics are caught, so a poisoned lock still guards
        // consistent collections.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with exclusive access to the store.
    pub fn transaction<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut StoreTxn<'_>) -> R,
    {
        let mut guard = self.lock();
        let mut txn = StoreTxn { state: &mut guard };
        f(&mut txn)
    }

    /// Registers a listener for every later mutation.
    ///
    /// The listener runs under the store lock. It must not call back into the
    /// store and should hand heavy work off to another thread.
    pub fn subscribe(&self, listener: Box<dyn PoiListener>) -> ListenerId {
        let mut state = self.lock();
        let id = ListenerId(state.next_listener_id);
        state.next_listener_id += 1;
        state.listeners.push((id, listener));
        id
    }

    /// Subscribes a channel and returns its receiving end
    pub fn subscribe_channel(&self) -> (ListenerId, mpsc::UnboundedReceiver<PoiEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.subscribe(Box::new(ChannelListener::new(sender)));
        (id, receiver)
    }

    /// Drops a listener. Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut state = self.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(listener_id, _)| *listener_id != id);
        state.listeners.len() != before
    }

    pub fn add(&self, poi: Poi) {
        self.transaction(|txn| txn.add(poi))
    }

    pub fn remove(&self, poi: &Poi) -> Option<Poi> {
        self.transaction(|txn| txn.remove(poi))
    }

    pub fn replace(&self, old: &Poi, new: Poi) -> bool {
        self.transaction(|txn| txn.replace(old, new))
    }

    pub fn pois_in_area(&self, query: &AreaQuery) -> Vec<Poi> {
        self.transaction(|txn| txn.pois_in_area(query))
    }

    /// Every report that existed at `cutoff`: created at or before it and, if
    /// removed, removed at or after it.
    pub fn all_as_of(&self, cutoff: DateTime<Utc>) -> HistoryView {
        let state = self.lock();
        let pois: Vec<Poi> = state
            .active
            .iter()
            .filter(|poi| poi.created_at() <= cutoff)
            .chain(state.removed.iter().filter(|poi| {
                poi.created_at() <= cutoff && poi.removed_at().map_or(true, |at| at >= cutoff)
            }))
            .cloned()
            .collect();
        let earliest = pois.iter().map(Poi::created_at).min();
        HistoryView { pois, earliest }
    }

    pub fn active(&self) -> Vec<Poi> {
        self.lock().active.clone()
    }

    pub fn removed(&self) -> Vec<Poi> {
        self.lock().removed.clone()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.lock();
        StoreSnapshot {
            active: state.active.clone(),
            removed: state.removed.clone(),
        }
    }

    /// Number of active reports
    pub fn len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().active.is_empty()
    }
}

impl Default for PoiStore {
    fn default() -> Self {
        Self::new()
    }
}
