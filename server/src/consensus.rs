//! Vote rules applied on top of the store: deduplicating submissions into
//! confirmations and retiring hazards once enough clients stopped seeing them.

use crate::store::{AreaQuery, Modification, PoiStore};
use log::{debug, info, warn};
use shared::{Poi, SERVICE_RADIUS_METERS};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsensusConfig {
    /// Radius in meters within which a submission confirms an existing report
    pub add_precision: f64,
    /// Radius in meters used to locate the report a `NOT_SEEN` refers to
    pub precision: f64,
    /// Refutations after which a report is removed
    pub delete_threshold: u32,
    /// Radius in meters of a `GET_INFOS` answer
    pub service_radius: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            add_precision: 500.0,
            precision: 500.0,
            delete_threshold: 3,
            service_radius: SERVICE_RADIUS_METERS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// No nearby report of that type existed; this one was stored
    Created(Poi),
    /// An existing report gained a confirmation
    Confirmed(Poi),
}

impl SubmitOutcome {
    pub fn poi(&self) -> &Poi {
        match self {
            SubmitOutcome::Created(poi) | SubmitOutcome::Confirmed(poi) => poi,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotSeenOutcome {
    /// Reports that gained a refutation and are still active
    pub refuted: Vec<Poi>,
    /// Reports that reached the threshold and moved to history
    pub removed: Vec<Poi>,
}

impl NotSeenOutcome {
    pub fn is_empty(&self) -> bool {
        self.refuted.is_empty() && self.removed.is_empty()
    }
}

/// Applies client votes to a shared [`PoiStore`].
///
/// Every decision runs inside one store transaction, so concurrent
/// submissions for the same spot cannot both conclude that nothing exists yet.
#[derive(Clone)]
pub struct ConsensusPolicy {
    store: Arc<PoiStore>,
    config: ConsensusConfig,
}

impl ConsensusPolicy {
    pub fn new(store: Arc<PoiStore>, config: ConsensusConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<PoiStore> {
        &self.store
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Records a hazard report.
    ///
    /// When a report of the same type lies within `add_precision`, the closest
    /// one gains a confirmation and the submitted value is discarded.
    /// Otherwise the submission is stored as a new report counting itself as
    /// its first confirmation.
    ///
    /// Only the closest match is confirmed, even when several reports lie
    /// within range; other nearby reports keep their counters.
    pub fn submit(&self, poi: Poi) -> SubmitOutcome {
        let query = AreaQuery::around(poi.latitude(), poi.longitude(), self.config.add_precision)
            .with_type(poi.poi_type());

        let outcome = self.store.transaction(|txn| {
            let closest = txn.pois_in_area(&query).into_iter().min_by(|a, b| {
                let da = a.distance_to(poi.latitude(), poi.longitude());
                let db = b.distance_to(poi.latitude(), poi.longitude());
                da.total_cmp(&db)
            });

            if let Some(existing) = closest {
                let confirmed = txn.modify(&existing, |p| {
                    p.confirm();
                    Modification::Keep
                });
                if let Some((updated, _)) = confirmed {
                    return SubmitOutcome::Confirmed(updated);
                }
            }

            let created = poi.with_counters(1, 0);
            txn.add(created.clone());
            SubmitOutcome::Created(created)
        });

        match &outcome {
            SubmitOutcome::Created(poi) => info!("New hazard: {}", poi),
            SubmitOutcome::Confirmed(poi) => debug!("Confirmed hazard: {}", poi),
        }
        outcome
    }

    /// Records that a client no longer sees a hazard.
    ///
    /// Every active report of the same type and creation date within
    /// `precision` gains a refutation; those reaching `delete_threshold` are
    /// removed. Finding nothing is not an error.
    pub fn not_seen(&self, poi: &Poi) -> NotSeenOutcome {
        let query = AreaQuery::around(poi.latitude(), poi.longitude(), self.config.precision)
            .with_type(poi.poi_type())
            .created_at(poi.created_at());
        let threshold = self.config.delete_threshold;

        let outcome = self.store.transaction(|txn| {
            let mut outcome = NotSeenOutcome::default();
            let changed = txn.modify_matching(&query, |p| {
                if p.refute() >= threshold {
                    Modification::Remove
                } else {
                    Modification::Keep
                }
            });
            for (p, modification) in changed {
                match modification {
                    Modification::Keep => outcome.refuted.push(p),
                    Modification::Remove => outcome.removed.push(p),
                }
            }
            outcome
        });

        if outcome.is_empty() {
            warn!("No active hazard matches NOT_SEEN for {}", poi);
        }
        for removed in &outcome.removed {
            info!("Removed hazard: {}", removed);
        }
        outcome
    }

    /// Active hazards within the service radius of a position
    pub fn infos_around(&self, latitude: f64, longitude: f64) -> Vec<Poi> {
        self.store
            .pois_in_area(&AreaQuery::around(latitude, longitude, self.config.service_radius))
    }
}
