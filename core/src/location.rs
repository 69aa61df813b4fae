//! Location history and circular geofences.

use crate::event::{EventBus, EventPayload};
use crate::log::PersistedLog;
use crate::storage::{load_or_default, save_or_log, KeyValueStore};
use crate::util::gen_id;
use crate::{Result, SosError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

pub const LOCATION_KEY: &str = "sos.locations";
pub const GEOFENCE_KEY: &str = "sos.geofences";
pub const MAX_HISTORY: usize = 100;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl LocationFix {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            accuracy_m: None,
            timestamp: Utc::now(),
        }
    }

    pub fn maps_url(&self) -> String {
        format!("https://maps.google.com/maps?q={},{}", self.lat, self.lng)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    pub radius_m: f64,
    pub created_at: DateTime<Utc>,
}

impl Geofence {
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        haversine_m(self.lat, self.lng, lat, lng) <= self.radius_m
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeofenceTransition {
    Entered(Geofence),
    Exited(Geofence),
}

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

pub struct LocationTracker {
    history: PersistedLog<LocationFix>,
    geofences: Vec<Geofence>,
    inside: HashSet<String>,
    store: Arc<dyn KeyValueStore>,
    bus: Option<Arc<EventBus>>,
}

impl LocationTracker {
    pub fn load(store: Arc<dyn KeyValueStore>, bus: Option<Arc<EventBus>>) -> Self {
        let geofences: Vec<Geofence> = load_or_default(store.as_ref(), GEOFENCE_KEY, "location");
        Self {
            history: PersistedLog::load(Arc::clone(&store), LOCATION_KEY, MAX_HISTORY),
            geofences,
            inside: HashSet::new(),
            store,
            bus,
        }
    }

    pub fn last_fix(&self) -> Option<&LocationFix> {
        self.history.log().last()
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<LocationFix> {
        self.history.log().iter().cloned().collect()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn geofences(&self) -> &[Geofence] {
        &self.geofences
    }

    pub fn add_geofence(&mut self, name: &str, lat: f64, lng: f64, radius_m: f64) -> Result<Geofence> {
        if !(radius_m > 0.0) {
            return Err(SosError::InvalidInput(format!(
                "geofence radius must be positive, got {}",
                radius_m
            )));
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(SosError::InvalidInput(format!(
                "invalid coordinates {}, {}",
                lat, lng
            )));
        }
        let fence = Geofence {
            id: gen_id("geofence"),
            name: name.to_string(),
            lat,
            lng,
            radius_m,
            created_at: Utc::now(),
        };
        self.geofences.push(fence.clone());
        self.save_geofences();
        Ok(fence)
    }

    pub fn remove_geofence(&mut self, id: &str) -> bool {
        let before = self.geofences.len();
        self.geofences.retain(|g| g.id != id);
        self.inside.remove(id);
        let removed = self.geofences.len() != before;
        if removed {
            self.save_geofences();
        }
        removed
    }

    /// Record a fix and report geofence boundary crossings relative to the
    /// previous fix.
    pub async fn update(&mut self, fix: LocationFix) -> Vec<GeofenceTransition> {
        self.history.push(fix.clone());

        let mut transitions = Vec::new();
        for fence in &self.geofences {
            let now_inside = fence.contains(fix.lat, fix.lng);
            let was_inside = self.inside.contains(&fence.id);
            match (was_inside, now_inside) {
                (false, true) => {
                    self.inside.insert(fence.id.clone());
                    info!(target: "location", geofence = %fence.name, "Entered geofence");
                    transitions.push(GeofenceTransition::Entered(fence.clone()));
                }
                (true, false) => {
                    self.inside.remove(&fence.id);
                    info!(target: "location", geofence = %fence.name, "Exited geofence");
                    transitions.push(GeofenceTransition::Exited(fence.clone()));
                }
                _ => {}
            }
        }

        if let Some(bus) = &self.bus {
            for t in &transitions {
                let payload = match t {
                    GeofenceTransition::Entered(g) => EventPayload::GeofenceEntered {
                        geofence: g.clone(),
                        fix: fix.clone(),
                    },
                    GeofenceTransition::Exited(g) => EventPayload::GeofenceExited {
                        geofence: g.clone(),
                        fix: fix.clone(),
                    },
                };
                bus.emit("location", payload).await;
            }
        }
        transitions
    }

    fn save_geofences(&self) {
        save_or_log(self.store.as_ref(), GEOFENCE_KEY, &self.geofences, "location");
    }
}
