use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::model::{ContractDetails, UNIT_KWH};

const DEVICE_DOMAIN: &str = "meter";
const DEVICE_CLASS_ENERGY: &str = "energy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    TotalIncreasing,
    Measurement,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<(String, String)>,
    pub manufacturer: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorDescriptor {
    pub unique_id: String,
    pub name: String,
    pub unit: &'static str,
    pub device_class: &'static str,
    pub state_class: StateClass,
    pub device: Option<DeviceInfo>,
}

impl SensorDescriptor {
    pub fn accumulated(base_name: &str, entry_id: &str, details: Option<&ContractDetails>) -> Self {
        Self::build(
            format!("{}_consumed", base_name.to_lowercase()),
            format!("{entry_id}-accumulated"),
            StateClass::TotalIncreasing,
            details,
        )
    }

    pub fn historical(base_name: &str, entry_id: &str, details: Option<&ContractDetails>) -> Self {
        Self::build(
            format!("{}_historical", base_name.to_lowercase()),
            format!("{entry_id}-historical"),
            StateClass::Measurement,
            details,
        )
    }

    fn build(
        name: String,
        unique_id: String,
        state_class: StateClass,
        details: Option<&ContractDetails>,
    ) -> Self {
        let device = details.map(|details| DeviceInfo {
            identifiers: vec![
                (DEVICE_DOMAIN.to_string(), unique_id.clone()),
                ("serial".to_string(), details.serial.clone()),
            ],
            manufacturer: details.manufacturer.clone(),
            name: name.clone(),
        });
        Self {
            unique_id,
            name,
            unit: UNIT_KWH,
            device_class: DEVICE_CLASS_ENERGY,
            state_class,
            device,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorSnapshot {
    #[serde(flatten)]
    pub descriptor: SensorDescriptor,
    pub value: Option<f64>,
    pub observed_at: Option<DateTime<Utc>>,
    pub last_reset: Option<DateTime<Utc>>,
    pub next_update_at: Option<DateTime<Utc>>,
}

impl SensorSnapshot {
    pub fn new(descriptor: SensorDescriptor) -> Self {
        Self {
            descriptor,
            value: None,
            observed_at: None,
            last_reset: None,
            next_update_at: None,
        }
    }
}

/// Latest state of every sensor, shared between the sensor runtimes and the HTTP surface.
#[derive(Clone, Default)]
pub struct Observations {
    sensors: Arc<RwLock<BTreeMap<String, SensorSnapshot>>>,
}

impl Observations {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, snapshot: SensorSnapshot) {
        let mut sensors = self.sensors.write().await;
        sensors.insert(snapshot.descriptor.unique_id.clone(), snapshot);
    }

    pub async fn update<F>(&self, unique_id: &str, apply: F)
    where
        F: FnOnce(&mut SensorSnapshot),
    {
        let mut sensors = self.sensors.write().await;
        if let Some(snapshot) = sensors.get_mut(unique_id) {
            apply(snapshot);
        }
    }

    pub async fn get(&self, unique_id: &str) -> Option<SensorSnapshot> {
        self.sensors.read().await.get(unique_id).cloned()
    }

    pub async fn all(&self) -> Vec<SensorSnapshot> {
        self.sensors.read().await.values().cloned().collect()
    }
}
