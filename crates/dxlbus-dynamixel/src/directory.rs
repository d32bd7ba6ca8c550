//! MotorDirectory -- the set of motors known to be on the bus.
//!
//! Motors enter the directory either through broadcast discovery, which
//! replaces the whole directory, or through explicit registration (for
//! example from a configuration file). Each entry is bound to the
//! [`RegisterSchema`] of its model.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use dxlbus_core::error::{Error, Result};
use dxlbus_core::types::MotorId;

use crate::bus::BusChannel;
use crate::instructions::ModelInfo;
use crate::models::{RegisterSchema, model_tag_for_number};

/// One motor on the bus.
#[derive(Debug, Clone)]
pub struct Motor {
    id: MotorId,
    schema: Arc<RegisterSchema>,
    info: Option<ModelInfo>,
    selected: bool,
}

impl Motor {
    /// Bind a motor ID to a model tag. Fails with `UnsupportedModel` if the
    /// model has no register schema.
    pub fn new(id: MotorId, model: &str) -> Result<Self> {
        Ok(Motor {
            id,
            schema: RegisterSchema::for_model(model)?,
            info: None,
            selected: false,
        })
    }

    pub fn id(&self) -> MotorId {
        self.id
    }

    /// Canonical model tag, e.g. `X_SERIES`.
    pub fn model(&self) -> &str {
        self.schema.model()
    }

    pub fn schema(&self) -> &RegisterSchema {
        &self.schema
    }

    /// Model number and firmware reported by ping, for discovered motors.
    pub fn info(&self) -> Option<ModelInfo> {
        self.info
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }
}

/// A device that answered discovery but could not be added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDevice {
    pub id: MotorId,
    pub model_number: u16,
    pub reason: String,
}

/// Outcome of a discovery scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// IDs added to the directory, ascending.
    pub found: Vec<MotorId>,
    /// Devices that answered but have no usable register schema.
    pub skipped: Vec<SkippedDevice>,
}

/// Ordered collection of motors keyed by ID.
#[derive(Debug, Default)]
pub struct MotorDirectory {
    motors: BTreeMap<MotorId, Motor>,
}

impl MotorDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan the bus with a broadcast ping and replace the directory with
    /// what answered.
    ///
    /// On a communication error the directory is left untouched. Devices
    /// whose model number maps to no supported schema are skipped and
    /// listed in the report.
    pub async fn discover(&mut self, bus: &BusChannel) -> Result<DiscoveryReport> {
        let answered = bus.broadcast_discover().await?;

        let mut motors = BTreeMap::new();
        let mut report = DiscoveryReport::default();
        for (id, info) in answered {
            let motor = model_tag_for_number(info.model_number)
                .ok_or_else(|| Error::UnsupportedModel(format!("model number {}", info.model_number)))
                .and_then(|tag| Motor::new(id, tag));
            match motor {
                Ok(mut motor) => {
                    motor.info = Some(info);
                    motors.insert(id, motor);
                    report.found.push(id);
                }
                Err(e) => {
                    warn!(id = id.get(), model_number = info.model_number, error = %e, "skipping device");
                    report.skipped.push(SkippedDevice {
                        id,
                        model_number: info.model_number,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            found = report.found.len(),
            skipped = report.skipped.len(),
            "discovery complete"
        );
        self.motors = motors;
        Ok(report)
    }

    /// Add or replace a motor explicitly.
    pub fn register(&mut self, id: MotorId, model: &str) -> Result<&Motor> {
        let motor = Motor::new(id, model)?;
        self.motors.insert(id, motor);
        self.resolve(id)
    }

    /// Motors matching `predicate`, in ID order. May be empty.
    pub fn select(&self, predicate: impl Fn(&Motor) -> bool) -> Vec<Motor> {
        self.motors.values().filter(|m| predicate(m)).cloned().collect()
    }

    pub fn resolve(&self, id: MotorId) -> Result<&Motor> {
        self.motors.get(&id).ok_or(Error::MotorConfigNotFound(id))
    }

    /// Resolve several IDs, failing on the first one that is missing.
    pub fn resolve_all(&self, ids: &[MotorId]) -> Result<Vec<&Motor>> {
        ids.iter().map(|&id| self.resolve(id)).collect()
    }

    pub fn set_selected(&mut self, id: MotorId, selected: bool) -> Result<()> {
        let motor = self
            .motors
            .get_mut(&id)
            .ok_or(Error::MotorConfigNotFound(id))?;
        motor.selected = selected;
        Ok(())
    }

    /// IDs of selected motors, ascending.
    pub fn selected(&self) -> Vec<MotorId> {
        self.motors
            .values()
            .filter(|m| m.selected)
            .map(|m| m.id)
            .collect()
    }

    pub fn clear(&mut self) {
        self.motors.clear();
    }

    pub fn len(&self) -> usize {
        self.motors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.motors.is_empty()
    }

    /// All IDs, ascending.
    pub fn ids(&self) -> Vec<MotorId> {
        self.motors.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Motor> {
        self.motors.values()
    }
}
