//! Provisioning Events
//!
//! Events published against a claim as it moves through provisioning.

use crate::domain::ports::EventType;
use serde::{Deserialize, Serialize};

/// Events emitted by the provisioning controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningEvent {
    /// A backing volume was created and its object persisted
    Provisioned { volume: String, provisioner: String },

    /// The claim was bound to a volume
    Bound { volume: String },

    /// No provisionable plugin is registered for the class's provisioner
    ProvisionerMissing { class: String, provisioner: String },

    /// The provisioner could not create a backing volume
    ProvisioningFailed { class: String, reason: String },

    /// The volume object could not be persisted; its backing volume was released
    VolumeCreationFailed {
        volume: String,
        attempts: u32,
        reason: String,
    },

    /// Releasing an orphaned backing volume failed
    CleanupFailed { volume: String, reason: String },
}

impl ProvisioningEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            ProvisioningEvent::Provisioned { .. } | ProvisioningEvent::Bound { .. } => {
                EventType::Normal
            }
            _ => EventType::Warning,
        }
    }

    /// Machine-readable reason, as shown in `kubectl describe`
    pub fn reason(&self) -> &'static str {
        match self {
            ProvisioningEvent::Provisioned { .. } => "ProvisioningSucceeded",
            ProvisioningEvent::Bound { .. } => "VolumeBound",
            ProvisioningEvent::ProvisionerMissing { .. } => "ProvisioningFailed",
            ProvisioningEvent::ProvisioningFailed { .. } => "ProvisioningFailed",
            ProvisioningEvent::VolumeCreationFailed { .. } => "ProvisioningFailed",
            ProvisioningEvent::CleanupFailed { .. } => "ProvisioningCleanupFailed",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ProvisioningEvent::Provisioned {
                volume,
                provisioner,
            } => format!("Successfully provisioned volume {} using {}", volume, provisioner),
            ProvisioningEvent::Bound { volume } => format!("Bound to volume {}", volume),
            ProvisioningEvent::ProvisionerMissing { class, provisioner } => format!(
                "no volume plugin matched provisioner {:?} of storage class {}",
                provisioner, class
            ),
            ProvisioningEvent::ProvisioningFailed { class, reason } => format!(
                "Failed to provision volume with StorageClass {:?}: {}",
                class, reason
            ),
            ProvisioningEvent::VolumeCreationFailed {
                volume,
                attempts,
                reason,
            } => format!(
                "Error creating provisioned PV object {} after {} attempts: {}. Deleted the provisioned volume",
                volume, attempts, reason
            ),
            ProvisioningEvent::CleanupFailed { volume, reason } => format!(
                "Error cleaning provisioned volume {}: {}. Please delete it manually",
                volume, reason
            ),
        }
    }

    /// Whether this event reports a failure
    pub fn is_failure(&self) -> bool {
        self.event_type() == EventType::Warning
    }
}
