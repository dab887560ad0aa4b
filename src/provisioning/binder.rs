//! Matching claims against existing volumes

use crate::domain::claim::{claim_access_modes, claim_class_name, requested_bytes};
use crate::domain::quantity::quantity_bytes;
use crate::domain::Selector;
use crate::error::Result;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};

/// Volume phases that can never be bound again
const UNBINDABLE_PHASES: [&str; 2] = ["Released", "Failed"];

/// Beta annotation carrying a volume's class
const BETA_VOLUME_CLASS_ANNOTATION: &str = "volume.beta.kubernetes.io/storage-class";

/// Whether `volume` is reserved for `claim` through its claim reference
pub fn is_prebound_to(volume: &PersistentVolume, claim: &PersistentVolumeClaim) -> bool {
    let Some(claim_ref) = volume.spec.as_ref().and_then(|s| s.claim_ref.as_ref()) else {
        return false;
    };
    let namespace = claim.metadata.namespace.as_deref().unwrap_or("default");
    if claim_ref.namespace.as_deref() != Some(namespace)
        || claim_ref.name != claim.metadata.name
    {
        return false;
    }
    match (&claim_ref.uid, &claim.metadata.uid) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// Class of a volume, empty when it has none
pub fn volume_class_name(volume: &PersistentVolume) -> String {
    volume
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.clone())
        .or_else(|| {
            volume
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(BETA_VOLUME_CLASS_ANNOTATION).cloned())
        })
        .unwrap_or_default()
}

fn volume_capacity(volume: &PersistentVolume) -> Result<u64> {
    match volume
        .spec
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"))
    {
        Some(q) => quantity_bytes(q),
        None => Ok(0),
    }
}

fn is_bindable(volume: &PersistentVolume) -> bool {
    let phase = volume.status.as_ref().and_then(|s| s.phase.as_deref());
    !matches!(phase, Some(p) if UNBINDABLE_PHASES.contains(&p))
}

/// Find an existing volume for `claim`
///
/// A volume pre-bound to the claim always wins. Otherwise the smallest free
/// volume with the claim's class, enough capacity, every requested access
/// mode and labels satisfying the claim's selector is chosen; ties go to the
/// lexically first name. A claim naming a volume only considers that volume.
pub fn find_matching_volume(
    claim: &PersistentVolumeClaim,
    volumes: &[PersistentVolume],
) -> Result<Option<PersistentVolume>> {
    if let Some(volume) = volumes
        .iter()
        .find(|v| is_bindable(v) && is_prebound_to(v, claim))
    {
        return Ok(Some(volume.clone()));
    }

    let spec = claim.spec.as_ref();
    let selector = Selector::from_optional(spec.and_then(|s| s.selector.as_ref()))?;
    let wanted_volume = spec.and_then(|s| s.volume_name.as_deref());
    let class = claim_class_name(claim).unwrap_or_default();
    let request = requested_bytes(claim)?;
    let modes = claim_access_modes(claim);

    let mut best: Option<(u64, &PersistentVolume)> = None;
    for volume in volumes {
        let free = volume
            .spec
            .as_ref()
            .map(|s| s.claim_ref.is_none())
            .unwrap_or(true);
        if !free || !is_bindable(volume) {
            continue;
        }
        if let Some(wanted) = wanted_volume {
            if volume.metadata.name.as_deref() != Some(wanted) {
                continue;
            }
        }
        if volume_class_name(volume) != class {
            continue;
        }
        if !selector.matches(volume.metadata.labels.as_ref()) {
            continue;
        }
        let offered: Vec<String> = volume
            .spec
            .as_ref()
            .and_then(|s| s.access_modes.clone())
            .unwrap_or_default();
        if !modes.iter().all(|m| offered.contains(m)) {
            continue;
        }
        let capacity = volume_capacity(volume)?;
        if capacity < request {
            continue;
        }

        let better = match best {
            None => true,
            Some((size, current)) => {
                capacity < size
                    || (capacity == size && volume.metadata.name < current.metadata.name)
            }
        };
        if better {
            best = Some((capacity, volume));
        }
    }

    Ok(best.map(|(_, v)| v.clone()))
}
