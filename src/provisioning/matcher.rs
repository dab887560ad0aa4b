//! Storage class selection for unbound claims
//!
//! The candidate set is every class whose labels satisfy the claim's
//! selector. A default class among the candidates always wins; otherwise one
//! candidate is drawn uniformly at random. Candidates are sorted by name
//! before the draw so the outcome for a given seed never depends on the order
//! the classes were listed in.

use crate::domain::claim::claim_class_name;
use crate::domain::Selector;
use crate::error::Result;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Picks a storage class for a claim
pub struct StorageClassMatcher {
    rng: Mutex<StdRng>,
}

impl StorageClassMatcher {
    /// Matcher seeded from OS entropy
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Matcher with a fixed seed, for reproducible draws
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Classes eligible for `claim`, sorted by name
    ///
    /// A claim naming a class explicitly narrows the set to that class; a
    /// selector on the claim still has to match it.
    pub fn candidates<'a>(
        &self,
        claim: &PersistentVolumeClaim,
        classes: &'a [StorageClass],
    ) -> Result<Vec<&'a StorageClass>> {
        let selector = Selector::from_optional(
            claim.spec.as_ref().and_then(|s| s.selector.as_ref()),
        )?;
        let explicit = claim_class_name(claim);

        let mut candidates: Vec<&StorageClass> = classes
            .iter()
            .filter(|class| match &explicit {
                Some(name) => class.metadata.name.as_deref() == Some(name.as_str()),
                None => true,
            })
            .filter(|class| selector.matches(class.metadata.labels.as_ref()))
            .collect();
        candidates.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(candidates)
    }

    /// Choose a class for `claim`, or `None` when nothing matches
    ///
    /// Fails only when the claim's selector is malformed.
    pub fn select_class(
        &self,
        claim: &PersistentVolumeClaim,
        classes: &[StorageClass],
        default_class_name: Option<&str>,
    ) -> Result<Option<StorageClass>> {
        let candidates = self.candidates(claim, classes)?;
        if candidates.is_empty() {
            return Ok(None);
        }

        if let Some(default) = default_class_name {
            if let Some(class) = candidates
                .iter()
                .find(|c| c.metadata.name.as_deref() == Some(default))
            {
                debug!("Default class {} is a candidate", default);
                return Ok(Some((*class).clone()));
            }
        }

        let index = self.rng.lock().gen_range(0..candidates.len());
        Ok(Some(candidates[index].clone()))
    }
}

impl Default for StorageClassMatcher {
    fn default() -> Self {
        Self::new()
    }
}
