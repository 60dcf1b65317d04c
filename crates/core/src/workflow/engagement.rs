use crate::error::{TransitionError, TransitionResult};
use crate::types::TargetId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Targets currently owned by an in-flight run
#[derive(Default)]
pub struct EngagedTargets {
    engaged: Mutex<HashSet<TargetId>>,
}

impl EngagedTargets {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<TargetId>> {
        // The set stays consistent even if a holder panicked
        self.engaged.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim every target of a batch, or none of them
    pub fn engage(self: &Arc<Self>, ids: &[TargetId]) -> TransitionResult<Engagement> {
        let mut engaged = self.lock();
        if let Some(busy) = ids.iter().find(|id| engaged.contains(*id)) {
            return Err(TransitionError::TargetBusy(busy.clone()));
        }
        engaged.extend(ids.iter().cloned());

        Ok(Engagement {
            owner: self.clone(),
            ids: ids.to_vec(),
        })
    }

    pub fn is_engaged(&self, id: &TargetId) -> bool {
        self.lock().contains(id)
    }
}

/// Releases its targets when dropped
pub struct Engagement {
    owner: Arc<EngagedTargets>,
    ids: Vec<TargetId>,
}

impl Drop for Engagement {
    fn drop(&mut self) {
        let mut engaged = self.owner.lock();
        for id in &self.ids {
            engaged.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<TargetId> {
        names.iter().map(|n| TargetId::new(*n)).collect()
    }

    #[test]
    fn test_overlapping_batch_rejected() {
        let engaged = Arc::new(EngagedTargets::new());
        let _first = engaged.engage(&ids(&["a", "b"])).unwrap();

        let err = engaged.engage(&ids(&["c", "b"])).err().unwrap();
        assert!(matches!(err, TransitionError::TargetBusy(id) if id.0 == "b"));
        // A rejected claim takes nothing
        assert!(!engaged.is_engaged(&TargetId::new("c")));

        assert!(engaged.engage(&ids(&["c", "d"])).is_ok());
    }

    #[test]
    fn test_drop_releases_targets() {
        let engaged = Arc::new(EngagedTargets::new());
        {
            let _guard = engaged.engage(&ids(&["a"])).unwrap();
            assert!(engaged.is_engaged(&TargetId::new("a")));
        }
        assert!(!engaged.is_engaged(&TargetId::new("a")));
        assert!(engaged.engage(&ids(&["a"])).is_ok());
    }
}
