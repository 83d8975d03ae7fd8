//! Outcome vocabulary returned by user reconcilers

use std::time::Duration;

/// What to persist after a reconcile pass
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateOutcome<P> {
    /// Nothing to persist
    NoUpdate,
    /// Replace the whole resource, guarded by its resource version
    UpdateResource(P),
    /// Write only the status subresource, without the version guard
    UpdateStatus(P),
    /// Replace the resource, then write its status subresource
    UpdateResourceAndStatus(P),
}

/// Result of a user reconcile: what to persist and when to look again
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateControl<P> {
    outcome: UpdateOutcome<P>,
    reschedule_after: Option<Duration>,
}

impl<P> UpdateControl<P> {
    /// Persist nothing
    pub fn no_update() -> Self {
        Self::from_outcome(UpdateOutcome::NoUpdate)
    }

    /// Persist the full resource
    pub fn update_resource(resource: P) -> Self {
        Self::from_outcome(UpdateOutcome::UpdateResource(resource))
    }

    /// Persist only the status subresource
    pub fn update_status(resource: P) -> Self {
        Self::from_outcome(UpdateOutcome::UpdateStatus(resource))
    }

    /// Persist the full resource and then its status
    pub fn update_resource_and_status(resource: P) -> Self {
        Self::from_outcome(UpdateOutcome::UpdateResourceAndStatus(resource))
    }

    fn from_outcome(outcome: UpdateOutcome<P>) -> Self {
        Self {
            outcome,
            reschedule_after: None,
        }
    }

    /// Ask the scheduler to reconcile this resource again after `delay`
    pub fn reschedule_after(mut self, delay: Duration) -> Self {
        self.reschedule_after = Some(delay);
        self
    }

    /// The persistence outcome
    pub fn outcome(&self) -> &UpdateOutcome<P> {
        &self.outcome
    }

    /// Requested reschedule delay, if any
    pub fn reschedule_delay(&self) -> Option<Duration> {
        self.reschedule_after
    }

    /// Split into the persistence outcome and the reschedule delay
    pub fn into_parts(self) -> (UpdateOutcome<P>, Option<Duration>) {
        (self.outcome, self.reschedule_after)
    }
}

/// Result of a cleanup pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeleteControl {
    /// Cleanup is complete: remove the finalizer so the store can delete the resource
    #[default]
    DefaultDelete,
    /// Keep the finalizer; the resource stays until a later pass removes it
    NoFinalizerRemoval,
}

impl DeleteControl {
    /// Whether the finalizer should be removed
    pub fn removes_finalizer(&self) -> bool {
        matches!(self, DeleteControl::DefaultDelete)
    }
}
