use tracing::{error, trace};
use uuid::Uuid;

/// Position of an event in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Received,
    Deduplicated,
    PreHooked,
    Resolved,
    Merging,
    PropertiesUpdated,
    Emitted,
    PostHooked,
    Done,
    Dropped,
    Overflowed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Received => "received",
            PipelineState::Deduplicated => "deduplicated",
            PipelineState::PreHooked => "pre_hooked",
            PipelineState::Resolved => "resolved",
            PipelineState::Merging => "merging",
            PipelineState::PropertiesUpdated => "properties_updated",
            PipelineState::Emitted => "emitted",
            PipelineState::PostHooked => "post_hooked",
            PipelineState::Done => "done",
            PipelineState::Dropped => "dropped",
            PipelineState::Overflowed => "overflowed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Done | PipelineState::Dropped | PipelineState::Overflowed
        )
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        match (self, next) {
            // Duplicates are dropped on receipt, vetoes once the pre-hook has run.
            (PipelineState::Received | PipelineState::PreHooked, PipelineState::Dropped) => true,
            (state, PipelineState::Overflowed) => !state.is_terminal(),
            (PipelineState::Received, PipelineState::Deduplicated)
            | (PipelineState::Deduplicated, PipelineState::PreHooked)
            | (PipelineState::PreHooked, PipelineState::Resolved)
            | (PipelineState::Resolved, PipelineState::Merging)
            | (PipelineState::Resolved, PipelineState::PropertiesUpdated)
            | (PipelineState::Merging, PipelineState::PropertiesUpdated)
            | (PipelineState::PropertiesUpdated, PipelineState::Emitted)
            | (PipelineState::Emitted, PipelineState::PostHooked)
            | (PipelineState::PostHooked, PipelineState::Done) => true,
            _ => false,
        }
    }
}

/// Tracks the states one event passes through.
#[derive(Debug, Clone)]
pub struct EventProgress {
    uuid: Uuid,
    history: Vec<PipelineState>,
}

impl EventProgress {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            history: vec![PipelineState::Received],
        }
    }

    pub fn state(&self) -> PipelineState {
        self.history
            .last()
            .copied()
            .unwrap_or(PipelineState::Received)
    }

    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    /// Move to `next`. Invalid transitions are logged and ignored.
    pub fn advance(&mut self, next: PipelineState) -> bool {
        let current = self.state();
        if !current.can_transition_to(next) {
            error!(
                event_uuid = %self.uuid,
                from = current.as_str(),
                to = next.as_str(),
                "invalid pipeline transition"
            );
            debug_assert!(false, "invalid pipeline transition {current:?} -> {next:?}");
            return false;
        }

        trace!(event_uuid = %self.uuid, from = current.as_str(), to = next.as_str(), "pipeline transition");
        self.history.push(next);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_with_merge_is_valid() {
        let mut progress = EventProgress::new(Uuid::now_v7());
        for state in [
            PipelineState::Deduplicated,
            PipelineState::PreHooked,
            PipelineState::Resolved,
            PipelineState::Merging,
            PipelineState::PropertiesUpdated,
            PipelineState::Emitted,
            PipelineState::PostHooked,
            PipelineState::Done,
        ] {
            assert!(progress.advance(state), "{state:?} should be reachable");
        }

        assert_eq!(progress.state(), PipelineState::Done);
        assert_eq!(progress.history().len(), 9);
    }

    #[test]
    fn test_vetoed_event_is_dropped_after_the_pre_hook() {
        let mut progress = EventProgress::new(Uuid::now_v7());
        assert!(progress.advance(PipelineState::Deduplicated));
        assert!(progress.advance(PipelineState::PreHooked));
        assert!(progress.advance(PipelineState::Dropped));

        assert_eq!(
            progress.history(),
            &[
                PipelineState::Received,
                PipelineState::Deduplicated,
                PipelineState::PreHooked,
                PipelineState::Dropped,
            ]
        );
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        for terminal in [
            PipelineState::Done,
            PipelineState::Dropped,
            PipelineState::Overflowed,
        ] {
            assert!(!terminal.can_transition_to(PipelineState::Overflowed));
            assert!(!terminal.can_transition_to(PipelineState::Dropped));
            assert!(!terminal.can_transition_to(PipelineState::Received));
        }
    }

    #[test]
    fn test_drops_only_happen_before_resolution() {
        assert!(PipelineState::Received.can_transition_to(PipelineState::Dropped));
        assert!(PipelineState::PreHooked.can_transition_to(PipelineState::Dropped));
        assert!(!PipelineState::Deduplicated.can_transition_to(PipelineState::Dropped));
        assert!(!PipelineState::Resolved.can_transition_to(PipelineState::Dropped));
        assert!(!PipelineState::Emitted.can_transition_to(PipelineState::Dropped));
    }

    #[test]
    fn test_any_live_state_can_overflow() {
        assert!(PipelineState::PreHooked.can_transition_to(PipelineState::Overflowed));
        assert!(PipelineState::PropertiesUpdated.can_transition_to(PipelineState::Overflowed));
    }

    #[test]
    fn test_steps_cannot_be_skipped() {
        assert!(!PipelineState::PreHooked.can_transition_to(PipelineState::Emitted));
        assert!(!PipelineState::Received.can_transition_to(PipelineState::Resolved));
    }

    #[test]
    fn test_merging_sits_between_resolution_and_property_updates() {
        assert!(PipelineState::Resolved.can_transition_to(PipelineState::Merging));
        assert!(PipelineState::Merging.can_transition_to(PipelineState::PropertiesUpdated));
        assert!(!PipelineState::PreHooked.can_transition_to(PipelineState::Merging));
        assert!(!PipelineState::Merging.can_transition_to(PipelineState::Resolved));
    }
}
