//! State machine for the pipeline controller
//!
//! All transitions go through `reduce()`, which returns the next state and
//! the effects the controller must run. Builds are tagged with a `setup_id`;
//! results carrying any other id are stale and never become the live pipeline.

use std::fmt;

use uuid::Uuid;

use crate::error::PipelineError;

/// Internal controller state. Only the controller task holds it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Idle,
    /// A build is in flight.
    Arming { setup_id: Uuid },
    Active { setup_id: Uuid },
}

impl State {
    pub fn observable(&self) -> PipelineState {
        match self {
            State::Idle | State::Arming { .. } => PipelineState::Uninitialized,
            State::Active { .. } => PipelineState::Active,
        }
    }
}

/// What observers see: a pipeline either exists or it does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Active,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Uninitialized => write!(f, "Uninitialized"),
            PipelineState::Active => write!(f, "Active"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    /// A caller asked for a pipeline.
    SetupRequested,
    /// A caller asked for teardown.
    ShutdownRequested,

    // Build results (include id to detect stale builds)
    BuildOk { id: Uuid },
    BuildFail { id: Uuid, err: PipelineError },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Begin constructing a pipeline tagged `id`.
    StartBuild { id: Uuid },
    /// Interrupt the in-flight build.
    CancelBuild { id: Uuid },
    /// Park the requesting caller until the in-flight build settles.
    QueueWaiter,
    /// Answer the requesting caller with the live handle.
    ReplyReady,
    /// Make the finished build `id` the live pipeline and answer all waiters.
    Publish { id: Uuid },
    /// Answer all waiters with an error.
    FailWaiters { err: PipelineError },
    /// Release a finished build that lost a race with shutdown.
    DiscardBuild { id: Uuid },
    /// Release the live pipeline and publish its absence.
    Teardown { id: Uuid },
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - A successful build with a stale id is discarded, never published
/// - Failed builds with a stale id are ignored
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle, SetupRequested) => {
            let id = Uuid::new_v4();
            (
                Arming { setup_id: id },
                vec![QueueWaiter, StartBuild { id }],
            )
        }
        (Idle, ShutdownRequested) => (Idle, vec![]),

        // -----------------
        // Arming
        // -----------------
        // Concurrent setup joins the in-flight build
        (Arming { .. }, SetupRequested) => (state.clone(), vec![QueueWaiter]),
        (Arming { setup_id }, BuildOk { id }) if *setup_id == id => {
            (Active { setup_id: id }, vec![Publish { id }])
        }
        (Arming { setup_id }, BuildFail { id, err }) if *setup_id == id => {
            (Idle, vec![FailWaiters { err }])
        }
        (Arming { setup_id }, ShutdownRequested) => (
            Idle,
            vec![
                CancelBuild { id: *setup_id },
                FailWaiters {
                    err: PipelineError::Cancelled,
                },
            ],
        ),

        // -----------------
        // Active
        // -----------------
        (Active { .. }, SetupRequested) => (state.clone(), vec![ReplyReady]),
        (Active { setup_id }, ShutdownRequested) => {
            (Idle, vec![Teardown { id: *setup_id }])
        }

        // -----------------
        // Stale build results
        // -----------------
        (_, BuildOk { id }) => (state.clone(), vec![DiscardBuild { id }]),
        (_, BuildFail { .. }) => (state.clone(), vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_setup_starts_build() {
        let (next, effects) = reduce(&State::Idle, Event::SetupRequested);
        let State::Arming { setup_id } = next else {
            panic!("expected Arming, got {:?}", next);
        };
        assert_eq!(
            effects,
            vec![Effect::QueueWaiter, Effect::StartBuild { id: setup_id }]
        );
    }

    #[test]
    fn idle_shutdown_is_noop() {
        let (next, effects) = reduce(&State::Idle, Event::ShutdownRequested);
        assert_eq!(next, State::Idle);
        assert!(effects.is_empty());
    }

    #[test]
    fn concurrent_setup_joins_build() {
        let id = Uuid::new_v4();
        let state = State::Arming { setup_id: id };
        let (next, effects) = reduce(&state, Event::SetupRequested);
        assert_eq!(next, state);
        // No second build
        assert_eq!(effects, vec![Effect::QueueWaiter]);
    }

    #[test]
    fn build_ok_publishes() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&State::Arming { setup_id: id }, Event::BuildOk { id });
        assert_eq!(next, State::Active { setup_id: id });
        assert_eq!(effects, vec![Effect::Publish { id }]);
    }

    #[test]
    fn build_fail_returns_to_idle() {
        let id = Uuid::new_v4();
        let err = PipelineError::CaptureUnavailable("denied".to_string());
        let (next, effects) = reduce(
            &State::Arming { setup_id: id },
            Event::BuildFail {
                id,
                err: err.clone(),
            },
        );
        assert_eq!(next, State::Idle);
        assert_eq!(effects, vec![Effect::FailWaiters { err }]);
    }

    #[test]
    fn active_setup_replies_with_existing() {
        let id = Uuid::new_v4();
        let state = State::Active { setup_id: id };
        let (next, effects) = reduce(&state, Event::SetupRequested);
        assert_eq!(next, state);
        assert_eq!(effects, vec![Effect::ReplyReady]);
    }

    #[test]
    fn active_shutdown_tears_down() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&State::Active { setup_id: id }, Event::ShutdownRequested);
        assert_eq!(next, State::Idle);
        assert_eq!(effects, vec![Effect::Teardown { id }]);
    }

    // =========================================================================
    // Shutdown racing setup
    // =========================================================================

    #[test]
    fn shutdown_during_arming_cancels_and_fails_waiters() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&State::Arming { setup_id: id }, Event::ShutdownRequested);
        assert_eq!(next, State::Idle);
        assert!(effects.contains(&Effect::CancelBuild { id }));
        assert!(effects.contains(&Effect::FailWaiters {
            err: PipelineError::Cancelled
        }));
    }

    #[test]
    fn stale_build_ok_is_discarded_not_published() {
        let stale = Uuid::new_v4();
        let (next, effects) = reduce(&State::Idle, Event::BuildOk { id: stale });
        assert_eq!(next, State::Idle);
        assert_eq!(effects, vec![Effect::DiscardBuild { id: stale }]);
    }

    #[test]
    fn stale_build_ok_does_not_replace_newer_build() {
        let current = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let state = State::Arming { setup_id: current };
        let (next, effects) = reduce(&state, Event::BuildOk { id: stale });
        assert_eq!(next, state);
        assert_eq!(effects, vec![Effect::DiscardBuild { id: stale }]);
    }

    #[test]
    fn stale_build_fail_is_ignored() {
        let current = Uuid::new_v4();
        let state = State::Active { setup_id: current };
        let (next, effects) = reduce(
            &state,
            Event::BuildFail {
                id: Uuid::new_v4(),
                err: PipelineError::Cancelled,
            },
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn observable_state_hides_arming() {
        assert_eq!(State::Idle.observable(), PipelineState::Uninitialized);
        assert_eq!(
            State::Arming {
                setup_id: Uuid::new_v4()
            }
            .observable(),
            PipelineState::Uninitialized
        );
        assert_eq!(
            State::Active {
                setup_id: Uuid::new_v4()
            }
            .observable(),
            PipelineState::Active
        );
    }
}
