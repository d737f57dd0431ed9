//! Retry controller state machine.
//!
//! The whole generate/retry/escalate/revise policy for one stage is a pure
//! transition function `step(limits, state, event) -> (state, effects)`. The
//! executor interprets the returned effects and feeds the results back in as
//! events, so every control path is enumerable in tests without a backend.
//!
//! `Pending -> Generating -> Parsing -> Normalizing -> Validating ->
//! {Accepted | Retrying | Escalating} -> Revising -> Validating ->
//! {Accepted | Fatal}`

/// Generation and revision budgets for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLimits {
    pub max_generation_attempts: u32,
    pub max_revision_attempts: u32,
}

/// Which pass produced the candidate currently moving through
/// parse/normalize/validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Generation,
    /// `errors_before` is the error count this revision set out to fix.
    /// `None` when escalation came from a parse failure, where there was no
    /// validated error set to compare against.
    Revision { errors_before: Option<usize> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    /// First generation attempt in flight.
    Generating { attempt: u32 },
    /// A re-generation attempt in flight after a failed attempt.
    Retrying { attempt: u32 },
    Parsing { phase: Phase, attempt: u32 },
    Normalizing { phase: Phase, attempt: u32 },
    Validating { phase: Phase, attempt: u32 },
    /// Generation budget exhausted; the first revision is in flight.
    Escalating { errors_before: Option<usize> },
    /// A subsequent revision attempt in flight.
    Revising { attempt: u32, errors_before: Option<usize> },
    Accepted,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptEvent {
    Start,
    /// The backend returned text.
    BackendResponded,
    /// Timeout, or a transient failure that survived its own bounded
    /// backoff retries. Counts against the attempt budget exactly like a
    /// parse failure.
    BackendFailed,
    ParseSucceeded,
    ParseFailed,
    Normalized,
    ValidationPassed,
    ValidationFailed { error_count: usize },
}

/// What the executor must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Generate { attempt: u32 },
    Parse,
    Normalize { final_attempt: bool },
    Validate,
    Revise { attempt: u32 },
    Accept,
    Fail,
}

/// Advance the machine by one event.
///
/// An event that makes no sense in the current state leaves the state
/// unchanged with no effects; the driver supplies events in response to
/// effects, so such pairings indicate a driver bug, not a policy decision.
pub fn step(
    limits: &StageLimits,
    state: AttemptState,
    event: AttemptEvent,
) -> (AttemptState, Vec<Effect>) {
    use AttemptEvent as E;
    use AttemptState as S;

    match (state, event) {
        (S::Pending, E::Start) => (
            S::Generating { attempt: 1 },
            vec![Effect::Generate { attempt: 1 }],
        ),

        // --- generation attempts -------------------------------------------
        (S::Generating { attempt } | S::Retrying { attempt }, E::BackendResponded) => (
            S::Parsing {
                phase: Phase::Generation,
                attempt,
            },
            vec![Effect::Parse],
        ),
        (S::Generating { attempt } | S::Retrying { attempt }, E::BackendFailed) => {
            retry_or_escalate(limits, attempt, None)
        }
        (
            S::Parsing {
                phase: Phase::Generation,
                attempt,
            },
            E::ParseFailed,
        ) => retry_or_escalate(limits, attempt, None),

        // --- revision attempts ---------------------------------------------
        (S::Escalating { errors_before }, E::BackendResponded) => (
            S::Parsing {
                phase: Phase::Revision { errors_before },
                attempt: 1,
            },
            vec![Effect::Parse],
        ),
        (S::Escalating { errors_before }, E::BackendFailed) => {
            revise_or_fail(limits, 1, errors_before)
        }
        (
            S::Revising {
                attempt,
                errors_before,
            },
            E::BackendResponded,
        ) => (
            S::Parsing {
                phase: Phase::Revision { errors_before },
                attempt,
            },
            vec![Effect::Parse],
        ),
        (
            S::Revising {
                attempt,
                errors_before,
            },
            E::BackendFailed,
        ) => revise_or_fail(limits, attempt, errors_before),
        (
            S::Parsing {
                phase: Phase::Revision { errors_before },
                attempt,
            },
            E::ParseFailed,
        ) => revise_or_fail(limits, attempt, errors_before),

        // --- shared parse/normalize/validate path --------------------------
        (S::Parsing { phase, attempt }, E::ParseSucceeded) => (
            S::Normalizing { phase, attempt },
            vec![Effect::Normalize {
                final_attempt: is_final(limits, phase, attempt),
            }],
        ),
        (S::Normalizing { phase, attempt }, E::Normalized) => {
            (S::Validating { phase, attempt }, vec![Effect::Validate])
        }
        (S::Validating { .. }, E::ValidationPassed) => (S::Accepted, vec![Effect::Accept]),
        (
            S::Validating {
                phase: Phase::Generation,
                attempt,
            },
            E::ValidationFailed { error_count },
        ) => retry_or_escalate(limits, attempt, Some(error_count)),
        (
            S::Validating {
                phase: Phase::Revision { errors_before },
                attempt,
            },
            E::ValidationFailed { error_count },
        ) => {
            // A revision must never grow the error set.
            if errors_before.is_some_and(|before| error_count > before) {
                (S::Fatal, vec![Effect::Fail])
            } else {
                revise_or_fail(limits, attempt, Some(error_count))
            }
        }

        (state, _) => (state, Vec::new()),
    }
}

fn retry_or_escalate(
    limits: &StageLimits,
    attempt: u32,
    errors: Option<usize>,
) -> (AttemptState, Vec<Effect>) {
    if attempt < limits.max_generation_attempts {
        let next = attempt + 1;
        (
            AttemptState::Retrying { attempt: next },
            vec![Effect::Generate { attempt: next }],
        )
    } else if limits.max_revision_attempts == 0 {
        (AttemptState::Fatal, vec![Effect::Fail])
    } else {
        (
            AttemptState::Escalating {
                errors_before: errors,
            },
            vec![Effect::Revise { attempt: 1 }],
        )
    }
}

fn revise_or_fail(
    limits: &StageLimits,
    attempt: u32,
    errors_before: Option<usize>,
) -> (AttemptState, Vec<Effect>) {
    if attempt < limits.max_revision_attempts {
        let next = attempt + 1;
        (
            AttemptState::Revising {
                attempt: next,
                errors_before,
            },
            vec![Effect::Revise { attempt: next }],
        )
    } else {
        (AttemptState::Fatal, vec![Effect::Fail])
    }
}

/// Placeholder padding is permitted only on the last attempt of the current
/// envelope, generation or revision.
fn is_final(limits: &StageLimits, phase: Phase, attempt: u32) -> bool {
    match phase {
        Phase::Generation => attempt >= limits.max_generation_attempts,
        Phase::Revision { .. } => attempt >= limits.max_revision_attempts,
    }
}
