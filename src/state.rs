use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStateKind {
    NotStarted,
    Ingesting,
    Transforming,
    Persisting,
    Completed,
    Failed,
}

impl RunStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStateKind::NotStarted => "not_started",
            RunStateKind::Ingesting => "ingesting",
            RunStateKind::Transforming => "transforming",
            RunStateKind::Persisting => "persisting",
            RunStateKind::Completed => "completed",
            RunStateKind::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    NotStarted,
    Ingesting,
    Transforming,
    Persisting,
    Completed,
    Failed { stage: RunStateKind, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Begin,
    Transform,
    Persist,
    Complete,
    Fail(String),
}

impl RunEvent {
    fn target(&self) -> RunStateKind {
        match self {
            RunEvent::Begin => RunStateKind::Ingesting,
            RunEvent::Transform => RunStateKind::Transforming,
            RunEvent::Persist => RunStateKind::Persisting,
            RunEvent::Complete => RunStateKind::Completed,
            RunEvent::Fail(_) => RunStateKind::Failed,
        }
    }
}

impl RunState {
    pub fn kind(&self) -> RunStateKind {
        match self {
            RunState::NotStarted => RunStateKind::NotStarted,
            RunState::Ingesting => RunStateKind::Ingesting,
            RunState::Transforming => RunStateKind::Transforming,
            RunState::Persisting => RunStateKind::Persisting,
            RunState::Completed => RunStateKind::Completed,
            RunState::Failed { .. } => RunStateKind::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed { .. })
    }

    pub fn transition(&self, event: RunEvent) -> Result<RunState, PipelineError> {
        let next = match (self, event) {
            (RunState::NotStarted, RunEvent::Begin) => RunState::Ingesting,
            (RunState::Ingesting, RunEvent::Transform) => RunState::Transforming,
            (RunState::Transforming, RunEvent::Persist) => RunState::Persisting,
            (RunState::Persisting, RunEvent::Complete) => RunState::Completed,
            (state, RunEvent::Fail(reason)) if !state.is_terminal() => RunState::Failed {
                stage: state.kind(),
                reason,
            },
            (state, event) => {
                return Err(PipelineError::InvalidTransition {
                    from: state.kind(),
                    to: event.target(),
                })
            }
        };
        Ok(next)
    }
}
