// Signal status domain model
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusResult {
    Ready,
    Busy,
    /// Terminal: the node can never be evaluated.
    Invalid,
    Fail,
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Init,
    DataAccess,
    Processing,
}

/// Outcome of the last operation on a signal node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusInfo {
    pub result: StatusResult,
    pub stage: Stage,
    pub num_points: usize,
    pub message: String,
}

impl StatusInfo {
    pub fn new(result: StatusResult, stage: Stage) -> Self {
        Self {
            result,
            stage,
            num_points: 0,
            message: String::new(),
        }
    }

    pub fn init() -> Self {
        Self::new(StatusResult::Ready, Stage::Init)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(StatusResult::Invalid, Stage::Init).with_message(message)
    }

    pub fn busy(stage: Stage) -> Self {
        Self::new(StatusResult::Busy, stage)
    }

    pub fn success(stage: Stage, num_points: usize) -> Self {
        Self {
            num_points,
            ..Self::new(StatusResult::Success, stage)
        }
    }

    pub fn fail(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(StatusResult::Fail, stage).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn is_busy(&self) -> bool {
        self.result == StatusResult::Busy
    }

    pub fn is_invalid(&self) -> bool {
        self.result == StatusResult::Invalid
    }

    pub fn is_fail(&self) -> bool {
        self.result == StatusResult::Fail
    }

    pub fn is_success(&self) -> bool {
        self.result == StatusResult::Success
    }
}

impl fmt::Display for StatusInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.result, self.stage)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}
