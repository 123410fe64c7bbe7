use crate::ResourceUsage;

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictKind {
    #[serde(rename = "AC")]
    Accepted,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "MLE")]
    MemoryLimitExceeded,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "CE")]
    CompileError,
    #[serde(rename = "SE")]
    SystemError,
}

impl VerdictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VerdictKind::Accepted => "AC",
            VerdictKind::WrongAnswer => "WA",
            VerdictKind::TimeLimitExceeded => "TLE",
            VerdictKind::MemoryLimitExceeded => "MLE",
            VerdictKind::RuntimeError => "RE",
            VerdictKind::CompileError => "CE",
            VerdictKind::SystemError => "SE",
        }
    }
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub kind: VerdictKind,
    pub message: String,
    pub usage: ResourceUsage,
}

impl Verdict {
    pub fn new(kind: VerdictKind, message: impl Into<String>, usage: ResourceUsage) -> Self {
        Self {
            kind,
            message: message.into(),
            usage,
        }
    }

    pub fn accepted(usage: ResourceUsage) -> Self {
        Self::new(VerdictKind::Accepted, "", usage)
    }

    pub fn wrong_answer(message: impl Into<String>, usage: ResourceUsage) -> Self {
        Self::new(VerdictKind::WrongAnswer, message, usage)
    }

    pub fn time_limit(message: impl Into<String>, usage: ResourceUsage) -> Self {
        Self::new(VerdictKind::TimeLimitExceeded, message, usage)
    }

    pub fn memory_limit(message: impl Into<String>, usage: ResourceUsage) -> Self {
        Self::new(VerdictKind::MemoryLimitExceeded, message, usage)
    }

    pub fn runtime_error(message: impl Into<String>, usage: ResourceUsage) -> Self {
        Self::new(VerdictKind::RuntimeError, message, usage)
    }

    pub fn compile_error(message: impl Into<String>) -> Self {
        Self::new(VerdictKind::CompileError, message, ResourceUsage::default())
    }

    /// The judge itself failed; nothing was measured.
    pub fn system_error(message: impl Into<String>) -> Self {
        Self::new(VerdictKind::SystemError, message, ResourceUsage::default())
    }

    /// Whether the verdict counts against the submission.
    pub fn is_submitter_fault(&self) -> bool {
        !matches!(
            self.kind,
            VerdictKind::Accepted | VerdictKind::SystemError
        )
    }
}

/// What the supervisor learned from one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Exited cleanly within limits; the output decides.
    Completed(ResourceUsage),
    Terminal(Verdict),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_tags() {
        let json = serde_json::to_string(&VerdictKind::TimeLimitExceeded).unwrap();
        assert_eq!(json, "\"TLE\"");
        for kind in [
            VerdictKind::Accepted,
            VerdictKind::WrongAnswer,
            VerdictKind::MemoryLimitExceeded,
            VerdictKind::RuntimeError,
            VerdictKind::CompileError,
            VerdictKind::SystemError,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn system_error_is_not_billed() {
        assert!(!Verdict::system_error("boom").is_submitter_fault());
        assert!(!Verdict::accepted(ResourceUsage::default()).is_submitter_fault());
        assert!(Verdict::compile_error("x").is_submitter_fault());
        assert!(Verdict::runtime_error("x", ResourceUsage::default()).is_submitter_fault());
    }
}
