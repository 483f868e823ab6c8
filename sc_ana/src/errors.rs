//! Error taxonomy of the pipeline

use crate::grouping::GroupingError;
use std::fmt::Display;

/// A pipeline failure, always tagged with the stage it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// Invalid options or an unsatisfiable stage plan. Raised before any stage executes.
    #[error("configuration error in {stage}: {reason}")]
    Configuration { stage: String, reason: String },

    /// The data cannot support the stage, e.g. too few cells to train on.
    #[error("data error in {stage}: {reason}")]
    Data { stage: String, reason: String },

    /// An external helper process crashed, ran out of memory or timed out.
    #[error("external process error in {stage}: {reason}")]
    ExternalProcess { stage: String, reason: String },
}

impl PipelineError {
    pub fn configuration(stage: impl Into<String>, reason: impl Display) -> Self {
        PipelineError::Configuration {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }

    pub fn stage(&self) -> &str {
        match self {
            PipelineError::Configuration { stage, .. }
            | PipelineError::Data { stage, .. }
            | PipelineError::ExternalProcess { stage, .. } => stage,
        }
    }

    /// Classify the error returned by a stage body.
    pub fn from_stage_failure(stage: &str, err: &anyhow::Error) -> Self {
        let reason = format!("{err:#}");
        let stage = stage.to_string();
        if err.chain().any(|e| e.is::<ExternalProcessError>()) {
            PipelineError::ExternalProcess { stage, reason }
        } else if err
            .chain()
            .any(|e| e.is::<GroupingError>() || e.is::<PipelineError>())
        {
            PipelineError::Configuration { stage, reason }
        } else {
            PipelineError::Data { stage, reason }
        }
    }
}

/// Raised by numeric helpers when the input cannot support the computation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct DataError(pub String);

impl DataError {
    pub fn new(reason: impl Display) -> Self {
        DataError(reason.to_string())
    }
}

/// Failure of an external helper process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExternalProcessError {
    #[error("could not launch {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("{command} exited with {status}: {stderr}")]
    Exited {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("{command} did not finish within {secs} s and was killed")]
    Timeout { command: String, secs: u64 },

    #[error("{command} wrote unusable output: {reason}")]
    BadOutput { command: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classify_stage_failure() {
        let err = anyhow::Error::new(ExternalProcessError::Timeout {
            command: "fa2".into(),
            secs: 3,
        })
        .context("polishing layout");
        let classified = PipelineError::from_stage_failure("net_fle", &err);
        assert!(matches!(classified, PipelineError::ExternalProcess { .. }));
        assert_eq!(classified.stage(), "net_fle");

        let err: anyhow::Result<()> = Err(DataError::new("too few cells")).context("training");
        let classified = PipelineError::from_stage_failure("net_umap", &err.unwrap_err());
        match classified {
            PipelineError::Data { stage, reason } => {
                assert_eq!(stage, "net_umap");
                assert!(reason.contains("too few cells"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
