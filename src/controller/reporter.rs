//! Stack output reporting

use std::io::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, FailureKind, Result};
use crate::model::ExecutionResult;

/// Default key under which the post-provision value is published
pub const DEFAULT_OUTPUT_KEY: &str = "demo-output";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `key = value`
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// A published stack-level output
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackOutput {
    pub key: String,
    pub value: String,
    pub reported_at: DateTime<Utc>,
}

/// Writes execution results to a sink. Holds no state between reports and
/// never retries.
pub struct OutputReporter<W: Write> {
    writer: W,
    key: String,
    format: OutputFormat,
}

impl<W: Write> OutputReporter<W> {
    pub fn new(writer: W, key: impl Into<String>, format: OutputFormat) -> Self {
        Self {
            writer,
            key: key.into(),
            format,
        }
    }

    /// Publish a successful result. A failed result is returned as an error
    /// carrying its failure kind, and nothing is written.
    pub fn report(&mut self, result: &ExecutionResult) -> Result<StackOutput> {
        let value = match (result.is_success(), result.value()) {
            (true, Some(value)) => value.to_string(),
            _ => {
                return Err(Error::ExecutionFailed {
                    kind: result.failure().unwrap_or(FailureKind::Rejected),
                    message: result.message().unwrap_or("no value produced").to_string(),
                })
            }
        };

        let output = StackOutput {
            key: self.key.clone(),
            value,
            reported_at: Utc::now(),
        };
        match self.format {
            OutputFormat::Text => writeln!(self.writer, "{} = {}", output.key, output.value)?,
            OutputFormat::Json => {
                serde_json::to_writer(&mut self.writer, &output)?;
                writeln!(self.writer)?;
            }
        }
        self.writer.flush()?;

        info!(key = %output.key, "Stack output reported");
        Ok(output)
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_output() {
        let mut reporter = OutputReporter::new(Vec::new(), DEFAULT_OUTPUT_KEY, OutputFormat::Text);
        let output = reporter
            .report(&ExecutionResult::succeeded("8f14e45f-ceea-467f-a2b3-1c9e8d2a0b11"))
            .unwrap();
        assert_eq!(output.key, "demo-output");

        let written = String::from_utf8(reporter.into_inner()).unwrap();
        assert_eq!(written, "demo-output = 8f14e45f-ceea-467f-a2b3-1c9e8d2a0b11\n");
    }

    #[test]
    fn test_json_output() {
        let mut reporter = OutputReporter::new(Vec::new(), "uid", OutputFormat::Json);
        reporter.report(&ExecutionResult::succeeded("abc")).unwrap();

        let written = reporter.into_inner();
        let parsed: StackOutput = serde_json::from_slice(&written).unwrap();
        assert_eq!(parsed.key, "uid");
        assert_eq!(parsed.value, "abc");
    }

    #[test]
    fn test_failure_propagates_and_writes_nothing() {
        let mut reporter = OutputReporter::new(Vec::new(), DEFAULT_OUTPUT_KEY, OutputFormat::Text);
        let err = reporter
            .report(&ExecutionResult::failed(
                FailureKind::NotFound,
                "ConfigMap default/kube-root-ca.crt not found",
            ))
            .unwrap_err();

        assert_eq!(err.kind(), Some(FailureKind::NotFound));
        assert!(reporter.into_inner().is_empty());
    }
}
