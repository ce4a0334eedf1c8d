//! Compiled operations.

use super::future::CompletionFuture;
use crate::ast::{Operation, Stream};

/// One operation bound to the futures that order it.
#[derive(Debug, Clone)]
pub struct Handler {
    /// Operation to execute
    pub op: Operation,
    /// Must succeed before the operation runs: the previous handler's
    /// future, or the run's start gate for the first handler
    pub pipeline: CompletionFuture,
    /// Completes when the operation succeeds, fails or is cancelled
    pub future: CompletionFuture,
    /// Human-readable description used in logs and failure reports
    pub description: String,
}

impl Handler {
    /// Compile one operation behind `pipeline`.
    pub fn new(op: Operation, pipeline: CompletionFuture) -> Self {
        let description = if op.implicit {
            format!("{} (implicit, {})", op.kind, op.region)
        } else {
            format!("{} ({})", op.kind, op.region)
        };
        Self { op, pipeline, future: CompletionFuture::new(), description }
    }

    /// Compile every operation of `stream`, in order, chained behind `gate`.
    pub fn compile(stream: &Stream, gate: &CompletionFuture) -> Vec<Self> {
        let mut pipeline = gate.clone();
        let mut handlers = Vec::with_capacity(stream.operations.len());
        for op in &stream.operations {
            let handler = Self::new(op.clone(), pipeline);
            pipeline = handler.future.clone();
            handlers.push(handler);
        }
        handlers
    }
}
