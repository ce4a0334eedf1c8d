//! Flush injection.

use crate::{
    ast::{Operation, OperationKind, Script},
    error::ValidationError,
};

/// Insert `Flush` after every maximal run of writes unless the run is
/// already followed by one.
pub fn inject_flush(mut script: Script) -> Result<Script, ValidationError> {
    for stream in &mut script.streams {
        let ops = std::mem::take(&mut stream.operations);
        let mut out = Vec::with_capacity(ops.len() + 2);
        let mut pending: Option<Operation> = None;

        for op in ops {
            if op.kind.is_write() {
                pending = Some(Operation::implicit(OperationKind::Flush, op.region));
            } else if let Some(flush) = pending.take() {
                if op.kind != OperationKind::Flush {
                    out.push(flush);
                }
            }
            out.push(op);
        }
        out.extend(pending);

        stream.operations = out;
    }
    Ok(script)
}
