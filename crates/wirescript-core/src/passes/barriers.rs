//! Synthesized bind barriers.

use super::pair_streams;
use crate::{
    ast::{INTERNAL_PREFIX, Operation, OperationKind, Script},
    error::ValidationError,
};

/// Make every in-script connect wait for its acceptor.
///
/// For each accept/connect pair whose connect stream has no explicit await
/// before `Connected`, a barrier named `~bound~N` is notified right after the
/// accept stream's `Bound` and awaited right before the connect stream's
/// `Connected`. `N` is the pair's position in document order.
///
/// Expects lifecycle markers to be present.
pub fn inject_barriers(mut script: Script) -> Result<Script, ValidationError> {
    let pairs = pair_streams(&script)?;

    for (n, (accept, connect)) in pairs.into_iter().enumerate() {
        let connect_ops = &script.streams[connect].operations;
        let connected = position(connect_ops, |k| matches!(k, OperationKind::Connected));
        let Some(connected_at) = connected else {
            continue;
        };
        let explicit_await = connect_ops[..connected_at]
            .iter()
            .any(|op| !op.implicit && matches!(op.kind, OperationKind::BarrierAwait(_)));
        if explicit_await {
            continue;
        }

        let accept_stream = &script.streams[accept];
        let bound = position(&accept_stream.operations, |k| matches!(k, OperationKind::Bound));
        let Some(bound_at) = bound else {
            continue;
        };

        let name = format!("{INTERNAL_PREFIX}bound{INTERNAL_PREFIX}{n}");
        let accept_region = accept_stream.region;
        let connect_region = script.streams[connect].region;

        let notify = Operation::implicit(OperationKind::BarrierNotify(name.clone()), accept_region);
        script.streams[accept].operations.insert(bound_at + 1, notify);
        let wait = Operation::implicit(OperationKind::BarrierAwait(name), connect_region);
        script.streams[connect].operations.insert(connected_at, wait);
    }

    Ok(script)
}

fn position(ops: &[Operation], pred: impl Fn(&OperationKind) -> bool) -> Option<usize> {
    ops.iter().position(|op| pred(&op.kind))
}
