//! Lifecycle marker injection.

use crate::{
    ast::{Operation, OperationKind, Role, Script, Stream},
    error::ValidationError,
};

/// Give every stream a complete lifecycle.
///
/// Accept streams start `Opened, Bound, <leading awaits/options>, Connected`;
/// connect streams start `Opened, <leading awaits/options>, Connected`.
/// Markers already written are kept in place of the synthesized ones. A
/// stream that does not end in `Closed` or `Disconnected` gets `Closed`
/// appended, preceded by `Close` unless it already ends in one.
///
/// # Errors
///
/// `IllegalOperation` for `bound` on a connect stream, an opening marker
/// after the first read or write, or anything after `closed`/`disconnected`.
pub fn inject_events(mut script: Script) -> Result<Script, ValidationError> {
    for stream in &mut script.streams {
        inject_stream(stream)?;
    }
    Ok(script)
}

fn inject_stream(stream: &mut Stream) -> Result<(), ValidationError> {
    let ops = std::mem::take(&mut stream.operations);

    let leading = ops
        .iter()
        .take_while(|op| {
            matches!(
                op.kind,
                OperationKind::Opened
                    | OperationKind::Bound
                    | OperationKind::Connected
                    | OperationKind::BarrierAwait(_)
                    | OperationKind::OptionConfig { .. }
            )
        })
        .count();

    let mut opened = None;
    let mut bound = None;
    let mut connected = None;
    let mut setup = Vec::new();

    let mut rest = ops.into_iter();
    for op in rest.by_ref().take(leading) {
        match op.kind {
            OperationKind::Opened => opened = Some(op),
            OperationKind::Bound if stream.role == Role::Connect => {
                return Err(illegal(&op, "`bound` is only valid on accept streams"));
            },
            OperationKind::Bound => bound = Some(op),
            OperationKind::Connected => connected = Some(op),
            _ => setup.push(op),
        }
    }
    let body: Vec<Operation> = rest.collect();

    let marker = |found: Option<Operation>, kind: OperationKind| {
        found.unwrap_or_else(|| Operation::implicit(kind, stream.region))
    };

    let mut operations = Vec::with_capacity(body.len() + setup.len() + 5);
    operations.push(marker(opened, OperationKind::Opened));
    if stream.role == Role::Accept {
        operations.push(marker(bound, OperationKind::Bound));
    }
    operations.extend(setup);
    operations.push(marker(connected, OperationKind::Connected));

    for (idx, op) in body.iter().enumerate() {
        match op.kind {
            OperationKind::Opened | OperationKind::Bound | OperationKind::Connected => {
                let message = format!("`{}` must precede reads and writes", op.kind.keyword());
                return Err(illegal(op, &message));
            },
            OperationKind::Closed | OperationKind::Disconnected if idx + 1 < body.len() => {
                let message = format!("operation after `{}`", op.kind.keyword());
                return Err(illegal(&body[idx + 1], &message));
            },
            _ => {},
        }
    }

    let tail_region = body.last().map_or(stream.region, |op| op.region);
    let ending = body.last().map(|op| op.kind.clone());
    operations.extend(body);

    match ending {
        Some(kind) if kind.is_terminal() => {},
        Some(OperationKind::Close) => {
            operations.push(Operation::implicit(OperationKind::Closed, tail_region));
        },
        _ => {
            operations.push(Operation::implicit(OperationKind::Close, tail_region));
            operations.push(Operation::implicit(OperationKind::Closed, tail_region));
        },
    }

    stream.operations = operations;
    Ok(())
}

fn illegal(op: &Operation, message: &str) -> ValidationError {
    ValidationError::IllegalOperation { region: op.region, message: message.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn kinds(script: &Script, stream: usize) -> Vec<String> {
        script.streams[stream].operations.iter().map(|op| op.kind.to_string()).collect()
    }

    fn injected(text: &str) -> Result<Script, ValidationError> {
        inject_events(parse(text).expect("parse"))
    }

    #[test]
    fn accept_gets_full_lifecycle() {
        let script = injected("accept tcp://h:1\nread \"a\"\n").expect("inject");
        assert_eq!(kinds(&script, 0), vec![
            "opened",
            "bound",
            "connected",
            "read \"a\"",
            "close",
            "closed"
        ]);
        assert!(script.streams[0].operations[3..].iter().skip(1).all(|op| op.implicit));
    }

    #[test]
    fn connect_await_stays_before_connected() {
        let script = injected("connect await go tcp://h:1\nwrite \"a\"\nclose\n").expect("inject");
        assert_eq!(kinds(&script, 0), vec![
            "opened",
            "await go",
            "connected",
            "write \"a\"",
            "close",
            "closed"
        ]);
    }

    #[test]
    fn explicit_markers_are_not_duplicated() {
        let script = injected("accept tcp://h:1\nopened\nbound\nconnected\nread \"a\"\nclosed\n")
            .expect("inject");
        let ops = &script.streams[0].operations;
        assert_eq!(kinds(&script, 0), vec!["opened", "bound", "connected", "read \"a\"", "closed"]);
        assert!(ops.iter().all(|op| !op.implicit));
    }

    #[test]
    fn empty_stream_is_completed() {
        let script = injected("connect tcp://h:1\n").expect("inject");
        assert_eq!(kinds(&script, 0), vec!["opened", "connected", "close", "closed"]);
    }

    #[test]
    fn bound_on_connect_is_rejected() {
        let err = injected("connect tcp://h:1\nbound\n").expect_err("bound on connect");
        assert!(matches!(err, ValidationError::IllegalOperation { .. }));
    }

    #[test]
    fn operations_after_closed_are_rejected() {
        let err = injected("connect tcp://h:1\nclosed\nwrite \"x\"\n").expect_err("after closed");
        insta::assert_snapshot!(err.to_string(), @"3:1: operation after `closed`");
    }
}
