//! Semantic passes turning a parsed script into an execution plan.
//!
//! Each pass is a pure function from [`Script`] to [`Script`]. [`resolve`]
//! runs them in a fixed order:
//!
//! 1. **InjectEvents** - lifecycle markers at the start and end of every
//!    stream.
//! 2. **InjectBarriers** - synthesized `~bound~N` barriers so that a connect
//!    stream never dials before its in-script acceptor is bound.
//! 3. **InjectFlush** - a flush after every run of writes.
//! 4. **AssociateStreams** - pair accept and connect streams.
//! 5. **ValidateBarriers** - every await has exactly one notify and can be
//!    reached.
//! 6. **InjectHttpStreams** - expand http metadata into bytes and matchers.
//!
//! Passes only use ordered collections, so the same input always produces
//! the same output. Any failure aborts the pipeline.

mod associate;
mod barriers;
mod events;
mod flush;
mod http;
mod validate;

use std::collections::BTreeMap;

use tracing::debug;

pub use self::{
    associate::associate_streams, barriers::inject_barriers, events::inject_events,
    flush::inject_flush, http::inject_http_streams, validate::validate_barriers,
};
use crate::{
    ast::{Location, Role, Script},
    error::ValidationError,
};

/// Signature shared by every pass.
pub type Pass = fn(Script) -> Result<Script, ValidationError>;

/// All passes, in execution order.
pub const PIPELINE: [(&str, Pass); 6] = [
    ("inject-events", inject_events),
    ("inject-barriers", inject_barriers),
    ("inject-flush", inject_flush),
    ("associate-streams", associate_streams),
    ("validate-barriers", validate_barriers),
    ("inject-http-streams", inject_http_streams),
];

/// Run every pass over `script`.
///
/// # Errors
///
/// The first `ValidationError` raised by any pass.
pub fn resolve(script: Script) -> Result<Script, ValidationError> {
    PIPELINE.iter().try_fold(script, |script, (name, pass)| {
        let resolved = pass(script)?;
        debug!(pass = name, streams = resolved.streams.len(), "pass complete");
        Ok(resolved)
    })
}

#[derive(Default)]
struct Sides {
    accepts: usize,
    connects: usize,
    free_accepts: Vec<usize>,
    free_connects: Vec<usize>,
}

/// Pair in-script accept and connect streams.
///
/// Returns `(accept, connect)` stream indices ordered by accept index.
/// Explicit `peer` names pair first; remaining streams pair by effective
/// location in document order. A location with no in-script accept (or no
/// in-script connect) talks to the implementation under test and is left
/// unpaired.
///
/// # Errors
///
/// - `UnknownPeer` if a connect stream names an accept stream that does not
///   exist
/// - `IllegalOperation` for duplicate accept names, a named peer at a
///   different location, or a named peer claimed twice
/// - `UnassociatedStream` if a location with both roles has a surplus on
///   either side
pub(crate) fn pair_streams(script: &Script) -> Result<Vec<(usize, usize)>, ValidationError> {
    let mut named: BTreeMap<&str, usize> = BTreeMap::new();
    for (idx, stream) in script.streams.iter().enumerate() {
        if stream.role == Role::Accept {
            if let Some(name) = stream.accept_peer.as_deref() {
                if named.insert(name, idx).is_some() {
                    return Err(ValidationError::IllegalOperation {
                        region: stream.region,
                        message: format!("accept name `{name}` is declared twice"),
                    });
                }
            }
        }
    }

    let mut pairs = Vec::new();
    let mut paired = vec![false; script.streams.len()];

    for (idx, stream) in script.streams.iter().enumerate() {
        if stream.role != Role::Connect {
            continue;
        }
        let Some(peer) = stream.accept_peer.as_deref() else {
            continue;
        };
        let &accept = named
            .get(peer)
            .ok_or_else(|| ValidationError::UnknownPeer {
                name: peer.to_string(),
                region: stream.region,
            })?;

        let accept_location = script.streams[accept].location.effective();
        if accept_location != stream.location.effective() {
            return Err(ValidationError::IllegalOperation {
                region: stream.region,
                message: format!(
                    "peer `{peer}` accepts at {accept_location}, not {}",
                    stream.location
                ),
            });
        }
        if paired[accept] {
            return Err(ValidationError::IllegalOperation {
                region: stream.region,
                message: format!("peer `{peer}` is already paired"),
            });
        }

        paired[accept] = true;
        paired[idx] = true;
        pairs.push((accept, idx));
    }

    let mut by_location: BTreeMap<Location, Sides> = BTreeMap::new();
    for (idx, stream) in script.streams.iter().enumerate() {
        let sides = by_location.entry(stream.location.effective()).or_default();
        match stream.role {
            Role::Accept => {
                sides.accepts += 1;
                if !paired[idx] {
                    sides.free_accepts.push(idx);
                }
            },
            Role::Connect => {
                sides.connects += 1;
                if !paired[idx] {
                    sides.free_connects.push(idx);
                }
            },
        }
    }

    let mut surplus: Option<usize> = None;
    for sides in by_location.values() {
        if sides.accepts == 0 || sides.connects == 0 {
            continue;
        }

        for (&accept, &connect) in sides.free_accepts.iter().zip(&sides.free_connects) {
            pairs.push((accept, connect));
        }

        let leftover = sides
            .free_accepts
            .iter()
            .skip(sides.free_connects.len())
            .chain(sides.free_connects.iter().skip(sides.free_accepts.len()));
        for &idx in leftover {
            surplus = Some(surplus.map_or(idx, |current| current.min(idx)));
        }
    }

    if let Some(idx) = surplus {
        let stream = &script.streams[idx];
        return Err(ValidationError::UnassociatedStream {
            role: stream.role.as_str(),
            location: stream.location.to_string(),
            region: stream.region,
        });
    }

    pairs.sort_unstable();
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn parsed(text: &str) -> Script {
        parse(text).expect("script should parse")
    }

    #[test]
    fn pairs_by_location_in_document_order() {
        let script = parsed(
            "accept tcp://localhost:1\naccept tcp://localhost:2\n\
             connect tcp://localhost:2\nconnect tcp://LOCALHOST:1/\n",
        );

        assert_eq!(pair_streams(&script), Ok(vec![(0, 3), (1, 2)]));
    }

    #[test]
    fn external_targets_stay_unpaired() {
        let script = parsed("accept tcp://localhost:1\nconnect tcp://localhost:9\n");
        assert_eq!(pair_streams(&script), Ok(Vec::new()));
    }

    #[test]
    fn named_peer_wins_over_order() {
        let script = parsed(
            "accept tcp://h:1\naccept tcp://h:1 as second\n\
             connect tcp://h:1 peer second\nconnect tcp://h:1\n",
        );

        assert_eq!(pair_streams(&script), Ok(vec![(0, 3), (1, 2)]));
    }

    #[test]
    fn unknown_peer_is_rejected() {
        let script = parsed("accept tcp://h:1\nconnect tcp://h:1 peer nobody\n");
        assert!(matches!(
            pair_streams(&script),
            Err(ValidationError::UnknownPeer { name, .. }) if name == "nobody"
        ));
    }

    #[test]
    fn surplus_connect_is_rejected() {
        let script = parsed("accept tcp://h:1\nconnect tcp://h:1\nconnect tcp://h:1\n");
        let err = pair_streams(&script).expect_err("surplus connect");
        assert_eq!(err, ValidationError::UnassociatedStream {
            role: "connect",
            location: "tcp://h:1".to_string(),
            region: crate::ast::Region::new(3, 1),
        });
    }

    #[test]
    fn resolve_is_deterministic() {
        let text =
            "accept tcp://h:1\nread \"a\"\nnotify b\nconnect tcp://h:1\nawait b\nwrite \"a\"\n";
        let first = resolve(parsed(text)).expect("script should resolve");
        let second = resolve(parsed(text)).expect("script should resolve");
        assert_eq!(first, second);
    }
}
