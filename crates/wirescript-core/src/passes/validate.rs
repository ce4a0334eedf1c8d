//! Barrier validation.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    ast::{OperationKind, Region, Script},
    error::ValidationError,
};

/// Check that barriers can complete.
///
/// Every awaited barrier must be notified by exactly one operation, and a
/// progress simulation over barrier operations alone must let every stream
/// run to its end. Non-barrier operations are assumed to succeed.
///
/// # Errors
///
/// - `UnresolvedBarrier` for the first await (document order) of a barrier
///   nobody notifies
/// - `DuplicateNotify` for the second notify of a barrier
/// - `UnsatisfiableWait` for the first stream left stuck by the simulation
pub fn validate_barriers(script: Script) -> Result<Script, ValidationError> {
    let mut notifies: BTreeMap<&str, Vec<Region>> = BTreeMap::new();
    let mut awaits: Vec<(&str, Region)> = Vec::new();

    for op in script.streams.iter().flat_map(|s| &s.operations) {
        match &op.kind {
            OperationKind::BarrierNotify(name) => {
                notifies.entry(name.as_str()).or_default().push(op.region);
            },
            OperationKind::BarrierAwait(name) => awaits.push((name.as_str(), op.region)),
            _ => {},
        }
    }

    if let Some(&(name, region)) = awaits.iter().find(|(name, _)| !notifies.contains_key(name)) {
        return Err(ValidationError::UnresolvedBarrier { name: name.to_string(), region });
    }

    if let Some((name, regions)) = notifies.iter().find(|(_, regions)| regions.len() > 1) {
        return Err(ValidationError::DuplicateNotify {
            name: (*name).to_string(),
            region: regions[1],
        });
    }

    simulate(&script)?;
    Ok(script)
}

fn simulate(script: &Script) -> Result<(), ValidationError> {
    let mut cursors = vec![0usize; script.streams.len()];
    let mut notified: BTreeSet<&str> = BTreeSet::new();

    loop {
        let mut progressed = false;

        for (stream, cursor) in script.streams.iter().zip(cursors.iter_mut()) {
            while let Some(op) = stream.operations.get(*cursor) {
                match &op.kind {
                    OperationKind::BarrierAwait(name) if !notified.contains(name.as_str()) => break,
                    OperationKind::BarrierNotify(name) => {
                        notified.insert(name.as_str());
                    },
                    _ => {},
                }
                *cursor += 1;
                progressed = true;
            }
        }

        if !progressed {
            break;
        }
    }

    for (stream, &cursor) in script.streams.iter().zip(&cursors) {
        if let Some(op) = stream.operations.get(cursor) {
            if let OperationKind::BarrierAwait(name) = &op.kind {
                return Err(ValidationError::UnsatisfiableWait {
                    name: name.clone(),
                    region: op.region,
                });
            }
        }
    }

    Ok(())
}
