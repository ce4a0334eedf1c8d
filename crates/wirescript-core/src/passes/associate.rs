//! Stream association.

use super::pair_streams;
use crate::{
    ast::{AssociationId, Script},
    error::ValidationError,
};

/// Stamp each accept/connect pair with a shared [`AssociationId`], numbered
/// in document order of the accept stream.
pub fn associate_streams(mut script: Script) -> Result<Script, ValidationError> {
    for stream in &mut script.streams {
        stream.association = None;
    }

    for (n, (accept, connect)) in pair_streams(&script)?.into_iter().enumerate() {
        let id = AssociationId(u32::try_from(n).unwrap_or(u32::MAX));
        script.streams[accept].association = Some(id);
        script.streams[connect].association = Some(id);
    }

    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn pairs_share_an_id() {
        let script = associate_streams(
            parse("accept tcp://h:1\nconnect tcp://h:9\nconnect tcp://h:1\n").expect("parse"),
        )
        .expect("associate");

        let ids: Vec<_> = script.streams.iter().map(|s| s.association).collect();
        assert_eq!(ids, vec![Some(AssociationId(0)), None, Some(AssociationId(0))]);
    }
}
