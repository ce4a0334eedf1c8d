//! Matching inbound bytes and rendering outbound bytes.
//!
//! Matching is sans-IO: [`try_match`] looks at the buffered bytes and either
//! matches, asks for more input, or fails with the first observed
//! difference. The caller owns the buffer and the transport.

use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
};

use bytes::{Bytes, BytesMut};

use crate::{
    ast::{Matcher, Property, Region, ValueGenerator, render_bytes},
    error::ProgressError,
};

/// Longest http head accepted by [`Matcher::HttpHead`].
pub const MAX_HTTP_HEAD: usize = 64 * 1024;

/// Run-scoped variable table shared by every stream.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    values: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl Variables {
    /// Table seeded with script properties.
    pub fn from_properties(properties: &[Property]) -> Self {
        let values = properties.iter().map(|p| (p.name.clone(), p.value.clone())).collect();
        Self { values: Arc::new(RwLock::new(values)) }
    }

    /// Current value.
    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.values.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// Bind or rebind.
    pub fn set(&self, name: impl Into<String>, value: Bytes) {
        self.values.write().unwrap_or_else(PoisonError::into_inner).insert(name.into(), value);
    }

    /// Bind every capture of a successful match.
    pub fn bind_all(&self, captures: Vec<(String, Bytes)>) {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        for (name, value) in captures {
            values.insert(name, value);
        }
    }
}

/// Successful match over a prefix of the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matched {
    /// Bytes consumed
    pub consumed: usize,
    /// Variables captured, in matcher order
    pub captures: Vec<(String, Bytes)>,
}

/// Match `matchers` in sequence against the front of `input`.
///
/// Returns `Ok(None)` when more input is needed and `eof` is false. Captures
/// made by earlier matchers are visible to later matchers of the same call
/// but are not written to `vars`.
///
/// # Errors
///
/// `ProgressError` on the first byte that cannot match, on end of stream
/// before a match completes, or on a reference to an unbound variable.
pub fn try_match(
    matchers: &[Matcher],
    input: &[u8],
    eof: bool,
    vars: &Variables,
    region: Region,
) -> Result<Option<Matched>, ProgressError> {
    let mut consumed = 0;
    let mut captures: Vec<(String, Bytes)> = Vec::new();

    for matcher in matchers {
        let rest = &input[consumed..];
        let step = match matcher {
            Matcher::Exact(expected) => {
                match_exact(expected, &render_bytes(expected), rest, eof, region)?
            },
            Matcher::Variable(name) => {
                let expected = lookup(name, &captures, vars)
                    .ok_or_else(|| unbound(name, region))?;
                let rendered = format!("${{{name}}} = {}", render_bytes(&expected));
                match_exact(&expected, &rendered, rest, eof, region)?
            },
            Matcher::Fixed { len, capture } => {
                let step = take(*len, rest, eof, || format!("{len} bytes"), region)?;
                if let (Some(n), Some(name)) = (step, capture) {
                    captures.push((name.clone(), Bytes::copy_from_slice(&rest[..n])));
                }
                step
            },
            Matcher::Integer { width, expected, capture } => {
                let size = width.size();
                let step = take(size, rest, eof, || matcher.to_string(), region)?;
                if step.is_some() {
                    let bytes = &rest[..size];
                    if let Some(expected) = expected {
                        if !width.matches(bytes, *expected) {
                            let value = if *expected < 0 {
                                width.decode(bytes).to_string()
                            } else {
                                width.decode_unsigned(bytes).to_string()
                            };
                            return Err(ProgressError {
                                region,
                                expected: matcher.to_string(),
                                observed: format!("{}:{value}", width.as_str()),
                            });
                        }
                    }
                    if let Some(name) = capture {
                        captures.push((name.clone(), Bytes::copy_from_slice(bytes)));
                    }
                }
                step
            },
            Matcher::HttpHead { start_line, headers } => {
                match_http_head(start_line.as_deref(), headers, rest, eof, region)?
            },
        };

        match step {
            Some(n) => consumed += n,
            None => return Ok(None),
        }
    }

    Ok(Some(Matched { consumed, captures }))
}

fn lookup(name: &str, captures: &[(String, Bytes)], vars: &Variables) -> Option<Bytes> {
    captures
        .iter()
        .rev()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
        .or_else(|| vars.get(name))
}

fn unbound(name: &str, region: Region) -> ProgressError {
    ProgressError {
        region,
        expected: format!("${{{name}}}"),
        observed: "unbound variable".to_string(),
    }
}

fn end_of_stream(seen: &[u8]) -> String {
    if seen.is_empty() {
        "end of stream".to_string()
    } else {
        format!("{} then end of stream", render_bytes(seen))
    }
}

fn match_exact(
    expected: &[u8],
    rendered: &str,
    rest: &[u8],
    eof: bool,
    region: Region,
) -> Result<Option<usize>, ProgressError> {
    let n = rest.len().min(expected.len());
    if rest[..n] != expected[..n] {
        let mismatch = rest[..n].iter().zip(expected).position(|(a, b)| a != b).unwrap_or(0);
        return Err(ProgressError {
            region,
            expected: rendered.to_string(),
            observed: render_bytes(&rest[..=mismatch]),
        });
    }
    if n == expected.len() {
        return Ok(Some(n));
    }
    if eof {
        return Err(ProgressError {
            region,
            expected: rendered.to_string(),
            observed: end_of_stream(rest),
        });
    }
    Ok(None)
}

fn take(
    len: usize,
    rest: &[u8],
    eof: bool,
    expected: impl FnOnce() -> String,
    region: Region,
) -> Result<Option<usize>, ProgressError> {
    if rest.len() >= len {
        Ok(Some(len))
    } else if eof {
        Err(ProgressError { region, expected: expected(), observed: end_of_stream(rest) })
    } else {
        Ok(None)
    }
}

fn match_http_head(
    start_line: Option<&str>,
    headers: &[(String, String)],
    rest: &[u8],
    eof: bool,
    region: Region,
) -> Result<Option<usize>, ProgressError> {
    let expected = || Matcher::HttpHead {
        start_line: start_line.map(str::to_string),
        headers: headers.to_vec(),
    }
    .to_string();

    let Some(end) = rest.windows(4).position(|w| w == b"\r\n\r\n") else {
        if eof {
            return Err(ProgressError {
                region,
                expected: expected(),
                observed: end_of_stream(rest),
            });
        }
        if rest.len() > MAX_HTTP_HEAD {
            return Err(ProgressError {
                region,
                expected: expected(),
                observed: format!("{} bytes without end of head", rest.len()),
            });
        }
        return Ok(None);
    };

    let head = String::from_utf8_lossy(&rest[..end]);
    let mut lines = head.split("\r\n");
    let first = lines.next().unwrap_or_default();

    if let Some(line) = start_line {
        if first != line {
            return Err(ProgressError {
                region,
                expected: render_bytes(line.as_bytes()),
                observed: render_bytes(first.as_bytes()),
            });
        }
    }

    let received: Vec<(&str, &str)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim(), value.trim()))
        .collect();

    for (name, value) in headers {
        let found = received.iter().any(|(n, v)| n.eq_ignore_ascii_case(name) && v == value);
        if !found {
            let observed = received
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map_or_else(|| format!("no {name} header"), |(n, v)| format!("{n}: {v}"));
            return Err(ProgressError { region, expected: format!("{name}: {value}"), observed });
        }
    }

    Ok(Some(end + 4))
}

/// Concatenate the output of `generators`.
///
/// # Errors
///
/// `ProgressError` if a generator references an unbound variable.
pub fn render(
    generators: &[ValueGenerator],
    vars: &Variables,
    region: Region,
) -> Result<Bytes, ProgressError> {
    let mut out = BytesMut::new();
    for generator in generators {
        match generator {
            ValueGenerator::Literal(bytes) => out.extend_from_slice(bytes),
            ValueGenerator::Variable(name) => {
                let value = vars.get(name).ok_or_else(|| unbound(name, region))?;
                out.extend_from_slice(&value);
            },
            ValueGenerator::Integer { width, value } => {
                out.extend_from_slice(&width.encode(*value));
            },
        }
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::IntWidth;

    const AT: Region = Region::new(1, 1);

    fn exact(bytes: &'static [u8]) -> Matcher {
        Matcher::Exact(Bytes::from_static(bytes))
    }

    #[test]
    fn exact_waits_for_more_input() {
        let vars = Variables::default();
        assert_eq!(try_match(&[exact(b"ping")], b"pi", false, &vars, AT), Ok(None));
        assert_eq!(
            try_match(&[exact(b"ping")], b"ping!", false, &vars, AT),
            Ok(Some(Matched { consumed: 4, captures: Vec::new() }))
        );
    }

    #[test]
    fn exact_fails_on_first_difference() {
        let err = try_match(&[exact(b"ping")], b"pu", false, &Variables::default(), AT)
            .expect_err("mismatch");
        assert_eq!(err.expected, "\"ping\"");
        assert_eq!(err.observed, "\"pu\"");
    }

    #[test]
    fn eof_before_match_fails() {
        let err =
            try_match(&[exact(b"ping")], b"pi", true, &Variables::default(), AT).expect_err("eof");
        insta::assert_snapshot!(
            err.to_string(),
            @r#"1:1: expected "ping", observed "pi" then end of stream"#
        );
    }

    #[test]
    fn captures_flow_into_later_matchers() {
        let matchers = [
            Matcher::Fixed { len: 2, capture: Some("id".to_string()) },
            exact(b"-"),
            Matcher::Variable("id".to_string()),
        ];
        let vars = Variables::default();

        let matched = try_match(&matchers, b"ab-ab", false, &vars, AT).unwrap().unwrap();
        assert_eq!(matched.consumed, 5);
        assert_eq!(vars.get("id"), None);

        vars.bind_all(matched.captures);
        assert_eq!(vars.get("id"), Some(Bytes::from_static(b"ab")));
    }

    #[test]
    fn integer_checks_expected_value() {
        let matcher = Matcher::Integer { width: IntWidth::Short, expected: Some(7), capture: None };
        let vars = Variables::default();
        let matched = try_match(std::slice::from_ref(&matcher), &[0, 7], false, &vars, AT);
        assert!(matched.unwrap().is_some());
        let err = try_match(&[matcher], &[0, 8], false, &vars, AT).expect_err("wrong value");
        assert_eq!(err.observed, "short:8");
    }

    #[test]
    fn integer_matches_unsigned_reading() {
        let vars = Variables::default();
        let byte = |expected| Matcher::Integer { width: IntWidth::Byte, expected, capture: None };
        let unsigned = byte(Some(200));
        let signed = byte(Some(-56));
        let matched = try_match(std::slice::from_ref(&unsigned), &[0xc8], false, &vars, AT);
        assert!(matched.unwrap().is_some());
        assert!(try_match(&[signed], &[0xc8], false, &vars, AT).unwrap().is_some());

        let err = try_match(&[unsigned], &[0xc9], false, &vars, AT).expect_err("wrong value");
        assert_eq!(err.observed, "byte:201");
    }

    #[test]
    fn http_head_matches_case_insensitive_names() {
        let matcher = Matcher::HttpHead {
            start_line: Some("HTTP/1.1 200 OK".to_string()),
            headers: vec![("content-length".to_string(), "5".to_string())],
        };
        let input = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let matched =
            try_match(&[matcher], input, false, &Variables::default(), AT).unwrap().unwrap();
        assert_eq!(matched.consumed, input.len() - 5);
    }

    #[test]
    fn http_head_reports_missing_header() {
        let matcher = Matcher::HttpHead {
            start_line: None,
            headers: vec![("x-id".to_string(), "1".to_string())],
        };
        let err = try_match(&[matcher], b"GET / HTTP/1.1\r\n\r\n", false, &Variables::default(), AT)
            .expect_err("missing header");
        assert_eq!(err.observed, "no x-id header");
    }

    #[test]
    fn render_uses_variables() {
        let vars = Variables::default();
        vars.set("name", Bytes::from_static(b"bob"));
        let out = render(
            &[
                ValueGenerator::Literal(Bytes::from_static(b"hi ")),
                ValueGenerator::Variable("name".to_string()),
                ValueGenerator::Integer { width: IntWidth::Byte, value: 1 },
            ],
            &vars,
            AT,
        )
        .unwrap();
        assert_eq!(out.as_ref(), b"hi bob\x01");
        assert!(render(&[ValueGenerator::Variable("nope".to_string())], &vars, AT).is_err());
    }
}
