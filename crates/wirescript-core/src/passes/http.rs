//! Http stream expansion and operation legality.
//!
//! Http streams carry one request and one response. Connect streams write
//! the request and read the response; accept streams read the request and
//! write the response. Metadata written with `write method|version|header|
//! status` becomes a literal head in front of the body, and metadata read
//! with `read ...` becomes a single [`Matcher::HttpHead`].

use bytes::Bytes;

use crate::{
    ast::{
        HttpConfig, Matcher, Operation, OperationKind, Region, Role, Script, Stream, ValueGenerator,
    },
    error::ValidationError,
};

const DEFAULT_VERSION: &str = "HTTP/1.1";

/// Check operation ordering on every stream and expand http metadata.
///
/// # Errors
///
/// `IllegalOperation` for a write after `write close`, an option or a read
/// or write after `close`, http metadata on a non-http stream, metadata
/// that does not fit the stream's role, header metadata after the body
/// began, or a dynamically sized body without a declared `content-length`.
pub fn inject_http_streams(mut script: Script) -> Result<Script, ValidationError> {
    for stream in &mut script.streams {
        check_ordering(stream)?;
        if stream.is_http() {
            expand(stream)?;
        }
    }
    Ok(script)
}

fn illegal(region: Region, message: impl Into<String>) -> ValidationError {
    ValidationError::IllegalOperation { region, message: message.into() }
}

fn check_ordering(stream: &Stream) -> Result<(), ValidationError> {
    let mut write_closed = false;
    let mut closed = false;

    for op in &stream.operations {
        match &op.kind {
            OperationKind::ReadConfig(_) | OperationKind::WriteConfig(_) if !stream.is_http() => {
                return Err(illegal(op.region, format!("`{}` requires an http stream", op.kind)));
            },
            OperationKind::OptionConfig { name, .. } if closed => {
                return Err(illegal(op.region, format!("option `{name}` after `close`")));
            },
            OperationKind::ReadEvent(_)
            | OperationKind::WriteCommand(_)
            | OperationKind::ReadConfig(_)
            | OperationKind::WriteConfig(_)
            | OperationKind::WriteClose
            | OperationKind::Flush
                if closed =>
            {
                return Err(illegal(op.region, format!("`{}` after `close`", op.kind.keyword())));
            },
            OperationKind::WriteCommand(_)
            | OperationKind::WriteConfig(_)
            | OperationKind::WriteClose
                if write_closed =>
            {
                let message = format!("`{}` after `write close`", op.kind.keyword());
                return Err(illegal(op.region, message));
            },
            OperationKind::WriteClose => write_closed = true,
            OperationKind::Close => closed = true,
            _ => {},
        }
    }

    Ok(())
}

#[derive(Default)]
struct Pending {
    configs: Vec<HttpConfig>,
    region: Option<Region>,
    done: bool,
}

impl Pending {
    fn push(&mut self, config: HttpConfig, region: Region) -> Result<(), ValidationError> {
        if self.done {
            return Err(illegal(region, format!("`{config}` after the message body began")));
        }
        self.region.get_or_insert(region);
        self.configs.push(config);
        Ok(())
    }
}

fn expand(stream: &mut Stream) -> Result<(), ValidationError> {
    let ops = std::mem::take(&mut stream.operations);
    let mut out = Vec::with_capacity(ops.len() + 2);
    let mut reads = Pending::default();
    let mut writes = Pending::default();

    for (idx, op) in ops.iter().enumerate() {
        match &op.kind {
            OperationKind::ReadConfig(config) => {
                reads.push(config.clone(), op.region)?;
                continue;
            },
            OperationKind::WriteConfig(config) => {
                writes.push(config.clone(), op.region)?;
                continue;
            },
            _ => {},
        }

        let starts_read = matches!(op.kind, OperationKind::ReadEvent(_));
        if !reads.done && (!reads.configs.is_empty() || starts_read) {
            out.push(read_head(stream, &mut reads, op.region)?);
        }

        let starts_body = matches!(op.kind, OperationKind::WriteCommand(_));
        if !writes.done && (!writes.configs.is_empty() || starts_body) {
            out.push(write_head(stream, &mut writes, &ops[idx..], op.region)?);
        }

        if op.kind != OperationKind::WriteClose {
            out.push(op.clone());
        }
    }

    stream.operations = out;
    Ok(())
}

fn read_head(
    stream: &Stream,
    pending: &mut Pending,
    at: Region,
) -> Result<Operation, ValidationError> {
    let mut method = None;
    let mut version = None;
    let mut status = None;
    let mut headers = Vec::new();
    let region = pending.region.unwrap_or(at);

    for config in pending.configs.drain(..) {
        match config {
            HttpConfig::Method(m) if stream.role == Role::Accept => method = Some(m),
            HttpConfig::Status { code, reason } if stream.role == Role::Connect => {
                status = Some((code, reason));
            },
            HttpConfig::Version(v) => version = Some(v),
            HttpConfig::Header { name, value } => headers.push((name, value)),
            other => {
                let role = stream.role.as_str();
                return Err(illegal(region, format!("`read {other}` does not fit a {role} stream")));
            },
        }
    }

    let version = version.unwrap_or_else(|| DEFAULT_VERSION.to_string());
    let start_line = match (method, status) {
        (Some(method), _) => Some(format!("{method} {} {version}", request_path(stream))),
        (None, Some((code, reason))) => Some(format!("{version} {code} {reason}")),
        (None, None) => None,
    };

    let implicit = pending.region.is_none();
    pending.done = true;

    let kind = OperationKind::ReadEvent(vec![Matcher::HttpHead { start_line, headers }]);
    Ok(if implicit { Operation::implicit(kind, region) } else { Operation::new(kind, region) })
}

fn write_head(
    stream: &Stream,
    pending: &mut Pending,
    rest: &[Operation],
    at: Region,
) -> Result<Operation, ValidationError> {
    let region = pending.region.unwrap_or(at);
    let body = body_length(rest);
    let request = stream.role == Role::Connect;

    let mut method = None;
    let mut version = None;
    let mut status = None;
    let mut headers: Vec<(String, String)> = Vec::new();

    for config in pending.configs.drain(..) {
        match config {
            HttpConfig::Method(m) if request => method = Some(m),
            HttpConfig::Status { code, reason } if !request => status = Some((code, reason)),
            HttpConfig::Version(v) => version = Some(v),
            HttpConfig::Header { name, value } => headers.push((name, value)),
            other => {
                let role = stream.role.as_str();
                let message = format!("`write {other}` does not fit a {role} stream");
                return Err(illegal(region, message));
            },
        }
    }

    let has_header = |name: &str| headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name));
    let declared_length = has_header("content-length");
    let declared_host = has_header("host");

    let version = version.unwrap_or_else(|| DEFAULT_VERSION.to_string());
    let mut head = if request {
        let has_body = !matches!(body, BodyLength::Static(0));
        let method = method.unwrap_or_else(|| if has_body { "POST" } else { "GET" }.to_string());
        format!("{method} {} {version}\r\n", request_path(stream))
    } else {
        let (code, reason) = status.unwrap_or_else(|| (200, "OK".to_string()));
        format!("{version} {code} {reason}\r\n")
    };

    if request && !declared_host {
        head.push_str(&format!("Host: {}\r\n", stream.location.authority));
    }
    for (name, value) in &headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if !declared_length {
        match body {
            BodyLength::Static(0) if request => {},
            BodyLength::Static(len) => head.push_str(&format!("content-length: {len}\r\n")),
            BodyLength::Dynamic(at) => {
                return Err(illegal(
                    at,
                    "body of unknown length needs a declared content-length header",
                ));
            },
        }
    }
    head.push_str("\r\n");

    let implicit = pending.region.is_none();
    pending.done = true;

    let kind = OperationKind::WriteCommand(vec![ValueGenerator::Literal(Bytes::from(head))]);
    Ok(if implicit { Operation::implicit(kind, region) } else { Operation::new(kind, region) })
}

enum BodyLength {
    Static(usize),
    /// Region of the first write whose length is not known statically
    Dynamic(Region),
}

/// Length of the writes starting at `rest[0]` up to the end of the message.
fn body_length(rest: &[Operation]) -> BodyLength {
    let mut total = 0;
    for op in rest {
        match &op.kind {
            OperationKind::WriteCommand(values) => {
                for value in values {
                    match value.static_len() {
                        Some(len) => total += len,
                        None => return BodyLength::Dynamic(op.region),
                    }
                }
            },
            OperationKind::WriteClose
            | OperationKind::WriteConfig(_)
            | OperationKind::ReadEvent(_)
            | OperationKind::ReadConfig(_)
            | OperationKind::Close
            | OperationKind::Closed
            | OperationKind::Disconnected => break,
            _ => {},
        }
    }
    BodyLength::Static(total)
}

fn request_path(stream: &Stream) -> &str {
    if stream.location.path.is_empty() { "/" } else { &stream.location.path }
}
