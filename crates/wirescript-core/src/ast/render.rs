//! Rendering the model back to script text.
//!
//! Used for PREPARED echoes, observed scripts and diagnostics. Byte strings
//! made of printable ASCII (plus CR, LF and tab) render as quoted strings,
//! anything else as a `[0x..]` byte list.

use std::fmt::{self, Write as _};

use super::{
    HttpConfig, Matcher, Operation, OperationKind, Script, Stream, ValueGenerator,
};

/// Render bytes as a script literal.
pub fn render_bytes(bytes: &[u8]) -> String {
    let printable = bytes
        .iter()
        .all(|&b| (0x20..0x7f).contains(&b) || matches!(b, b'\r' | b'\n' | b'\t'));
    let mut out = String::with_capacity(bytes.len() + 2);

    if printable {
        out.push('"');
        for &b in bytes {
            match b {
                b'\r' => out.push_str("\\r"),
                b'\n' => out.push_str("\\n"),
                b'\t' => out.push_str("\\t"),
                b'"' => out.push_str("\\\""),
                b'\\' => out.push_str("\\\\"),
                _ => out.push(char::from(b)),
            }
        }
        out.push('"');
    } else {
        out.push('[');
        for (i, b) in bytes.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            let _ = write!(out, "0x{b:02x}");
        }
        out.push(']');
    }

    out
}

fn quote(text: &str) -> String {
    render_bytes(text.as_bytes())
}

/// Render `stream`'s declaration followed by the explicit operations among
/// its first `completed` operations.
pub fn render_explicit(stream: &Stream, completed: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", StreamHeader(stream));
    for op in stream.operations.iter().take(completed).filter(|op| !op.implicit) {
        let _ = writeln!(out, "{}", op.kind);
    }
    out
}

struct StreamHeader<'a>(&'a Stream);

impl fmt::Display for StreamHeader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stream = self.0;
        write!(f, "{} {}", stream.role.as_str(), quote(&stream.location.to_string()))?;
        if let Some(peer) = &stream.accept_peer {
            match stream.role {
                super::Role::Accept => write!(f, " as {peer}")?,
                super::Role::Connect => write!(f, " peer {peer}")?,
            }
        }
        for option in &stream.options {
            write!(f, " option {} {}", option.name, quote(&option.value))?;
        }
        Ok(())
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(bytes) => f.write_str(&render_bytes(bytes)),
            Self::Variable(name) => write!(f, "${{{name}}}"),
            Self::Fixed { len, capture: None } => write!(f, "([0..{len}])"),
            Self::Fixed { len, capture: Some(name) } => write!(f, "([0..{len}]:{name})"),
            Self::Integer { width, expected: Some(value), .. } => {
                write!(f, "{}:{value}", width.as_str())
            },
            Self::Integer { width, expected: None, capture: Some(name) } => {
                write!(f, "({}:{name})", width.as_str())
            },
            Self::Integer { width, expected: None, capture: None } => {
                write!(f, "({})", width.as_str())
            },
            Self::HttpHead { start_line, headers } => {
                f.write_str("(head")?;
                if let Some(line) = start_line {
                    write!(f, " {}", quote(line))?;
                }
                for (name, value) in headers {
                    write!(f, " {}", quote(&format!("{name}: {value}")))?;
                }
                f.write_str(")")
            },
        }
    }
}

impl fmt::Display for ValueGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(bytes) => f.write_str(&render_bytes(bytes)),
            Self::Variable(name) => write!(f, "${{{name}}}"),
            Self::Integer { width, value } => write!(f, "{}:{value}", width.as_str()),
        }
    }
}

impl fmt::Display for HttpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Method(method) => write!(f, "method {}", quote(method)),
            Self::Version(version) => write!(f, "version {}", quote(version)),
            Self::Header { name, value } => write!(f, "header {} {}", quote(name), quote(value)),
            Self::Status { code, reason } => write!(f, "status {code} {}", quote(reason)),
        }
    }
}

fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for item in items {
        write!(f, " {item}")?;
    }
    Ok(())
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadEvent(matchers) => {
                f.write_str("read")?;
                join(f, matchers)
            },
            Self::WriteCommand(values) => {
                f.write_str("write")?;
                join(f, values)
            },
            Self::OptionConfig { name, value } => write!(f, "option {name} {}", quote(value)),
            Self::BarrierAwait(name) => write!(f, "await {name}"),
            Self::BarrierNotify(name) => write!(f, "notify {name}"),
            Self::Close => f.write_str("close"),
            Self::WriteClose => f.write_str("write close"),
            Self::Flush => f.write_str("write flush"),
            Self::Advise { name, values } => {
                write!(f, "write advise {name}")?;
                join(f, values)
            },
            Self::Advised { name, matchers } => {
                write!(f, "read advised {name}")?;
                join(f, matchers)
            },
            Self::ReadConfig(config) => write!(f, "read {config}"),
            Self::WriteConfig(config) => write!(f, "write {config}"),
            Self::Opened => f.write_str("opened"),
            Self::Bound => f.write_str("bound"),
            Self::Connected => f.write_str("connected"),
            Self::Closed => f.write_str("closed"),
            Self::Disconnected => f.write_str("disconnected"),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", StreamHeader(self))?;
        for op in &self.operations {
            writeln!(f, "{}", op.kind)?;
        }
        Ok(())
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for property in &self.properties {
            writeln!(f, "property {} {}", property.name, render_bytes(&property.value))?;
        }
        for (i, stream) in self.streams.iter().enumerate() {
            if i > 0 || !self.properties.is_empty() {
                writeln!(f)?;
            }
            write!(f, "{stream}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::ast::{IntWidth, Location, Region, Role};

    #[test]
    fn printable_bytes_render_quoted() {
        assert_eq!(render_bytes(b"GET /\r\n"), "\"GET /\\r\\n\"");
        assert_eq!(render_bytes(b"say \"hi\""), "\"say \\\"hi\\\"\"");
    }

    #[test]
    fn binary_bytes_render_as_list() {
        assert_eq!(render_bytes(&[0x00, 0xff, 0x10]), "[0x00 0xff 0x10]");
    }

    #[test]
    fn operations_render_in_script_grammar() {
        let read = OperationKind::ReadEvent(vec![
            Matcher::Exact(Bytes::from_static(b"ping")),
            Matcher::Fixed { len: 4, capture: Some("id".to_string()) },
            Matcher::Integer { width: IntWidth::Short, expected: Some(7), capture: None },
        ]);
        assert_eq!(read.to_string(), "read \"ping\" ([0..4]:id) short:7");

        let write = OperationKind::WriteCommand(vec![
            ValueGenerator::Variable("id".to_string()),
            ValueGenerator::Integer { width: IntWidth::Int, value: 1 },
        ]);
        assert_eq!(write.to_string(), "write ${id} int:1");
    }

    #[test]
    fn explicit_rendering_skips_implicit_and_unfinished() {
        let mut stream = Stream::new(
            Role::Connect,
            Location::parse("tcp://localhost:9000").expect("valid location"),
            Region::new(1, 1),
        );
        let write = vec![ValueGenerator::Literal(Bytes::from_static(b"a"))];
        let read = vec![Matcher::Exact(Bytes::from_static(b"b"))];
        stream.operations = vec![
            Operation::implicit(OperationKind::Opened, Region::new(1, 1)),
            Operation::new(OperationKind::WriteCommand(write), Region::new(2, 1)),
            Operation::new(OperationKind::ReadEvent(read), Region::new(3, 1)),
        ];

        assert_eq!(render_explicit(&stream, 2), "connect \"tcp://localhost:9000\"\nwrite \"a\"\n");
    }
}
