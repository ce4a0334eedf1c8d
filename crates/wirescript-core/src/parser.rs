//! Line-oriented script parser.
//!
//! One construct per line; `#` starts a comment. A stream runs from its
//! `accept`/`connect` line to the next one.
//!
//! ```text
//! property greeting "hello"
//!
//! accept "tcp://localhost:9000" as server option nodelay true
//! read "ping"
//! write ${greeting} [0x00 0x01] short:7
//! notify ready
//!
//! connect await ready "tcp://localhost:9000"
//! write "ping"
//! read ([0..7]:reply)
//! close
//! ```
//!
//! Operand tokens: quoted strings with `\r \n \t \0 \" \\ \xHH` escapes,
//! byte lists `[0x.. 0x..]`, variables `${name}`, fixed-length captures
//! `([0..N])` / `([0..N]:name)`, integer captures `(int)` / `(int:name)` and
//! integer literals `byte:N short:N int:N long:N`.

use bytes::Bytes;

use crate::{
    ast::{
        HttpConfig, IntWidth, Location, Matcher, Operation, OperationKind, Property, Region, Role,
        Script, Stream, StreamOption, ValueGenerator,
    },
    error::ParseError,
};

/// Turns script text into a raw, unresolved [`Script`].
pub trait ScriptParser {
    /// Parse `text`.
    fn parse(&self, text: &str) -> Result<Script, ParseError>;
}

/// The line grammar described in the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineParser;

impl ScriptParser for LineParser {
    fn parse(&self, text: &str) -> Result<Script, ParseError> {
        let mut script = Script::default();

        for (idx, line) in text.lines().enumerate() {
            let line_no = u32::try_from(idx + 1).unwrap_or(u32::MAX);
            let tokens = tokenize(line, line_no)?;
            if tokens.is_empty() {
                continue;
            }
            parse_line(&mut script, Cursor { tokens, pos: 0, line: line_no })?;
        }

        Ok(script)
    }
}

/// Parse `text` with [`LineParser`].
pub fn parse(text: &str) -> Result<Script, ParseError> {
    LineParser.parse(text)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Word(String),
    Str(Bytes),
    ByteList(Bytes),
    Var(String),
    Group(String),
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    region: Region,
}

fn tokenize(line: &str, line_no: u32) -> Result<Vec<Token>, ParseError> {
    let bytes = line.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c == b'#' {
            break;
        }

        let region = Region::new(line_no, u32::try_from(i + 1).unwrap_or(u32::MAX));
        let (kind, next) = match c {
            b'"' => read_quoted(bytes, i + 1, region)?,
            b'[' => read_byte_list(line, i + 1, region)?,
            b'(' => {
                let end = find(bytes, i + 1, b')')
                    .ok_or_else(|| ParseError::new(region, "unterminated `(`"))?;
                (TokenKind::Group(line[i + 1..end].trim().to_string()), end + 1)
            },
            b'$' if bytes.get(i + 1) == Some(&b'{') => {
                let end = find(bytes, i + 2, b'}')
                    .ok_or_else(|| ParseError::new(region, "unterminated `${`"))?;
                let name = &line[i + 2..end];
                if !is_identifier(name) {
                    return Err(ParseError::new(region, format!("invalid variable name {name:?}")));
                }
                (TokenKind::Var(name.to_string()), end + 1)
            },
            _ => {
                let end = bytes[i..]
                    .iter()
                    .position(u8::is_ascii_whitespace)
                    .map_or(bytes.len(), |offset| i + offset);
                (TokenKind::Word(line[i..end].to_string()), end)
            },
        };

        tokens.push(Token { kind, region });
        i = next;
    }

    Ok(tokens)
}

fn find(bytes: &[u8], from: usize, needle: u8) -> Option<usize> {
    bytes[from..].iter().position(|&b| b == needle).map(|offset| from + offset)
}

fn read_quoted(
    bytes: &[u8],
    start: usize,
    region: Region,
) -> Result<(TokenKind, usize), ParseError> {
    let mut out = Vec::new();
    let mut i = start;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => return Ok((TokenKind::Str(Bytes::from(out)), i + 1)),
            b'\\' => {
                let escape = *bytes
                    .get(i + 1)
                    .ok_or_else(|| ParseError::new(region, "dangling escape"))?;
                match escape {
                    b'r' => out.push(b'\r'),
                    b'n' => out.push(b'\n'),
                    b't' => out.push(b'\t'),
                    b'0' => out.push(0),
                    b'"' => out.push(b'"'),
                    b'\\' => out.push(b'\\'),
                    b'x' => {
                        let hex = bytes
                            .get(i + 2..i + 4)
                            .and_then(|h| std::str::from_utf8(h).ok())
                            .and_then(|h| u8::from_str_radix(h, 16).ok())
                            .ok_or_else(|| ParseError::new(region, "invalid `\\x` escape"))?;
                        out.push(hex);
                        i += 2;
                    },
                    other => {
                        let message = format!("unknown escape `\\{}`", char::from(other));
                        return Err(ParseError::new(region, message));
                    },
                }
                i += 2;
            },
            b => {
                out.push(b);
                i += 1;
            },
        }
    }

    Err(ParseError::new(region, "unterminated string"))
}

fn read_byte_list(
    line: &str,
    start: usize,
    region: Region,
) -> Result<(TokenKind, usize), ParseError> {
    let end = find(line.as_bytes(), start, b']')
        .ok_or_else(|| ParseError::new(region, "unterminated `[`"))?;
    let mut out = Vec::new();

    for item in line[start..end].split_whitespace() {
        let value = item
            .strip_prefix("0x")
            .or_else(|| item.strip_prefix("0X"))
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .ok_or_else(|| ParseError::new(region, format!("invalid byte {item:?}")))?;
        out.push(value);
    }

    Ok((TokenKind::ByteList(Bytes::from(out)), end + 1))
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
    line: u32,
}

impl Cursor {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_word(&self) -> Option<&str> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Word(word)) => Some(word),
            _ => None,
        }
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn is_done(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    /// Region of the next token, or end of line.
    fn region(&self) -> Region {
        self.peek().map_or_else(
            || {
                let column = self.tokens.last().map_or(1, |t| t.region.column + 1);
                Region::new(self.line, column)
            },
            |t| t.region,
        )
    }

    fn expect(&mut self, what: &str) -> Result<Token, ParseError> {
        let region = self.region();
        self.advance().ok_or_else(|| ParseError::new(region, format!("expected {what}")))
    }

    fn expect_word(&mut self, what: &str) -> Result<(String, Region), ParseError> {
        let token = self.expect(what)?;
        match token.kind {
            TokenKind::Word(word) => Ok((word, token.region)),
            _ => Err(ParseError::new(token.region, format!("expected {what}"))),
        }
    }

    fn expect_name(&mut self, what: &str) -> Result<String, ParseError> {
        let (word, region) = self.expect_word(what)?;
        if is_identifier(&word) {
            Ok(word)
        } else {
            Err(ParseError::new(region, format!("invalid {what} {word:?}")))
        }
    }

    /// A bare word or a quoted UTF-8 string.
    fn expect_text(&mut self, what: &str) -> Result<String, ParseError> {
        let token = self.expect(what)?;
        match token.kind {
            TokenKind::Word(word) => Ok(word),
            TokenKind::Str(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|_| ParseError::new(token.region, format!("{what} must be UTF-8"))),
            _ => Err(ParseError::new(token.region, format!("expected {what}"))),
        }
    }

    fn finish(&self) -> Result<(), ParseError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(ParseError::new(token.region, "unexpected trailing token")),
        }
    }
}

fn parse_line(script: &mut Script, mut cursor: Cursor) -> Result<(), ParseError> {
    let (keyword, region) = cursor.expect_word("keyword")?;

    match keyword.as_str() {
        "property" => {
            let name = cursor.expect_name("property name")?;
            let token = cursor.expect("property value")?;
            let value = match token.kind {
                TokenKind::Str(bytes) | TokenKind::ByteList(bytes) => bytes,
                TokenKind::Word(word) => match parse_int_literal(&word, token.region)? {
                    Some((width, value)) => width.encode(value),
                    None => Bytes::from(word),
                },
                TokenKind::Var(_) | TokenKind::Group(_) => {
                    return Err(ParseError::new(token.region, "property value must be a literal"));
                },
            };
            cursor.finish()?;
            script.properties.push(Property { name, value, region });
        },
        "accept" => {
            let location = parse_location(&mut cursor)?;
            let mut stream = Stream::new(Role::Accept, location, region);
            if cursor.peek_word() == Some("as") {
                cursor.advance();
                stream.accept_peer = Some(cursor.expect_name("accept name")?);
            }
            stream.options = parse_stream_options(&mut cursor)?;
            script.streams.push(stream);
        },
        "connect" => {
            let mut awaited = None;
            if cursor.peek_word() == Some("await") {
                let await_region = cursor.region();
                cursor.advance();
                awaited = Some((cursor.expect_name("barrier name")?, await_region));
            }
            let location = parse_location(&mut cursor)?;
            let mut stream = Stream::new(Role::Connect, location, region);
            if cursor.peek_word() == Some("peer") {
                cursor.advance();
                stream.accept_peer = Some(cursor.expect_name("peer name")?);
            }
            stream.options = parse_stream_options(&mut cursor)?;
            if let Some((name, await_region)) = awaited {
                let kind = OperationKind::BarrierAwait(name);
                stream.operations.push(Operation::new(kind, await_region));
            }
            script.streams.push(stream);
        },
        _ => {
            let kind = parse_operation(&keyword, region, &mut cursor)?;
            cursor.finish()?;
            let stream = script
                .streams
                .last_mut()
                .ok_or_else(|| {
                    ParseError::new(region, format!("`{keyword}` outside of a stream"))
                })?;
            stream.operations.push(Operation::new(kind, region));
        },
    }

    Ok(())
}

fn parse_location(cursor: &mut Cursor) -> Result<Location, ParseError> {
    let region = cursor.region();
    let text = cursor.expect_text("location")?;
    Location::parse(&text)
        .ok_or_else(|| ParseError::new(region, format!("invalid location {text:?}")))
}

fn parse_stream_options(cursor: &mut Cursor) -> Result<Vec<StreamOption>, ParseError> {
    let mut options = Vec::new();
    while !cursor.is_done() {
        let (word, region) = cursor.expect_word("`option`")?;
        if word != "option" {
            return Err(ParseError::new(region, format!("unexpected {word:?}, expected `option`")));
        }
        let name = cursor.expect_name("option name")?;
        let value = cursor.expect_text("option value")?;
        options.push(StreamOption { name, value });
    }
    Ok(options)
}

fn parse_operation(
    keyword: &str,
    region: Region,
    cursor: &mut Cursor,
) -> Result<OperationKind, ParseError> {
    let kind = match keyword {
        "opened" => OperationKind::Opened,
        "bound" => OperationKind::Bound,
        "connected" => OperationKind::Connected,
        "closed" => OperationKind::Closed,
        "disconnected" => OperationKind::Disconnected,
        "close" => OperationKind::Close,
        "await" => OperationKind::BarrierAwait(cursor.expect_name("barrier name")?),
        "notify" => OperationKind::BarrierNotify(cursor.expect_name("barrier name")?),
        "option" => parse_option(cursor)?,
        "read" => parse_read(cursor)?,
        "write" => parse_write(cursor)?,
        other => return Err(ParseError::new(region, format!("unknown keyword `{other}`"))),
    };
    Ok(kind)
}

fn parse_option(cursor: &mut Cursor) -> Result<OperationKind, ParseError> {
    let name = cursor.expect_name("option name")?;
    let value = cursor.expect_text("option value")?;
    Ok(OperationKind::OptionConfig { name, value })
}

/// Forms shared by `read` and `write`.
enum Common {
    Operation(OperationKind),
    Config(HttpConfig),
}

/// Parse a shared `read|write` form. `None` if the next token starts operands.
fn parse_common(cursor: &mut Cursor) -> Result<Option<Common>, ParseError> {
    let Some(word) = cursor.peek_word().map(str::to_string) else {
        return Ok(None);
    };

    let parsed = match word.as_str() {
        "await" => {
            cursor.advance();
            Common::Operation(OperationKind::BarrierAwait(cursor.expect_name("barrier name")?))
        },
        "notify" => {
            cursor.advance();
            Common::Operation(OperationKind::BarrierNotify(cursor.expect_name("barrier name")?))
        },
        "option" => {
            cursor.advance();
            Common::Operation(parse_option(cursor)?)
        },
        "method" => {
            cursor.advance();
            Common::Config(HttpConfig::Method(cursor.expect_text("method")?))
        },
        "version" => {
            cursor.advance();
            Common::Config(HttpConfig::Version(cursor.expect_text("version")?))
        },
        "header" => {
            cursor.advance();
            let name = cursor.expect_text("header name")?;
            let value = cursor.expect_text("header value")?;
            Common::Config(HttpConfig::Header { name, value })
        },
        "status" => {
            cursor.advance();
            let (code, region) = cursor.expect_word("status code")?;
            let code = code
                .parse::<u16>()
                .map_err(|_| ParseError::new(region, format!("invalid status code {code:?}")))?;
            let reason = cursor.expect_text("status reason")?;
            Common::Config(HttpConfig::Status { code, reason })
        },
        _ => return Ok(None),
    };

    Ok(Some(parsed))
}

fn parse_read(cursor: &mut Cursor) -> Result<OperationKind, ParseError> {
    match parse_common(cursor)? {
        Some(Common::Operation(kind)) => return Ok(kind),
        Some(Common::Config(config)) => return Ok(OperationKind::ReadConfig(config)),
        None => {},
    }

    if cursor.peek_word() == Some("advised") {
        cursor.advance();
        let name = cursor.expect_name("advisory name")?;
        let matchers = parse_matchers(cursor)?;
        return Ok(OperationKind::Advised { name, matchers });
    }

    let region = cursor.region();
    let matchers = parse_matchers(cursor)?;
    if matchers.is_empty() {
        return Err(ParseError::new(region, "`read` needs at least one matcher"));
    }
    Ok(OperationKind::ReadEvent(matchers))
}

fn parse_write(cursor: &mut Cursor) -> Result<OperationKind, ParseError> {
    match parse_common(cursor)? {
        Some(Common::Operation(kind)) => return Ok(kind),
        Some(Common::Config(config)) => return Ok(OperationKind::WriteConfig(config)),
        None => {},
    }

    match cursor.peek_word() {
        Some("close") => {
            cursor.advance();
            return Ok(OperationKind::WriteClose);
        },
        Some("flush") => {
            cursor.advance();
            return Ok(OperationKind::Flush);
        },
        Some("advise") => {
            cursor.advance();
            let name = cursor.expect_name("advisory name")?;
            let values = parse_generators(cursor)?;
            return Ok(OperationKind::Advise { name, values });
        },
        _ => {},
    }

    let region = cursor.region();
    let values = parse_generators(cursor)?;
    if values.is_empty() {
        return Err(ParseError::new(region, "`write` needs at least one value"));
    }
    Ok(OperationKind::WriteCommand(values))
}

/// `width:value` literal. `Ok(None)` if `word` is not shaped like one.
fn parse_int_literal(word: &str, region: Region) -> Result<Option<(IntWidth, i64)>, ParseError> {
    let Some((name, digits)) = word.split_once(':') else {
        return Ok(None);
    };
    let (Some(width), Ok(value)) = (IntWidth::from_name(name), digits.parse::<i128>()) else {
        return Ok(None);
    };
    match width.literal(value) {
        Some(value) => Ok(Some((width, value))),
        None => Err(ParseError::new(region, format!("{value} does not fit in {name}"))),
    }
}

fn parse_matchers(cursor: &mut Cursor) -> Result<Vec<Matcher>, ParseError> {
    let mut matchers = Vec::new();
    while let Some(token) = cursor.advance() {
        matchers.push(parse_matcher(token)?);
    }
    Ok(matchers)
}

fn parse_matcher(token: Token) -> Result<Matcher, ParseError> {
    let region = token.region;
    match token.kind {
        TokenKind::Str(bytes) | TokenKind::ByteList(bytes) => Ok(Matcher::Exact(bytes)),
        TokenKind::Var(name) => Ok(Matcher::Variable(name)),
        TokenKind::Word(word) => parse_int_literal(&word, region)?
            .map(|(width, value)| Matcher::Integer { width, expected: Some(value), capture: None })
            .ok_or_else(|| ParseError::new(region, format!("invalid matcher {word:?}"))),
        TokenKind::Group(inner) => {
            let (pattern, capture) = match inner.split_once(':') {
                Some((pattern, name)) if is_identifier(name) => {
                    (pattern.trim(), Some(name.to_string()))
                },
                Some(_) => {
                    return Err(ParseError::new(region, format!("invalid capture ({inner})")));
                },
                None => (inner.as_str(), None),
            };

            if let Some(width) = IntWidth::from_name(pattern) {
                return Ok(Matcher::Integer { width, expected: None, capture });
            }

            pattern
                .strip_prefix("[0..")
                .and_then(|rest| rest.strip_suffix(']'))
                .and_then(|len| len.parse::<usize>().ok())
                .map(|len| Matcher::Fixed { len, capture })
                .ok_or_else(|| ParseError::new(region, format!("invalid matcher ({inner})")))
        },
    }
}

fn parse_generators(cursor: &mut Cursor) -> Result<Vec<ValueGenerator>, ParseError> {
    let mut values = Vec::new();
    while let Some(token) = cursor.advance() {
        let value = match token.kind {
            TokenKind::Str(bytes) | TokenKind::ByteList(bytes) => ValueGenerator::Literal(bytes),
            TokenKind::Var(name) => ValueGenerator::Variable(name),
            TokenKind::Word(word) => parse_int_literal(&word, token.region)?
                .map(|(width, value)| ValueGenerator::Integer { width, value })
                .ok_or_else(|| ParseError::new(token.region, format!("invalid value {word:?}")))?,
            TokenKind::Group(inner) => {
                let message = format!("`({inner})` is only valid in reads");
                return Err(ParseError::new(token.region, message));
            },
        };
        values.push(value);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PING_PONG: &str = r#"
# simple exchange
accept "tcp://localhost:9000"
read "ping"
write "pong"

connect "tcp://localhost:9000"
write "ping"
read "pong"
"#;

    #[test]
    fn parses_streams_and_operations() {
        let script = parse(PING_PONG).expect("script should parse");

        assert_eq!(script.streams.len(), 2);
        assert_eq!(script.streams[0].role, Role::Accept);
        assert_eq!(script.streams[0].region, Region::new(3, 1));
        assert_eq!(
            script.streams[1].operations[1].kind,
            OperationKind::ReadEvent(vec![Matcher::Exact(Bytes::from_static(b"pong"))])
        );
        assert!(script.streams.iter().flat_map(|s| &s.operations).all(|op| !op.implicit));
    }

    #[test]
    fn connect_await_becomes_leading_await() {
        let script =
            parse("connect await ready tcp://localhost:9000 peer srv option nodelay true\n")
                .expect("script should parse");
        let stream = &script.streams[0];

        assert_eq!(stream.accept_peer.as_deref(), Some("srv"));
        assert_eq!(stream.options, vec![StreamOption {
            name: "nodelay".to_string(),
            value: "true".to_string()
        }]);
        assert_eq!(stream.operations[0].kind, OperationKind::BarrierAwait("ready".to_string()));
    }

    #[test]
    fn parses_operands() {
        let script = parse(
            "property id [0x01 0x02]\naccept tcp://h:1\n\
             read ${id} ([0..3]:x) (short:n) int:-4 \"a\\r\\n\\x41\"\nwrite byte:1 ${x}\n",
        )
        .expect("script should parse");

        assert_eq!(script.properties[0].value.as_ref(), &[0x01, 0x02]);
        let OperationKind::ReadEvent(matchers) = &script.streams[0].operations[0].kind else {
            panic!("expected read");
        };
        assert_eq!(matchers, &vec![
            Matcher::Variable("id".to_string()),
            Matcher::Fixed { len: 3, capture: Some("x".to_string()) },
            Matcher::Integer {
                width: IntWidth::Short,
                expected: None,
                capture: Some("n".to_string())
            },
            Matcher::Integer { width: IntWidth::Int, expected: Some(-4), capture: None },
            Matcher::Exact(Bytes::from_static(b"a\r\nA")),
        ]);
    }

    #[test]
    fn parses_barrier_and_http_forms() {
        let script = parse(
            "accept http://h:80/x\nread method GET\nread header Host h\n\
             write status 200 \"OK\"\nwrite notify done\nread await go\nwrite close\nwrite flush\n",
        )
        .expect("script should parse");
        let kinds: Vec<_> = script.streams[0].operations.iter().map(|op| op.kind.clone()).collect();

        assert_eq!(kinds, vec![
            OperationKind::ReadConfig(HttpConfig::Method("GET".to_string())),
            OperationKind::ReadConfig(HttpConfig::Header {
                name: "Host".to_string(),
                value: "h".to_string()
            }),
            OperationKind::WriteConfig(HttpConfig::Status { code: 200, reason: "OK".to_string() }),
            OperationKind::BarrierNotify("done".to_string()),
            OperationKind::BarrierAwait("go".to_string()),
            OperationKind::WriteClose,
            OperationKind::Flush,
        ]);
    }

    #[test]
    fn operation_outside_stream_is_rejected() {
        let err = parse("read \"x\"\n").expect_err("should fail");
        insta::assert_snapshot!(err.to_string(), @"1:1: `read` outside of a stream");
    }

    #[test]
    fn reports_region_of_bad_token() {
        let err = parse("accept tcp://h:1\nread \"ok\" bogus\n").expect_err("should fail");
        assert_eq!(err.region, Region::new(2, 11));
    }

    #[test]
    fn rejects_unterminated_string() {
        let err = parse("accept tcp://h:1\nwrite \"abc\n").expect_err("should fail");
        assert_eq!(err.message, "unterminated string");
    }

    #[test]
    fn int_literals_are_range_checked() {
        let script = parse("accept tcp://h:1\nread byte:200 short:65535\nwrite byte:-128\n")
            .expect("script should parse");
        let OperationKind::ReadEvent(matchers) = &script.streams[0].operations[0].kind else {
            panic!("expected read");
        };
        assert_eq!(matchers[0], Matcher::Integer {
            width: IntWidth::Byte,
            expected: Some(200),
            capture: None
        });

        let err = parse("accept tcp://h:1\nwrite byte:300\n").expect_err("should fail");
        insta::assert_snapshot!(err.to_string(), @"2:7: 300 does not fit in byte");
        assert!(parse("accept tcp://h:1\nread short:-32769\n").is_err());
    }

    #[test]
    fn rejects_empty_read() {
        assert!(parse("accept tcp://h:1\nread\n").is_err());
        assert!(parse("accept tcp://h:1\nwrite\n").is_err());
    }

    #[test]
    fn rendered_script_parses_back() {
        let script = parse(
            "property p \"v\"\naccept tcp://h:1 as srv\nread ([0..2]:x) long:9\n\
             write advise note ${x}\nread advised note \"y\"\n",
        )
        .expect("script should parse");
        let reparsed = parse(&script.to_string()).expect("rendered script should parse");

        let strip = |s: &Script| -> Vec<Vec<OperationKind>> {
            s.streams
                .iter()
                .map(|st| st.operations.iter().map(|op| op.kind.clone()).collect())
                .collect()
        };
        assert_eq!(strip(&reparsed), strip(&script));
        assert_eq!(reparsed.properties[0].value, script.properties[0].value);
    }
}
