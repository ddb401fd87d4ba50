//! A parser for a really small subset of the Postgres SQL dialect. The
//! objective is to only support LISTEN, UNLISTEN and trivial "ping"-type
//! SELECT statements. Many queries accepted by Postgres proper are
//! rejected, but that's fine for our purposes.

use herald_common::error::ParseError;

use crate::query::ParsedQuery;

/// Maximum query length, in bytes.
pub const MAX_QUERY_SIZE: usize = 512;

/// Whitespace class, matching src/backend/parser/scan.l.
const WHITESPACE: &str = " \t\n\r\x0C";

const FLAG_ALLOW_EOF: u32 = 1;
const FLAG_ALLOW_QUOTED_IDENTIFIERS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Eof,
    Identifier,
    Digit,
    Semicolon,
    Asterisk,
}

impl TokenKind {
    fn name(self) -> &'static str {
        match self {
            TokenKind::Eof => "EOF",
            TokenKind::Identifier => "identifier",
            TokenKind::Digit => "digit",
            TokenKind::Semicolon => "semicolon",
            TokenKind::Asterisk => "asterisk",
        }
    }
}

#[derive(Debug)]
struct Token {
    kind: TokenKind,
    payload: String,
}

impl Token {
    fn bare(kind: TokenKind) -> Self {
        Token {
            kind,
            payload: String::new(),
        }
    }
}

/// Parse a raw query string from the wire into one of the recognized query
/// forms.
pub fn parse_query(raw: &[u8]) -> Result<ParsedQuery, ParseError> {
    let input = std::str::from_utf8(raw).map_err(|_| ParseError::InputNotUtf8)?;
    if raw.len() >= MAX_QUERY_SIZE {
        return Err(ParseError::QueryTooLong);
    }

    // hack for JDBC versions 9.1 through 9.3
    if input == "SET extra_float_digits = 3" {
        return Ok(ParsedQuery::NopSet);
    }

    let chars: Vec<char> = input.chars().collect();
    let (token, rest) = next_token(&chars, FLAG_ALLOW_EOF)?;
    match token.kind {
        TokenKind::Eof => Ok(ParsedQuery::Empty),
        TokenKind::Semicolon => {
            semicolon_or_eof(rest)?;
            Ok(ParsedQuery::Empty)
        }
        TokenKind::Identifier => match token.payload.as_str() {
            "select" => parse_select(rest),
            "listen" => parse_listen(rest),
            "unlisten" => parse_unlisten(rest),
            other => Err(ParseError::AtOrNear(other.to_string())),
        },
        other => Err(ParseError::UnexpectedToken(other.name())),
    }
}

fn parse_select(input: &[char]) -> Result<ParsedQuery, ParseError> {
    let (token, rest) = next_token(input, 0)?;
    if token.kind != TokenKind::Digit {
        return Err(ParseError::UnexpectedToken(token.kind.name()));
    }
    semicolon_or_eof(rest)?;
    Ok(ParsedQuery::TrivialSelect)
}

fn parse_listen(input: &[char]) -> Result<ParsedQuery, ParseError> {
    let (token, rest) = next_token(input, FLAG_ALLOW_QUOTED_IDENTIFIERS)?;
    if token.kind != TokenKind::Identifier {
        return Err(ParseError::UnexpectedToken(token.kind.name()));
    }
    semicolon_or_eof(rest)?;
    Ok(ParsedQuery::Listen(token.payload))
}

fn parse_unlisten(input: &[char]) -> Result<ParsedQuery, ParseError> {
    let (token, rest) = next_token(input, FLAG_ALLOW_QUOTED_IDENTIFIERS)?;
    match token.kind {
        TokenKind::Asterisk => {
            semicolon_or_eof(rest)?;
            Ok(ParsedQuery::UnlistenAll)
        }
        TokenKind::Identifier => {
            semicolon_or_eof(rest)?;
            Ok(ParsedQuery::Unlisten(token.payload))
        }
        other => Err(ParseError::UnexpectedToken(other.name())),
    }
}

/// The query must end here, modulo a single trailing semicolon and any
/// whitespace or comments around it.
fn semicolon_or_eof(input: &[char]) -> Result<(), ParseError> {
    let (token, rest) = next_token(input, FLAG_ALLOW_EOF)?;
    match token.kind {
        TokenKind::Eof => return Ok(()),
        TokenKind::Semicolon => {}
        _ => return Err(ParseError::TrailingData),
    }

    let (token, _) = next_token(rest, FLAG_ALLOW_EOF)?;
    if token.kind == TokenKind::Eof {
        Ok(())
    } else {
        Err(ParseError::GarbageAfterSemicolon)
    }
}

fn next_token(mut input: &[char], flags: u32) -> Result<(Token, &[char]), ParseError> {
    loop {
        input = strip_leading_whitespace(input);
        if input.is_empty() {
            return if flags & FLAG_ALLOW_EOF != 0 {
                Ok((Token::bare(TokenKind::Eof), input))
            } else {
                Err(ParseError::UnexpectedEof)
            };
        }

        let r = input[0];
        if flags & FLAG_ALLOW_QUOTED_IDENTIFIERS != 0 && r == '"' {
            return read_quoted_identifier(&input[1..]);
        } else if is_identifier_start(r) {
            return Ok(read_identifier(input));
        } else if r == '1' {
            return read_digit(input);
        } else if r == '-' || r == '/' {
            input = read_comment_or_error(input)?;
        } else if r == ';' {
            return Ok((Token::bare(TokenKind::Semicolon), &input[1..]));
        } else if r == '*' {
            return Ok((Token::bare(TokenKind::Asterisk), &input[1..]));
        } else {
            return Err(ParseError::Generic);
        }
    }
}

fn read_comment_or_error(input: &[char]) -> Result<&[char], ParseError> {
    if input.len() < 2 {
        return Err(ParseError::UnexpectedEof);
    }
    if input[0] == '-' && input[1] == '-' {
        let mut rest = &input[2..];
        while !rest.is_empty() && rest[0] != '\r' && rest[0] != '\n' {
            rest = &rest[1..];
        }
        Ok(rest)
    } else if input[0] == '/' && input[1] == '*' {
        let mut rest = &input[2..];
        loop {
            if rest.len() < 2 {
                return Err(ParseError::UnexpectedEof);
            }
            if rest[0] == '*' && rest[1] == '/' {
                return Ok(&rest[2..]);
            } else if rest[0] == '/' && rest[1] == '*' {
                // C-style comments nest; recurse
                rest = read_comment_or_error(rest)?;
            } else {
                rest = &rest[1..];
            }
        }
    } else {
        Err(ParseError::AtOrNear(input[..2].iter().collect()))
    }
}

/// Only the single digit `1` is a valid token. Anything else except
/// another digit may follow; enforcing what exactly is allowed to follow
/// is the grammar's job, not the scanner's.
fn read_digit(input: &[char]) -> Result<(Token, &[char]), ParseError> {
    if input.len() == 1 {
        return Ok((Token::bare(TokenKind::Digit), &input[1..]));
    }
    let r = input[1];
    if r.is_ascii_digit() {
        Err(ParseError::UnexpectedInteger)
    } else {
        Ok((Token::bare(TokenKind::Digit), &input[1..]))
    }
}

fn is_identifier_start(r: char) -> bool {
    r == '_' || r.is_ascii_alphabetic() || ('\u{80}'..='\u{FF}').contains(&r)
}

fn is_identifier_continuation(r: char) -> bool {
    is_identifier_start(r) || r.is_ascii_digit() || r == '$'
}

fn read_quoted_identifier(mut input: &[char]) -> Result<(Token, &[char]), ParseError> {
    let mut identifier = String::new();
    loop {
        if input.is_empty() {
            return Err(ParseError::UnexpectedEof);
        } else if input[0] == '"' {
            input = &input[1..];
            break;
        } else if input[0] == '\\' {
            if input.len() < 2 {
                return Err(ParseError::UnexpectedEof);
            }
            if input[1] != '\\' && input[1] != '"' {
                return Err(ParseError::UnexpectedEscape(input[1]));
            }
            identifier.push(input[1]);
            input = &input[2..];
        } else {
            identifier.push(input[0]);
            input = &input[1..];
        }
    }
    Ok((
        Token {
            kind: TokenKind::Identifier,
            payload: identifier,
        },
        input,
    ))
}

fn read_identifier(input: &[char]) -> (Token, &[char]) {
    let mut len = 1;
    while len < input.len() && is_identifier_continuation(input[len]) {
        len += 1;
    }
    let payload: String = input[..len].iter().flat_map(|c| c.to_lowercase()).collect();
    (
        Token {
            kind: TokenKind::Identifier,
            payload,
        },
        &input[len..],
    )
}

fn strip_leading_whitespace(mut input: &[char]) -> &[char] {
    while !input.is_empty() && WHITESPACE.contains(input[0]) {
        input = &input[1..];
    }
    input
}
