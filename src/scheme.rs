//! Reader: Scheme source text to [`Value`] trees.
//!
//! Every symbol is interned through the session's [`SymbolTable`], so the trees
//! it produces can be evaluated directly. `'datum` reads as a two-element list
//! headed by the bare `quote` syntax tag. The reader is the only part of the crate
//! that recurses natively; nesting is capped by the configured maximum depth.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, multispace0},
    combinator::value,
    error::ErrorKind,
};

use crate::ast::{NumberType, SyntaxKind, Value};
use crate::symbol::SymbolTable;
use crate::{Error, MAX_PARSE_DEPTH, ParseError, ParseErrorKind};

/// Characters besides alphanumerics allowed in symbols and numbers
const SYMBOL_SPECIAL_CHARS: &str = "+-*/<>=!?_$%&:.~^";

type ReadError<'a> = nom::error::Error<&'a str>;

fn is_atom_char(c: char) -> bool {
    c.is_alphanumeric() || SYMBOL_SPECIAL_CHARS.contains(c)
}

/// Valid: non-empty, not `.`, no leading digit, no sign or dot directly before a digit
fn is_valid_symbol(name: &str) -> bool {
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (None, _) => false,
        (Some('.'), None) => false,
        (Some(first), _) if first.is_ascii_digit() => false,
        (Some('-' | '+' | '.'), Some(second)) if second.is_ascii_digit() => false,
        _ => name.chars().all(is_atom_char),
    }
}

/// Whether a token should be read as a number rather than a symbol
fn looks_numeric(token: &str) -> bool {
    let mut chars = token.chars();
    match (chars.next(), chars.next()) {
        (Some(first), _) if first.is_ascii_digit() => true,
        (Some('-' | '+' | '.'), Some(second)) => second.is_ascii_digit(),
        _ => false,
    }
}

/// Turn a recoverable nom error into a committed one
fn commit(error: nom::Err<ReadError<'_>>) -> nom::Err<ReadError<'_>> {
    match error {
        nom::Err::Error(e) => nom::Err::Failure(e),
        other => other,
    }
}

fn fail<T>(input: &str, code: ErrorKind) -> IResult<&str, T> {
    Err(nom::Err::Failure(nom::error::Error::new(input, code)))
}

/// Skip whitespace and `;` line comments
fn atmosphere(mut input: &str) -> IResult<&str, ()> {
    loop {
        let (rest, _) = multispace0.parse(input)?;
        match rest.strip_prefix(';') {
            Some(comment) => input = comment.find('\n').map_or("", |end| &comment[end..]),
            None => return Ok((rest, ())),
        }
    }
}

/// Parse a boolean (#t, #f, #true, #false)
fn parse_bool(input: &str) -> IResult<&str, Value> {
    let (rest, b) = alt((
        value(true, tag("#true")),
        value(false, tag("#false")),
        value(true, tag("#t")),
        value(false, tag("#f")),
    ))
    .parse(input)?;
    if rest.starts_with(is_atom_char) {
        return fail(input, ErrorKind::Tag);
    }
    Ok((rest, Value::from(b)))
}

/// Parse a character literal (#\a, #\space, #\newline, #\tab)
fn parse_char(input: &str) -> IResult<&str, Value> {
    let (rest, _) = tag("#\\").parse(input)?;
    let Some(first) = rest.chars().next() else {
        return fail(rest, ErrorKind::Eof);
    };
    let (rest, name) = if first.is_alphabetic() {
        take_while1(|c: char| c.is_alphanumeric()).parse(rest)?
    } else {
        let (name, rest) = rest.split_at(first.len_utf8());
        (rest, name)
    };
    let c = match name {
        "space" => ' ',
        "newline" => '\n',
        "tab" => '\t',
        _ => {
            let mut chars = name.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => c,
                _ => return fail(input, ErrorKind::Char),
            }
        }
    };
    Ok((rest, Value::Char(c)))
}

/// Parse a string literal
fn parse_string(input: &str) -> IResult<&str, Value> {
    let (mut remaining, _) = char('"').parse(input)?;
    let mut text = String::new();

    loop {
        let mut char_iter = remaining.chars();
        match char_iter.next() {
            Some('"') => return Ok((char_iter.as_str(), Value::from(text))),
            Some('\\') => {
                match char_iter.next() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('\\') => text.push('\\'),
                    Some('"') => text.push('"'),
                    Some(_) => return fail(remaining, ErrorKind::Escaped),
                    // backslash at end of input
                    None => return fail(char_iter.as_str(), ErrorKind::Escaped),
                }
                remaining = char_iter.as_str();
            }
            Some(ch) => {
                text.push(ch);
                remaining = char_iter.as_str();
            }
            None => return fail(remaining, ErrorKind::Char),
        }
    }
}

/// Text to values, interning through one symbol table
#[derive(Debug, Clone)]
pub struct Reader {
    symbols: SymbolTable,
    max_depth: usize,
}

impl Reader {
    pub fn new(symbols: SymbolTable) -> Self {
        Reader {
            symbols,
            max_depth: MAX_PARSE_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Read exactly one datum; anything but whitespace and comments after it is an error
    pub fn read(&self, input: &str) -> Result<Value, ParseError> {
        let (rest, datum) = self
            .datum(input, 0)
            .map_err(|e| self.to_parse_error(input, e))?;
        let (rest, ()) = atmosphere(rest).map_err(|e| self.to_parse_error(input, e))?;
        if !rest.is_empty() {
            return Err(ParseError::with_context(
                ParseErrorKind::TrailingContent,
                format!("Unexpected remaining input: '{rest}'"),
                input,
                input.len() - rest.len(),
            ));
        }
        Ok(datum)
    }

    /// Read every top-level datum of `input`, in order
    pub fn read_all(&self, input: &str) -> Result<Vec<Value>, ParseError> {
        let mut data = Vec::new();
        let mut rest = input;
        loop {
            let (after, ()) = atmosphere(rest).map_err(|e| self.to_parse_error(input, e))?;
            if after.is_empty() {
                return Ok(data);
            }
            let (after, datum) = self
                .datum(after, 0)
                .map_err(|e| self.to_parse_error(input, e))?;
            data.push(datum);
            rest = after;
        }
    }

    fn datum<'a>(&self, input: &'a str, depth: usize) -> IResult<&'a str, Value> {
        if depth >= self.max_depth {
            return fail(input, ErrorKind::TooLarge);
        }
        let (input, ()) = atmosphere(input)?;
        alt((
            |input| self.quoted(input, depth),
            |input| self.list(input, depth),
            parse_string,
            parse_char,
            parse_bool,
            |input| self.atom(input),
        ))
        .parse(input)
    }

    /// Parse quoted expression ('expr -> (<quote> expr))
    fn quoted<'a>(&self, input: &'a str, depth: usize) -> IResult<&'a str, Value> {
        let (input, _) = char('\'').parse(input)?;
        let (input, datum) = self.datum(input, depth + 1).map_err(commit)?;
        Ok((input, Value::list([Value::Syntax(SyntaxKind::Quote), datum])))
    }

    /// Parse a proper list, a dotted pair or `()`
    fn list<'a>(&self, input: &'a str, depth: usize) -> IResult<&'a str, Value> {
        let (mut input, _) = char('(').parse(input)?;
        let mut elements = Vec::new();
        let mut tail = Value::Null;

        loop {
            let (rest, ()) = atmosphere(input)?;
            input = rest;
            if let Some(rest) = input.strip_prefix(')') {
                input = rest;
                break;
            }
            if input.is_empty() {
                return fail(input, ErrorKind::Eof);
            }
            if let Some(after_dot) = input.strip_prefix('.')
                && !after_dot.starts_with(is_atom_char)
            {
                if elements.is_empty() {
                    return fail(input, ErrorKind::Char);
                }
                let (rest, last) = self.datum(after_dot, depth + 1).map_err(commit)?;
                let (rest, ()) = atmosphere(rest)?;
                let (rest, _) = char(')').parse(rest).map_err(commit)?;
                tail = last;
                input = rest;
                break;
            }
            let (rest, element) = self.datum(input, depth + 1).map_err(commit)?;
            elements.push(element);
            input = rest;
        }

        let list = elements
            .into_iter()
            .rev()
            .fold(tail, |tail, head| Value::cons(head, tail));
        Ok((input, list))
    }

    /// Parse a number or a symbol
    fn atom<'a>(&self, input: &'a str) -> IResult<&'a str, Value> {
        let (rest, token) = take_while1(is_atom_char).parse(input)?;
        if let Ok(n) = token.parse::<NumberType>() {
            return Ok((rest, Value::Integer(n)));
        }
        if looks_numeric(token) {
            let digits = token.trim_start_matches(['+', '-']);
            if digits.chars().all(|c| c.is_ascii_digit()) {
                return fail(input, ErrorKind::Digit);
            }
            return match token.parse::<f64>() {
                Ok(d) => Ok((rest, Value::Double(d))),
                Err(_) => fail(input, ErrorKind::Float),
            };
        }
        if is_valid_symbol(token) {
            Ok((rest, Value::Symbol(self.symbols.get_or_create(token))))
        } else {
            Err(nom::Err::Error(nom::error::Error::new(input, ErrorKind::Alpha)))
        }
    }

    /// Convert nom parsing errors to user-friendly messages
    fn to_parse_error(&self, input: &str, error: nom::Err<ReadError<'_>>) -> ParseError {
        match error {
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                let position = input.len().saturating_sub(e.input.len());
                let (kind, message) = match e.code {
                    ErrorKind::TooLarge => (
                        ParseErrorKind::TooDeeplyNested,
                        format!("Expression too deeply nested (max depth: {})", self.max_depth),
                    ),
                    _ if e.input.is_empty() => (
                        ParseErrorKind::Incomplete,
                        "Unexpected end of input".to_owned(),
                    ),
                    ErrorKind::Escaped => (
                        ParseErrorKind::InvalidSyntax,
                        format!("Invalid escape sequence at position {position}"),
                    ),
                    ErrorKind::Digit => (
                        ParseErrorKind::InvalidSyntax,
                        format!("Integer literal out of range at position {position}"),
                    ),
                    ErrorKind::Float => (
                        ParseErrorKind::InvalidSyntax,
                        format!("Invalid number at position {position}"),
                    ),
                    ErrorKind::Char => (
                        ParseErrorKind::InvalidSyntax,
                        format!("Unexpected character at position {position}"),
                    ),
                    _ => {
                        let near: String = e.input.chars().take(10).collect();
                        (
                            ParseErrorKind::InvalidSyntax,
                            format!("Invalid syntax near '{near}'"),
                        )
                    }
                };
                ParseError::with_context(kind, message, input, position)
            }
            nom::Err::Incomplete(_) => {
                ParseError::from_message(ParseErrorKind::Incomplete, "Incomplete input")
            }
        }
    }
}

/// Parse a complete S-expression from input, interning symbols in `symbols`.
pub fn parse_scheme(input: &str, symbols: &SymbolTable) -> Result<Value, Error> {
    Ok(Reader::new(symbols.clone()).read(input)?)
}
