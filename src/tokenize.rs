//! Tokenizer for stu scripts.
//!
//! Produces the token stream consumed by the parser: names (with embedded
//! `$param` references), single-character operators, `-pot`-style flag
//! words, and brace-delimited command bodies.  Comments start at `#`
//! outside quotes and run to end of line.

use crate::dep::{
    Flags, F_NEWLINE_SEPARATED, F_NUL_SEPARATED, F_OPTIONAL, F_PERSISTENT, F_TRIVIAL,
};
use crate::error::{Error, Place, Result};
use crate::name::ParamName;
use crate::scanner::Scanner;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub struct NameToken {
    pub name: ParamName,
    pub place: Place,
}

#[derive(Debug, Clone)]
pub struct OperatorToken {
    /// One of `: ; = < > @ ( ) [ ] ! ? & *`, or `$` for the `$[` opener.
    pub op: u8,
    pub place: Place,
}

#[derive(Debug, Clone)]
pub struct FlagsToken {
    pub flags: Flags,
    pub place: Place,
}

#[derive(Debug, Clone)]
pub struct CommandToken {
    /// The body between the outer braces, verbatim.
    pub text: String,
    pub place: Place,
}

#[derive(Debug, Clone)]
pub enum Token {
    Name(NameToken),
    Operator(OperatorToken),
    Flags(FlagsToken),
    Command(CommandToken),
}

impl Token {
    pub fn place(&self) -> &Place {
        match self {
            Token::Name(t) => &t.place,
            Token::Operator(t) => &t.place,
            Token::Flags(t) => &t.place,
            Token::Command(t) => &t.place,
        }
    }

    /// How the token reads at the start of a message ("operator ':'" etc.).
    pub fn format_start(&self) -> String {
        match self {
            Token::Name(t) => format!("name '{}'", t.name.raw()),
            Token::Operator(t) => format!("operator '{}'", t.op as char),
            Token::Flags(t) => format!("flags '{}'", crate::dep::flags_format(t.flags).trim_end()),
            Token::Command(_) => "command".to_string(),
        }
    }
}

const OPERATORS: &[u8] = b":;=<>@()[]!?&*";

fn is_operator(c: u8) -> bool {
    OPERATORS.contains(&c)
}

fn is_space(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\r' | b'\n')
}

/// Bytes that may appear in an unquoted name.
fn is_name_char(c: u8) -> bool {
    c != 0 && !is_space(c) && !is_operator(c) && !matches!(c, b'#' | b'$' | b'\'' | b'"' | b'{' | b'}')
}

fn is_param_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

fn flag_bit(c: u8) -> Option<Flags> {
    match c {
        b'p' => Some(F_PERSISTENT),
        b'o' => Some(F_OPTIONAL),
        b't' => Some(F_TRIVIAL),
        b'n' => Some(F_NEWLINE_SEPARATED),
        b'0' => Some(F_NUL_SEPARATED),
        _ => None,
    }
}

/// Tokenize a whole source.  Returns the tokens and the place of the end of
/// input, used for "expected ... at end" diagnostics.
pub fn tokenize(text: &[u8], filename: &Rc<str>) -> Result<(Vec<Token>, Place)> {
    let mut buf = text.to_vec();
    buf.push(0);
    let mut s = Scanner::new(&buf, filename);
    let mut tokens = Vec::new();

    loop {
        while is_space(s.peek()) {
            s.next();
        }
        let place = s.place();
        let c = s.peek();
        match c {
            0 => break,
            b'#' => {
                while s.peek() != b'\n' && s.peek() != 0 {
                    s.next();
                }
            }
            b'{' => {
                tokens.push(Token::Command(read_command(&mut s, place)?));
            }
            b'}' => {
                return Err(Error::syntax(place, "unexpected '}'"));
            }
            b'$' if s.peek_at(1) == b'[' => {
                s.next();
                s.next();
                tokens.push(Token::Operator(OperatorToken { op: b'$', place }));
            }
            b'-' if flag_bit(s.peek_at(1)).is_some() => {
                s.next();
                let mut flags = 0;
                while let Some(bit) = flag_bit(s.peek()) {
                    flags |= bit;
                    s.next();
                }
                if is_name_char(s.peek()) {
                    return Err(Error::syntax(
                        s.place(),
                        format!("invalid flag '-{}'", s.peek() as char),
                    ));
                }
                tokens.push(Token::Flags(FlagsToken { flags, place }));
            }
            _ if is_operator(c) => {
                s.next();
                tokens.push(Token::Operator(OperatorToken { op: c, place }));
            }
            _ => {
                tokens.push(Token::Name(read_name(&mut s, place)?));
            }
        }
    }

    Ok((tokens, s.place()))
}

/// Read a name: adjacent unquoted runs, quoted pieces and `$param`
/// references concatenate into one token.
fn read_name<'a>(s: &mut Scanner<'a>, place: Place) -> Result<NameToken> {
    let mut name = ParamName::new();
    let mut any = false;
    loop {
        let c = s.peek();
        if is_name_char(c) {
            let start = s.ofs;
            s.next();
            while is_name_char(s.peek()) {
                s.next();
            }
            name.push_text(&String::from_utf8_lossy(s.slice(start, s.ofs)));
            any = true;
        } else if c == b'\'' {
            let quote_place = s.place();
            s.next();
            let start = s.ofs;
            loop {
                match s.peek() {
                    0 => {
                        return Err(Error::syntax(quote_place, "unterminated single quote"));
                    }
                    b'\'' => break,
                    _ => s.next(),
                }
            }
            name.push_text(&String::from_utf8_lossy(s.slice(start, s.ofs)));
            s.next();
            any = true;
        } else if c == b'"' {
            let quote_place = s.place();
            s.next();
            let mut text = String::new();
            loop {
                match s.peek() {
                    0 => {
                        return Err(Error::syntax(quote_place, "unterminated double quote"));
                    }
                    b'"' => {
                        s.next();
                        break;
                    }
                    b'\\' => {
                        s.next();
                        let e = s.peek();
                        if e == 0 {
                            return Err(Error::syntax(
                                quote_place,
                                "unterminated double quote",
                            ));
                        }
                        match e {
                            b'n' => text.push('\n'),
                            b't' => text.push('\t'),
                            _ => text.push(e as char),
                        }
                        s.next();
                    }
                    b => {
                        text.push(b as char);
                        s.next();
                    }
                }
            }
            name.push_text(&text);
            any = true;
        } else if c == b'$' {
            if s.peek_at(1) == b'[' {
                // `$[` starts a variable dependency, not a parameter.
                break;
            }
            let dollar_place = s.place();
            s.next();
            let param = if s.skip(b'{') {
                let start = s.ofs;
                while is_param_char(s.peek()) {
                    s.next();
                }
                let param = String::from_utf8_lossy(s.slice(start, s.ofs)).into_owned();
                if !s.skip(b'}') {
                    return Err(Error::syntax(s.place(), "expected '}' closing parameter"));
                }
                param
            } else {
                let start = s.ofs;
                while is_param_char(s.peek()) {
                    s.next();
                }
                String::from_utf8_lossy(s.slice(start, s.ofs)).into_owned()
            };
            if param.is_empty() {
                return Err(Error::syntax(dollar_place, "expected a parameter name after '$'"));
            }
            name.push_param(&param);
            any = true;
        } else {
            break;
        }
    }
    if !any {
        return Err(Error::syntax(place, "expected a name"));
    }
    Ok(NameToken { name, place })
}

/// Read a `{ ... }` command body.  Braces nest; brace characters inside
/// single quotes, double quotes and backticks do not count, and a backslash
/// escapes the next character outside single quotes.
fn read_command<'a>(s: &mut Scanner<'a>, place: Place) -> Result<CommandToken> {
    s.next(); // consume '{'
    let start = s.ofs;
    let mut depth = 1usize;
    #[derive(PartialEq)]
    enum State {
        Normal,
        Single,
        Double,
        Backtick,
    }
    let mut state = State::Normal;
    loop {
        let c = s.peek();
        if c == 0 {
            return Err(Error::syntax(place, "unterminated command, expected '}'"));
        }
        match state {
            State::Normal => match c {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let text = String::from_utf8_lossy(s.slice(start, s.ofs)).into_owned();
                        s.next();
                        return Ok(CommandToken { text, place });
                    }
                }
                b'\'' => state = State::Single,
                b'"' => state = State::Double,
                b'`' => state = State::Backtick,
                b'\\' => {
                    s.next();
                    if s.peek() == 0 {
                        return Err(Error::syntax(place, "unterminated command, expected '}'"));
                    }
                }
                _ => {}
            },
            State::Single => {
                if c == b'\'' {
                    state = State::Normal;
                }
            }
            State::Double => match c {
                b'"' => state = State::Normal,
                b'\\' => {
                    s.next();
                    if s.peek() == 0 {
                        return Err(Error::syntax(place, "unterminated command, expected '}'"));
                    }
                }
                _ => {}
            },
            State::Backtick => match c {
                b'`' => state = State::Normal,
                b'\\' => {
                    s.next();
                    if s.peek() == 0 {
                        return Err(Error::syntax(place, "unterminated command, expected '}'"));
                    }
                }
                _ => {}
            },
        }
        s.next();
    }
}
