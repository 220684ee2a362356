use super::Error;

pub const LEFT_DELIM: &str = "[[";
pub const RIGHT_DELIM: &str = "]]";

/// Item is either literal text, or the tokens of a single `[[ ... ]]` action.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Text(String),
    Action { tokens: Vec<Token>, line: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Dot,
    Field(Vec<String>),
    Ident(String),
    Str(String),
    Int(i64),
    Bool(bool),
    Pipe,
    LParen,
    RParen,
    If,
    Else,
    End,
    Range,
}

fn is_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\r' | '\n')
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Split `src` into text and action items, applying `[[-` and `-]]`
/// whitespace trimming to adjacent text.
pub fn scan(src: &str) -> Result<Vec<Item>, Error> {
    let mut items = Vec::new();
    let mut rest = src;
    let mut offset = 0;

    while let Some(index) = rest.find(LEFT_DELIM) {
        let mut text = &rest[..index];
        let mut cursor = index + LEFT_DELIM.len();

        // A trim marker is a '-' immediately inside the delimiter, followed by a space.
        let mut after = rest[cursor..].chars();
        if after.next() == Some('-') && after.next().map(is_space).unwrap_or(false) {
            text = text.trim_end_matches(is_space);
            cursor += 1;
        }
        if !text.is_empty() {
            items.push(Item::Text(text.to_string()));
        }

        let line = 1 + src[..offset + cursor].matches('\n').count();
        let (tokens, consumed, trim_right) = lex_action(&rest[cursor..], line)?;
        items.push(Item::Action { tokens, line });

        cursor += consumed;
        rest = &rest[cursor..];
        offset += cursor;

        if trim_right {
            let trimmed = rest.trim_start_matches(is_space);
            offset += rest.len() - trimmed.len();
            rest = trimmed;
        }
    }
    if !rest.is_empty() {
        items.push(Item::Text(rest.to_string()));
    }
    Ok(items)
}

/// Lex tokens of an action body up to and including its closing delimiter.
/// Returns the tokens, the number of bytes consumed, and whether the action
/// closed with a trim marker.
fn lex_action(s: &str, line: usize) -> Result<(Vec<Token>, usize, bool), Error> {
    let err = |message: String| Error::Parse { line, message };
    let mut tokens = Vec::new();
    let mut i = 0;

    loop {
        let Some(c) = s[i..].chars().next() else {
            return Err(err("unclosed action".to_string()));
        };

        match c {
            c if is_space(c) => {
                if s[i + 1..].starts_with("-]]") {
                    return Ok((tokens, i + 4, true));
                }
                i += 1;
            }
            ']' if s[i..].starts_with(RIGHT_DELIM) => {
                return Ok((tokens, i + RIGHT_DELIM.len(), false));
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' => {
                let (value, consumed) = lex_quoted(&s[i + 1..]).map_err(err)?;
                tokens.push(Token::Str(value));
                i += 1 + consumed;
            }
            '`' => {
                let Some(end) = s[i + 1..].find('`') else {
                    return Err(err("unterminated raw quoted string".to_string()));
                };
                tokens.push(Token::Str(s[i + 1..i + 1 + end].to_string()));
                i += end + 2;
            }
            '.' => {
                let mut path = Vec::new();
                let mut j = i;
                while s[j..].starts_with('.')
                    && s[j + 1..].chars().next().map(is_ident_start).unwrap_or(false)
                {
                    let start = j + 1;
                    let len = s[start..].find(|c| !is_ident(c)).unwrap_or(s.len() - start);
                    path.push(s[start..start + len].to_string());
                    j = start + len;
                }
                if path.is_empty() {
                    tokens.push(Token::Dot);
                    i += 1;
                } else {
                    tokens.push(Token::Field(path));
                    i = j;
                }
            }
            '-' | '0'..='9' => {
                let start = i;
                let mut j = i + 1;
                while s[j..].starts_with(|c: char| c.is_ascii_digit()) {
                    j += 1;
                }
                let literal = &s[start..j];
                let value = literal
                    .parse::<i64>()
                    .map_err(|_| err(format!("bad number syntax: {literal:?}")))?;
                tokens.push(Token::Int(value));
                i = j;
            }
            c if is_ident_start(c) => {
                let len = s[i..].find(|c| !is_ident(c)).unwrap_or(s.len() - i);
                let word = &s[i..i + len];
                tokens.push(match word {
                    "if" => Token::If,
                    "else" => Token::Else,
                    "end" => Token::End,
                    "range" => Token::Range,
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    _ => Token::Ident(word.to_string()),
                });
                i += len;
            }
            c => return Err(err(format!("unexpected {c:?} in command"))),
        }
    }
}

/// Lex the remainder of a double-quoted string, returning its unescaped
/// value and the number of bytes consumed (including the closing quote).
fn lex_quoted(s: &str) -> Result<(String, usize), String> {
    let mut value = String::new();
    let mut chars = s.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((value, i + 1)),
            '\n' => break,
            '\\' => match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, 'r')) => value.push('\r'),
                Some((_, '\\')) => value.push('\\'),
                Some((_, '"')) => value.push('"'),
                Some((_, other)) => return Err(format!("invalid escape \\{other} in string")),
                None => break,
            },
            c => value.push(c),
        }
    }
    Err("unterminated quoted string".to_string())
}
