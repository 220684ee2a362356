use super::funcs;
use super::lex::{Item, Token};
use super::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    Action(Pipeline),
    If {
        cond: Pipeline,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
    Range {
        over: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

/// Pipeline of commands, where each command after the first receives the
/// result of its predecessor as a final argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub line: usize,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub operands: Vec<Operand>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Dot,
    Field(Vec<String>),
    Func(String),
    Str(String),
    Int(i64),
    Bool(bool),
    Pipeline(Pipeline),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Terminator {
    Else,
    End,
}

pub fn parse(items: Vec<Item>) -> Result<Vec<Node>, Error> {
    let mut parser = Parser {
        items: items.into_iter(),
    };
    match parser.list()? {
        (nodes, None) => Ok(nodes),
        (_, Some((Terminator::End, line))) => Err(Error::Parse {
            line,
            message: "unexpected [[end]]".to_string(),
        }),
        (_, Some((Terminator::Else, line))) => Err(Error::Parse {
            line,
            message: "unexpected [[else]]".to_string(),
        }),
    }
}

struct Parser {
    items: std::vec::IntoIter<Item>,
}

impl Parser {
    fn list(&mut self) -> Result<(Vec<Node>, Option<(Terminator, usize)>), Error> {
        let mut nodes = Vec::new();

        while let Some(item) = self.items.next() {
            let (tokens, line) = match item {
                Item::Text(text) => {
                    nodes.push(Node::Text(text));
                    continue;
                }
                Item::Action { tokens, line } => (tokens, line),
            };

            match tokens.first() {
                Some(Token::End) => {
                    expect_bare(&tokens, "end", line)?;
                    return Ok((nodes, Some((Terminator::End, line))));
                }
                Some(Token::Else) => {
                    expect_bare(&tokens, "else", line)?;
                    return Ok((nodes, Some((Terminator::Else, line))));
                }
                Some(Token::If) => {
                    let cond = pipeline(&tokens[1..], line)?;
                    let (then, otherwise) = self.branches("if", line)?;
                    nodes.push(Node::If {
                        cond,
                        then,
                        otherwise,
                    });
                }
                Some(Token::Range) => {
                    let over = pipeline(&tokens[1..], line)?;
                    let (body, otherwise) = self.branches("range", line)?;
                    nodes.push(Node::Range {
                        over,
                        body,
                        otherwise,
                    });
                }
                _ => nodes.push(Node::Action(pipeline(&tokens, line)?)),
            }
        }
        Ok((nodes, None))
    }

    fn branches(&mut self, keyword: &str, line: usize) -> Result<(Vec<Node>, Vec<Node>), Error> {
        let unexpected_eof = || Error::Parse {
            line,
            message: format!("unexpected EOF in [[{keyword}]]"),
        };

        match self.list()? {
            (then, Some((Terminator::End, _))) => Ok((then, Vec::new())),
            (then, Some((Terminator::Else, _))) => match self.list()? {
                (otherwise, Some((Terminator::End, _))) => Ok((then, otherwise)),
                (_, Some((Terminator::Else, line))) => Err(Error::Parse {
                    line,
                    message: format!("expected [[end]] of [[{keyword}]]; found [[else]]"),
                }),
                (_, None) => Err(unexpected_eof()),
            },
            (_, None) => Err(unexpected_eof()),
        }
    }
}

fn expect_bare(tokens: &[Token], keyword: &str, line: usize) -> Result<(), Error> {
    if tokens.len() != 1 {
        return Err(Error::Parse {
            line,
            message: format!("unexpected arguments to [[{keyword}]]"),
        });
    }
    Ok(())
}

fn pipeline(tokens: &[Token], line: usize) -> Result<Pipeline, Error> {
    let mut cursor = Cursor {
        tokens,
        pos: 0,
        line,
    };
    let pipeline = cursor.pipeline(false)?;
    if cursor.pos != tokens.len() {
        return Err(cursor.error("unexpected tokens after pipeline"));
    }
    Ok(pipeline)
}

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
    line: usize,
}

impl<'a> Cursor<'a> {
    fn error(&self, message: impl Into<String>) -> Error {
        Error::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn pipeline(&mut self, nested: bool) -> Result<Pipeline, Error> {
        let mut commands = Vec::new();

        loop {
            let command = self.command()?;

            // Commands which receive a piped value must be function calls.
            if !commands.is_empty() && !matches!(command.operands[0], Operand::Func(_)) {
                return Err(self.error(format!(
                    "non executable command in pipeline stage {}",
                    commands.len() + 1
                )));
            }
            commands.push(command);

            match self.peek() {
                Some(Token::Pipe) => self.pos += 1,
                Some(Token::RParen) if nested => break,
                Some(Token::RParen) => return Err(self.error("unexpected right paren")),
                None if nested => return Err(self.error("unclosed left paren")),
                None => break,
                Some(token) => return Err(self.error(format!("unexpected {token:?} in pipeline"))),
            }
        }
        Ok(Pipeline {
            line: self.line,
            commands,
        })
    }

    fn command(&mut self) -> Result<Command, Error> {
        let mut operands = Vec::new();

        while let Some(token) = self.peek() {
            let operand = match token {
                Token::Pipe | Token::RParen => break,
                Token::LParen => {
                    self.pos += 1;
                    let nested = self.pipeline(true)?;
                    Operand::Pipeline(nested)
                }
                Token::Dot => Operand::Dot,
                Token::Field(path) => Operand::Field(path.clone()),
                Token::Str(s) => Operand::Str(s.clone()),
                Token::Int(i) => Operand::Int(*i),
                Token::Bool(b) => Operand::Bool(*b),
                Token::Ident(name) => {
                    if !funcs::exists(name) {
                        return Err(self.error(format!("function {name:?} not defined")));
                    }
                    Operand::Func(name.clone())
                }
                Token::If | Token::Else | Token::End | Token::Range => {
                    return Err(self.error(format!("unexpected {token:?} in command")))
                }
            };
            // Consumes the operand token, or the closing paren of a nested pipeline.
            self.pos += 1;
            operands.push(operand);
        }

        if operands.is_empty() {
            return Err(self.error("missing value for command"));
        }
        if operands.len() > 1 && !matches!(operands[0], Operand::Func(_)) {
            return Err(self.error(format!(
                "can't give argument to non-function {:?}",
                operands[0]
            )));
        }
        Ok(Command { operands })
    }
}

#[cfg(test)]
mod test {
    use super::super::lex::scan;
    use super::parse;

    fn parse_err(src: &str) -> String {
        match scan(src).and_then(parse) {
            Ok(nodes) => panic!("expected error, got {nodes:?}"),
            Err(err) => err.to_string(),
        }
    }

    #[test]
    fn test_parse_nesting() {
        let nodes = scan("[[ if .on ]]a[[ range .xs ]][[ . ]][[ else ]]none[[ end ]][[ end ]]")
            .and_then(parse)
            .unwrap();

        insta::assert_debug_snapshot!(nodes, @r###"
        [
            If {
                cond: Pipeline {
                    line: 1,
                    commands: [
                        Command {
                            operands: [
                                Field(
                                    [
                                        "on",
                                    ],
                                ),
                            ],
                        },
                    ],
                },
                then: [
                    Text(
                        "a",
                    ),
                    Range {
                        over: Pipeline {
                            line: 1,
                            commands: [
                                Command {
                                    operands: [
                                        Field(
                                            [
                                                "xs",
                                            ],
                                        ),
                                    ],
                                },
                            ],
                        },
                        body: [
                            Action(
                                Pipeline {
                                    line: 1,
                                    commands: [
                                        Command {
                                            operands: [
                                                Dot,
                                            ],
                                        },
                                    ],
                                },
                            ),
                        ],
                        otherwise: [
                            Text(
                                "none",
                            ),
                        ],
                    },
                ],
                otherwise: [],
            },
        ]
        "###);
    }

    #[test]
    fn test_parse_errors() {
        insta::assert_debug_snapshot!(
            [
                parse_err("[[ nope .x ]]"),
                parse_err("[[ ]]"),
                parse_err("[[ .a .b ]]"),
                parse_err("[[ .a | .b ]]"),
                parse_err("[[ upper (lower .a ]]"),
                parse_err("[[ .a ) ]]"),
                parse_err("[[ if .a ]]x"),
                parse_err("x[[ end ]]"),
                parse_err("[[ if .a ]][[ else ]][[ else ]][[ end ]]"),
            ],
            @r###"
        [
            "line 1: function \"nope\" not defined",
            "line 1: missing value for command",
            "line 1: can't give argument to non-function Field([\"a\"])",
            "line 1: non executable command in pipeline stage 2",
            "line 1: unclosed left paren",
            "line 1: unexpected right paren",
            "line 1: unexpected EOF in [[if]]",
            "line 1: unexpected [[end]]",
            "line 1: expected [[end]] of [[if]]; found [[else]]",
        ]
        "###
        );
    }
}
