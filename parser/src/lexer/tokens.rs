#[derive(Debug, Clone, PartialEq)]
pub enum Token<'a> {
    Eof,
    Identifier(&'a str),
    Scalar(&'a str),
    Indent(usize),

    OpenBracket,
    CloseBracket,
    OpenBrace,
    CloseBrace,

    Colon,
    Comma,
    Dash,
    NewLine,
}

#[derive(Debug)]
pub struct LexerError(pub String);

impl std::fmt::Display for LexerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for LexerError {}
