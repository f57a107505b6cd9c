use std::borrow::Cow;
use std::iter::FusedIterator;

/// Scanner takes in an input and spits out tokens.
#[derive(Debug)]
pub struct Scanner<'a> {
    input: &'a str,
    // rather than keeping a second str to distinguish 'start' from 'current',
    // we track the number of bytes into the input used up while scanning the
    // next token:
    // - scanned_input_len is (current - start)
    // - self.unscanned_input() is current (both are &str)
    // - self.reset_scanned_input() is `start = current`
    scanned_input_len: usize,
    current_line: usize,
    ended: bool,
}

#[allow(dead_code, missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Semicolon,
    Colon,
    Slash,
    Star,
    Modulo,
    BitAnd,
    BitOr,
    BitXor,
    // One or two character tokens.
    Plus,
    PlusPlus,
    Minus,
    MinusMinus,
    Arrow,
    Power,
    ShiftLeft,
    ShiftRight,
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    // Literals.
    Identifier,
    String,
    Number,
    // Keywords.
    And,
    Assert,
    Break,
    Class,
    Continue,
    Define,
    Else,
    False,
    For,
    If,
    Lambda,
    Let,
    None,
    Or,
    Private,
    Return,
    This,
    True,
    Use,
    While,

    Error,
    Eof,
}

/// Token is a single token, including a ref to the raw characters that constitute it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<'a> {
    /// What kind of token this is.
    pub typ: TokenType,
    // The Cow is to handle Error tokens: fixed messages would be 'static,
    // but mixing dynamically-built messages with refs to the input needs Cow.
    /// The raw text of the token (for Error tokens, the message).
    pub raw: Cow<'a, str>,
    /// 1-based source line the token starts on.
    pub line: usize,
}

impl<'a> Scanner<'a> {
    /// Returns a fresh Scanner, ready to spit out tokens from the given source
    pub fn new<'b>(source: &'b str) -> Scanner<'b>
    where
        'b: 'a,
    {
        Scanner {
            input: source,
            current_line: 1,
            ended: false,
            scanned_input_len: 0,
        }
    }
}

impl<'a> Scanner<'a> {
    /// Returns the next token from the input, advancing the scanner.
    /// Errors are represented in-band as TokenType::Error.
    /// The scanner will return one Eof token, then None afterwards.
    pub fn next_token(&mut self) -> Option<Token<'a>> {
        self.skip_whitespace();
        let next_char = match self.take_next_char() {
            None if self.ended => return None,
            None => {
                self.ended = true;
                return Some(Token {
                    typ: TokenType::Eof,
                    raw: Cow::Borrowed(self.input),
                    line: self.current_line,
                });
            }
            Some(c) => c,
        };
        let token = match next_char {
            '(' => self.make_token(TokenType::LeftParen),
            ')' => self.make_token(TokenType::RightParen),
            '{' => self.make_token(TokenType::LeftBrace),
            '}' => self.make_token(TokenType::RightBrace),
            '[' => self.make_token(TokenType::LeftBracket),
            ']' => self.make_token(TokenType::RightBracket),
            ';' => self.make_token(TokenType::Semicolon),
            ':' => self.make_token(TokenType::Colon),
            ',' => self.make_token(TokenType::Comma),
            '.' => self.make_token(TokenType::Dot),
            '/' => self.make_token(TokenType::Slash),
            '%' => self.make_token(TokenType::Modulo),
            '&' => self.make_token(TokenType::BitAnd),
            '|' => self.make_token(TokenType::BitOr),
            '^' => self.make_token(TokenType::BitXor),
            '+' => {
                if self.take_next_char_if_matches('+') {
                    self.make_token(TokenType::PlusPlus)
                } else {
                    self.make_token(TokenType::Plus)
                }
            }
            '-' => {
                if self.take_next_char_if_matches('-') {
                    self.make_token(TokenType::MinusMinus)
                } else if self.take_next_char_if_matches('>') {
                    self.make_token(TokenType::Arrow)
                } else {
                    self.make_token(TokenType::Minus)
                }
            }
            '*' => {
                if self.take_next_char_if_matches('*') {
                    self.make_token(TokenType::Power)
                } else {
                    self.make_token(TokenType::Star)
                }
            }
            '!' => {
                if self.take_next_char_if_matches('=') {
                    self.make_token(TokenType::BangEqual)
                } else {
                    self.make_token(TokenType::Bang)
                }
            }
            '=' => {
                if self.take_next_char_if_matches('=') {
                    self.make_token(TokenType::EqualEqual)
                } else {
                    self.make_token(TokenType::Equal)
                }
            }
            '<' => {
                if self.take_next_char_if_matches('<') {
                    self.make_token(TokenType::ShiftLeft)
                } else if self.take_next_char_if_matches('=') {
                    self.make_token(TokenType::LessEqual)
                } else {
                    self.make_token(TokenType::Less)
                }
            }
            '>' => {
                if self.take_next_char_if_matches('>') {
                    self.make_token(TokenType::ShiftRight)
                } else if self.take_next_char_if_matches('=') {
                    self.make_token(TokenType::GreaterEqual)
                } else {
                    self.make_token(TokenType::Greater)
                }
            }
            '"' => self.scan_string_literal('"'),
            '\'' => self.scan_string_literal('\''),
            c @ '0'..='9' => self.scan_numeric_literal(c),
            c if c.is_alphabetic() || c == '_' => self.scan_identifier_or_keyword(),
            c => self.err_token(format!("Unexpected character '{}'.", c)),
        };
        self.reset_scanned_input();
        Some(token)
    }

    fn unscanned_input(&self) -> &'a str {
        if self.scanned_input_len < self.input.len() {
            &self.input[self.scanned_input_len..]
        } else {
            ""
        }
    }

    // Safe to call even if input is empty, in which case it returns None.
    fn peek_next_char(&mut self) -> Option<char> {
        self.unscanned_input().chars().next()
    }

    fn peek_next_next_char(&mut self) -> Option<char> {
        self.unscanned_input().chars().nth(1)
    }

    fn take_next_char(&mut self) -> Option<char> {
        let next_char = self.peek_next_char()?;
        self.scanned_input_len += next_char.len_utf8();
        Some(next_char)
    }

    fn take_next_char_if_matches(&mut self, target: char) -> bool {
        match self.peek_next_char() {
            None => false,
            Some(c) if c == target => {
                self.scanned_input_len += c.len_utf8();
                true
            }
            Some(_) => false,
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek_next_char() {
                Some('\n') => {
                    self.current_line += 1;
                    self.take_next_char();
                }
                Some(c) if c.is_whitespace() => {
                    // only \n is recognized as newline, no other chars
                    self.take_next_char();
                }
                Some('/') if self.peek_next_next_char() == Some('/') => {
                    // skip to the end of the line, leaving the \n alone;
                    // a comment on the last line runs out of input instead
                    while !matches!(self.peek_next_char(), Some('\n') | None) {
                        self.take_next_char();
                    }
                }
                _ => break,
            }
        }
        self.reset_scanned_input();
    }

    // Makes a token of the given type from the scanned portion of input
    // (as determined by scanned_input_len) and the current line.
    // Does NOT reset scanned input, caller of this probably also wants to call that.
    fn make_token(&mut self, typ: TokenType) -> Token<'a> {
        Token {
            typ,
            line: self.current_line,
            raw: Cow::Borrowed(&self.input[0..self.scanned_input_len]),
        }
    }

    // Makes an error token with the given message on the current line.
    fn err_token(&self, message: String) -> Token<'a> {
        Token {
            typ: TokenType::Error,
            raw: Cow::Owned(message),
            line: self.current_line,
        }
    }

    // Mark the scanned portion of input as done by removing it from input.
    fn reset_scanned_input(&mut self) {
        self.input = self.unscanned_input();
        self.scanned_input_len = 0;
    }

    // Assumes we have just scanned the opening quote. String literals are raw:
    // escape sequences are left untouched here and refined by the compiler.
    // The token's raw chars include both the opening and closing quote.
    fn scan_string_literal(&mut self, quote: char) -> Token<'a> {
        loop {
            match self.peek_next_char() {
                Some(c) if c == quote => {
                    self.take_next_char();
                    return self.make_token(TokenType::String);
                }
                Some(c) => {
                    if c == '\n' {
                        self.current_line += 1
                    }
                    self.take_next_char();
                }
                None => {
                    // Ran out of input without finding the closing quote
                    return self.err_token("Unterminated string.".to_string());
                }
            }
        }
    }

    // '1.' is not a valid literal, and '1.a' scans as three tokens: one, dot, 'a'.
    // The dot is only brought into the numeric literal if it's followed by a digit.
    // '0x' and '0o' prefixes switch to hex/octal digits, with '_' separators allowed.
    fn scan_numeric_literal(&mut self, first: char) -> Token<'a> {
        if first == '0' && matches!(self.peek_next_char(), Some('x') | Some('X')) {
            self.take_next_char();
            if !self.peek_next_char().map_or(false, is_hex_digit) {
                return self.err_token("Invalid hex literal".to_string());
            }
            while self.peek_next_char().map_or(false, is_hex_digit) {
                self.take_next_char();
            }
            return self.make_token(TokenType::Number);
        }
        if first == '0' && matches!(self.peek_next_char(), Some('o') | Some('O')) {
            self.take_next_char();
            if !self.peek_next_char().map_or(false, is_octal_digit) {
                return self.err_token("Invalid octal literal".to_string());
            }
            while self.peek_next_char().map_or(false, is_octal_digit) {
                self.take_next_char();
            }
            return self.make_token(TokenType::Number);
        }
        while let Some('0'..='9') = self.peek_next_char() {
            self.take_next_char();
        }
        if self.peek_next_char() == Some('.')
            && matches!(self.peek_next_next_char(), Some('0'..='9'))
        {
            self.take_next_char(); // decimal
            while let Some('0'..='9') = self.peek_next_char() {
                self.take_next_char();
            }
        }
        self.make_token(TokenType::Number)
    }

    fn scan_identifier_or_keyword(&mut self) -> Token<'a> {
        while self
            .peek_next_char()
            .map_or(false, |c| c.is_alphanumeric() || c == '_')
        {
            self.take_next_char();
        }
        self.make_token(token_type_from_str(&self.input[0..self.scanned_input_len]))
    }
}

fn is_hex_digit(c: char) -> bool {
    c.is_ascii_hexdigit() || c == '_'
}

fn is_octal_digit(c: char) -> bool {
    matches!(c, '0'..='7' | '_')
}

// assumes text is not empty
fn token_type_from_str(token_text: &str) -> TokenType {
    let mut chars = token_text.chars();
    match chars.next().unwrap() {
        'b' => keyword_if_equal(&token_text[1..], "reak", TokenType::Break),
        'd' => keyword_if_equal(&token_text[1..], "efine", TokenType::Define),
        'e' => keyword_if_equal(&token_text[1..], "lse", TokenType::Else),
        'i' => keyword_if_equal(&token_text[1..], "f", TokenType::If),
        'n' => keyword_if_equal(&token_text[1..], "one", TokenType::None),
        'o' => keyword_if_equal(&token_text[1..], "r", TokenType::Or),
        'p' => keyword_if_equal(&token_text[1..], "rivate", TokenType::Private),
        'r' => keyword_if_equal(&token_text[1..], "eturn", TokenType::Return),
        'u' => keyword_if_equal(&token_text[1..], "se", TokenType::Use),
        'w' => keyword_if_equal(&token_text[1..], "hile", TokenType::While),
        'a' => match chars.next() {
            Some('n') => keyword_if_equal(&token_text[2..], "d", TokenType::And),
            Some('s') => keyword_if_equal(&token_text[2..], "sert", TokenType::Assert),
            _ => TokenType::Identifier,
        },
        'c' => match chars.next() {
            Some('l') => keyword_if_equal(&token_text[2..], "ass", TokenType::Class),
            Some('o') => keyword_if_equal(&token_text[2..], "ntinue", TokenType::Continue),
            _ => TokenType::Identifier,
        },
        'f' => match chars.next() {
            Some('a') => keyword_if_equal(&token_text[2..], "lse", TokenType::False),
            Some('o') => keyword_if_equal(&token_text[2..], "r", TokenType::For),
            _ => TokenType::Identifier,
        },
        'l' => match chars.next() {
            Some('e') => keyword_if_equal(&token_text[2..], "t", TokenType::Let),
            Some('a') => keyword_if_equal(&token_text[2..], "mbda", TokenType::Lambda),
            _ => TokenType::Identifier,
        },
        't' => match chars.next() {
            Some('h') => keyword_if_equal(&token_text[2..], "is", TokenType::This),
            Some('r') => keyword_if_equal(&token_text[2..], "ue", TokenType::True),
            _ => TokenType::Identifier,
        },
        _ => TokenType::Identifier,
    }
}

fn keyword_if_equal(text: &str, keyword_text: &str, typ: TokenType) -> TokenType {
    if text == keyword_text {
        typ
    } else {
        TokenType::Identifier
    }
}

impl<'a> Iterator for Scanner<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_token()
    }
}

impl<'a> FusedIterator for Scanner<'a> {}

#[cfg(test)]
mod test {
    use super::*;

    fn tokens_of(input: &str) -> Vec<Token<'_>> {
        Scanner::new(input).collect()
    }

    fn assert_tokens(input: &str, expected: Vec<(&str, TokenType, usize)>) {
        let expected_tokens: Vec<_> = expected
            .into_iter()
            .map(|(raw, typ, line)| Token {
                typ,
                raw: raw.into(),
                line,
            })
            .collect();
        let tokens = tokens_of(input);
        assert_eq!(tokens.len(), expected_tokens.len(), "token count");
        for (i, (got, expected)) in tokens.into_iter().zip(expected_tokens).enumerate() {
            assert_eq!(got, expected, "on token number {}", i);
        }
    }

    #[test]
    fn big_happy_path_test() {
        let input = r#"
( // comment
) [ ] { != == = ! / ->
123.1 ++ -- ** << >> % & | ^ :
"#;
        assert_tokens(
            input,
            vec![
                ("(", TokenType::LeftParen, 2),
                (")", TokenType::RightParen, 3),
                ("[", TokenType::LeftBracket, 3),
                ("]", TokenType::RightBracket, 3),
                ("{", TokenType::LeftBrace, 3),
                ("!=", TokenType::BangEqual, 3),
                ("==", TokenType::EqualEqual, 3),
                ("=", TokenType::Equal, 3),
                ("!", TokenType::Bang, 3),
                ("/", TokenType::Slash, 3),
                ("->", TokenType::Arrow, 3),
                ("123.1", TokenType::Number, 4),
                ("++", TokenType::PlusPlus, 4),
                ("--", TokenType::MinusMinus, 4),
                ("**", TokenType::Power, 4),
                ("<<", TokenType::ShiftLeft, 4),
                (">>", TokenType::ShiftRight, 4),
                ("%", TokenType::Modulo, 4),
                ("&", TokenType::BitAnd, 4),
                ("|", TokenType::BitOr, 4),
                ("^", TokenType::BitXor, 4),
                (":", TokenType::Colon, 4),
                ("", TokenType::Eof, 5),
            ],
        );
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let text = "and assert break class continue define else false for if lambda \
                    let none or private return this true use while l d _tmp x1 noneX";
        assert_tokens(
            text,
            vec![
                ("and", TokenType::And, 1),
                ("assert", TokenType::Assert, 1),
                ("break", TokenType::Break, 1),
                ("class", TokenType::Class, 1),
                ("continue", TokenType::Continue, 1),
                ("define", TokenType::Define, 1),
                ("else", TokenType::Else, 1),
                ("false", TokenType::False, 1),
                ("for", TokenType::For, 1),
                ("if", TokenType::If, 1),
                ("lambda", TokenType::Lambda, 1),
                ("let", TokenType::Let, 1),
                ("none", TokenType::None, 1),
                ("or", TokenType::Or, 1),
                ("private", TokenType::Private, 1),
                ("return", TokenType::Return, 1),
                ("this", TokenType::This, 1),
                ("true", TokenType::True, 1),
                ("use", TokenType::Use, 1),
                ("while", TokenType::While, 1),
                ("l", TokenType::Identifier, 1),
                ("d", TokenType::Identifier, 1),
                ("_tmp", TokenType::Identifier, 1),
                ("x1", TokenType::Identifier, 1),
                ("noneX", TokenType::Identifier, 1),
                ("", TokenType::Eof, 1),
            ],
        );
    }

    #[test]
    fn test_numeric_literals() {
        assert_tokens(
            "12 12.5 0xFF 0x1_000 0o17 0o1_7 12.foo",
            vec![
                ("12", TokenType::Number, 1),
                ("12.5", TokenType::Number, 1),
                ("0xFF", TokenType::Number, 1),
                ("0x1_000", TokenType::Number, 1),
                ("0o17", TokenType::Number, 1),
                ("0o1_7", TokenType::Number, 1),
                ("12", TokenType::Number, 1),
                (".", TokenType::Dot, 1),
                ("foo", TokenType::Identifier, 1),
                ("", TokenType::Eof, 1),
            ],
        );
    }

    #[test]
    fn test_bad_prefixed_literals() {
        let tokens = tokens_of("0x");
        assert_eq!(tokens[0].typ, TokenType::Error);
        assert_eq!(tokens[0].raw, "Invalid hex literal");
        let tokens = tokens_of("0o9");
        assert_eq!(tokens[0].typ, TokenType::Error);
        assert_eq!(tokens[0].raw, "Invalid octal literal");
    }

    #[test]
    fn test_string_literals() {
        assert_tokens(
            r#""hi" 'single' "esc\n" "#,
            vec![
                (r#""hi""#, TokenType::String, 1),
                ("'single'", TokenType::String, 1),
                (r#""esc\n""#, TokenType::String, 1),
                ("", TokenType::Eof, 1),
            ],
        );
        let tokens = tokens_of("\"open");
        assert_eq!(tokens[0].typ, TokenType::Error);
        assert_eq!(tokens[0].raw, "Unterminated string.");
    }

    #[test]
    fn test_comment_at_end_of_input() {
        // no trailing newline after the comment
        assert_tokens(
            "1 // trailing",
            vec![("1", TokenType::Number, 1), ("", TokenType::Eof, 1)],
        );
    }
}
