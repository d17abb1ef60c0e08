use std::collections::HashSet;
use tickchart_core::engine::error::ScriptError;

/// # Summary
/// 词法单元种类。
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    // `EXCHANGE:PAIR[:KEY]`
    Market {
        exchange: String,
        pair: String,
        key: Option<String>,
    },
    // `$indicator`
    Reference(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Semicolon,
    Newline,
    Question,
    Colon,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PlusPlus,
    MinusMinus,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Eof,
}

/// # Summary
/// 带位置信息的词法单元。
///
/// # Invariants
/// - `start..end` 为源文本中的字节区间，用于截取绘图选项的原始文本。
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub start: usize,
    pub end: usize,
}

/// # Summary
/// 将脚本文本切分为词法单元。
///
/// # Logic
/// 1. 跳过空白与 `//`、`/* */` 注释。
/// 2. 字符串字面量整体成为一个单元，后续阶段不会再触碰其内容。
/// 3. 仅在圆括号与方括号之外产生换行单元，跨行的括号表达式自然拼接为一行。
/// 4. 用括号栈精确校验嵌套，任何不匹配都报告 `ScriptError::Bracket`。
///
/// # Returns
/// 以 `Eof` 结尾的单元序列。
pub fn tokenize(source: &str) -> Result<Vec<Token>, ScriptError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    src: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
    line: usize,
    // 未闭合的括号及其所在行
    brackets: Vec<(char, usize)>,
    tokens: Vec<Token>,
    // 脚本中被赋值过的标识符，`X:y` 形式时不视为市场
    declared: HashSet<String>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        let chars: Vec<(usize, char)> = src.char_indices().collect();
        let declared = declared_names(&chars);
        Self {
            src,
            chars,
            pos: 0,
            line: 1,
            brackets: Vec::new(),
            tokens: Vec::new(),
            declared,
        }
    }

    fn peek(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|(_, c)| *c)
    }

    fn offset(&self, pos: usize) -> usize {
        self.chars.get(pos).map_or(self.src.len(), |(i, _)| *i)
    }

    fn push(&mut self, kind: TokenKind, start: usize) {
        let end = self.offset(self.pos);
        self.tokens.push(Token {
            kind,
            line: self.line,
            start: self.offset(start),
            end,
        });
    }

    fn syntax(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Syntax {
            line: self.line,
            message: message.into(),
        }
    }

    fn run(mut self) -> Result<Vec<Token>, ScriptError> {
        while let Some(c) = self.peek(0) {
            let start = self.pos;
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.brackets.iter().all(|(b, _)| *b == '{') {
                        self.push(TokenKind::Newline, start);
                    }
                    self.line += 1;
                }
                c if c.is_whitespace() => self.pos += 1,
                '/' if self.peek(1) == Some('/') => {
                    while let Some(c) = self.peek(0) {
                        if c == '\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                '/' if self.peek(1) == Some('*') => self.block_comment()?,
                '"' | '\'' => self.string(c)?,
                '0'..='9' => self.number()?,
                '.' if self.peek(1).is_some_and(|c| c.is_ascii_digit()) => self.number()?,
                '$' => self.reference()?,
                c if c.is_alphabetic() || c == '_' => self.word(),
                _ => self.symbol(c)?,
            }
        }

        if let Some((open, line)) = self.brackets.last() {
            return Err(ScriptError::Bracket {
                line: *line,
                message: format!("`{}` is never closed", open),
            });
        }

        let start = self.pos;
        self.push(TokenKind::Eof, start);
        Ok(self.tokens)
    }

    fn block_comment(&mut self) -> Result<(), ScriptError> {
        let line = self.line;
        self.pos += 2;
        loop {
            match self.peek(0) {
                Some('*') if self.peek(1) == Some('/') => {
                    self.pos += 2;
                    return Ok(());
                }
                Some(c) => {
                    if c == '\n' {
                        self.line += 1;
                    }
                    self.pos += 1;
                }
                None => {
                    return Err(ScriptError::Syntax {
                        line,
                        message: "unterminated block comment".to_string(),
                    });
                }
            }
        }
    }

    fn string(&mut self, quote: char) -> Result<(), ScriptError> {
        let start = self.pos;
        self.pos += 1;
        let mut text = String::new();
        loop {
            match self.peek(0) {
                Some('\\') => {
                    let escaped = match self.peek(1) {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some(c) => c,
                        None => return Err(self.syntax("unterminated string literal")),
                    };
                    text.push(escaped);
                    self.pos += 2;
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    break;
                }
                Some('\n') | None => return Err(self.syntax("unterminated string literal")),
                Some(c) => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }
        self.push(TokenKind::Str(text), start);
        Ok(())
    }

    fn number(&mut self) -> Result<(), ScriptError> {
        let start = self.pos;
        while self.peek(0).is_some_and(|c| c.is_ascii_digit() || c == '.') {
            self.pos += 1;
        }
        if self.peek(0).is_some_and(|c| c == 'e' || c == 'E') {
            let sign = usize::from(self.peek(1).is_some_and(|c| c == '+' || c == '-'));
            if self.peek(1 + sign).is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1 + sign;
                while self.peek(0).is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
        let text = &self.src[self.offset(start)..self.offset(self.pos)];
        let value = text
            .parse::<f64>()
            .map_err(|_| self.syntax(format!("invalid number `{}`", text)))?;
        self.push(TokenKind::Number(value), start);
        Ok(())
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let from = self.offset(self.pos);
        while self.peek(0).is_some_and(&pred) {
            self.pos += 1;
        }
        self.src[from..self.offset(self.pos)].to_string()
    }

    fn reference(&mut self) -> Result<(), ScriptError> {
        let start = self.pos;
        self.pos += 1;
        let mut name = self.take_while(|c| c.is_alphanumeric() || c == '_');
        // `$band-2` 指向同一指标的第二个绘图
        while self.peek(0) == Some('-') && self.peek(1).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
            let suffix = self.take_while(|c| c.is_ascii_digit());
            name = format!("{}-{}", name, suffix);
        }
        if name.is_empty() {
            return Err(self.syntax("expected indicator id after `$`"));
        }
        self.push(TokenKind::Reference(name), start);
        Ok(())
    }

    fn word(&mut self) {
        let start = self.pos;
        let word = self.take_while(|c| c.is_alphanumeric() || c == '_');

        let exchange_like = word
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if exchange_like
            && !self.declared.contains(&word)
            && self.peek(0) == Some(':')
            && self.peek(1).is_some_and(|c| c.is_ascii_alphanumeric())
        {
            self.pos += 1;
            let pair = self.take_while(is_pair_char);
            let mut key = None;
            if self.peek(0) == Some(':') && self.peek(1).is_some_and(|c| c.is_ascii_alphabetic()) {
                self.pos += 1;
                key = Some(self.take_while(|c| c.is_alphanumeric() || c == '_'));
            }
            self.push(
                TokenKind::Market {
                    exchange: word,
                    pair,
                    key,
                },
                start,
            );
            return;
        }

        self.push(TokenKind::Ident(word), start);
    }

    fn open(&mut self, c: char, kind: TokenKind, start: usize) {
        self.brackets.push((c, self.line));
        self.pos += 1;
        self.push(kind, start);
    }

    fn close(&mut self, c: char, kind: TokenKind, start: usize) -> Result<(), ScriptError> {
        let expected = match c {
            ')' => '(',
            ']' => '[',
            _ => '{',
        };
        match self.brackets.pop() {
            Some((open, _)) if open == expected => {
                self.pos += 1;
                self.push(kind, start);
                Ok(())
            }
            Some((open, line)) => Err(ScriptError::Bracket {
                line: self.line,
                message: format!("`{}` closes `{}` opened at line {}", c, open, line),
            }),
            None => Err(ScriptError::Bracket {
                line: self.line,
                message: format!("unexpected `{}`", c),
            }),
        }
    }

    fn symbol(&mut self, c: char) -> Result<(), ScriptError> {
        let start = self.pos;
        let next = self.peek(1);
        let (kind, width) = match (c, next) {
            ('(', _) => {
                self.open(c, TokenKind::LParen, start);
                return Ok(());
            }
            ('[', _) => {
                self.open(c, TokenKind::LBracket, start);
                return Ok(());
            }
            ('{', _) => {
                self.open(c, TokenKind::LBrace, start);
                return Ok(());
            }
            (')', _) => return self.close(c, TokenKind::RParen, start),
            (']', _) => return self.close(c, TokenKind::RBracket, start),
            ('}', _) => return self.close(c, TokenKind::RBrace, start),
            ('+', Some('+')) => (TokenKind::PlusPlus, 2),
            ('-', Some('-')) => (TokenKind::MinusMinus, 2),
            ('+', Some('=')) => (TokenKind::PlusAssign, 2),
            ('-', Some('=')) => (TokenKind::MinusAssign, 2),
            ('*', Some('=')) => (TokenKind::StarAssign, 2),
            ('/', Some('=')) => (TokenKind::SlashAssign, 2),
            ('=', Some('=')) => (TokenKind::Eq, 2),
            ('!', Some('=')) => (TokenKind::Ne, 2),
            ('<', Some('=')) => (TokenKind::Le, 2),
            ('>', Some('=')) => (TokenKind::Ge, 2),
            ('&', Some('&')) => (TokenKind::And, 2),
            ('|', Some('|')) => (TokenKind::Or, 2),
            ('+', _) => (TokenKind::Plus, 1),
            ('-', _) => (TokenKind::Minus, 1),
            ('*', _) => (TokenKind::Star, 1),
            ('/', _) => (TokenKind::Slash, 1),
            ('%', _) => (TokenKind::Percent, 1),
            ('!', _) => (TokenKind::Bang, 1),
            ('=', _) => (TokenKind::Assign, 1),
            ('<', _) => (TokenKind::Lt, 1),
            ('>', _) => (TokenKind::Gt, 1),
            (',', _) => (TokenKind::Comma, 1),
            ('.', _) => (TokenKind::Dot, 1),
            (';', _) => (TokenKind::Semicolon, 1),
            ('?', _) => (TokenKind::Question, 1),
            (':', _) => (TokenKind::Colon, 1),
            _ => return Err(self.syntax(format!("unexpected character `{}`", c))),
        };
        self.pos += width;
        // `===` 与 `!==` 按 `==` / `!=` 处理
        if matches!(kind, TokenKind::Eq | TokenKind::Ne) && self.peek(0) == Some('=') {
            self.pos += 1;
        }
        self.push(kind, start);
        Ok(())
    }
}

fn is_pair_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '/'
}

/// # Summary
/// 预扫描赋值目标。
///
/// # Logic
/// 标识符后 (忽略空白) 紧跟 `=` (非 `==`) 或复合赋值 `+= -= *= /=` 即视为已声明。
/// 前面是 `$` 或 `.` 的单词属于引用或成员访问，跳过。
fn declared_names(chars: &[(usize, char)]) -> HashSet<String> {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let at = |i: usize| chars.get(i).map(|(_, c)| *c);
    let mut names = HashSet::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i].1;
        if !(c.is_alphabetic() || c == '_') {
            i += 1;
            continue;
        }
        let qualified = i > 0 && matches!(at(i - 1), Some('$' | '.'));
        let start = i;
        while at(i).is_some_and(is_word) {
            i += 1;
        }
        let mut j = i;
        while matches!(at(j), Some(' ' | '\t')) {
            j += 1;
        }
        let assigns = match (at(j), at(j + 1)) {
            (Some('='), next) => next != Some('='),
            (Some('+' | '-' | '*' | '/'), Some('=')) => true,
            _ => false,
        };
        if assigns && !qualified {
            names.insert(chars[start..i].iter().map(|(_, c)| *c).collect());
        }
    }
    names
}
