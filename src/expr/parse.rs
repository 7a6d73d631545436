//! Expression source parser.
//!
//! Recursive descent over characters; string literals with `~{}` / `${}`
//! placeholders recurse back into the expression grammar.

use super::{BinaryOp, Expr, StringPart, UnaryOp};

pub(super) fn parse(src: &str) -> Result<Expr, String> {
    let mut parser = Parser {
        src,
        chars: src.chars().collect(),
        pos: 0,
    };
    let expr = parser.expr()?;
    parser.skip_ws();
    if parser.pos < parser.chars.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

/// Parses raw command text: `~{expr}` placeholders, no escapes, no `${}`.
pub(super) fn parse_template(src: &str) -> Result<Expr, String> {
    let mut parser = Parser {
        src,
        chars: src.chars().collect(),
        pos: 0,
    };
    parser.string_body(None)
}

struct Parser<'a> {
    src: &'a str,
    chars: Vec<char>,
    pos: usize,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl Parser<'_> {
    fn error(&self, message: &str) -> String {
        format!("{} at column {} of expression '{}'", message, self.pos + 1, self.src)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn looking_at(&self, token: &str) -> bool {
        token
            .chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c))
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.looking_at(token) {
            self.pos += token.chars().count();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<(), String> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", token)))
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        self.skip_ws();
        let len = keyword.chars().count();
        if self.looking_at(keyword) && !self.peek_at(len).is_some_and(is_ident_char) {
            self.pos += len;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), String> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", keyword)))
        }
    }

    fn expr(&mut self) -> Result<Expr, String> {
        if self.eat_keyword("if") {
            let condition = self.expr()?;
            self.expect_keyword("then")?;
            let then = self.expr()?;
            self.expect_keyword("else")?;
            let otherwise = self.expr()?;
            return Ok(Expr::IfThenElse {
                condition: Box::new(condition),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        self.binary(1)
    }

    fn peek_binary_op(&mut self) -> Option<(BinaryOp, usize)> {
        self.skip_ws();
        const OPS: [(&str, BinaryOp); 13] = [
            ("||", BinaryOp::Or),
            ("&&", BinaryOp::And),
            ("==", BinaryOp::Eq),
            ("!=", BinaryOp::Ne),
            ("<=", BinaryOp::Le),
            (">=", BinaryOp::Ge),
            ("<", BinaryOp::Lt),
            (">", BinaryOp::Gt),
            ("+", BinaryOp::Add),
            ("-", BinaryOp::Sub),
            ("*", BinaryOp::Mul),
            ("/", BinaryOp::Div),
            ("%", BinaryOp::Rem),
        ];
        OPS.iter()
            .find(|(token, _)| self.looking_at(token))
            .map(|(token, op)| (*op, token.len()))
    }

    /// Precedence climbing; all binary operators are left-associative.
    fn binary(&mut self, min_precedence: u8) -> Result<Expr, String> {
        let mut left = self.unary()?;
        while let Some((op, len)) = self.peek_binary_op() {
            if op.precedence() < min_precedence {
                break;
            }
            self.pos += len;
            let right = self.binary(op.precedence() + 1)?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.eat("!") {
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        if self.eat("-") {
            return Ok(match self.unary()? {
                Expr::Int(i) => Expr::Int(-i),
                Expr::Float(x) => Expr::Float(-x),
                operand => Expr::Unary {
                    op: UnaryOp::Negate,
                    operand: Box::new(operand),
                },
            });
        }
        let primary = self.primary()?;
        self.postfix(primary)
    }

    fn postfix(&mut self, mut expr: Expr) -> Result<Expr, String> {
        loop {
            if self.eat("[") {
                let index = self.expr()?;
                self.expect("]")?;
                expr = Expr::Index {
                    collection: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.peek() == Some('.') && self.peek_at(1).is_some_and(is_ident_start) {
                self.pos += 1;
                let member = self.ident();
                expr = match expr {
                    Expr::Ident(name) => Expr::Ident(format!("{}.{}", name, member)),
                    other => Expr::Member {
                        expr: Box::new(other),
                        member,
                    },
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn primary(&mut self) -> Result<Expr, String> {
        self.skip_ws();
        let c = self
            .peek()
            .ok_or_else(|| self.error("unexpected end of expression"))?;
        match c {
            '(' => {
                self.pos += 1;
                let first = self.expr()?;
                if self.eat(",") {
                    let second = self.expr()?;
                    self.expect(")")?;
                    return Ok(Expr::Pair(Box::new(first), Box::new(second)));
                }
                self.expect(")")?;
                Ok(first)
            }
            '[' => {
                self.pos += 1;
                let items = self.list("]", Self::expr)?;
                Ok(Expr::Array(items))
            }
            '{' => {
                self.pos += 1;
                let entries = self.list("}", |p| {
                    let key = p.expr()?;
                    p.expect(":")?;
                    Ok((key, p.expr()?))
                })?;
                Ok(Expr::Map(entries))
            }
            '"' | '\'' => self.string(c),
            c if c.is_ascii_digit() => self.number(),
            c if is_ident_start(c) => {
                let name = self.ident();
                match name.as_str() {
                    "true" => return Ok(Expr::Boolean(true)),
                    "false" => return Ok(Expr::Boolean(false)),
                    "None" => return Ok(Expr::Null),
                    _ => {}
                }
                if self.eat("(") {
                    let args = self.list(")", Self::expr)?;
                    return Ok(Expr::Apply {
                        function: name,
                        args,
                    });
                }
                Ok(Expr::Ident(name))
            }
            _ => Err(self.error(&format!("unexpected character '{}'", c))),
        }
    }

    /// Comma-separated items up to `close`; the opening token is consumed.
    fn list<T>(
        &mut self,
        close: &str,
        mut item: impl FnMut(&mut Self) -> Result<T, String>,
    ) -> Result<Vec<T>, String> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(item(self)?);
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(",")?;
        }
    }

    fn number(&mut self) -> Result<Expr, String> {
        let start = self.pos;
        let mut is_float = false;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let sign = usize::from(matches!(self.peek_at(1), Some('+' | '-')));
            if self.peek_at(1 + sign).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                self.pos += 1 + sign;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if is_float {
            text.parse()
                .map(Expr::Float)
                .map_err(|e| self.error(&format!("bad float literal: {}", e)))
        } else {
            text.parse()
                .map(Expr::Int)
                .map_err(|e| self.error(&format!("bad integer literal: {}", e)))
        }
    }

    fn string(&mut self, quote: char) -> Result<Expr, String> {
        self.pos += 1;
        self.string_body(Some(quote))
    }

    /// String content up to the closing `quote`, or to the end of input for
    /// command templates.
    fn string_body(&mut self, quote: Option<char>) -> Result<Expr, String> {
        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            let Some(c) = self.peek() else {
                if quote.is_some() {
                    return Err(self.error("unterminated string literal"));
                }
                break;
            };
            self.pos += 1;
            match c {
                c if Some(c) == quote => break,
                '\\' if quote.is_some() => {
                    let escaped = self
                        .peek()
                        .ok_or_else(|| self.error("unterminated string literal"))?;
                    self.pos += 1;
                    match escaped {
                        'n' => text.push('\n'),
                        't' => text.push('\t'),
                        'r' => text.push('\r'),
                        '\\' | '"' | '\'' | '~' | '$' => text.push(escaped),
                        other => {
                            text.push('\\');
                            text.push(other);
                        }
                    }
                }
                '~' | '$' if self.peek() == Some('{') && (c == '~' || quote.is_some()) => {
                    self.pos += 1;
                    if !text.is_empty() {
                        parts.push(StringPart::Text(std::mem::take(&mut text)));
                    }
                    let placeholder = self.expr()?;
                    self.expect("}")?;
                    parts.push(StringPart::Placeholder(placeholder));
                }
                c => text.push(c),
            }
        }
        if !text.is_empty() || parts.is_empty() {
            parts.push(StringPart::Text(text));
        }
        Ok(Expr::String(parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let expr = parse("1 + 2 * 3 == 7 && !false").unwrap();
        let Expr::Binary { op, left, .. } = expr else {
            panic!("expected binary expression");
        };
        assert_eq!(op, BinaryOp::And);
        assert!(matches!(*left, Expr::Binary { op: BinaryOp::Eq, .. }));
    }

    #[test]
    fn test_literals() {
        assert_eq!(parse("None").unwrap(), Expr::Null);
        assert_eq!(parse("-4").unwrap(), Expr::Int(-4));
        assert_eq!(parse("2.5e3").unwrap(), Expr::Float(2500.0));
        assert!(parse("'it''s'").unwrap_err().contains("trailing"));
        assert_eq!(parse("\"\"").unwrap(), Expr::string(""));
        assert_eq!(
            parse("(1, \"a\")").unwrap(),
            Expr::Pair(Box::new(Expr::Int(1)), Box::new(Expr::string("a")))
        );
    }

    #[test]
    fn test_keywords_need_boundaries() {
        assert_eq!(parse("iffy").unwrap(), Expr::ident("iffy"));
        assert_eq!(parse("true_count").unwrap(), Expr::ident("true_count"));
    }

    #[test]
    fn test_placeholders() {
        let expr = parse("\"${a}-~{b + 1}\"").unwrap();
        let Expr::String(parts) = expr else {
            panic!("expected string literal");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], StringPart::Text("-".into()));
    }

    #[test]
    fn test_errors() {
        assert!(parse("").is_err());
        assert!(parse("f(1,").is_err());
        assert!(parse("\"open").is_err());
        assert!(parse("if x then 1").is_err());
        assert!(parse("1 2").unwrap_err().contains("column 3"));
    }
}
