//! Category expression parser
//!
//! ```text
//! Expression   := Term ('|' Term)*
//! Term         := Primitive (('+'|'-') Primitive)*
//! Primitive    := '-' Primitive | '(' Expression ')' | CategoryList
//! CategoryList := Name ((','|';') Name)*
//! ```

use crate::common::{Error, Result};

use super::TestFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Name(String),
    Or,
    Plus,
    Minus,
    Separator,
    Open,
    Close,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Name(n) => format!("category '{}'", n),
            Token::Or => "'|'".to_string(),
            Token::Plus => "'+'".to_string(),
            Token::Minus => "'-'".to_string(),
            Token::Separator => "','".to_string(),
            Token::Open => "'('".to_string(),
            Token::Close => "')'".to_string(),
        }
    }
}

/// Parser for the `--where` category syntax
pub struct CategoryExpression {
    tokens: Vec<(usize, Token)>,
    next: usize,
    end: usize,
}

impl CategoryExpression {
    /// Parse an expression into a filter. Blank input yields [`TestFilter::Empty`].
    pub fn parse(text: &str) -> Result<TestFilter> {
        let mut parser = Self {
            tokens: tokenize(text),
            next: 0,
            end: text.len(),
        };

        if parser.tokens.is_empty() {
            return Ok(TestFilter::Empty);
        }

        let filter = parser.expression()?;
        if let Some((pos, token)) = parser.peek() {
            return Err(Error::filter_syntax(*pos, format!("unexpected {}", token.describe())));
        }
        Ok(filter)
    }

    fn peek(&self) -> Option<&(usize, Token)> {
        self.tokens.get(self.next)
    }

    fn take(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.next).cloned();
        if token.is_some() {
            self.next += 1;
        }
        token
    }

    fn expression(&mut self) -> Result<TestFilter> {
        let mut terms = vec![self.term()?];
        while matches!(self.peek(), Some((_, Token::Or))) {
            self.take();
            terms.push(self.term()?);
        }
        Ok(collapse(terms, TestFilter::Or))
    }

    fn term(&mut self) -> Result<TestFilter> {
        let mut members = vec![self.primitive()?];
        loop {
            match self.peek() {
                Some((_, Token::Plus)) => {
                    self.take();
                    members.push(self.primitive()?);
                }
                Some((_, Token::Minus)) => {
                    self.take();
                    members.push(TestFilter::negate(self.primitive()?));
                }
                _ => break,
            }
        }
        Ok(collapse(members, TestFilter::And))
    }

    fn primitive(&mut self) -> Result<TestFilter> {
        match self.take() {
            Some((_, Token::Minus)) => Ok(TestFilter::negate(self.primitive()?)),
            Some((pos, Token::Open)) => {
                let inner = self.expression()?;
                match self.take() {
                    Some((_, Token::Close)) => Ok(inner),
                    Some((p, t)) => Err(Error::filter_syntax(p, format!("expected ')' but found {}", t.describe()))),
                    None => Err(Error::filter_syntax(pos, "unclosed '('")),
                }
            }
            Some((_, Token::Name(first))) => {
                let mut names = vec![first];
                while matches!(self.peek(), Some((_, Token::Separator))) {
                    let (pos, _) = self.take().unwrap_or((self.end, Token::Separator));
                    match self.take() {
                        Some((_, Token::Name(name))) => names.push(name),
                        _ => return Err(Error::filter_syntax(pos, "expected category name after separator")),
                    }
                }
                Ok(TestFilter::category(names))
            }
            Some((pos, token)) => Err(Error::filter_syntax(pos, format!("unexpected {}", token.describe()))),
            None => Err(Error::filter_syntax(self.end, "unexpected end of expression")),
        }
    }
}

fn collapse(mut members: Vec<TestFilter>, wrap: fn(Vec<TestFilter>) -> TestFilter) -> TestFilter {
    if members.len() == 1 {
        members.remove(0)
    } else {
        wrap(members)
    }
}

fn tokenize(text: &str) -> Vec<(usize, Token)> {
    let mut tokens = Vec::new();
    let mut name_start: Option<usize> = None;

    let flush = |tokens: &mut Vec<(usize, Token)>, start: Option<usize>, end: usize| {
        if let Some(start) = start {
            let name = text[start..end].trim();
            if !name.is_empty() {
                tokens.push((start, Token::Name(name.to_string())));
            }
        }
    };

    for (pos, ch) in text.char_indices() {
        let operator = match ch {
            '|' => Some(Token::Or),
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            ',' | ';' => Some(Token::Separator),
            '(' => Some(Token::Open),
            ')' => Some(Token::Close),
            _ => None,
        };

        match operator {
            Some(token) => {
                flush(&mut tokens, name_start.take(), pos);
                tokens.push((pos, token));
            }
            // Names start at their first visible character
            None if name_start.is_none() && ch.is_whitespace() => {}
            None => {
                name_start.get_or_insert(pos);
            }
        }
    }
    flush(&mut tokens, name_start, text.len());

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat(names: &[&str]) -> TestFilter {
        TestFilter::category(names.iter().copied())
    }

    #[test]
    fn test_and_with_list_and_exclusion() {
        let filter = CategoryExpression::parse("Foo,Bar+Baz-Qux").unwrap();
        assert_eq!(
            filter,
            TestFilter::And(vec![
                cat(&["Foo", "Bar"]),
                cat(&["Baz"]),
                TestFilter::negate(cat(&["Qux"])),
            ])
        );
    }

    #[test]
    fn test_or() {
        let filter = CategoryExpression::parse("A|B").unwrap();
        assert_eq!(filter, TestFilter::Or(vec![cat(&["A"]), cat(&["B"])]));
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(CategoryExpression::parse("").unwrap(), TestFilter::Empty);
        assert_eq!(CategoryExpression::parse("   ").unwrap(), TestFilter::Empty);
    }

    #[test]
    fn test_semicolon_separator_and_whitespace() {
        let filter = CategoryExpression::parse(" Slow Tests ; Db ").unwrap();
        assert_eq!(filter, cat(&["Slow Tests", "Db"]));
    }

    #[test]
    fn test_prefix_not_and_parentheses() {
        let filter = CategoryExpression::parse("-(A|B)+C").unwrap();
        assert_eq!(
            filter,
            TestFilter::And(vec![
                TestFilter::negate(TestFilter::Or(vec![cat(&["A"]), cat(&["B"])])),
                cat(&["C"]),
            ])
        );
    }

    #[test]
    fn test_precedence_and_binds_tighter_than_or() {
        let filter = CategoryExpression::parse("A+B|C").unwrap();
        assert_eq!(
            filter,
            TestFilter::Or(vec![TestFilter::And(vec![cat(&["A"]), cat(&["B"])]), cat(&["C"])])
        );
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(
            CategoryExpression::parse("(A|B"),
            Err(Error::FilterSyntax { position: 0, .. })
        ));
        assert!(matches!(
            CategoryExpression::parse("A,"),
            Err(Error::FilterSyntax { position: 1, .. })
        ));
        assert!(matches!(
            CategoryExpression::parse("A)"),
            Err(Error::FilterSyntax { position: 1, .. })
        ));
        assert!(CategoryExpression::parse("A|").is_err());
    }

    #[test]
    fn test_name_errors_point_at_the_name() {
        assert!(matches!(
            CategoryExpression::parse("(A)   Slow"),
            Err(Error::FilterSyntax { position: 6, .. })
        ));
        assert!(matches!(
            CategoryExpression::parse("-(A)  B"),
            Err(Error::FilterSyntax { position: 6, .. })
        ));
    }
}
