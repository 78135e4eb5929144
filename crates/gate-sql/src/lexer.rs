// SPDX-License-Identifier: Apache-2.0

//! SQL lexing
//!
//! Wraps the sqlparser PostgreSQL tokenizer and reduces its output to the
//! handful of token shapes the classifier and the scope enforcer care about.
//! String literals, dollar-quoted bodies and comments never surface as words.

use gate_core::ViolationKind;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

/// A significant token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlToken {
    /// Identifier or keyword; `quoted` for `"..."` identifiers
    Word { value: String, quoted: bool },
    Semicolon,
    Period,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    /// Literals, operators, placeholders
    Other,
}

impl SqlToken {
    /// Uppercased keyword text of an unquoted word
    pub fn keyword(&self) -> Option<String> {
        match self {
            Self::Word {
                value,
                quoted: false,
            } => Some(value.to_uppercase()),
            _ => None,
        }
    }

    /// Case-insensitive match against an unquoted word
    pub fn is_keyword(&self, keyword: &str) -> bool {
        match self {
            Self::Word {
                value,
                quoted: false,
            } => value.eq_ignore_ascii_case(keyword),
            _ => false,
        }
    }

    /// Identifier as the database resolves it: unquoted folds to lowercase,
    /// quoted keeps its exact spelling
    pub fn identifier(&self) -> Option<String> {
        match self {
            Self::Word {
                value,
                quoted: false,
            } => Some(value.to_lowercase()),
            Self::Word {
                value,
                quoted: true,
            } => Some(value.clone()),
            _ => None,
        }
    }

    pub fn is_word(&self) -> bool {
        matches!(self, Self::Word { .. })
    }

    /// Short rendering for diagnostics
    pub fn describe(&self) -> String {
        match self {
            Self::Word { value, .. } => value.clone(),
            Self::Semicolon => ";".to_string(),
            Self::Period => ".".to_string(),
            Self::Comma => ",".to_string(),
            Self::LParen => "(".to_string(),
            Self::RParen => ")".to_string(),
            Self::LBracket => "[".to_string(),
            Self::RBracket => "]".to_string(),
            Self::Other => "literal".to_string(),
        }
    }
}

/// `U&"..."`: the quoted part may spell its name with escapes, so it
/// cannot be compared against anything
fn is_unicode_escape_identifier(window: &[Token]) -> bool {
    matches!(
        window,
        [Token::Word(prefix), Token::Ampersand, Token::Word(ident)]
            if prefix.quote_style.is_none()
                && prefix.value.eq_ignore_ascii_case("u")
                && ident.quote_style == Some('"')
    )
}

/// Tokenizes `sql`, dropping whitespace and comments
///
/// Unicode-escaped identifiers are rejected as malformed.
pub fn lex(sql: &str) -> Result<Vec<SqlToken>, ViolationKind> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| ViolationKind::MalformedText {
            message: e.to_string(),
        })?;

    if tokens.windows(3).any(is_unicode_escape_identifier) {
        return Err(ViolationKind::MalformedText {
            message: "unicode-escaped identifiers are not supported".to_string(),
        });
    }

    Ok(tokens
        .into_iter()
        .filter_map(|token| match token {
            Token::Whitespace(_) | Token::EOF => None,
            Token::Word(word) => Some(SqlToken::Word {
                value: word.value,
                quoted: word.quote_style.is_some(),
            }),
            Token::SemiColon => Some(SqlToken::Semicolon),
            Token::Period => Some(SqlToken::Period),
            Token::Comma => Some(SqlToken::Comma),
            Token::LParen => Some(SqlToken::LParen),
            Token::RParen => Some(SqlToken::RParen),
            Token::LBracket => Some(SqlToken::LBracket),
            Token::RBracket => Some(SqlToken::RBracket),
            _ => Some(SqlToken::Other),
        })
        .collect())
}

/// Removes statement separators at the end of the token stream
pub fn strip_trailing_semicolons(tokens: &mut Vec<SqlToken>) {
    while matches!(tokens.last(), Some(SqlToken::Semicolon)) {
        tokens.pop();
    }
}

/// Lexes and strips trailing separators in one go
pub fn normalize(sql: &str) -> Result<Vec<SqlToken>, ViolationKind> {
    let mut tokens = lex(sql)?;
    strip_trailing_semicolons(&mut tokens);
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(value: &str) -> SqlToken {
        SqlToken::Word {
            value: value.to_string(),
            quoted: false,
        }
    }

    #[test]
    fn drops_whitespace_and_comments() {
        let tokens = lex("SELECT -- trailing\n 1 /* block */ FROM t").unwrap();
        assert_eq!(
            tokens,
            vec![word("SELECT"), SqlToken::Other, word("FROM"), word("t")]
        );
    }

    #[test]
    fn literals_are_opaque() {
        let tokens = lex("SELECT 'DROP TABLE x', $$DELETE$$").unwrap();
        assert_eq!(tokens.iter().filter(|t| t.is_word()).count(), 1);
    }

    #[test]
    fn quoted_identifiers_keep_case() {
        let tokens = lex(r#"SELECT * FROM "Users""#).unwrap();
        let last = tokens.last().unwrap();
        assert_eq!(last.identifier().as_deref(), Some("Users"));
        assert!(!last.is_keyword("users"));
        assert_eq!(tokens[2].identifier().as_deref(), Some("from"));
    }

    #[test]
    fn strips_only_trailing_separators() {
        let tokens = normalize("SELECT 1;; ").unwrap();
        assert!(!tokens.contains(&SqlToken::Semicolon));

        let tokens = normalize("SELECT 1; SELECT 2;").unwrap();
        assert_eq!(
            tokens.iter().filter(|t| **t == SqlToken::Semicolon).count(),
            1
        );
    }

    #[test]
    fn unicode_escaped_identifiers_are_malformed() {
        for text in [
            r#"SELECT * FROM U&"pg_authid""#,
            r#"SELECT * FROM u&"\0070g_authid""#,
            r#"SELECT U&"pg_terminate_backend"(1)"#,
        ] {
            let err = lex(text).unwrap_err();
            assert!(matches!(err, ViolationKind::MalformedText { .. }), "{}", text);
        }

        // a unicode string literal or a spaced-out operator is not one
        assert!(lex("SELECT U&'data'").is_ok());
        assert!(lex(r#"SELECT u & "flags" FROM t"#).is_ok());
    }

    #[test]
    fn unterminated_literal_is_malformed() {
        let err = lex("SELECT 'oops").unwrap_err();
        assert!(matches!(err, ViolationKind::MalformedText { .. }));
    }
}
