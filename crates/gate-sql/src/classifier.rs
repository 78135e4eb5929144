// SPDX-License-Identifier: Apache-2.0

//! Statement classifier
//!
//! Decides from the token stream alone whether a text is a single read-only
//! statement. No I/O, no parsing into an AST: the checks run in a fixed order
//! and the first failing one determines the violation.

use gate_core::{ClassificationVerdict, ViolationKind};
use serde::Serialize;

use crate::lexer::{normalize, SqlToken};

/// Leading keywords a statement may start with
pub const ALLOWED_PREFIXES: &[&str] = &["SELECT", "SHOW", "EXPLAIN", "DESCRIBE", "WITH"];

/// Words that are never accepted anywhere in a statement
///
/// Some of these are legal inside harmless queries (a column called
/// `replace` must be quoted); false positives are accepted.
pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    // row mutation
    "INSERT",
    "UPDATE",
    "DELETE",
    "MERGE",
    "UPSERT",
    "REPLACE",
    "TRUNCATE",
    "COPY",
    "INTO",
    // schema mutation
    "CREATE",
    "ALTER",
    "DROP",
    "RENAME",
    "REINDEX",
    "VACUUM",
    "CLUSTER",
    "REFRESH",
    // privileges and session state
    "GRANT",
    "REVOKE",
    "CALL",
    "DO",
    "EXECUTE",
    "LOCK",
];

/// Builtins with side effects or dynamic SQL
///
/// Function names resolve the same when quoted, so `"nextval"(...)` is caught
/// as well as `NEXTVAL(...)`.
pub const FORBIDDEN_FUNCTIONS: &[&str] = &[
    "SETVAL",
    "NEXTVAL",
    "SET_CONFIG",
    "DBLINK",
    "DBLINK_EXEC",
    "QUERY_TO_XML",
    "QUERY_TO_XML_AND_XMLSCHEMA",
    "QUERY_TO_XMLSCHEMA",
    "CURSOR_TO_XML",
    "PG_READ_FILE",
    "PG_READ_BINARY_FILE",
    "PG_LS_DIR",
    "LO_IMPORT",
    "LO_EXPORT",
    "PG_TERMINATE_BACKEND",
    "PG_CANCEL_BACKEND",
];

/// Leading keyword category of an accepted statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementForm {
    Select,
    Show,
    Explain,
    Describe,
    With,
}

impl StatementForm {
    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "SELECT" => Some(Self::Select),
            "SHOW" => Some(Self::Show),
            "EXPLAIN" => Some(Self::Explain),
            "DESCRIBE" => Some(Self::Describe),
            "WITH" => Some(Self::With),
            _ => None,
        }
    }
}

/// Details of an accepted statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub form: StatementForm,
    /// An explicit top-level `LIMIT` or `FETCH` clause is present
    pub has_limit: bool,
}

/// Classifies `text` as an allowed read-only statement or a violation
pub fn classify(text: &str) -> ClassificationVerdict {
    match analyze(text) {
        Ok(_) => ClassificationVerdict::Allowed,
        Err(violation) => ClassificationVerdict::Rejected(violation),
    }
}

/// Runs every check and reports what was accepted
pub fn analyze(text: &str) -> Result<Classification, ViolationKind> {
    let tokens = normalize(text)?;

    let form = tokens
        .first()
        .and_then(SqlToken::keyword)
        .and_then(|keyword| StatementForm::from_keyword(&keyword))
        .ok_or(ViolationKind::NotReadOnlyPrefix)?;

    if let Some(keyword) = tokens.iter().find_map(forbidden_word) {
        return Err(ViolationKind::forbidden(keyword));
    }

    if tokens.contains(&SqlToken::Semicolon) {
        return Err(ViolationKind::MultipleStatements);
    }

    Ok(Classification {
        form,
        has_limit: has_limit_clause(&tokens),
    })
}

/// The deny-list entry a token hits, if any
fn forbidden_word(token: &SqlToken) -> Option<String> {
    match token {
        SqlToken::Word {
            value,
            quoted: false,
        } => {
            let keyword = value.to_uppercase();
            let hit = FORBIDDEN_KEYWORDS.contains(&keyword.as_str())
                || FORBIDDEN_FUNCTIONS.contains(&keyword.as_str());
            hit.then_some(keyword)
        }
        // quoted names match only their exact lowercase spelling
        SqlToken::Word {
            value,
            quoted: true,
        } => FORBIDDEN_FUNCTIONS
            .iter()
            .find(|name| name.to_lowercase() == *value)
            .map(|name| name.to_string()),
        _ => None,
    }
}

/// Whether the outermost query level carries `LIMIT` or `FETCH`
pub fn has_limit_clause(tokens: &[SqlToken]) -> bool {
    let mut depth = 0usize;
    for token in tokens {
        match token {
            SqlToken::LParen | SqlToken::LBracket => depth += 1,
            SqlToken::RParen | SqlToken::RBracket => depth = depth.saturating_sub(1),
            _ if depth == 0 && (token.is_keyword("LIMIT") || token.is_keyword("FETCH")) => {
                return true
            }
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rejected(text: &str) -> ViolationKind {
        match classify(text) {
            ClassificationVerdict::Rejected(v) => v,
            ClassificationVerdict::Allowed => panic!("expected rejection for {:?}", text),
        }
    }

    #[test]
    fn accepts_read_only_forms() {
        for text in [
            "SELECT 1",
            "select * from users",
            "  SHOW search_path",
            "EXPLAIN SELECT * FROM users",
            "DESCRIBE users",
            "WITH t AS (SELECT 1) SELECT * FROM t",
            "SELECT 1;",
            "SELECT pg_sleep(1)",
        ] {
            assert!(classify(text).is_allowed(), "{}", text);
        }
    }

    #[test]
    fn rejects_bad_prefix() {
        assert_eq!(rejected("DELETE FROM users"), ViolationKind::NotReadOnlyPrefix);
        assert_eq!(rejected(""), ViolationKind::NotReadOnlyPrefix);
        assert_eq!(rejected("   ;  "), ViolationKind::NotReadOnlyPrefix);
        assert_eq!(rejected("(SELECT 1)"), ViolationKind::NotReadOnlyPrefix);
        assert_eq!(rejected(r#""select" 1"#), ViolationKind::NotReadOnlyPrefix);
    }

    #[test]
    fn rejects_forbidden_keywords_anywhere() {
        assert_eq!(
            rejected("WITH d AS (DELETE FROM users RETURNING *) SELECT * FROM d"),
            ViolationKind::forbidden("DELETE")
        );
        assert_eq!(
            rejected("SELECT * INTO backup FROM users"),
            ViolationKind::forbidden("INTO")
        );
        assert_eq!(
            rejected("select nextval('seq')"),
            ViolationKind::forbidden("NEXTVAL")
        );
        assert_eq!(
            rejected("SELECT 1; DROP TABLE users"),
            ViolationKind::forbidden("DROP")
        );
    }

    #[test]
    fn quoted_builtin_names_are_rejected() {
        for (text, name) in [
            (r#"SELECT "pg_terminate_backend"(1234)"#, "PG_TERMINATE_BACKEND"),
            (r#"SELECT "set_config"('search_path', 'x', false)"#, "SET_CONFIG"),
            (r#"SELECT "nextval"('seq')"#, "NEXTVAL"),
            (r#"SELECT pg_catalog."pg_read_file"('/etc/passwd')"#, "PG_READ_FILE"),
            (r#"SELECT * FROM "dblink_exec"('dbname=x', 'DROP TABLE t')"#, "DBLINK_EXEC"),
        ] {
            assert_eq!(rejected(text), ViolationKind::forbidden(name), "{}", text);
        }

        // a quoted name with other casing is a different object
        assert!(classify(r#"SELECT "NextVal" FROM counters"#).is_allowed());
    }

    #[test]
    fn keywords_inside_literals_and_quotes_are_ignored() {
        assert!(classify("SELECT 'DROP TABLE users' AS note").is_allowed());
        assert!(classify(r#"SELECT "update" FROM audit_events"#).is_allowed());
        assert!(classify("SELECT 1 -- delete everything").is_allowed());
        assert!(classify("SELECT updated_at FROM users").is_allowed());
    }

    #[test]
    fn rejects_multiple_statements() {
        assert_eq!(
            rejected("SELECT 1; SELECT 2"),
            ViolationKind::MultipleStatements
        );
        assert_eq!(
            rejected("SELECT 1;; SELECT 2;"),
            ViolationKind::MultipleStatements
        );
    }

    #[test]
    fn malformed_text_is_rejected() {
        assert!(matches!(
            rejected("SELECT 'unterminated"),
            ViolationKind::MalformedText { .. }
        ));
    }

    #[test]
    fn reports_form_and_limit() {
        let c = analyze("select * from users limit 10").unwrap();
        assert_eq!(c.form, StatementForm::Select);
        assert!(c.has_limit);

        let c = analyze("SELECT * FROM (SELECT * FROM users LIMIT 5) u").unwrap();
        assert!(!c.has_limit);

        let c = analyze("WITH t AS (SELECT 1) SELECT * FROM t FETCH FIRST 3 ROWS ONLY").unwrap();
        assert_eq!(c.form, StatementForm::With);
        assert!(c.has_limit);
    }

    fn mutation_verb() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec![
            "insert", "update", "delete", "merge", "truncate", "create", "alter", "drop",
            "grant", "revoke", "copy", "vacuum", "call", "lock",
        ])
    }

    fn random_case(word: &str, mask: u64) -> String {
        word.chars()
            .enumerate()
            .map(|(i, c)| {
                if mask & (1 << (i % 64)) != 0 {
                    c.to_ascii_uppercase()
                } else {
                    c
                }
            })
            .collect()
    }

    proptest! {
        #[test]
        fn mutation_verbs_never_pass(
            verb in mutation_verb(),
            mask in any::<u64>(),
            lead in "[ \t\n]{0,4}",
            tail in "[ \t\n]{1,4}",
        ) {
            let text = format!("{}{}{}users", lead, random_case(verb, mask), tail);
            prop_assert!(!classify(&text).is_allowed());
        }

        #[test]
        fn mutation_verbs_inside_selects_never_pass(
            verb in mutation_verb(),
            mask in any::<u64>(),
        ) {
            let text = format!("SELECT * FROM users WHERE id IN (SELECT 1) {} x", random_case(verb, mask));
            prop_assert_eq!(
                classify(&text),
                ClassificationVerdict::Rejected(ViolationKind::forbidden(verb.to_uppercase()))
            );
        }

        #[test]
        fn allowed_prefixes_survive_random_case(
            prefix in prop::sample::select(vec!["select", "show", "explain", "describe"]),
            mask in any::<u64>(),
        ) {
            let text = format!("{} users", random_case(prefix, mask));
            prop_assert!(classify(&text).is_allowed());
        }
    }
}
