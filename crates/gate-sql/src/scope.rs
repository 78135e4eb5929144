// SPDX-License-Identifier: Apache-2.0

//! Scope enforcer
//!
//! Finds the tables a statement reads from and checks each one against the
//! blocked schemas and the table allow-list of the active policy.
//!
//! A reference is the name that follows an unquoted `FROM`, `JOIN`, `TABLE`
//! or `DESCRIBE`, or a `,` inside a `FROM` list. Parentheses open a new
//! frame: a sub-select inside one is scanned in place, and a `FROM` inside a
//! frame that never saw `SELECT` (as in `extract(year FROM ts)`) is ignored.
//! Whatever cannot be read as a name where one is required, or is followed
//! directly by an operator or literal, is rejected.

use gate_core::{ClassificationVerdict, PolicySnapshot, QualifiedName, ViolationKind};

use crate::lexer::{normalize, SqlToken};

/// Keywords that end a `FROM` list at the current nesting level
const CLAUSE_ENDERS: &[&str] = &[
    "WHERE",
    "GROUP",
    "HAVING",
    "ORDER",
    "LIMIT",
    "OFFSET",
    "FETCH",
    "WINDOW",
    "UNION",
    "INTERSECT",
    "EXCEPT",
    "FOR",
    "RETURNING",
    "VALUES",
];

/// Keywords that open a nested query where a table name could stand
const QUERY_STARTERS: &[&str] = &["SELECT", "WITH", "VALUES", "TABLE"];

/// A table name as written in a statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReference {
    pub name: QualifiedName,
    /// Token index of the first name part
    pub position: usize,
}

/// A name bound by the statement's leading `WITH` list
#[derive(Debug, Clone, PartialEq, Eq)]
struct CteBinding {
    name: String,
    /// Token index of the parenthesis closing the CTE body
    body_end: usize,
}

#[derive(Debug, Default)]
struct Frame {
    has_select: bool,
    from_list: bool,
}

fn unresolved(near: &str) -> ViolationKind {
    ViolationKind::table_not_allowed(format!("<unresolved near '{}'>", near))
}

fn current(frames: &mut [Frame]) -> &mut Frame {
    let last = frames.len() - 1;
    &mut frames[last]
}

fn matching_paren(tokens: &[SqlToken], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, token) in tokens[open..].iter().enumerate() {
        match token {
            SqlToken::LParen => depth += 1,
            SqlToken::RParen => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Reads a dotted name starting at `start`; returns it and the next index
fn read_name(tokens: &[SqlToken], start: usize) -> Result<(QualifiedName, usize), ViolationKind> {
    let mut parts = Vec::new();
    let mut i = start;
    loop {
        let ident = tokens
            .get(i)
            .and_then(SqlToken::identifier)
            .ok_or_else(|| unresolved(&tokens[i - 1].describe()))?;
        parts.push(ident);
        i += 1;
        if tokens.get(i) == Some(&SqlToken::Period) {
            i += 1;
        } else {
            break;
        }
    }

    let name = match parts.len() {
        1 => QualifiedName::new(None, parts.remove(0)),
        2 => QualifiedName::qualified(parts.remove(0), parts.remove(0)),
        // catalog.schema.table: the catalog can only be the current database
        3 => QualifiedName::qualified(parts.remove(1), parts.remove(1)),
        _ => return Err(unresolved(&parts.join("."))),
    };

    // an operator or literal glued to the name means it was not read whole
    if tokens.get(i) == Some(&SqlToken::Other) {
        return Err(unresolved(&name.to_string()));
    }
    Ok((name, i))
}

fn top_level_ctes(tokens: &[SqlToken]) -> Result<Vec<CteBinding>, ViolationKind> {
    let mut ctes = Vec::new();
    if !tokens.first().is_some_and(|t| t.is_keyword("WITH")) {
        return Ok(ctes);
    }

    let mut i = 1;
    if tokens.get(i).is_some_and(|t| t.is_keyword("RECURSIVE")) {
        i += 1;
    }

    loop {
        let name = tokens
            .get(i)
            .and_then(SqlToken::identifier)
            .ok_or_else(|| unresolved("WITH"))?;
        i += 1;

        if tokens.get(i) == Some(&SqlToken::LParen) {
            i = matching_paren(tokens, i).ok_or_else(|| unresolved(&name))? + 1;
        }
        if !tokens.get(i).is_some_and(|t| t.is_keyword("AS")) {
            return Err(unresolved(&name));
        }
        i += 1;
        if tokens.get(i).is_some_and(|t| t.is_keyword("NOT")) {
            i += 1;
        }
        if tokens.get(i).is_some_and(|t| t.is_keyword("MATERIALIZED")) {
            i += 1;
        }
        if tokens.get(i) != Some(&SqlToken::LParen) {
            return Err(unresolved(&name));
        }

        let body_end = matching_paren(tokens, i).ok_or_else(|| unresolved(&name))?;
        ctes.push(CteBinding { name, body_end });

        i = body_end + 1;
        if tokens.get(i) == Some(&SqlToken::Comma) {
            i += 1;
        } else {
            break;
        }
    }

    Ok(ctes)
}

/// Collects every table reference in a lexed statement
pub fn extract_references(tokens: &[SqlToken]) -> Result<Vec<TableReference>, ViolationKind> {
    let mut frames = vec![Frame::default()];
    let mut references = Vec::new();
    // index of the token that demands a table name next
    let mut expecting: Option<usize> = None;
    let mut i = 0;

    while i < tokens.len() {
        let token = &tokens[i];

        if let Some(introducer) = expecting {
            if token.is_keyword("ONLY") || token.is_keyword("LATERAL") {
                i += 1;
                continue;
            }
            match token {
                SqlToken::LParen => {
                    // sub-select or parenthesized join
                    frames.push(Frame {
                        has_select: false,
                        from_list: true,
                    });
                    i += 1;
                    continue;
                }
                SqlToken::Word { .. } if QUERY_STARTERS.iter().any(|k| token.is_keyword(k)) => {
                    expecting = None;
                }
                SqlToken::Word { .. } => {
                    let (name, next) = read_name(tokens, i)?;
                    references.push(TableReference { name, position: i });
                    expecting = None;
                    i = next;
                    continue;
                }
                _ => return Err(unresolved(&tokens[introducer].describe())),
            }
        }

        match token {
            SqlToken::LParen | SqlToken::LBracket => frames.push(Frame::default()),
            SqlToken::RParen | SqlToken::RBracket => {
                if frames.len() > 1 {
                    frames.pop();
                }
            }
            SqlToken::Comma => {
                if current(&mut frames).from_list {
                    expecting = Some(i);
                }
            }
            _ => {
                if let Some(keyword) = token.keyword() {
                    let at_root = frames.len() == 1;
                    let frame = current(&mut frames);
                    match keyword.as_str() {
                        "SELECT" => {
                            frame.has_select = true;
                            frame.from_list = false;
                        }
                        "FROM" => {
                            let distinct_from = i > 0 && tokens[i - 1].is_keyword("DISTINCT");
                            if !distinct_from && (at_root || frame.has_select || frame.from_list) {
                                frame.from_list = true;
                                expecting = Some(i);
                            }
                        }
                        "JOIN" => {
                            frame.from_list = true;
                            expecting = Some(i);
                        }
                        "TABLE" | "DESCRIBE" => expecting = Some(i),
                        k if CLAUSE_ENDERS.contains(&k) => frame.from_list = false,
                        _ => {}
                    }
                }
            }
        }
        i += 1;
    }

    if let Some(introducer) = expecting {
        return Err(unresolved(&tokens[introducer].describe()));
    }
    Ok(references)
}

/// Table references that need checking, resolved against `default_schema`
///
/// Unqualified references to a leading `WITH` name after its body are
/// dropped; they name the CTE, not a table.
pub fn resolved_references(
    text: &str,
    default_schema: &str,
) -> Result<Vec<QualifiedName>, ViolationKind> {
    let tokens = normalize(text)?;
    let ctes = top_level_ctes(&tokens)?;
    let references = extract_references(&tokens)?;

    Ok(references
        .into_iter()
        .filter(|r| {
            r.name.is_qualified()
                || !ctes
                    .iter()
                    .any(|cte| cte.name == r.name.table && r.position > cte.body_end)
        })
        .map(|r| r.name.resolve(default_schema))
        .collect())
}

/// Checks a statement that already passed classification
pub fn check_scope(text: &str, policy: &PolicySnapshot) -> ClassificationVerdict {
    let references = match resolved_references(text, &policy.default_schema) {
        Ok(references) => references,
        Err(violation) => return ClassificationVerdict::Rejected(violation),
    };

    references
        .iter()
        .map(|name| check_table(name, policy))
        .find(|verdict| !verdict.is_allowed())
        .unwrap_or(ClassificationVerdict::Allowed)
}

/// Applies the schema and table rules to one name
pub fn check_table(name: &QualifiedName, policy: &PolicySnapshot) -> ClassificationVerdict {
    let resolved = name.resolve(&policy.default_schema);

    if let Some(schema) = resolved.schema.as_deref() {
        if policy.is_schema_blocked(schema) {
            return ClassificationVerdict::Rejected(ViolationKind::blocked_schema(schema));
        }
    }
    if !policy.allows_table(&resolved) {
        return ClassificationVerdict::Rejected(ViolationKind::table_not_allowed(
            resolved.to_string(),
        ));
    }
    ClassificationVerdict::Allowed
}

/// Whether a table may be shown to callers at all
pub fn is_visible(name: &QualifiedName, policy: &PolicySnapshot) -> bool {
    check_table(name, policy).is_allowed()
}
