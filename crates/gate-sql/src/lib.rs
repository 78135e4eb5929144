//! SQL gatekeeping for querygate
//!
//! Lexical classification of statements and table scoping. Nothing here
//! touches a database.

pub mod classifier;
pub mod lexer;
pub mod scope;

pub use classifier::{
    analyze, classify, Classification, StatementForm, ALLOWED_PREFIXES, FORBIDDEN_FUNCTIONS,
    FORBIDDEN_KEYWORDS,
};
pub use scope::{check_scope, check_table, is_visible, resolved_references};
