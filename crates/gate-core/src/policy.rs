// SPDX-License-Identifier: Apache-2.0

//! Policy snapshot
//!
//! The limits and allow/deny lists every request is judged against. Built
//! once at startup and shared read-only for the life of the process.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::types::QualifiedName;

pub const DEFAULT_MAX_ROWS: usize = 1000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SCHEMA: &str = "public";
pub const DEFAULT_BLOCKED_SCHEMAS: &[&str] = &["pg_catalog", "information_schema"];

/// Immutable security policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySnapshot {
    pub max_rows: usize,
    #[serde(rename = "queryTimeoutSeconds", serialize_with = "serialize_secs")]
    pub timeout: Duration,
    /// Empty means every table outside the blocked schemas is visible.
    /// Entries are always schema-qualified.
    pub allowed_tables: BTreeSet<QualifiedName>,
    pub blocked_schemas: BTreeSet<String>,
    pub audit_enabled: bool,
    /// Schema that unqualified names resolve to
    pub default_schema: String,
}

fn serialize_secs<S>(timeout: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(timeout.as_secs_f64())
}

impl PolicySnapshot {
    /// Whether an allow-list is in force
    pub fn is_restricted(&self) -> bool {
        !self.allowed_tables.is_empty()
    }

    pub fn is_schema_blocked(&self, schema: &str) -> bool {
        self.blocked_schemas.contains(schema)
    }

    /// Whether a resolved, schema-qualified name is on the allow-list
    pub fn allows_table(&self, name: &QualifiedName) -> bool {
        !self.is_restricted() || self.allowed_tables.contains(name)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            allowed_tables: BTreeSet::new(),
            blocked_schemas: DEFAULT_BLOCKED_SCHEMAS.iter().map(|s| s.to_string()).collect(),
            audit_enabled: true,
            default_schema: DEFAULT_SCHEMA.to_string(),
        }
    }
}
