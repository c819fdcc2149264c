/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
//! Per-backend SQL differences. One dialect is chosen when the database is
//! opened and everything above the batch composer stays backend-agnostic.
use std::fmt::Debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?` for every parameter, bound in order of appearance.
    Positional,
    /// `?1`, `$1`, ... so that a parameter can be referenced more than once.
    Numbered(char),
}

pub trait Dialect: Debug + Send + Sync {
    fn name(&self) -> &'static str;
    fn placeholder_style(&self) -> PlaceholderStyle;
    /// Highest number of bound parameters a single statement may carry.
    fn max_bind_params(&self) -> usize;
    /// Whether a list of blobs can be bound as one array parameter.
    fn supports_array_binding(&self) -> bool {
        false
    }
    fn blob_type(&self) -> &'static str;
    /// SQL expression extracting the user part of a device jid stored in
    /// `column` (everything before the first `.`).
    fn jid_user_part(&self, column: &str) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Numbered('?')
    }

    fn max_bind_params(&self) -> usize {
        // SQLITE_MAX_VARIABLE_NUMBER since 3.32
        32766
    }

    fn blob_type(&self) -> &'static str {
        "BLOB"
    }

    fn jid_user_part(&self, column: &str) -> String {
        format!("substr({column}, 1, instr({column}, '.') - 1)")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Numbered('$')
    }

    fn max_bind_params(&self) -> usize {
        65535
    }

    fn supports_array_binding(&self) -> bool {
        true
    }

    fn blob_type(&self) -> &'static str {
        "bytea"
    }

    fn jid_user_part(&self, column: &str) -> String {
        format!("split_part({column}, '.', 1)")
    }
}
