/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
//! Bulk statement composition.
//!
//! The composer turns a list of rows into as few statements as the dialect's
//! parameter ceiling allows. It never executes anything: callers run the
//! returned statements inside one transaction so a bulk write applies
//! completely or not at all.
use itertools::Itertools;

use super::dialect::{Dialect, PlaceholderStyle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Text(String),
    Blob(Vec<u8>),
    BigInt(i64),
    Bool(bool),
    BlobArray(Vec<Vec<u8>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Param>,
}

/// Shape of a multi-row insert.
///
/// `shared_columns` get the same value on every row (typically the owning
/// device) and come first in the column list.
#[derive(Debug, Clone, Copy)]
pub struct BulkInsert<'a> {
    pub table: &'a str,
    pub shared_columns: &'a [&'a str],
    pub row_columns: &'a [&'a str],
    /// Appended verbatim, e.g. an `ON CONFLICT` clause.
    pub suffix: &'a str,
    pub chunk_size: usize,
}

/// Shape of a `DELETE ... WHERE key = .. AND list_column IN (..)`.
#[derive(Debug, Clone, Copy)]
pub struct BulkDelete<'a> {
    pub table: &'a str,
    pub key_columns: &'a [&'a str],
    pub list_column: &'a str,
}

struct Binder {
    style: PlaceholderStyle,
    params: Vec<Param>,
}

impl Binder {
    fn new(style: PlaceholderStyle) -> Self {
        Binder {
            style,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, param: Param) -> String {
        self.params.push(param);
        match self.style {
            PlaceholderStyle::Positional => String::from("?"),
            PlaceholderStyle::Numbered(prefix) => format!("{}{}", prefix, self.params.len()),
        }
    }

    fn bind_all(&mut self, params: &[Param]) -> Vec<String> {
        params.iter().map(|param| self.bind(param.clone())).collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchComposer<'a> {
    dialect: &'a dyn Dialect,
    array_binding: bool,
}

impl<'a> BatchComposer<'a> {
    pub fn new(dialect: &'a dyn Dialect, array_binding: bool) -> Self {
        BatchComposer {
            dialect,
            array_binding,
        }
    }

    fn numbered(&self) -> bool {
        matches!(
            self.dialect.placeholder_style(),
            PlaceholderStyle::Numbered(_)
        )
    }

    /// Rows per statement: the entity's chunk size, lowered if needed so the
    /// statement stays under the parameter ceiling.
    pub fn rows_per_statement(&self, insert: &BulkInsert) -> usize {
        let shared = insert.shared_columns.len();
        let width = insert.row_columns.len();
        let (fixed, per_row) = if self.numbered() {
            (shared, width)
        } else {
            (0, shared + width)
        };
        let ceiling = self.dialect.max_bind_params().saturating_sub(fixed) / per_row.max(1);
        insert.chunk_size.min(ceiling).max(1)
    }

    pub fn insert(&self, insert: &BulkInsert, shared: &[Param], rows: &[Vec<Param>]) -> Vec<Statement> {
        rows.chunks(self.rows_per_statement(insert))
            .map(|chunk| self.insert_chunk(insert, shared, chunk))
            .collect()
    }

    fn insert_chunk(&self, insert: &BulkInsert, shared: &[Param], rows: &[Vec<Param>]) -> Statement {
        let mut binder = Binder::new(self.dialect.placeholder_style());
        let shared_refs = if self.numbered() {
            Some(binder.bind_all(shared))
        } else {
            None
        };

        let tuples = rows
            .iter()
            .map(|row| {
                let mut refs = match &shared_refs {
                    Some(refs) => refs.clone(),
                    None => binder.bind_all(shared),
                };
                refs.extend(binder.bind_all(row));
                format!("({})", refs.join(", "))
            })
            .join(", ");

        let columns = insert
            .shared_columns
            .iter()
            .chain(insert.row_columns.iter())
            .join(", ");
        let mut sql = format!("INSERT INTO {} ({}) VALUES {}", insert.table, columns, tuples);
        if !insert.suffix.is_empty() {
            sql.push(' ');
            sql.push_str(insert.suffix);
        }

        Statement {
            sql,
            params: binder.params,
        }
    }

    /// Delete every row whose `list_column` is one of `values`. Uses a single
    /// array parameter when enabled and supported, IN-lists otherwise.
    pub fn delete(&self, delete: &BulkDelete, keys: &[Param], values: &[Vec<u8>]) -> Vec<Statement> {
        if values.is_empty() {
            return Vec::new();
        }

        if self.array_binding && self.dialect.supports_array_binding() {
            let mut binder = Binder::new(self.dialect.placeholder_style());
            let mut conditions = self.key_conditions(&mut binder, delete, keys);
            let array = binder.bind(Param::BlobArray(values.to_vec()));
            conditions.push(format!("{} = ANY({})", delete.list_column, array));
            return vec![Statement {
                sql: format!("DELETE FROM {} WHERE {}", delete.table, conditions.join(" AND ")),
                params: binder.params,
            }];
        }

        let per_statement = self
            .dialect
            .max_bind_params()
            .saturating_sub(keys.len())
            .max(1);
        values
            .chunks(per_statement)
            .map(|chunk| {
                let mut binder = Binder::new(self.dialect.placeholder_style());
                let mut conditions = self.key_conditions(&mut binder, delete, keys);
                let list = chunk
                    .iter()
                    .map(|value| binder.bind(Param::Blob(value.clone())))
                    .join(", ");
                conditions.push(format!("{} IN ({})", delete.list_column, list));
                Statement {
                    sql: format!("DELETE FROM {} WHERE {}", delete.table, conditions.join(" AND ")),
                    params: binder.params,
                }
            })
            .collect()
    }

    fn key_conditions(&self, binder: &mut Binder, delete: &BulkDelete, keys: &[Param]) -> Vec<String> {
        delete
            .key_columns
            .iter()
            .zip(keys)
            .map(|(column, key)| format!("{} = {}", column, binder.bind(key.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dialect::{PostgresDialect, SqliteDialect};

    #[derive(Debug)]
    struct Positional;

    impl Dialect for Positional {
        fn name(&self) -> &'static str {
            "positional"
        }

        fn placeholder_style(&self) -> PlaceholderStyle {
            PlaceholderStyle::Positional
        }

        fn max_bind_params(&self) -> usize {
            999
        }

        fn blob_type(&self) -> &'static str {
            "BLOB"
        }

        fn jid_user_part(&self, column: &str) -> String {
            column.to_string()
        }
    }

    const MACS: BulkInsert<'static> = BulkInsert {
        table: "app_state_mutation_macs",
        shared_columns: &["jid", "name", "version"],
        row_columns: &["index_mac", "value_mac"],
        suffix: "",
        chunk_size: 400,
    };

    fn shared() -> Vec<Param> {
        vec![
            Param::Text("device".into()),
            Param::Text("regular".into()),
            Param::BigInt(3),
        ]
    }

    fn rows(count: u8) -> Vec<Vec<Param>> {
        (0..count)
            .map(|i| vec![Param::Blob(vec![i; 32]), Param::Blob(vec![i; 32])])
            .collect()
    }

    #[test]
    fn test_numbered_placeholders_reuse_shared_params() {
        // Given
        let composer = BatchComposer::new(&SqliteDialect, true);

        // When
        let statements = composer.insert(&MACS, &shared(), &rows(2));

        // Then
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0].sql,
            "INSERT INTO app_state_mutation_macs (jid, name, version, index_mac, value_mac) \
             VALUES (?1, ?2, ?3, ?4, ?5), (?1, ?2, ?3, ?6, ?7)"
        );
        assert_eq!(statements[0].params.len(), 7);
        assert_eq!(statements[0].params[..3], shared()[..]);
    }

    #[test]
    fn test_positional_placeholders_repeat_shared_params() {
        // Given
        let composer = BatchComposer::new(&Positional, true);

        // When
        let statements = composer.insert(&MACS, &shared(), &rows(2));

        // Then
        assert_eq!(
            statements[0].sql,
            "INSERT INTO app_state_mutation_macs (jid, name, version, index_mac, value_mac) \
             VALUES (?, ?, ?, ?, ?), (?, ?, ?, ?, ?)"
        );
        assert_eq!(statements[0].params.len(), 10);
        assert_eq!(statements[0].params[5..8], shared()[..]);
    }

    #[test]
    fn test_postgres_placeholders_and_suffix() {
        // Given
        let contacts = BulkInsert {
            table: "contacts",
            shared_columns: &["our_jid"],
            row_columns: &["their_jid", "first_name", "full_name"],
            suffix: "ON CONFLICT (our_jid, their_jid) DO NOTHING",
            chunk_size: 300,
        };
        let composer = BatchComposer::new(&PostgresDialect, true);
        let row = vec![
            Param::Text("bob".into()),
            Param::Text("Bob".into()),
            Param::Text("Bob B".into()),
        ];

        // When
        let statements = composer.insert(&contacts, &[Param::Text("me".into())], &[row]);

        // Then
        assert_eq!(
            statements[0].sql,
            "INSERT INTO contacts (our_jid, their_jid, first_name, full_name) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (our_jid, their_jid) DO NOTHING"
        );
    }

    #[test]
    fn test_insert_is_split_at_chunk_size() {
        // Given
        let composer = BatchComposer::new(&SqliteDialect, true);
        let rows: Vec<Vec<Param>> = (0..450u32)
            .map(|i| vec![Param::Blob(i.to_be_bytes().to_vec()), Param::Blob(vec![0; 32])])
            .collect();

        // When
        let statements = composer.insert(&MACS, &shared(), &rows);

        // Then
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].params.len(), 3 + 400 * 2);
        assert_eq!(statements[1].params.len(), 3 + 50 * 2);
    }

    #[test]
    fn test_chunk_is_lowered_to_param_ceiling() {
        // Given
        let composer = BatchComposer::new(&Positional, true);

        // When
        let per_statement = composer.rows_per_statement(&MACS);

        // Then
        assert_eq!(per_statement, 999 / 5);
    }

    #[test]
    fn test_delete_with_in_list() {
        // Given
        let composer = BatchComposer::new(&SqliteDialect, true);
        let delete = BulkDelete {
            table: "app_state_mutation_macs",
            key_columns: &["jid", "name"],
            list_column: "index_mac",
        };
        let keys = [Param::Text("device".into()), Param::Text("regular".into())];

        // When
        let statements = composer.delete(&delete, &keys, &[vec![1; 32], vec![2; 32]]);

        // Then
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0].sql,
            "DELETE FROM app_state_mutation_macs WHERE jid = ?1 AND name = ?2 AND index_mac IN (?3, ?4)"
        );
        assert_eq!(statements[0].params[2], Param::Blob(vec![1; 32]));
    }

    #[test]
    fn test_delete_with_array_binding() {
        // Given
        let composer = BatchComposer::new(&PostgresDialect, true);
        let delete = BulkDelete {
            table: "app_state_mutation_macs",
            key_columns: &["jid", "name"],
            list_column: "index_mac",
        };
        let keys = [Param::Text("device".into()), Param::Text("regular".into())];

        // When
        let statements = composer.delete(&delete, &keys, &[vec![1; 32], vec![2; 32]]);

        // Then
        assert_eq!(
            statements[0].sql,
            "DELETE FROM app_state_mutation_macs WHERE jid = $1 AND name = $2 AND index_mac = ANY($3)"
        );
        assert_eq!(
            statements[0].params[2],
            Param::BlobArray(vec![vec![1; 32], vec![2; 32]])
        );
    }

    #[test]
    fn test_delete_falls_back_to_in_list_when_array_binding_is_off() {
        // Given
        let composer = BatchComposer::new(&PostgresDialect, false);
        let delete = BulkDelete {
            table: "t",
            key_columns: &["jid"],
            list_column: "index_mac",
        };

        // When
        let statements = composer.delete(&delete, &[Param::Text("d".into())], &[vec![1]]);

        // Then
        assert_eq!(statements[0].sql, "DELETE FROM t WHERE jid = $1 AND index_mac IN ($2)");
    }

    #[test]
    fn test_delete_nothing() {
        let composer = BatchComposer::new(&SqliteDialect, true);
        let delete = BulkDelete {
            table: "t",
            key_columns: &["jid"],
            list_column: "index_mac",
        };

        assert!(composer.delete(&delete, &[Param::Text("d".into())], &[]).is_empty());
    }
}
