/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
use std::fmt::Display;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A fixed-width field has an unexpected length. The schema CHECKs make
    /// this impossible for stored rows, so seeing it means the database is
    /// damaged.
    #[error("{field} has illegal length {actual} (expected {expected})")]
    IntegrityViolation {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A stored integer does not fit the type it is read into.
    #[error("{field} value {value} is out of range")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("{operation} failed for {key}")]
    Query {
        operation: &'static str,
        key: String,
        #[source]
        source: diesel::result::Error,
    },

    #[error(transparent)]
    Database(#[from] diesel::result::Error),

    #[error("cannot get a database connection")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("cannot connect to database")]
    Connection(#[from] diesel::ConnectionError),

    #[error("upgrading database to v{version} failed")]
    Migration {
        version: usize,
        #[source]
        source: Box<StoreError>,
    },

    #[error("foreign keys are not enabled")]
    ForeignKeysDisabled,

    #[error("database schema v{found} is newer than the latest known v{latest}")]
    SchemaTooNew { found: usize, latest: usize },

    #[error("app state {name} does not match the asserted hash at v{version}")]
    HashMismatch { name: String, version: u64 },

    #[error("{0} backend support is not compiled in")]
    UnsupportedBackend(&'static str),
}

impl StoreError {
    pub(crate) fn check_len(field: &'static str, expected: usize, actual: usize) -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(StoreError::IntegrityViolation {
                field,
                expected,
                actual,
            })
        }
    }
}

/// Attach the failing operation and the affected key to a backend error.
pub(crate) trait QueryContext<T> {
    fn context(self, operation: &'static str, key: impl Display) -> Result<T>;
}

impl<T> QueryContext<T> for std::result::Result<T, diesel::result::Error> {
    fn context(self, operation: &'static str, key: impl Display) -> Result<T> {
        self.map_err(|source| StoreError::Query {
            operation,
            key: key.to_string(),
            source,
        })
    }
}

/// Copy a stored byte field into a fixed-width array.
pub(crate) fn fixed<const N: usize>(field: &'static str, bytes: &[u8]) -> Result<[u8; N]> {
    <[u8; N]>::try_from(bytes).map_err(|_| StoreError::IntegrityViolation {
        field,
        expected: N,
        actual: bytes.len(),
    })
}

/// Narrow an integer column to its domain type.
pub(crate) fn narrow<T, V>(field: &'static str, value: V) -> Result<T>
where
    T: TryFrom<V>,
    V: Copy + Into<i64>,
{
    T::try_from(value).map_err(|_| StoreError::OutOfRange {
        field,
        value: value.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_rejects_wrong_length() {
        // Given
        let bytes = vec![7u8; 31];

        // When
        let result = fixed::<32>("identity", &bytes);

        // Then
        assert!(matches!(
            result,
            Err(StoreError::IntegrityViolation {
                field: "identity",
                expected: 32,
                actual: 31
            })
        ));
    }

    #[test]
    fn test_narrow_rejects_values_that_would_wrap() {
        // Given
        let negative = -1i64;
        let huge = i64::from(u32::MAX) + 1;

        // When
        let narrowed: Result<u32> = narrow("registration id", 42i64);

        // Then
        assert_eq!(narrowed.unwrap(), 42);
        assert!(matches!(
            narrow::<u32, _>("registration id", negative),
            Err(StoreError::OutOfRange { field: "registration id", value: -1 })
        ));
        assert!(matches!(
            narrow::<u32, _>("prekey id", huge),
            Err(StoreError::OutOfRange { value, .. }) if value == huge
        ));
    }

    #[test]
    fn test_query_context_keeps_operation_and_key() {
        // Given
        let result: std::result::Result<(), _> = Err(diesel::result::Error::NotFound);

        // When
        let err = result.context("put session", "123:4").unwrap_err();

        // Then
        assert_eq!(err.to_string(), "put session failed for 123:4");
    }
}
