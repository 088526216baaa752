//! Bulk statement helpers shared by all writers.
//!
//! A writer describes how one of its rows binds into a `VALUES` tuple by
//! implementing [`BulkRow`]; [`bulk_execute`] and [`bulk_returning`] then
//! build and run a single multi-row statement for the whole batch, split
//! into several only when the batch would exceed the bind parameter limit.
//!
//! ```text
//! INSERT INTO msgs_msg(uuid, text, ...)  <- prefix
//! VALUES ($1, $2, ...), ($9, $10, ...)   <- one tuple per row
//! RETURNING id                           <- suffix
//! ```

use sqlx::postgres::PgRow;
use sqlx::query_builder::Separated;
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};

use crate::models::{DbContext, DbError};

/// Postgres caps a statement at 65535 bind parameters.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// A value that can be bound as one tuple of a multi-row `VALUES` list.
pub trait BulkRow {
    /// Number of parameters this row binds.
    const COLUMNS: usize;

    fn bind_row<'q>(&'q self, row: &mut Separated<'_, 'q, Postgres, &'static str>);
}

/// Most rows of `R` a single statement can bind.
pub fn max_rows<R: BulkRow>() -> usize {
    (MAX_BIND_PARAMS / R::COLUMNS.max(1)).max(1)
}

fn build<'q, R: BulkRow>(prefix: &str, rows: &'q [R], suffix: &str) -> QueryBuilder<'q, Postgres> {
    let mut builder = QueryBuilder::new(prefix);
    builder.push_values(rows, |mut separated, row| row.bind_row(&mut separated));
    builder.push(suffix);
    builder
}

/// Runs one statement over all rows and returns the number of rows affected.
pub async fn bulk_execute<R: BulkRow>(
    conn: &mut PgConnection,
    context: &'static str,
    prefix: &str,
    rows: &[R],
    suffix: &str,
) -> Result<u64, DbError> {
    let mut affected = 0;
    for chunk in rows.chunks(max_rows::<R>()) {
        let mut builder = build(prefix, chunk, suffix);
        let result = builder.build().execute(&mut *conn).await.context(context)?;
        affected += result.rows_affected();
    }
    Ok(affected)
}

/// Runs one statement over all rows, decoding each returned row.
///
/// Postgres returns rows of a multi-row `INSERT ... RETURNING` in insertion
/// order and chunks run in input order, which callers rely on to assign ids
/// back to their inputs.
pub async fn bulk_returning<R, T>(
    conn: &mut PgConnection,
    context: &'static str,
    prefix: &str,
    rows: &[R],
    suffix: &str,
) -> Result<Vec<T>, DbError>
where
    R: BulkRow,
    T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
{
    let mut returned = Vec::with_capacity(rows.len());
    for chunk in rows.chunks(max_rows::<R>()) {
        let mut builder = build(prefix, chunk, suffix);
        let decoded: Vec<T> = builder
            .build_query_as::<T>()
            .fetch_all(&mut *conn)
            .await
            .context(context)?;
        returned.extend(decoded);
    }
    Ok(returned)
}

#[cfg(test)]
pub(crate) mod testdata {
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;
    use tokio::sync::OnceCell;

    /// Names a scratch Postgres database the SQL tests may write to.
    pub const TEST_DB_ENV: &str = "MAILROOM_TEST_DB";

    const SCHEMA: &str = include_str!("../testdata/schema.sql");
    static SCHEMA_READY: OnceCell<()> = OnceCell::const_new();

    /// A pool on the scratch database with a fresh schema, or `None` when
    /// `MAILROOM_TEST_DB` is unset and the calling test should return early.
    pub async fn test_db() -> Option<PgPool> {
        let url = std::env::var(TEST_DB_ENV).ok()?;
        let db = PgPoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .expect("test database is reachable");

        let pool = &db;
        SCHEMA_READY
            .get_or_init(|| async move {
                let mut conn = pool.acquire().await.expect("test connection");
                sqlx::query("SELECT pg_advisory_lock(7331)").execute(&mut *conn).await.unwrap();
                sqlx::raw_sql(SCHEMA).execute(&mut *conn).await.expect("schema applies");
                sqlx::query("SELECT pg_advisory_unlock(7331)").execute(&mut *conn).await.unwrap();
            })
            .await;
        Some(db)
    }

    /// Number of columns listed in an `INSERT INTO table(a, b, ...)` prefix.
    pub fn insert_columns(prefix: &str) -> usize {
        let open = prefix.find('(').expect("prefix lists columns");
        let close = prefix[open..].find(')').expect("column list is closed") + open;
        prefix[open + 1..close].split(',').count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        a: i64,
        b: String,
    }

    impl BulkRow for Pair {
        const COLUMNS: usize = 2;

        fn bind_row<'q>(&'q self, row: &mut Separated<'_, 'q, Postgres, &'static str>) {
            row.push_bind(self.a).push_bind(&self.b);
        }
    }

    #[test]
    fn test_builds_single_multi_row_statement() {
        let rows = vec![
            Pair { a: 1, b: "x".into() },
            Pair { a: 2, b: "y".into() },
        ];
        let builder = build("INSERT INTO t(a, b) ", &rows, " RETURNING id");
        assert_eq!(
            builder.sql(),
            "INSERT INTO t(a, b) VALUES ($1, $2), ($3, $4) RETURNING id"
        );
    }

    #[test]
    fn test_chunks_stay_under_bind_limit() {
        assert_eq!(max_rows::<Pair>(), 32_767);

        let rows: Vec<Pair> = (0..40_000).map(|a| Pair { a, b: String::new() }).collect();
        let chunks: Vec<&[Pair]> = rows.chunks(max_rows::<Pair>()).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].len(), 40_000 - 32_767);

        let first = build("INSERT INTO t(a, b) ", chunks[0], "");
        assert!(first.sql().ends_with("($65533, $65534)"));
        let second = build("INSERT INTO t(a, b) ", chunks[1], "");
        assert!(second.sql().starts_with("INSERT INTO t(a, b) VALUES ($1, $2)"));
    }

    #[test]
    fn test_insert_columns() {
        assert_eq!(testdata::insert_columns("INSERT INTO t(a, b, c) "), 3);
        assert_eq!(testdata::insert_columns("INSERT INTO t(a,\n  b) VALUES"), 2);
    }
}
