use std::collections::HashSet;

use sqlx::query_builder::Separated;
use sqlx::{PgConnection, Postgres};
use tracing::debug;

use super::{DbError, OrgId};
use crate::db::{self, BulkRow};

/// A subscriber to remove from a resthook, identified by org, slug and URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResthookUnsubscribe {
    pub org_id: OrgId,
    pub slug: String,
    pub url: String,
}

impl BulkRow for ResthookUnsubscribe {
    const COLUMNS: usize = 3;

    fn bind_row<'q>(&'q self, row: &mut Separated<'_, 'q, Postgres, &'static str>) {
        row.push_bind(self.org_id).push_bind(&self.slug).push_bind(&self.url);
    }
}

/// Drops repeated tuples keeping first-seen order.
pub fn dedupe_unsubscribes(unsubs: Vec<ResthookUnsubscribe>) -> Vec<ResthookUnsubscribe> {
    let mut seen = HashSet::new();
    unsubs
        .into_iter()
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

/// Deletes the matching subscribers. Tuples with no subscriber are ignored so
/// repeating an unsubscribe is harmless.
pub async fn unsubscribe_resthooks(
    conn: &mut PgConnection,
    unsubs: Vec<ResthookUnsubscribe>,
) -> Result<u64, DbError> {
    let unsubs = dedupe_unsubscribes(unsubs);
    let deleted = db::bulk_execute(
        conn,
        "error unsubscribing from resthooks",
        r#"DELETE FROM api_resthooksubscriber s
 USING api_resthook r, ("#,
        &unsubs,
        r#") AS u(org_id, slug, url)
 WHERE s.resthook_id = r.id AND r.org_id = u.org_id AND r.slug = u.slug AND s.target_url = u.url"#,
    )
    .await?;

    debug!(requested = unsubs.len(), deleted, "Unsubscribed resthook subscribers");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unsub(slug: &str, url: &str) -> ResthookUnsubscribe {
        ResthookUnsubscribe {
            org_id: OrgId(1),
            slug: slug.to_string(),
            url: url.to_string(),
        }
    }

    #[test]
    fn test_dedupe_keeps_first_seen_order() {
        let deduped = dedupe_unsubscribes(vec![
            unsub("weather", "https://x"),
            unsub("news", "https://x"),
            unsub("weather", "https://x"),
            unsub("weather", "https://y"),
        ]);
        assert_eq!(
            deduped,
            vec![
                unsub("weather", "https://x"),
                unsub("news", "https://x"),
                unsub("weather", "https://y"),
            ]
        );
    }
}
