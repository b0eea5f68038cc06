use std::collections::HashMap;
use std::collections::HashSet;

use anyhow::Context;
use chrono::DateTime;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::Entry;
use crate::domain::Microformats2;

/// An entry page with its reply subtree, materialized by following
/// successful webmentions in both directions.
const ENTRY_WITH_CHILDREN: &str = r#"
WITH RECURSIVE linked_entries AS (
    SELECT
        e.uuid,
        e.author,
        e.location,
        e.content,
        e.published,
        e.visibility,
        e.sensitive,
        e.read,
        e.deleted,
        e.created_at,
        e.last_modified_at,
        NULL AS target
    FROM entries e
    WHERE e.uuid = ?1

    UNION

    SELECT
        e.uuid,
        e.author,
        e.location,
        e.content,
        e.published,
        e.visibility,
        e.sensitive,
        e.read,
        e.deleted,
        e.created_at,
        e.last_modified_at,
        iw.target AS target
    FROM entries e
    JOIN incoming_webmentions iw ON e.location = iw.source
    JOIN linked_entries le ON iw.target = le.location
    WHERE iw.status = 'success'

    UNION

    SELECT
        e.uuid,
        e.author,
        e.location,
        e.content,
        e.published,
        e.visibility,
        e.sensitive,
        e.read,
        e.deleted,
        e.created_at,
        e.last_modified_at,
        ow.target AS target
    FROM entries e
    JOIN outgoing_webmentions ow ON e.location = ow.source
    JOIN linked_entries le ON ow.target = le.location
    WHERE ow.status = 'success'
)
SELECT * FROM linked_entries;
"#;

fn row_to_entry(row: &SqliteRow) -> anyhow::Result<Entry> {
    let uuid: String = row.try_get("uuid")?;
    let content: String = row.try_get("content")?;

    Ok(Entry {
        uuid: Uuid::parse_str(&uuid).context("malformed entry uuid")?,
        author: row.try_get("author")?,
        location: row.try_get("location")?,
        content: serde_json::from_str::<Microformats2>(&content)
            .context("malformed entry content")?,
        published: row.try_get("published")?,
        visibility: row.try_get("visibility")?,
        sensitive: row.try_get("sensitive")?,
        read: row.try_get("read")?,
        deleted: row.try_get("deleted")?,
        created_at: row.try_get("created_at")?,
        last_modified_at: row.try_get("last_modified_at")?,
    })
}

fn parse_timestamp(value: Option<&str>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(fallback)
}

/// Create/update an entry in the database from an h-entry.
///
/// The `uid` property keys the row; `published`/`updated` drive the
/// timestamps; conflicting rows keep their `created_at` and come back to
/// life (`read` and `deleted` cleared). The full-text row is refreshed in
/// the same transaction.
pub async fn upsert_entry(pool: &SqlitePool, hentry: &Microformats2) -> anyhow::Result<Entry> {
    let uuid = hentry
        .property_str("uid")
        .context("h-entry is missing a uid")
        .and_then(|uid| Uuid::parse_str(uid).context("malformed uid"))?;

    let location = hentry
        .property_str("url")
        .context("h-entry is missing a url")?
        .to_string();

    // author defaults to the entry URL, unless an embedded h-card says better
    let author = hentry
        .property("author")
        .and_then(|card| card.get("properties")?.get("url")?.as_array()?.first()?.as_str())
        .unwrap_or(&location)
        .to_string();

    let now = Utc::now();
    let created_at = parse_timestamp(hentry.property_str("published"), now);
    let last_modified_at = parse_timestamp(hentry.property_str("updated"), created_at);

    let published = hentry.property_str("post-status").map(|s| s != "draft").unwrap_or(true);
    let visibility = hentry.property_str("visibility").unwrap_or("public").to_string();
    let sensitive = hentry.property_str("sensitive") == Some("true");

    let content = serde_json::to_string(hentry)?;
    let uuid_hex = uuid.simple().to_string();

    let mut transaction = pool.begin().await?;

    sqlx::query(
        r#"
INSERT INTO entries (
    uuid,
    author,
    location,
    content,
    published,
    visibility,
    sensitive,
    read,
    deleted,
    created_at,
    last_modified_at
)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, FALSE, FALSE, ?8, ?9)
ON CONFLICT(uuid) DO UPDATE SET
    author = excluded.author,
    location = excluded.location,
    content = excluded.content,
    published = excluded.published,
    visibility = excluded.visibility,
    sensitive = excluded.sensitive,
    read = FALSE,
    deleted = FALSE,
    last_modified_at = excluded.last_modified_at;
        "#,
    )
    .bind(&uuid_hex)
    .bind(&author)
    .bind(&location)
    .bind(&content)
    .bind(published)
    .bind(&visibility)
    .bind(sensitive)
    .bind(created_at)
    .bind(last_modified_at)
    .execute(&mut *transaction)
    .await?;

    sqlx::query("DELETE FROM documents WHERE uuid = ?1;")
        .bind(&uuid_hex)
        .execute(&mut *transaction)
        .await?;
    sqlx::query("INSERT INTO documents (uuid, content) VALUES (?1, ?2);")
        .bind(&uuid_hex)
        .bind(&content)
        .execute(&mut *transaction)
        .await?;

    transaction.commit().await?;

    Ok(Entry {
        uuid,
        author,
        location,
        content: hentry.clone(),
        published,
        visibility,
        sensitive,
        read: false,
        deleted: false,
        created_at,
        last_modified_at,
    })
}

pub async fn get_entry(pool: &SqlitePool, uuid: &Uuid) -> anyhow::Result<Option<Entry>> {
    let row = sqlx::query("SELECT * FROM entries WHERE uuid = ?1;")
        .bind(uuid.simple().to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_entry).transpose()
}

/// Return an entry with all its replies materialized as `children`.
///
/// The traversal is breadth-first over the webmention graph and keeps a
/// visited set, so it terminates on cyclic reply chains.
pub async fn get_entry_with_children(
    pool: &SqlitePool,
    uuid: &Uuid,
) -> anyhow::Result<Option<Entry>> {
    let rows = sqlx::query(ENTRY_WITH_CHILDREN)
        .bind(uuid.simple().to_string())
        .fetch_all(pool)
        .await?;

    if rows.is_empty() {
        return Ok(None);
    }

    let mut reply_map: HashMap<Option<String>, Vec<Entry>> = HashMap::new();
    for row in &rows {
        let target: Option<String> = row.try_get("target")?;
        reply_map.entry(target).or_default().push(row_to_entry(row)?);
    }

    let mut root = reply_map
        .get(&None)
        .and_then(|entries| entries.first())
        .cloned()
        .context("recursive query returned no root")?;

    // graft replies onto their parents; the visited set keeps cyclic
    // webmention graphs from recursing forever
    fn attach(
        hentry: &mut Microformats2,
        location: &str,
        reply_map: &HashMap<Option<String>, Vec<Entry>>,
        visited: &mut HashSet<String>,
    ) {
        if !visited.insert(location.to_string()) {
            return;
        }
        if let Some(replies) = reply_map.get(&Some(location.to_string())) {
            for reply in replies {
                let mut child = reply.content.clone();
                attach(&mut child, &reply.location, reply_map, visited);
                hentry.children.push(child);
            }
        }
    }

    let mut visited = HashSet::new();
    let location = root.location.clone();
    attach(&mut root.content, &location, &reply_map, &mut visited);

    Ok(Some(root))
}

pub async fn delete_entry(pool: &SqlitePool, entry: &Entry) -> anyhow::Result<()> {
    set_deleted(pool, entry, true).await
}

pub async fn undelete_entry(pool: &SqlitePool, entry: &Entry) -> anyhow::Result<()> {
    set_deleted(pool, entry, false).await
}

async fn set_deleted(pool: &SqlitePool, entry: &Entry, deleted: bool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
UPDATE entries
SET
    deleted = ?1,
    last_modified_at = ?2
WHERE
    uuid = ?3;
        "#,
    )
    .bind(deleted)
    .bind(Utc::now())
    .bind(entry.uuid.simple().to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Recent posts by the given author, most recently modified first.
pub async fn get_entries(
    pool: &SqlitePool,
    author: &str,
    since: Option<DateTime<Utc>>,
    offset: usize,
    limit: usize,
) -> anyhow::Result<Vec<Entry>> {
    let since = since.unwrap_or(DateTime::UNIX_EPOCH);

    let rows = sqlx::query(
        r#"
SELECT *
FROM
    entries
WHERE
    last_modified_at >= ?1 AND
    author = ?2 AND
    deleted = FALSE
ORDER BY
    last_modified_at DESC
LIMIT
    ?3
OFFSET
    ?4;
        "#,
    )
    .bind(since)
    .bind(author)
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_entry).collect()
}

/// Posts whose `category` property contains the given value. With
/// `protected`, drafts and non-public posts are excluded.
pub async fn list_by_category(
    pool: &SqlitePool,
    category: &str,
    author: &str,
    offset: usize,
    limit: usize,
    protected: bool,
) -> anyhow::Result<Vec<Entry>> {
    let protected_predicate = if protected {
        "AND entries.published = TRUE AND entries.visibility = 'public'"
    } else {
        ""
    };

    let query = format!(
        r#"
SELECT *
FROM
    entries
WHERE
    uuid IN (
        SELECT entries.uuid
        FROM entries, json_each(entries.content, '$.properties.category')
        WHERE json_each.value = ?1
    ) AND
    entries.author = ?2 AND
    entries.deleted = FALSE
    {protected_predicate}
ORDER BY
    entries.last_modified_at DESC
LIMIT
    ?3
OFFSET
    ?4;
        "#,
    );

    let rows = sqlx::query(&query)
        .bind(category)
        .bind(author)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(pool)
        .await?;

    rows.iter().map(row_to_entry).collect()
}

/// Full-text search over the document index.
pub async fn search_entries(
    pool: &SqlitePool,
    needle: &str,
    author: &str,
    offset: usize,
    limit: usize,
    protected: bool,
) -> anyhow::Result<Vec<Entry>> {
    match run_search(pool, needle, author, offset, limit, protected).await {
        Ok(rows) => Ok(rows),
        // FTS5 rejects queries with unbalanced quotes and stray operators;
        // retry with the syntax characters collapsed to spaces
        Err(sqlx::Error::Database(_)) => {
            let simple_needle: String = needle
                .chars()
                .map(|c| {
                    if c.is_alphanumeric() || c.is_whitespace() {
                        c
                    } else {
                        ' '
                    }
                })
                .collect();
            Ok(run_search(pool, &simple_needle, author, offset, limit, protected).await?)
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_search(
    pool: &SqlitePool,
    needle: &str,
    author: &str,
    offset: usize,
    limit: usize,
    protected: bool,
) -> Result<Vec<Entry>, sqlx::Error> {
    let protected_predicate = if protected {
        "AND entries.published = TRUE AND entries.visibility = 'public'"
    } else {
        ""
    };

    let query = format!(
        r#"
SELECT
    entries.*
FROM
    entries
JOIN
    documents
ON
    entries.uuid = documents.uuid
WHERE
    entries.author = ?1 AND
    entries.deleted = FALSE AND
    documents MATCH ?2
    {protected_predicate}
ORDER BY
    entries.last_modified_at DESC
LIMIT
    ?3
OFFSET
    ?4;
        "#,
    );

    let rows = sqlx::query(&query)
        .bind(author)
        .bind(needle)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| row_to_entry(row).map_err(|e| sqlx::Error::Decode(e.into())))
        .collect()
}
