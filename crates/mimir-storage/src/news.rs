use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::error::Result;

/// One discovered entry, ready to be upserted into `news`.
#[derive(Debug, Clone)]
pub struct NewsItemInput {
    pub title: Option<String>,
    pub link: String,
    pub description: Option<String>,
    pub date: Option<DateTime<Utc>>,
    /// Canonical JSON of the source `Entry`, stored so later digests don't
    /// need to re-fetch or re-parse the original feed.
    pub parsed: serde_json::Value,
}

/// A news item that was newly inserted (not already present for its
/// `(channel, link)`), and therefore belongs on the "to be notified" list.
#[derive(Debug, Clone)]
pub struct InsertedNewsItem {
    pub news_id: i64,
    pub title: Option<String>,
    pub link: String,
    pub description: Option<String>,
}

/// A subscriber wanting immediate notification for new items on a channel.
#[derive(Debug, Clone)]
pub struct NotifySubscriber {
    pub user_id: String,
    pub message_type: String,
    /// Whether a `chat`-type notification should include the entry
    /// description in its body; `headline`-type notifications ignore this.
    pub description_in_notify: bool,
}

/// One grouped digest to send in a `pageNotify` firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestGroup {
    pub user_id: String,
    pub message_type: String,
    pub ssl: bool,
    pub unread_count: i64,
}

/// `news`/`news_flags`/`news_page`/`news_subscriptions` store backing the
/// Monitor's news notification pipeline.
pub struct NewsStore {
    pool: SqlitePool,
}

impl NewsStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("./migrations").run(pool).await?;
        Ok(())
    }

    /// Upsert each item for `channel`, returning only the ones that were
    /// newly inserted (an `UPDATE` match is not renotified).
    #[instrument(skip(self, items), fields(%channel, count = items.len()))]
    pub async fn upsert_entries(
        &self,
        channel: &str,
        items: &[NewsItemInput],
    ) -> Result<Vec<InsertedNewsItem>> {
        let mut inserted = Vec::new();
        let mut tx = self.pool.begin().await?;

        for item in items {
            let parsed = item.parsed.to_string();
            let date = item.date.map(|d| d.to_rfc3339());

            let updated = sqlx::query(
                "UPDATE news SET title = ?1, description = ?2, date = ?3, parsed = ?4
                 WHERE channel = ?5 AND link = ?6",
            )
            .bind(&item.title)
            .bind(&item.description)
            .bind(&date)
            .bind(&parsed)
            .bind(channel)
            .bind(&item.link)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 1 {
                continue;
            }

            let result = sqlx::query(
                "INSERT INTO news (channel, title, link, description, date, parsed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(channel)
            .bind(&item.title)
            .bind(&item.link)
            .bind(&item.description)
            .bind(&date)
            .bind(&parsed)
            .execute(&mut *tx)
            .await?;

            inserted.push(InsertedNewsItem {
                news_id: result.last_insert_rowid(),
                title: item.title.clone(),
                link: item.link.clone(),
                description: item.description.clone(),
            });
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Subscribers wanting an immediate `<message>` for each new item
    /// (`notify AND notify_items`).
    pub async fn notify_subscribers(&self, channel: &str) -> Result<Vec<NotifySubscriber>> {
        let rows = sqlx::query(
            "SELECT DISTINCT user_id, message_type, description_in_notify FROM news_subscriptions
             WHERE channel = ?1 AND notify = 1 AND notify_items = 1",
        )
        .bind(channel)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| NotifySubscriber {
                user_id: row.get(0),
                message_type: row.get(1),
                description_in_notify: row.get::<i64, _>(2) != 0,
            })
            .collect())
    }

    /// Subscribers wanting silent unread bookkeeping (`store_offline`).
    pub async fn store_offline_subscribers(&self, channel: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT user_id FROM news_subscriptions
             WHERE channel = ?1 AND store_offline = 1",
        )
        .bind(channel)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    /// Flag `news_id` unread for every user in `user_ids`, and clear their
    /// `news_page.notified` flag so the next presence change re-triggers a
    /// digest.
    #[instrument(skip(self, user_ids), fields(news_id, count = user_ids.len()))]
    pub async fn flag_unread(&self, news_id: i64, user_ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for user_id in user_ids {
            sqlx::query(
                "INSERT INTO news_flags (user_id, news_id, unread) VALUES (?1, ?2, 1)
                 ON CONFLICT (user_id, news_id) DO UPDATE SET unread = 1",
            )
            .bind(user_id)
            .bind(news_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO news_page (user_id, notified) VALUES (?1, 0)
                 ON CONFLICT (user_id) DO UPDATE SET notified = 0",
            )
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// `pageNotify`: unread counts for `jid`, grouped by `(message_type,
    /// ssl)` preference row, gated on `news_notify_presences`. Returns no
    /// groups if the user's unread count is zero, or the user has
    /// presence-gating rows that don't include `show`.
    #[instrument(skip(self), fields(%jid, %show))]
    pub async fn digest_groups(&self, jid: &str, show: &str) -> Result<Vec<DigestGroup>> {
        let gate_rows: Vec<String> = sqlx::query("SELECT show FROM news_notify_presences WHERE user_id = ?1")
            .bind(jid)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| row.get(0))
            .collect();

        if !gate_rows.is_empty() && !gate_rows.iter().any(|allowed| allowed == show) {
            return Ok(Vec::new());
        }

        let unread_count: i64 = sqlx::query(
            "SELECT COUNT(*) FROM news_flags WHERE user_id = ?1 AND unread = 1",
        )
        .bind(jid)
        .fetch_one(&self.pool)
        .await?
        .get(0);

        if unread_count == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT DISTINCT message_type, ssl FROM news_subscriptions WHERE user_id = ?1",
        )
        .bind(jid)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DigestGroup {
                user_id: jid.to_string(),
                message_type: row.get(0),
                ssl: row.get::<i64, _>(1) != 0,
                unread_count,
            })
            .collect())
    }

    /// Mark the digest as sent for `user_id` so it isn't repeated until
    /// new items arrive (`flag_unread` clears this again).
    pub async fn mark_notified(&self, user_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO news_page (user_id, notified) VALUES (?1, 1)
             ON CONFLICT (user_id) DO UPDATE SET notified = 1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        NewsStore::migrate(&pool).await.unwrap();
        pool
    }

    fn item(link: &str) -> NewsItemInput {
        NewsItemInput {
            title: Some("Title".to_string()),
            link: link.to_string(),
            description: None,
            date: None,
            parsed: serde_json::json!({ "id": link }),
        }
    }

    #[tokio::test]
    async fn first_upsert_inserts_every_item() {
        let pool = test_pool().await;
        let store = NewsStore::new(pool);
        let inserted = store.upsert_entries("planet", &[item("a"), item("b")]).await.unwrap();
        assert_eq!(inserted.len(), 2);
    }

    #[tokio::test]
    async fn repeated_upsert_does_not_renotify() {
        let pool = test_pool().await;
        let store = NewsStore::new(pool);
        store.upsert_entries("planet", &[item("a")]).await.unwrap();
        let second = store.upsert_entries("planet", &[item("a")]).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn digest_respects_presence_gate() {
        let pool = test_pool().await;
        let store = NewsStore::new(pool);
        let inserted = store.upsert_entries("planet", &[item("a")]).await.unwrap();
        store.flag_unread(inserted[0].news_id, &["alice@example.org".to_string()]).await.unwrap();
        sqlx::query(
            "INSERT INTO news_subscriptions (user_id, channel, notify, notify_items, store_offline, message_type, ssl)
             VALUES ('alice@example.org', 'planet', 0, 0, 1, 'chat', 0)",
        )
        .execute(&store.pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO news_notify_presences (user_id, show) VALUES ('alice@example.org', 'chat')")
            .execute(&store.pool)
            .await
            .unwrap();

        let blocked = store.digest_groups("alice@example.org", "dnd").await.unwrap();
        assert!(blocked.is_empty());

        let allowed = store.digest_groups("alice@example.org", "chat").await.unwrap();
        assert_eq!(allowed.len(), 1);
        assert_eq!(allowed[0].unread_count, 1);
    }

    #[tokio::test]
    async fn notify_subscribers_reports_description_in_notify() {
        let pool = test_pool().await;
        let store = NewsStore::new(pool);
        sqlx::query(
            "INSERT INTO news_subscriptions (user_id, channel, notify, notify_items, store_offline, message_type, ssl, description_in_notify)
             VALUES ('alice@example.org', 'planet', 1, 1, 0, 'chat', 0, 0)",
        )
        .execute(&store.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO news_subscriptions (user_id, channel, notify, notify_items, store_offline, message_type, ssl)
             VALUES ('bob@example.org', 'planet', 1, 1, 0, 'headline', 0)",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let subscribers = store.notify_subscribers("planet").await.unwrap();
        let alice = subscribers.iter().find(|s| s.user_id == "alice@example.org").unwrap();
        let bob = subscribers.iter().find(|s| s.user_id == "bob@example.org").unwrap();
        assert!(!alice.description_in_notify);
        assert!(bob.description_in_notify);
    }

    #[tokio::test]
    async fn digest_is_empty_with_no_unread() {
        let pool = test_pool().await;
        let store = NewsStore::new(pool);
        let groups = store.digest_groups("alice@example.org", "").await.unwrap();
        assert!(groups.is_empty());
    }
}
