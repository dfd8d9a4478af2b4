use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::error::Result;

const KNOWN_SHOWS: &[&str] = &["away", "xa", "chat", "dnd"];

/// An incoming `<presence>` stanza, already split into the fields the
/// election logic cares about.
#[derive(Debug, Clone)]
pub struct IncomingPresence {
    pub available: bool,
    pub show: Option<String>,
    pub status: Option<String>,
    pub priority: i64,
}

impl IncomingPresence {
    fn normalized_show(&self) -> String {
        if !self.available {
            return String::new();
        }
        match self.show.as_deref() {
            Some(show) if KNOWN_SHOWS.contains(&show) => show.to_string(),
            _ => String::new(),
        }
    }

    fn normalized_priority(&self) -> i64 {
        if self.available {
            self.priority
        } else {
            0
        }
    }
}

/// The outcome of a top-resource election after one presence update: tells
/// the caller whether the registered callback list should fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub jid: String,
    pub changed: bool,
    pub available: bool,
    pub show: String,
}

struct TopResource {
    resource: String,
    available: bool,
    show: String,
}

/// `presences`/`roster` store backing the Monitor's top-resource election.
pub struct PresenceStore {
    pool: SqlitePool,
}

impl PresenceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("./migrations").run(pool).await?;
        Ok(())
    }

    /// No record survives a restart as "available".
    #[instrument(skip(self))]
    pub async fn reset_on_startup(&self) -> Result<()> {
        sqlx::query(
            "UPDATE presences SET type = 'unavailable', show = '', priority = 0 WHERE type = 'available'",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record an incoming presence for `(jid, resource)` and re-run the
    /// top-resource election for `jid`.
    #[instrument(skip(self, incoming), fields(%jid, %resource, available = incoming.available))]
    pub async fn record_presence(
        &self,
        jid: &str,
        resource: &str,
        incoming: IncomingPresence,
        now: DateTime<Utc>,
    ) -> Result<PresenceChange> {
        let show = incoming.normalized_show();
        let priority = incoming.normalized_priority();
        let type_ = if incoming.available { "available" } else { "unavailable" };
        let now = now.to_rfc3339();

        let mut tx = self.pool.begin().await?;

        let previous_top = fetch_top(&mut tx, jid).await?;
        let previous_this_resource = sqlx::query(
            "SELECT type, show FROM presences WHERE jid = ?1 AND resource = ?2",
        )
        .bind(jid)
        .bind(resource)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| (row.get::<String, _>(0), row.get::<String, _>(1)));

        if previous_this_resource.as_ref().map(|(t, _)| t.as_str()) == Some("unavailable") {
            sqlx::query("DELETE FROM presences WHERE jid = ?1 AND resource = ?2")
                .bind(jid)
                .bind(resource)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "INSERT INTO presences (jid, resource, type, show, status, priority, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (jid, resource) DO UPDATE SET
                type = excluded.type,
                show = excluded.show,
                status = excluded.status,
                priority = excluded.priority,
                last_updated = excluded.last_updated",
        )
        .bind(jid)
        .bind(resource)
        .bind(type_)
        .bind(&show)
        .bind(&incoming.status)
        .bind(priority)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let new_top = fetch_top(&mut tx, jid)
            .await?
            .expect("a presence was just written for this jid");

        sqlx::query(
            "INSERT INTO roster (jid, presence_id) VALUES (?1, (
                SELECT presence_id FROM presences WHERE jid = ?1 AND resource = ?2
             ))
             ON CONFLICT (jid) DO UPDATE SET presence_id = excluded.presence_id",
        )
        .bind(jid)
        .bind(&new_top.resource)
        .execute(&mut *tx)
        .await?;

        let changed = match &previous_top {
            None => true,
            Some(old) if old.resource != new_top.resource => true,
            Some(_) if new_top.resource == resource => match previous_this_resource {
                Some((old_type, old_show)) => {
                    (old_type == "available") != new_top.available || old_show != new_top.show
                }
                None => true,
            },
            Some(_) => false,
        };

        tx.commit().await?;

        Ok(PresenceChange {
            jid: jid.to_string(),
            changed,
            available: new_top.available,
            show: new_top.show,
        })
    }

    /// `unsubscribed` handling: drop both the roster row and every
    /// presence row for `jid`.
    #[instrument(skip(self))]
    pub async fn remove_jid(&self, jid: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM roster WHERE jid = ?1").bind(jid).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM presences WHERE jid = ?1").bind(jid).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn fetch_top(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    jid: &str,
) -> Result<Option<TopResource>> {
    let row = sqlx::query(
        "SELECT resource, type, show FROM presences
         WHERE jid = ?1
         ORDER BY
            CASE type WHEN 'available' THEN 0 ELSE 1 END ASC,
            priority DESC,
            CASE WHEN type = 'available' THEN presence_id ELSE 0 END DESC,
            last_updated DESC
         LIMIT 1",
    )
    .bind(jid)
    .fetch_optional(&mut *tx)
    .await?;

    Ok(row.map(|row| TopResource {
        resource: row.get(0),
        available: row.get::<String, _>(1) == "available",
        show: row.get(2),
    }))
}
