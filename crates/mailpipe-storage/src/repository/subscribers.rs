//! Subscriber and suppression list repository

use crate::db::DatabasePool;
use crate::memory::MemoryStore;
use crate::models::{NewSubscriber, Subscriber, SubscriberStatus, SuppressionEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailpipe_common::types::normalize_email;
use mailpipe_common::{Error, Result};
use sqlx::types::Json;
use uuid::Uuid;

/// Subscriber repository trait
///
/// Addresses are compared in normalized (trimmed, lowercase) form.
#[async_trait]
pub trait SubscriberRepository: Send + Sync {
    /// Insert or refresh a subscriber; status is left untouched on update
    async fn upsert(&self, input: NewSubscriber, now: DateTime<Utc>) -> Result<Subscriber>;

    async fn get_by_email(&self, email: &str) -> Result<Option<Subscriber>>;

    async fn subscriber_status(&self, email: &str) -> Result<Option<SubscriberStatus>>;

    /// Active subscribers, optionally restricted to a tag, oldest first
    async fn list_active(&self, tag: Option<&str>) -> Result<Vec<Subscriber>>;

    /// Returns false when no subscriber has that address
    async fn set_status(
        &self,
        email: &str,
        status: SubscriberStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn is_suppressed(&self, email: &str) -> Result<bool>;

    /// The subset of `emails` on the suppression list, normalized
    async fn suppressed_among(&self, emails: &[String]) -> Result<Vec<String>>;

    async fn add_suppression(&self, email: &str, reason: &str, now: DateTime<Utc>) -> Result<()>;
}

/// Database subscriber repository
pub struct DbSubscriberRepository {
    pool: DatabasePool,
}

impl DbSubscriberRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriberRepository for DbSubscriberRepository {
    async fn upsert(&self, input: NewSubscriber, now: DateTime<Utc>) -> Result<Subscriber> {

        sqlx::query_as::<_, Subscriber>(
            r#"
            INSERT INTO subscribers (id, email, name, status, tags, attributes, user_id, created_at, updated_at)
            VALUES ($1, $2, $3, 'active', $4, $5, $6, $7, $7)
            ON CONFLICT (email) DO UPDATE SET
                name = COALESCE(EXCLUDED.name, subscribers.name),
                tags = EXCLUDED.tags,
                attributes = EXCLUDED.attributes,
                user_id = COALESCE(EXCLUDED.user_id, subscribers.user_id),
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(normalize_email(&input.email))
        .bind(&input.name)
        .bind(&input.tags)
        .bind(Json(&input.attributes))
        .bind(input.user_id)
        .bind(now)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<Subscriber>> {
        sqlx::query_as::<_, Subscriber>("SELECT * FROM subscribers WHERE email = $1")
            .bind(normalize_email(email))
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn subscriber_status(&self, email: &str) -> Result<Option<SubscriberStatus>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM subscribers WHERE email = $1")
                .bind(normalize_email(email))
                .fetch_optional(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        row.map(|(status,)| {
            status
                .parse::<SubscriberStatus>()
                .map_err(|e| Error::Database(e.to_string()))
        })
        .transpose()
    }

    async fn list_active(&self, tag: Option<&str>) -> Result<Vec<Subscriber>> {
        match tag {
            Some(tag) => sqlx::query_as::<_, Subscriber>(
                r#"
                SELECT * FROM subscribers
                WHERE status = 'active' AND $1 = ANY(tags)
                ORDER BY created_at ASC, id ASC
                "#,
            )
            .bind(tag)
            .fetch_all(self.pool.pool())
            .await,
            None => sqlx::query_as::<_, Subscriber>(
                "SELECT * FROM subscribers WHERE status = 'active' ORDER BY created_at ASC, id ASC",
            )
            .fetch_all(self.pool.pool())
            .await,
        }
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn set_status(
        &self,
        email: &str,
        status: SubscriberStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE subscribers SET status = $2, updated_at = $3 WHERE email = $1")
                .bind(normalize_email(email))
                .bind(status.as_str())
                .bind(now)
                .execute(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn is_suppressed(&self, email: &str) -> Result<bool> {
        let row: (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM suppressions WHERE email = $1)")
                .bind(normalize_email(email))
                .fetch_one(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row.0)
    }

    async fn suppressed_among(&self, emails: &[String]) -> Result<Vec<String>> {
        let normalized: Vec<String> = emails.iter().map(|e| normalize_email(e)).collect();

        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT email FROM suppressions WHERE email = ANY($1)")
                .bind(&normalized)
                .fetch_all(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.into_iter().map(|(email,)| email).collect())
    }

    async fn add_suppression(&self, email: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO suppressions (email, reason, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(normalize_email(email))
        .bind(reason)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl SubscriberRepository for MemoryStore {
    async fn upsert(&self, input: NewSubscriber, now: DateTime<Utc>) -> Result<Subscriber> {
        let email = normalize_email(&input.email);
        let mut state = self.state();

        let subscriber = state
            .subscribers
            .entry(email.clone())
            .and_modify(|s| {
                if input.name.is_some() {
                    s.name = input.name.clone();
                }
                s.tags = input.tags.clone();
                s.attributes = Json(input.attributes.clone());
                if input.user_id.is_some() {
                    s.user_id = input.user_id;
                }
                s.updated_at = now;
            })
            .or_insert_with(|| Subscriber {
                id: Uuid::now_v7(),
                email,
                name: input.name.clone(),
                status: SubscriberStatus::Active,
                tags: input.tags.clone(),
                attributes: Json(input.attributes.clone()),
                user_id: input.user_id,
                created_at: now,
                updated_at: now,
            });
        Ok(subscriber.clone())
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<Subscriber>> {
        Ok(self
            .state()
            .subscribers
            .get(&normalize_email(email))
            .cloned())
    }

    async fn subscriber_status(&self, email: &str) -> Result<Option<SubscriberStatus>> {
        Ok(self
            .state()
            .subscribers
            .get(&normalize_email(email))
            .map(|s| s.status))
    }

    async fn list_active(&self, tag: Option<&str>) -> Result<Vec<Subscriber>> {
        let mut subscribers: Vec<_> = self
            .state()
            .subscribers
            .values()
            .filter(|s| s.status == SubscriberStatus::Active)
            .filter(|s| tag.map_or(true, |t| s.has_tag(t)))
            .cloned()
            .collect();
        subscribers.sort_by_key(|s| (s.created_at, s.id));
        Ok(subscribers)
    }

    async fn set_status(
        &self,
        email: &str,
        status: SubscriberStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match self.state().subscribers.get_mut(&normalize_email(email)) {
            Some(s) => {
                s.status = status;
                s.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn is_suppressed(&self, email: &str) -> Result<bool> {
        Ok(self
            .state()
            .suppressions
            .contains_key(&normalize_email(email)))
    }

    async fn suppressed_among(&self, emails: &[String]) -> Result<Vec<String>> {
        let state = self.state();
        Ok(emails
            .iter()
            .map(|e| normalize_email(e))
            .filter(|e| state.suppressions.contains_key(e))
            .collect())
    }

    async fn add_suppression(&self, email: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let email = normalize_email(email);
        self.state()
            .suppressions
            .entry(email.clone())
            .or_insert_with(|| SuppressionEntry {
                email,
                reason: reason.to_string(),
                created_at: now,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_lookups_are_case_insensitive() {
        let store = MemoryStore::new();
        store
            .upsert(
                NewSubscriber {
                    email: "Ann@Example.com".into(),
                    tags: vec!["vip".into()],
                    ..Default::default()
                },
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(
            store.subscriber_status(" ann@example.com").await.unwrap(),
            Some(SubscriberStatus::Active)
        );

        store
            .add_suppression("ANN@example.com", "complaint", Utc::now())
            .await
            .unwrap();
        assert!(store.is_suppressed("ann@example.com").await.unwrap());
        assert_eq!(
            store
                .suppressed_among(&["Ann@example.com".into(), "bob@example.com".into()])
                .await
                .unwrap(),
            vec!["ann@example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_list_active_filters_status_and_tag() {
        let store = MemoryStore::new();
        for (email, tags) in [
            ("a@example.com", vec!["vip"]),
            ("b@example.com", vec![]),
            ("c@example.com", vec!["vip"]),
        ] {
            store
                .upsert(
                    NewSubscriber {
                        email: email.into(),
                        tags: tags.into_iter().map(String::from).collect(),
                        ..Default::default()
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
        }
        store
            .set_status("c@example.com", SubscriberStatus::Bounced, Utc::now())
            .await
            .unwrap();

        let vip: Vec<_> = store
            .list_active(Some("vip"))
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.email)
            .collect();
        assert_eq!(vip, vec!["a@example.com".to_string()]);
        assert_eq!(store.list_active(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_upsert_keeps_status_and_uses_given_time() {
        let store = MemoryStore::new();
        let created = Utc::now() - Duration::days(3);
        let refreshed = created + Duration::hours(5);
        let input = NewSubscriber {
            email: "a@example.com".into(),
            ..Default::default()
        };
        store.upsert(input.clone(), created).await.unwrap();
        store
            .set_status("a@example.com", SubscriberStatus::Unsubscribed, created)
            .await
            .unwrap();

        let again = store.upsert(input, refreshed).await.unwrap();
        assert_eq!(again.status, SubscriberStatus::Unsubscribed);
        assert_eq!(again.created_at, created);
        assert_eq!(again.updated_at, refreshed);
    }
}
