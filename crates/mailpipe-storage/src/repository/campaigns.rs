//! Campaign and A/B test repository

use crate::db::DatabasePool;
use crate::memory::MemoryStore;
use crate::models::{
    AbTest, AbTestStatus, Campaign, CampaignCounter, CampaignSendSummary, CampaignStatus,
    NewAbTest, NewCampaign, Variant, VariantCounter,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mailpipe_common::types::{AbTestId, CampaignId};
use mailpipe_common::{Error, Result};
use sqlx::types::Json;
use uuid::Uuid;

/// Campaign repository trait
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn create(&self, input: NewCampaign) -> Result<Campaign>;

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>>;

    /// Atomically move a draft or failed campaign to sending; false otherwise
    async fn begin_sending(&self, id: CampaignId, now: DateTime<Utc>) -> Result<bool>;

    async fn set_status(&self, id: CampaignId, status: CampaignStatus, now: DateTime<Utc>)
        -> Result<()>;

    /// Move from `from` to `to`; false when the campaign was not in `from`
    async fn compare_and_set_status(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn record_send(&self, id: CampaignId, summary: &CampaignSendSummary) -> Result<()>;

    async fn increment_counter(&self, id: CampaignId, counter: CampaignCounter) -> Result<()>;

    async fn link_ab_test(&self, id: CampaignId, ab_test_id: AbTestId) -> Result<()>;

    async fn create_ab_test(&self, input: NewAbTest) -> Result<AbTest>;

    async fn get_ab_test(&self, id: AbTestId) -> Result<Option<AbTest>>;

    /// draft -> running; no-op for other states
    async fn start_ab_test(&self, id: AbTestId, now: DateTime<Utc>) -> Result<()>;

    async fn add_variant_sent(&self, id: AbTestId, variant: Variant, count: i32) -> Result<()>;

    async fn increment_variant_counter(
        &self,
        id: AbTestId,
        variant: Variant,
        counter: VariantCounter,
    ) -> Result<()>;

    async fn complete_ab_test(&self, id: AbTestId, winner: Variant, now: DateTime<Utc>)
        -> Result<()>;

    /// Running tests whose duration has elapsed
    async fn ab_tests_due(&self, now: DateTime<Utc>) -> Result<Vec<AbTest>>;
}

fn build_campaign(input: NewCampaign, now: DateTime<Utc>) -> Campaign {
    Campaign {
        id: Uuid::now_v7(),
        name: input.name,
        subject: input.subject,
        html_body: input.html_body,
        text_body: input.text_body,
        from_address: input.from_address,
        from_name: input.from_name,
        reply_to: input.reply_to,
        target_audience: Json(input.target_audience),
        status: CampaignStatus::Draft,
        track_opens: input.track_opens,
        track_clicks: input.track_clicks,
        ab_test_id: input.ab_test_id,
        total_recipients: 0,
        sent_count: 0,
        open_count: 0,
        click_count: 0,
        bounce_count: 0,
        unsubscribe_count: 0,
        sent_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn build_ab_test(input: NewAbTest, now: DateTime<Utc>) -> AbTest {
    AbTest {
        id: Uuid::now_v7(),
        campaign_id: input.campaign_id,
        test_type: input.test_type,
        variant_a: Json(input.variant_a),
        variant_b: Json(input.variant_b),
        split_percentage: input.split_percentage.clamp(0, 100),
        winner_criteria: input.winner_criteria,
        test_duration_hours: input.test_duration_hours,
        status: AbTestStatus::Draft,
        variant_a_sent: 0,
        variant_a_opens: 0,
        variant_a_clicks: 0,
        variant_a_conversions: 0,
        variant_b_sent: 0,
        variant_b_opens: 0,
        variant_b_clicks: 0,
        variant_b_conversions: 0,
        winner: None,
        started_at: None,
        completed_at: None,
        created_at: now,
    }
}

/// Database campaign repository
pub struct DbCampaignRepository {
    pool: DatabasePool,
}

impl DbCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignRepository for DbCampaignRepository {
    async fn create(&self, input: NewCampaign) -> Result<Campaign> {
        let campaign = build_campaign(input, Utc::now());

        sqlx::query_as::<_, Campaign>(
            r#"
            INSERT INTO campaigns (
                id, name, subject, html_body, text_body, from_address, from_name, reply_to,
                target_audience, status, track_opens, track_clicks, ab_test_id,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
            RETURNING *
            "#,
        )
        .bind(campaign.id)
        .bind(&campaign.name)
        .bind(&campaign.subject)
        .bind(&campaign.html_body)
        .bind(&campaign.text_body)
        .bind(&campaign.from_address)
        .bind(&campaign.from_name)
        .bind(&campaign.reply_to)
        .bind(&campaign.target_audience)
        .bind(campaign.status.as_str())
        .bind(campaign.track_opens)
        .bind(campaign.track_clicks)
        .bind(campaign.ab_test_id)
        .bind(campaign.created_at)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn begin_sending(&self, id: CampaignId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET status = 'sending', updated_at = $2
            WHERE id = $1 AND status IN ('draft', 'failed')
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE campaigns SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(now)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn compare_and_set_status(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE campaigns SET status = $3, updated_at = $4 WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_send(&self, id: CampaignId, summary: &CampaignSendSummary) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaigns SET
                status = $2,
                total_recipients = $3,
                sent_count = sent_count + $4,
                sent_at = $5,
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(summary.status.as_str())
        .bind(summary.total_recipients)
        .bind(summary.sent_count)
        .bind(summary.sent_at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn increment_counter(&self, id: CampaignId, counter: CampaignCounter) -> Result<()> {
        let column = counter.column();
        let sql = format!(
            "UPDATE campaigns SET {column} = {column} + 1, updated_at = NOW() WHERE id = $1"
        );
        sqlx::query(&sql)
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn link_ab_test(&self, id: CampaignId, ab_test_id: AbTestId) -> Result<()> {
        sqlx::query("UPDATE campaigns SET ab_test_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(ab_test_id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn create_ab_test(&self, input: NewAbTest) -> Result<AbTest> {
        let test = build_ab_test(input, Utc::now());

        sqlx::query_as::<_, AbTest>(
            r#"
            INSERT INTO ab_tests (
                id, campaign_id, test_type, variant_a, variant_b, split_percentage,
                winner_criteria, test_duration_hours, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(test.id)
        .bind(test.campaign_id)
        .bind(test.test_type.as_str())
        .bind(&test.variant_a)
        .bind(&test.variant_b)
        .bind(test.split_percentage)
        .bind(test.winner_criteria.as_str())
        .bind(test.test_duration_hours)
        .bind(test.status.as_str())
        .bind(test.created_at)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get_ab_test(&self, id: AbTestId) -> Result<Option<AbTest>> {
        sqlx::query_as::<_, AbTest>("SELECT * FROM ab_tests WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn start_ab_test(&self, id: AbTestId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE ab_tests SET status = 'running', started_at = $2 WHERE id = $1 AND status = 'draft'",
        )
        .bind(id)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn add_variant_sent(&self, id: AbTestId, variant: Variant, count: i32) -> Result<()> {
        let column = match variant {
            Variant::A => "variant_a_sent",
            Variant::B => "variant_b_sent",
        };
        let sql = format!("UPDATE ab_tests SET {column} = {column} + $2 WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .bind(count)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn increment_variant_counter(
        &self,
        id: AbTestId,
        variant: Variant,
        counter: VariantCounter,
    ) -> Result<()> {
        let column = counter.column(variant);
        let sql = format!("UPDATE ab_tests SET {column} = {column} + 1 WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn complete_ab_test(
        &self,
        id: AbTestId,
        winner: Variant,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE ab_tests SET status = 'completed', winner = $2, completed_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(winner.as_str())
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn ab_tests_due(&self, now: DateTime<Utc>) -> Result<Vec<AbTest>> {
        sqlx::query_as::<_, AbTest>(
            r#"
            SELECT * FROM ab_tests
            WHERE status = 'running'
              AND started_at + make_interval(hours => test_duration_hours) <= $1
            ORDER BY started_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}

#[async_trait]
impl CampaignRepository for MemoryStore {
    async fn create(&self, input: NewCampaign) -> Result<Campaign> {
        let campaign = build_campaign(input, Utc::now());
        self.state().campaigns.insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.state().campaigns.get(&id).cloned())
    }

    async fn begin_sending(&self, id: CampaignId, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state();
        match state.campaigns.get_mut(&id) {
            Some(c) if matches!(c.status, CampaignStatus::Draft | CampaignStatus::Failed) => {
                c.status = CampaignStatus::Sending;
                c.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(c) = self.state().campaigns.get_mut(&id) {
            c.status = status;
            c.updated_at = now;
        }
        Ok(())
    }

    async fn compare_and_set_status(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state();
        match state.campaigns.get_mut(&id) {
            Some(c) if c.status == from => {
                c.status = to;
                c.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_send(&self, id: CampaignId, summary: &CampaignSendSummary) -> Result<()> {
        if let Some(c) = self.state().campaigns.get_mut(&id) {
            c.status = summary.status;
            c.total_recipients = summary.total_recipients;
            c.sent_count += summary.sent_count;
            c.sent_at = Some(summary.sent_at);
            c.updated_at = summary.sent_at;
        }
        Ok(())
    }

    async fn increment_counter(&self, id: CampaignId, counter: CampaignCounter) -> Result<()> {
        if let Some(c) = self.state().campaigns.get_mut(&id) {
            match counter {
                CampaignCounter::Open => c.open_count += 1,
                CampaignCounter::Click => c.click_count += 1,
                CampaignCounter::Bounce => c.bounce_count += 1,
                CampaignCounter::Unsubscribe => c.unsubscribe_count += 1,
            }
        }
        Ok(())
    }

    async fn link_ab_test(&self, id: CampaignId, ab_test_id: AbTestId) -> Result<()> {
        if let Some(c) = self.state().campaigns.get_mut(&id) {
            c.ab_test_id = Some(ab_test_id);
        }
        Ok(())
    }

    async fn create_ab_test(&self, input: NewAbTest) -> Result<AbTest> {
        let test = build_ab_test(input, Utc::now());
        self.state().ab_tests.insert(test.id, test.clone());
        Ok(test)
    }

    async fn get_ab_test(&self, id: AbTestId) -> Result<Option<AbTest>> {
        Ok(self.state().ab_tests.get(&id).cloned())
    }

    async fn start_ab_test(&self, id: AbTestId, now: DateTime<Utc>) -> Result<()> {
        if let Some(t) = self.state().ab_tests.get_mut(&id) {
            if t.status == AbTestStatus::Draft {
                t.status = AbTestStatus::Running;
                t.started_at = Some(now);
            }
        }
        Ok(())
    }

    async fn add_variant_sent(&self, id: AbTestId, variant: Variant, count: i32) -> Result<()> {
        if let Some(t) = self.state().ab_tests.get_mut(&id) {
            match variant {
                Variant::A => t.variant_a_sent += count,
                Variant::B => t.variant_b_sent += count,
            }
        }
        Ok(())
    }

    async fn increment_variant_counter(
        &self,
        id: AbTestId,
        variant: Variant,
        counter: VariantCounter,
    ) -> Result<()> {
        if let Some(t) = self.state().ab_tests.get_mut(&id) {
            let slot = match (variant, counter) {
                (Variant::A, VariantCounter::Open) => &mut t.variant_a_opens,
                (Variant::A, VariantCounter::Click) => &mut t.variant_a_clicks,
                (Variant::A, VariantCounter::Conversion) => &mut t.variant_a_conversions,
                (Variant::B, VariantCounter::Open) => &mut t.variant_b_opens,
                (Variant::B, VariantCounter::Click) => &mut t.variant_b_clicks,
                (Variant::B, VariantCounter::Conversion) => &mut t.variant_b_conversions,
            };
            *slot += 1;
        }
        Ok(())
    }

    async fn complete_ab_test(
        &self,
        id: AbTestId,
        winner: Variant,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(t) = self.state().ab_tests.get_mut(&id) {
            t.status = AbTestStatus::Completed;
            t.winner = Some(winner.as_str().to_string());
            t.completed_at = Some(now);
        }
        Ok(())
    }

    async fn ab_tests_due(&self, now: DateTime<Utc>) -> Result<Vec<AbTest>> {
        let mut due: Vec<_> = self
            .state()
            .ab_tests
            .values()
            .filter(|t| {
                t.status == AbTestStatus::Running
                    && t.started_at.map_or(false, |s| {
                        s + Duration::hours(i64::from(t.test_duration_hours)) <= now
                    })
            })
            .cloned()
            .collect();
        due.sort_by_key(|t| t.started_at);
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AbTestType, VariantContent, WinnerCriteria};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_begin_sending_only_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let campaign = store
            .create(NewCampaign {
                name: "Spring".into(),
                subject: "Sale".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(store.begin_sending(campaign.id, now).await.unwrap());
        assert!(!store.begin_sending(campaign.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_ab_tests_due_after_duration() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let test = store
            .create_ab_test(NewAbTest {
                campaign_id: Uuid::now_v7(),
                test_type: AbTestType::Subject,
                variant_a: VariantContent::default(),
                variant_b: VariantContent::default(),
                split_percentage: 50,
                winner_criteria: WinnerCriteria::OpenRate,
                test_duration_hours: 4,
            })
            .await
            .unwrap();

        store.start_ab_test(test.id, now).await.unwrap();
        assert!(store.ab_tests_due(now + Duration::hours(3)).await.unwrap().is_empty());
        assert_eq!(
            store.ab_tests_due(now + Duration::hours(4)).await.unwrap().len(),
            1
        );

        store.complete_ab_test(test.id, Variant::B, now).await.unwrap();
        let stored = store.get_ab_test(test.id).await.unwrap().unwrap();
        assert_eq!(stored.winner_variant(), Some(Variant::B));
        assert!(store.ab_tests_due(now + Duration::hours(5)).await.unwrap().is_empty());
    }
}
