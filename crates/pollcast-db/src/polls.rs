use crate::{DbError, DbPool};
use chrono::{DateTime, Utc};
use pollcast_models::{Poll, PollKind, PollOption};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PollRow {
    pub id: i64,
    pub question: String,
    pub description: String,
    pub poll_type: i16,
    pub is_active: bool,
    pub end_time_ms: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PollOptionRow {
    pub id: i64,
    pub poll_id: i64,
    pub position: i64,
    pub text: String,
    pub votes: i64,
}

impl From<PollOptionRow> for PollOption {
    fn from(row: PollOptionRow) -> Self {
        PollOption {
            id: row.id,
            poll_id: row.poll_id,
            text: row.text,
            votes: row.votes,
        }
    }
}

impl PollRow {
    pub fn into_poll(self, options: Vec<PollOption>) -> Result<Poll, DbError> {
        let kind = PollKind::try_from(self.poll_type)
            .map_err(|err| DbError::Sqlx(sqlx::Error::Decode(Box::new(err))))?;
        Ok(Poll {
            id: self.id,
            question: self.question,
            description: self.description,
            kind,
            is_active: self.is_active,
            end_time: self.end_time_ms.and_then(DateTime::<Utc>::from_timestamp_millis),
            options,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewPoll {
    pub question: String,
    pub description: String,
    pub kind: PollKind,
    pub end_time: Option<DateTime<Utc>>,
    pub options: Vec<String>,
}

/// Result of a conditional vote increment.
#[derive(Debug, Clone)]
pub enum TallyOutcome {
    /// The count was incremented; carries the poll's options afterwards.
    Applied(Vec<PollOption>),
    PollMissing,
    PollClosed,
    OptionMissing,
}

pub async fn create_poll(pool: &DbPool, new: &NewPoll) -> Result<Poll, DbError> {
    let mut tx = pool.begin().await?;

    let row: PollRow = sqlx::query_as(
        "INSERT INTO polls (question, description, poll_type, is_active, end_time_ms)
         VALUES (?1, ?2, ?3, 1, ?4)
         RETURNING id, question, description, poll_type, is_active, end_time_ms, created_at",
    )
    .bind(&new.question)
    .bind(&new.description)
    .bind(i16::from(new.kind))
    .bind(new.end_time.map(|t| t.timestamp_millis()))
    .fetch_one(&mut *tx)
    .await?;

    let mut options = Vec::with_capacity(new.options.len());
    for (position, text) in new.options.iter().enumerate() {
        let option: PollOptionRow = sqlx::query_as(
            "INSERT INTO poll_options (poll_id, position, text, votes)
             VALUES (?1, ?2, ?3, 0)
             RETURNING id, poll_id, position, text, votes",
        )
        .bind(row.id)
        .bind(position as i64)
        .bind(text)
        .fetch_one(&mut *tx)
        .await?;
        options.push(option.into());
    }

    tx.commit().await?;
    row.into_poll(options)
}

pub async fn get_poll(pool: &DbPool, poll_id: i64) -> Result<Option<Poll>, DbError> {
    let row: Option<PollRow> = sqlx::query_as(
        "SELECT id, question, description, poll_type, is_active, end_time_ms, created_at
         FROM polls WHERE id = ?1",
    )
    .bind(poll_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let options = list_poll_options(pool, poll_id).await?;
            row.into_poll(options).map(Some)
        }
        None => Ok(None),
    }
}

pub async fn list_poll_options(pool: &DbPool, poll_id: i64) -> Result<Vec<PollOption>, DbError> {
    let rows: Vec<PollOptionRow> = sqlx::query_as(
        "SELECT id, poll_id, position, text, votes
         FROM poll_options
         WHERE poll_id = ?1
         ORDER BY position ASC",
    )
    .bind(poll_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(PollOption::from).collect())
}

/// Newest polls first, each with its options in display order.
pub async fn list_polls(pool: &DbPool, limit: i64, offset: i64) -> Result<Vec<Poll>, DbError> {
    let rows: Vec<PollRow> = sqlx::query_as(
        "SELECT id, question, description, poll_type, is_active, end_time_ms, created_at
         FROM polls
         ORDER BY id DESC
         LIMIT ?1 OFFSET ?2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let options: Vec<PollOptionRow> = sqlx::query_as(
        "SELECT id, poll_id, position, text, votes
         FROM poll_options
         WHERE poll_id IN (SELECT id FROM polls ORDER BY id DESC LIMIT ?1 OFFSET ?2)
         ORDER BY poll_id, position ASC",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let mut by_poll: std::collections::HashMap<i64, Vec<PollOption>> =
        std::collections::HashMap::new();
    for option in options {
        by_poll.entry(option.poll_id).or_default().push(option.into());
    }
    rows.into_iter()
        .map(|row| {
            let options = by_poll.remove(&row.id).unwrap_or_default();
            row.into_poll(options)
        })
        .collect()
}

pub async fn list_poll_ids(pool: &DbPool) -> Result<Vec<i64>, DbError> {
    let ids = sqlx::query_scalar("SELECT id FROM polls ORDER BY id ASC")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

/// Most recent open polls, newest first.
pub async fn list_open_poll_ids(
    pool: &DbPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<i64>, DbError> {
    let ids = sqlx::query_scalar(
        "SELECT id FROM polls
         WHERE is_active = 1 AND (end_time_ms IS NULL OR end_time_ms > ?1)
         ORDER BY id DESC
         LIMIT ?2",
    )
    .bind(now.timestamp_millis())
    .bind(limit.max(1))
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Increment one option's count, but only while the poll is open and the
/// option belongs to it. The check and the write are a single statement.
pub async fn apply_vote(
    pool: &DbPool,
    poll_id: i64,
    option_id: i64,
    now: DateTime<Utc>,
) -> Result<TallyOutcome, DbError> {
    let mut tx = pool.begin().await?;
    let now_ms = now.timestamp_millis();

    let updated = sqlx::query(
        "UPDATE poll_options SET votes = votes + 1
         WHERE id = ?1 AND poll_id = ?2
           AND EXISTS (
               SELECT 1 FROM polls p
               WHERE p.id = ?2 AND p.is_active = 1
                 AND (p.end_time_ms IS NULL OR p.end_time_ms > ?3)
           )",
    )
    .bind(option_id)
    .bind(poll_id)
    .bind(now_ms)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        let poll: Option<(bool, Option<i64>)> =
            sqlx::query_as("SELECT is_active, end_time_ms FROM polls WHERE id = ?1")
                .bind(poll_id)
                .fetch_optional(&mut *tx)
                .await?;
        tx.rollback().await?;
        return Ok(match poll {
            None => TallyOutcome::PollMissing,
            Some((active, end)) if !active || end.is_some_and(|end| end <= now_ms) => {
                TallyOutcome::PollClosed
            }
            Some(_) => TallyOutcome::OptionMissing,
        });
    }

    let rows: Vec<PollOptionRow> = sqlx::query_as(
        "SELECT id, poll_id, position, text, votes
         FROM poll_options
         WHERE poll_id = ?1
         ORDER BY position ASC",
    )
    .bind(poll_id)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(TallyOutcome::Applied(
        rows.into_iter().map(PollOption::from).collect(),
    ))
}

/// Zero every option count of a poll. Returns the options afterwards.
pub async fn reset_poll_votes(pool: &DbPool, poll_id: i64) -> Result<Vec<PollOption>, DbError> {
    let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM polls WHERE id = ?1")
        .bind(poll_id)
        .fetch_optional(pool)
        .await?;
    if exists.is_none() {
        return Err(DbError::NotFound);
    }

    sqlx::query("UPDATE poll_options SET votes = 0 WHERE poll_id = ?1")
        .bind(poll_id)
        .execute(pool)
        .await?;
    list_poll_options(pool, poll_id).await
}

/// Deactivate polls whose end time has passed. Returns the closed ids.
pub async fn close_expired_polls(pool: &DbPool, now: DateTime<Utc>) -> Result<Vec<i64>, DbError> {
    let ids = sqlx::query_scalar(
        "UPDATE polls SET is_active = 0
         WHERE is_active = 1 AND end_time_ms IS NOT NULL AND end_time_ms <= ?1
         RETURNING id",
    )
    .bind(now.timestamp_millis())
    .fetch_all(pool)
    .await?;
    Ok(ids)
}
