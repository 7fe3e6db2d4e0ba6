use super::model::{NewBatch, NewConversation, NewEvaluation};
use crate::model::{Batch, Conversation, ConversationStatus, Evaluation, Message, MessageRole, SetType};
use anyhow::{Context, Result};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;

const CONVERSATION_COLS: &str = "id, external_conversation_id, student_id, student_name, \
     topic_id, topic_name, subject_name, set_type, status, messages_remaining, is_auto, \
     is_running, system_prompt, initial_message, batch_id, created_at, updated_at";

const MESSAGE_COLS: &str = "id, conversation_id, role, content, created_at";

const BATCH_COLS: &str = "id, name, set_type, system_prompt, initial_message, status, \
     total_conversations, completed_conversations, created_at, updated_at";

const EVALUATION_COLS: &str = "id, set_type, batch_id, score, num_conversations, \
     submission_number, submissions_remaining, system_prompt, initial_message, created_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Expand a leading `~/` and ensure the parent directory exists for
/// file-backed SQLite URLs. In-memory URLs and other schemes pass through.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        // sqlite::memory: and sqlite::memory:?cache=shared
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }
    let path = match path.strip_prefix("~/") {
        Some(tail) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), tail),
            Err(_) => path.to_string(),
        },
        None => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    match query {
        Some(q) => format!("sqlite://{}?{}", path, q),
        None => format!("sqlite://{}", path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_conversation(pool: &Pool, new: &NewConversation<'_>) -> Result<Conversation> {
    let sql = format!(
        "INSERT INTO conversations (external_conversation_id, student_id, student_name, \
         topic_id, topic_name, subject_name, set_type, status, messages_remaining, is_auto, \
         is_running, system_prompt, initial_message, batch_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 'open', ?, ?, ?, ?, ?, ?) \
         RETURNING {}",
        CONVERSATION_COLS
    );
    let convo = sqlx::query_as::<_, Conversation>(&sql)
        .bind(new.external_conversation_id)
        .bind(new.student_id)
        .bind(new.student_name)
        .bind(new.topic_id)
        .bind(new.topic_name)
        .bind(new.subject_name)
        .bind(new.set_type)
        .bind(new.messages_remaining)
        .bind(new.is_auto)
        .bind(new.is_running)
        .bind(new.system_prompt)
        .bind(new.initial_message)
        .bind(new.batch_id)
        .fetch_one(pool)
        .await
        .context("failed to insert conversation")?;
    Ok(convo)
}

#[instrument(skip_all)]
pub async fn get_conversation(pool: &Pool, id: i64) -> Result<Option<Conversation>> {
    let sql = format!(
        "SELECT {} FROM conversations WHERE id = ?",
        CONVERSATION_COLS
    );
    let convo = sqlx::query_as::<_, Conversation>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(convo)
}

#[instrument(skip_all)]
pub async fn list_conversations(pool: &Pool, limit: i64) -> Result<Vec<Conversation>> {
    let sql = format!(
        "SELECT {} FROM conversations ORDER BY updated_at DESC, id DESC LIMIT ?",
        CONVERSATION_COLS
    );
    let convos = sqlx::query_as::<_, Conversation>(&sql)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(convos)
}

/// Per-turn progress write: the remaining budget and open/closed state.
#[instrument(skip_all)]
pub async fn update_conversation_progress(
    pool: &Pool,
    id: i64,
    messages_remaining: i64,
    status: ConversationStatus,
) -> Result<()> {
    sqlx::query(
        "UPDATE conversations SET messages_remaining = ?, status = ?, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(messages_remaining)
    .bind(status)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update conversation progress")?;
    Ok(())
}

/// Clear the running flag. Status is left as last persisted, so an
/// interrupted run can be resumed from the stored state. Idempotent.
#[instrument(skip_all)]
pub async fn release_conversation(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE conversations SET is_running = 0, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to release running flag")?;
    Ok(())
}

/// Claim a conversation for a driver. The conditional update is the lease:
/// exactly one caller observes `rows_affected == 1` per idle-to-running edge.
#[instrument(skip_all)]
pub async fn try_acquire_running(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE conversations SET is_running = 1, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND is_running = 0",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Persist one tutor/student exchange atomically, tutor side first.
#[instrument(skip_all)]
pub async fn insert_message_pair(
    pool: &Pool,
    conversation_id: i64,
    tutor_content: &str,
    student_content: &str,
) -> Result<(Message, Message)> {
    let mut tx = pool.begin().await?;
    let tutor = insert_message_tx(&mut tx, conversation_id, MessageRole::Tutor, tutor_content).await?;
    let student =
        insert_message_tx(&mut tx, conversation_id, MessageRole::Student, student_content).await?;
    tx.commit().await?;
    Ok((tutor, student))
}

async fn insert_message_tx(
    tx: &mut Transaction<'_, Sqlite>,
    conversation_id: i64,
    role: MessageRole,
    content: &str,
) -> Result<Message> {
    let sql = format!(
        "INSERT INTO messages (conversation_id, role, content) VALUES (?, ?, ?) RETURNING {}",
        MESSAGE_COLS
    );
    let msg = sqlx::query_as::<_, Message>(&sql)
        .bind(conversation_id)
        .bind(role)
        .bind(content)
        .fetch_one(&mut **tx)
        .await?;
    Ok(msg)
}

/// Transcript in replay order. The id tiebreak keeps the tutor side of a
/// pair ahead of the student side when both land in the same second.
#[instrument(skip_all)]
pub async fn list_messages(pool: &Pool, conversation_id: i64) -> Result<Vec<Message>> {
    let sql = format!(
        "SELECT {} FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, id ASC",
        MESSAGE_COLS
    );
    let messages = sqlx::query_as::<_, Message>(&sql)
        .bind(conversation_id)
        .fetch_all(pool)
        .await?;
    Ok(messages)
}

#[instrument(skip_all)]
pub async fn insert_batch(pool: &Pool, new: &NewBatch<'_>) -> Result<Batch> {
    let sql = format!(
        "INSERT INTO batches (name, set_type, system_prompt, initial_message, status, \
         total_conversations, completed_conversations) \
         VALUES (?, ?, ?, ?, 'running', ?, 0) \
         RETURNING {}",
        BATCH_COLS
    );
    let batch = sqlx::query_as::<_, Batch>(&sql)
        .bind(new.name)
        .bind(new.set_type)
        .bind(new.system_prompt)
        .bind(new.initial_message)
        .bind(new.total_conversations)
        .fetch_one(pool)
        .await
        .context("failed to insert batch")?;
    Ok(batch)
}

/// Correct the planned total after provisioning (skipped pairs shrink it).
#[instrument(skip_all)]
pub async fn set_batch_total(pool: &Pool, id: i64, total: i64) -> Result<()> {
    sqlx::query(
        "UPDATE batches SET total_conversations = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(total)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// In-place counter bump so concurrent observers never see completed > total.
#[instrument(skip_all)]
pub async fn increment_batch_completed(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE batches SET completed_conversations = completed_conversations + 1, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn complete_batch(pool: &Pool, id: i64, completed: i64) -> Result<()> {
    sqlx::query(
        "UPDATE batches SET status = 'completed', completed_conversations = ?, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(completed)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fail_batch(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("UPDATE batches SET status = 'failed', updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_batch(pool: &Pool, id: i64) -> Result<Option<Batch>> {
    let sql = format!("SELECT {} FROM batches WHERE id = ?", BATCH_COLS);
    let batch = sqlx::query_as::<_, Batch>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(batch)
}

#[instrument(skip_all)]
pub async fn list_batches(pool: &Pool, limit: i64) -> Result<Vec<Batch>> {
    let sql = format!(
        "SELECT {} FROM batches ORDER BY created_at DESC, id DESC LIMIT ?",
        BATCH_COLS
    );
    let batches = sqlx::query_as::<_, Batch>(&sql)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(batches)
}

/// Newest batch for a set type; evaluation gating reads this.
#[instrument(skip_all)]
pub async fn latest_batch_for_set_type(pool: &Pool, set_type: SetType) -> Result<Option<Batch>> {
    let sql = format!(
        "SELECT {} FROM batches WHERE set_type = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        BATCH_COLS
    );
    let batch = sqlx::query_as::<_, Batch>(&sql)
        .bind(set_type)
        .fetch_optional(pool)
        .await?;
    Ok(batch)
}

#[instrument(skip_all)]
pub async fn insert_evaluation(pool: &Pool, new: &NewEvaluation<'_>) -> Result<Evaluation> {
    let sql = format!(
        "INSERT INTO evaluations (set_type, batch_id, score, num_conversations, \
         submission_number, submissions_remaining, system_prompt, initial_message) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING {}",
        EVALUATION_COLS
    );
    let evaluation = sqlx::query_as::<_, Evaluation>(&sql)
        .bind(new.set_type)
        .bind(new.batch_id)
        .bind(new.score)
        .bind(new.num_conversations)
        .bind(new.submission_number)
        .bind(new.submissions_remaining)
        .bind(new.system_prompt)
        .bind(new.initial_message)
        .fetch_one(pool)
        .await
        .context("failed to insert evaluation")?;
    Ok(evaluation)
}

#[instrument(skip_all)]
pub async fn list_evaluations(pool: &Pool, limit: i64) -> Result<Vec<Evaluation>> {
    let sql = format!(
        "SELECT {} FROM evaluations ORDER BY created_at DESC, id DESC LIMIT ?",
        EVALUATION_COLS
    );
    let evaluations = sqlx::query_as::<_, Evaluation>(&sql)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(evaluations)
}
