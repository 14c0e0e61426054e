//! SQLite-backed implementation of the queue store.
//!
//! Every primitive runs inside a single transaction, and the lease and pop
//! primitives are single `UPDATE … RETURNING` / `DELETE … RETURNING` statements, so
//! two consumers never lease the same message at the same time. Timestamps are stored
//! as unix milliseconds.
//!
//! The schema is created by the migrations in `migrations/`, which
//! [`Service`](crate::service::Service) applies on connect.

use futures_util::future::BoxFuture;
use snafu::{OptionExt, ResultExt};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::{
    config::{Delay, VisibilityTimeout},
    error::{Error, Operation, QueueExistsSnafu, QueueNotFoundSnafu, StoreSnafu},
    message::{from_millis, now_millis, Message, MessageId, QueueMetric},
};

use super::{retain_found, QueueStore};

/// A queue store persisting messages in SQLite.
#[derive(Clone)]
pub struct SqliteQueueStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    read_ct: i64,
    enqueued_at: i64,
    visible_at: i64,
    body: String,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            read_count: row.read_ct,
            enqueued_at: from_millis(row.enqueued_at),
            visible_at: from_millis(row.visible_at),
            payload: row.body,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MetricRow {
    queue_length: i64,
    newest: Option<i64>,
    oldest: Option<i64>,
    total_messages: i64,
}

fn store_ctx(operation: Operation, queue: &str) -> StoreSnafu<Operation, &str> {
    StoreSnafu { operation, queue }
}

async fn queue_id(
    conn: &mut SqliteConnection,
    queue: &str,
    operation: Operation,
) -> Result<i64, Error> {
    sqlx::query_scalar::<_, i64>("SELECT id FROM queues WHERE name = $1")
        .bind(queue)
        .fetch_optional(conn)
        .await
        .context(store_ctx(operation, queue))?
        .context(QueueNotFoundSnafu { queue })
}

async fn insert_message(
    conn: &mut SqliteConnection,
    queue_id: i64,
    payload: &str,
    delay: Delay,
    now: i64,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar(
        "
        INSERT INTO messages (queue, read_ct, enqueued_at, visible_at, body)
        VALUES ($1, 0, $2, $3, $4)
        RETURNING id
        ",
    )
    .bind(queue_id)
    .bind(now)
    .bind(now + delay.as_millis())
    .bind(payload)
    .fetch_optional(conn)
    .await
}

async fn count_sent(conn: &mut SqliteConnection, queue_id: i64, sent: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE queues SET total_messages = total_messages + $1 WHERE id = $2")
        .bind(sent)
        .bind(queue_id)
        .execute(conn)
        .await?;
    Ok(())
}

async fn archive_one(
    conn: &mut SqliteConnection,
    queue_id: i64,
    id: MessageId,
    now: i64,
) -> Result<bool, sqlx::Error> {
    let copied = sqlx::query(
        "
        INSERT INTO archived_messages (id, queue, read_ct, enqueued_at, visible_at, archived_at, body)
        SELECT id, queue, read_ct, enqueued_at, visible_at, $3, body
        FROM messages
        WHERE queue = $1 AND id = $2
        ",
    )
    .bind(queue_id)
    .bind(id)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if copied == 0 {
        return Ok(false);
    }

    sqlx::query("DELETE FROM messages WHERE queue = $1 AND id = $2")
        .bind(queue_id)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(true)
}

impl SqliteQueueStore {
    /// Wraps a pool whose database has already been migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens a transaction that takes the write lock with its first statement.
    ///
    /// A deferred transaction that reads the queue id before writing cannot wait on
    /// the busy timeout when another writer holds the lock; its upgrade fails with
    /// `SQLITE_BUSY` immediately.
    async fn begin_write(
        &self,
        operation: Operation,
        queue: &str,
    ) -> Result<Transaction<'static, Sqlite>, Error> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .context(store_ctx(operation, queue))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Number of archived messages for a queue.
    pub async fn archived_count(&self, queue: &str) -> Result<i64, Error> {
        let op = Operation::Archive;
        let mut conn = self.pool.acquire().await.context(store_ctx(op, queue))?;
        let queue_id = queue_id(&mut conn, queue, op).await?;

        sqlx::query_scalar("SELECT COUNT(*) FROM archived_messages WHERE queue = $1")
            .bind(queue_id)
            .fetch_one(&mut *conn)
            .await
            .context(store_ctx(op, queue))
    }
}

impl QueueStore for SqliteQueueStore {
    fn create_queue<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let res = sqlx::query("INSERT INTO queues (name, created_at) VALUES ($1, $2)")
                .bind(queue)
                .bind(now_millis())
                .execute(&self.pool)
                .await;

            match res {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    QueueExistsSnafu { queue }.fail()
                }
                Err(e) => Err(e).context(store_ctx(Operation::CreateQueue, queue)),
            }
        })
    }

    fn drop_queue<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            let dropped = sqlx::query("DELETE FROM queues WHERE name = $1")
                .bind(queue)
                .execute(&self.pool)
                .await
                .context(store_ctx(Operation::DropQueue, queue))?
                .rows_affected();

            Ok(dropped > 0)
        })
    }

    fn list_queues(&self) -> BoxFuture<'_, Result<Vec<String>, Error>> {
        Box::pin(async move {
            sqlx::query_scalar("SELECT name FROM queues ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .context(store_ctx(Operation::ListQueues, "*"))
        })
    }

    fn enqueue<'a>(
        &'a self,
        queue: &'a str,
        payload: &'a str,
        delay: Delay,
    ) -> BoxFuture<'a, Result<Option<MessageId>, Error>> {
        Box::pin(async move {
            let op = Operation::Enqueue;
            let mut tx = self.begin_write(op, queue).await?;

            let queue_id = queue_id(&mut tx, queue, op).await?;

            let id = insert_message(&mut tx, queue_id, payload, delay, now_millis())
                .await
                .context(store_ctx(op, queue))?;

            if id.is_some() {
                count_sent(&mut tx, queue_id, 1)
                    .await
                    .context(store_ctx(op, queue))?;
            }

            tx.commit().await.context(store_ctx(op, queue))?;

            Ok(id)
        })
    }

    fn enqueue_batch<'a>(
        &'a self,
        queue: &'a str,
        payloads: &'a [String],
        delay: Delay,
    ) -> BoxFuture<'a, Result<Vec<MessageId>, Error>> {
        Box::pin(async move {
            let op = Operation::EnqueueBatch;
            let mut tx = self.begin_write(op, queue).await?;

            let queue_id = queue_id(&mut tx, queue, op).await?;
            let now = now_millis();

            let mut ids = Vec::with_capacity(payloads.len());
            for payload in payloads {
                if let Some(id) = insert_message(&mut tx, queue_id, payload, delay, now)
                    .await
                    .context(store_ctx(op, queue))?
                {
                    ids.push(id);
                }
            }

            count_sent(&mut tx, queue_id, ids.len() as i64)
                .await
                .context(store_ctx(op, queue))?;

            tx.commit().await.context(store_ctx(op, queue))?;

            Ok(ids)
        })
    }

    fn read<'a>(
        &'a self,
        queue: &'a str,
        visibility_timeout: VisibilityTimeout,
        count: usize,
    ) -> BoxFuture<'a, Result<Vec<Message>, Error>> {
        Box::pin(async move {
            let op = Operation::Read;
            let mut tx = self.begin_write(op, queue).await?;

            let queue_id = queue_id(&mut tx, queue, op).await?;
            let now = now_millis();

            let mut rows: Vec<MessageRow> = sqlx::query_as(
                "
                UPDATE messages
                SET read_ct = read_ct + 1, visible_at = $1
                WHERE id IN (
                    SELECT id FROM messages
                    WHERE queue = $2 AND visible_at <= $3
                    ORDER BY id
                    LIMIT $4
                )
                RETURNING id, read_ct, enqueued_at, visible_at, body
                ",
            )
            .bind(now + visibility_timeout.as_millis())
            .bind(queue_id)
            .bind(now)
            .bind(i64::try_from(count).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await
            .context(store_ctx(op, queue))?;

            tx.commit().await.context(store_ctx(op, queue))?;

            // RETURNING makes no ordering promise
            rows.sort_by_key(|row| row.id);

            Ok(rows.into_iter().map(Message::from).collect())
        })
    }

    fn pop<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<Option<Message>, Error>> {
        Box::pin(async move {
            let op = Operation::Pop;
            let mut tx = self.begin_write(op, queue).await?;

            let queue_id = queue_id(&mut tx, queue, op).await?;

            let row: Option<MessageRow> = sqlx::query_as(
                "
                DELETE FROM messages
                WHERE id = (
                    SELECT id FROM messages
                    WHERE queue = $1 AND visible_at <= $2
                    ORDER BY id
                    LIMIT 1
                )
                RETURNING id, read_ct + 1 AS read_ct, enqueued_at, visible_at, body
                ",
            )
            .bind(queue_id)
            .bind(now_millis())
            .fetch_optional(&mut *tx)
            .await
            .context(store_ctx(op, queue))?;

            tx.commit().await.context(store_ctx(op, queue))?;

            Ok(row.map(Message::from))
        })
    }

    fn delete<'a>(&'a self, queue: &'a str, id: MessageId) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            let op = Operation::Delete;
            let mut tx = self.begin_write(op, queue).await?;

            let queue_id = queue_id(&mut tx, queue, op).await?;

            let deleted = sqlx::query("DELETE FROM messages WHERE queue = $1 AND id = $2")
                .bind(queue_id)
                .bind(id)
                .execute(&mut *tx)
                .await
                .context(store_ctx(op, queue))?
                .rows_affected();

            tx.commit().await.context(store_ctx(op, queue))?;

            Ok(deleted > 0)
        })
    }

    fn delete_batch<'a>(
        &'a self,
        queue: &'a str,
        ids: &'a [MessageId],
    ) -> BoxFuture<'a, Result<Vec<MessageId>, Error>> {
        Box::pin(async move {
            let op = Operation::DeleteBatch;
            let mut tx = self.begin_write(op, queue).await?;

            let queue_id = queue_id(&mut tx, queue, op).await?;

            if ids.is_empty() {
                return Ok(Vec::new());
            }

            let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM messages WHERE queue = ");
            query.push_bind(queue_id);
            query.push(" AND id IN (");
            let mut list = query.separated(", ");
            for id in ids {
                list.push_bind(*id);
            }
            list.push_unseparated(") RETURNING id");

            let deleted: Vec<MessageId> = query
                .build_query_scalar()
                .fetch_all(&mut *tx)
                .await
                .context(store_ctx(op, queue))?;

            tx.commit().await.context(store_ctx(op, queue))?;

            Ok(retain_found(ids, &deleted))
        })
    }

    fn archive<'a>(&'a self, queue: &'a str, id: MessageId) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            let op = Operation::Archive;
            let mut tx = self.begin_write(op, queue).await?;

            let queue_id = queue_id(&mut tx, queue, op).await?;

            let archived = archive_one(&mut tx, queue_id, id, now_millis())
                .await
                .context(store_ctx(op, queue))?;

            tx.commit().await.context(store_ctx(op, queue))?;

            Ok(archived)
        })
    }

    fn archive_batch<'a>(
        &'a self,
        queue: &'a str,
        ids: &'a [MessageId],
    ) -> BoxFuture<'a, Result<Vec<MessageId>, Error>> {
        Box::pin(async move {
            let op = Operation::ArchiveBatch;
            let mut tx = self.begin_write(op, queue).await?;

            let queue_id = queue_id(&mut tx, queue, op).await?;
            let now = now_millis();

            let mut archived = Vec::with_capacity(ids.len());
            for id in ids {
                if archive_one(&mut tx, queue_id, *id, now)
                    .await
                    .context(store_ctx(op, queue))?
                {
                    archived.push(*id);
                }
            }

            tx.commit().await.context(store_ctx(op, queue))?;

            Ok(retain_found(ids, &archived))
        })
    }

    fn metrics<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<QueueMetric, Error>> {
        Box::pin(async move {
            let row: MetricRow = sqlx::query_as(
                "
                SELECT
                    COUNT(m.id) AS queue_length,
                    MAX(m.enqueued_at) AS newest,
                    MIN(m.enqueued_at) AS oldest,
                    q.total_messages AS total_messages
                FROM queues AS q
                LEFT JOIN messages AS m ON m.queue = q.id
                WHERE q.name = $1
                GROUP BY q.id
                ",
            )
            .bind(queue)
            .fetch_optional(&self.pool)
            .await
            .context(store_ctx(Operation::Metrics, queue))?
            .context(QueueNotFoundSnafu { queue })?;

            let now = now_millis();
            let age = |at: i64| (now - at).max(0) / 1000;

            Ok(QueueMetric {
                queue_name: queue.to_owned(),
                queue_length: row.queue_length,
                newest_msg_age_sec: row.newest.map(age),
                oldest_msg_age_sec: row.oldest.map(age),
                total_messages: row.total_messages,
                scrape_time: from_millis(now),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    async fn setup() -> SqliteQueueStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let store = SqliteQueueStore::new(pool);
        store.create_queue("test_queue").await.unwrap();
        store
    }

    fn vt(seconds: i64) -> VisibilityTimeout {
        VisibilityTimeout::new(seconds).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_list_queues() {
        let store = setup().await;
        store.create_queue("another").await.unwrap();

        assert_eq!(
            store.list_queues().await.unwrap(),
            vec!["another".to_owned(), "test_queue".to_owned()]
        );

        let err = store.create_queue("another").await.unwrap_err();
        assert!(matches!(err, Error::QueueExists { .. }));
    }

    #[tokio::test]
    async fn test_unknown_queue_fails() {
        let store = setup().await;

        let err = store
            .enqueue("missing", "{}", Delay::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueNotFound { ref queue } if queue == "missing"));

        assert!(store.pop("missing").await.is_err());
        assert!(store.metrics("missing").await.is_err());
        assert!(store.list_queues().await.unwrap().contains(&"test_queue".to_owned()));
    }

    #[tokio::test]
    async fn test_read_with_unbounded_count() {
        let store = setup().await;
        for n in 0..3 {
            store
                .enqueue("test_queue", &format!(r#"{{"n": {n}}}"#), Delay::ZERO)
                .await
                .unwrap();
        }

        let leased = store.read("test_queue", vt(30), usize::MAX).await.unwrap();
        assert_eq!(leased.len(), 3);
        assert!(leased.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_lease_hides_message_until_timeout() {
        let store = setup().await;
        let id = store
            .enqueue("test_queue", r#"{"customer_name": "John"}"#, Delay::ZERO)
            .await
            .unwrap()
            .unwrap();

        let first = store.read("test_queue", vt(1), 1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, id);
        assert_eq!(first[0].read_count, 1);

        assert!(store.read("test_queue", vt(1), 1).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;

        let again = store.read("test_queue", vt(1), 1).await.unwrap();
        assert_eq!(again[0].id, id);
        assert_eq!(again[0].read_count, 2);
    }

    #[tokio::test]
    async fn test_delay_defers_visibility() {
        let store = setup().await;
        store
            .enqueue("test_queue", "{}", Delay::new(60).unwrap())
            .await
            .unwrap();

        assert!(store.pop("test_queue").await.unwrap().is_none());
        assert_eq!(store.metrics("test_queue").await.unwrap().queue_length, 1);
    }

    #[tokio::test]
    async fn test_pop_is_fifo_and_removes() {
        let store = setup().await;
        let payloads = vec![r#"{"n":1}"#.to_owned(), r#"{"n":2}"#.to_owned()];
        let ids = store
            .enqueue_batch("test_queue", &payloads, Delay::ZERO)
            .await
            .unwrap();

        let first = store.pop("test_queue").await.unwrap().unwrap();
        assert_eq!(first.id, ids[0]);
        assert_eq!(first.read_count, 1);
        assert_eq!(first.payload, payloads[0]);

        let second = store.pop("test_queue").await.unwrap().unwrap();
        assert_eq!(second.id, ids[1]);

        assert!(store.pop("test_queue").await.unwrap().is_none());
        assert!(store.read("test_queue", vt(0), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_batch_returns_found_subset() {
        let store = setup().await;
        let id = store
            .enqueue("test_queue", "{}", Delay::ZERO)
            .await
            .unwrap()
            .unwrap();

        let deleted = store
            .delete_batch("test_queue", &[id, MessageId::MAX])
            .await
            .unwrap();
        assert_eq!(deleted, vec![id]);

        assert!(!store.delete("test_queue", id).await.unwrap());
    }

    #[tokio::test]
    async fn test_archive_moves_message() {
        let store = setup().await;
        let payloads = vec!["{}".to_owned(), "{}".to_owned()];
        let ids = store
            .enqueue_batch("test_queue", &payloads, Delay::ZERO)
            .await
            .unwrap();

        assert!(store.archive("test_queue", ids[0]).await.unwrap());
        assert!(!store.archive("test_queue", ids[0]).await.unwrap());

        let archived = store
            .archive_batch("test_queue", &[ids[1], MessageId::MAX])
            .await
            .unwrap();
        assert_eq!(archived, vec![ids[1]]);

        assert_eq!(store.archived_count("test_queue").await.unwrap(), 2);
        assert!(store.pop("test_queue").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_metrics() {
        let store = setup().await;

        let empty = store.metrics("test_queue").await.unwrap();
        assert_eq!(empty.queue_length, 0);
        assert_eq!(empty.newest_msg_age_sec, None);
        assert_eq!(empty.total_messages, 0);

        let payloads = vec!["{}".to_owned(), "{}".to_owned(), "{}".to_owned()];
        store
            .enqueue_batch("test_queue", &payloads, Delay::ZERO)
            .await
            .unwrap();
        store.pop("test_queue").await.unwrap();

        let metric = store.metrics("test_queue").await.unwrap();
        assert_eq!(metric.queue_name, "test_queue");
        assert_eq!(metric.queue_length, 2);
        assert_eq!(metric.total_messages, 3);
        assert_eq!(metric.oldest_msg_age_sec, Some(0));
    }

    #[tokio::test]
    async fn test_drop_queue_cascades() {
        let store = setup().await;
        store.enqueue("test_queue", "{}", Delay::ZERO).await.unwrap();

        assert!(store.drop_queue("test_queue").await.unwrap());
        assert!(!store.drop_queue("test_queue").await.unwrap());
        assert!(store.list_queues().await.unwrap().is_empty());

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }
}
