#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **foreman-store-sqlite** – SQLite persistence driver for the Foreman
//! control plane.
//!
//! Each entity is stored as one row holding its id, a handful of indexed
//! columns used for filtering, and a JSON blob of the full entity. Reads
//! deserialize the blob; writes are `INSERT OR REPLACE`. `claim_next_task`
//! wraps its select-then-transition in a single `BEGIN IMMEDIATE`
//! transaction, which takes SQLite's write lock up front and so serializes
//! concurrent claimants against each other.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use foreman_store_core::{ControlPlaneStore, StorageError, TaskClaimFilter, TaskFilter};
use foreman_types::{Agent, Budget, BudgetScope, CostRecord, EntityId, Task, TaskStatus, Ticket};

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn decode_err(e: serde_json::Error) -> StorageError {
    StorageError::Decode(e.to_string())
}

/// A persistent, SQLite-backed implementation of [`ControlPlaneStore`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if absent) a SQLite database file and run migrations.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePool::connect(&url).await.map_err(backend_err)?;
        Self::from_pool(pool).await
    }

    /// Open an in-memory SQLite database, useful for tests.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePool::connect("sqlite::memory:").await.map_err(backend_err)?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, running migrations against it.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tickets (
                id TEXT PRIMARY KEY,
                approval_status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                ticket_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL,
                sandbox_id TEXT,
                assigned_agent TEXT,
                priority_rank INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                body TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                body TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cost_records (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                body TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cost_task ON cost_records(task_id)")
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS budgets (
                id TEXT PRIMARY KEY,
                scope_type TEXT NOT NULL,
                scope_id TEXT,
                body TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(())
    }

    fn ticket_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Ticket, StorageError> {
        let body: String = row.try_get("body").map_err(backend_err)?;
        serde_json::from_str(&body).map_err(decode_err)
    }

    fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Task, StorageError> {
        let body: String = row.try_get("body").map_err(backend_err)?;
        serde_json::from_str(&body).map_err(decode_err)
    }

    fn agent_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Agent, StorageError> {
        let body: String = row.try_get("body").map_err(backend_err)?;
        serde_json::from_str(&body).map_err(decode_err)
    }

    fn cost_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CostRecord, StorageError> {
        let body: String = row.try_get("body").map_err(backend_err)?;
        serde_json::from_str(&body).map_err(decode_err)
    }

    fn budget_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Budget, StorageError> {
        let body: String = row.try_get("body").map_err(backend_err)?;
        serde_json::from_str(&body).map_err(decode_err)
    }

    async fn dependencies_satisfied(
        tx: &mut Transaction<'_, Sqlite>,
        task: &Task,
    ) -> Result<bool, StorageError> {
        for dep in &task.dependencies.depends_on {
            let row = sqlx::query("SELECT status FROM tasks WHERE id = ?")
                .bind(dep.to_string())
                .fetch_optional(&mut **tx)
                .await
                .map_err(backend_err)?;
            match row {
                Some(r) => {
                    let status: String = r.try_get("status").map_err(backend_err)?;
                    if status != "completed" {
                        return Ok(false);
                    }
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn ticket_can_schedule(
        tx: &mut Transaction<'_, Sqlite>,
        ticket_id: EntityId,
    ) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT approval_status FROM tickets WHERE id = ?")
            .bind(ticket_id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(backend_err)?;
        Ok(match row {
            Some(r) => {
                let status: String = r.try_get("approval_status").map_err(backend_err)?;
                status == "approved"
            }
            None => true,
        })
    }

    async fn claim_candidates(
        tx: &mut Transaction<'_, Sqlite>,
        status_gate: TaskStatus,
        filter: &TaskClaimFilter,
    ) -> Result<Vec<Task>, StorageError> {
        let status_tag = serde_json::to_value(status_gate).map_err(decode_err)?;
        let status_tag = status_tag.as_str().unwrap_or_default().to_string();

        let rows = sqlx::query(
            "SELECT body FROM tasks WHERE status = ? AND sandbox_id IS NULL ORDER BY priority_rank DESC, created_at ASC",
        )
        .bind(&status_tag)
        .fetch_all(&mut **tx)
        .await
        .map_err(backend_err)?;

        let mut candidates = Vec::new();
        for row in rows {
            let task = Self::task_from_row(&row)?;
            if let Some(phase) = &filter.phase {
                if &task.phase != phase {
                    continue;
                }
            }
            if let Some(caps) = &filter.agent_capabilities {
                let required = task.task_type.trim().to_lowercase();
                if !caps.iter().any(|c| c == &required) {
                    continue;
                }
            }
            if !Self::dependencies_satisfied(tx, &task).await? {
                continue;
            }
            if !Self::ticket_can_schedule(tx, task.ticket_id).await? {
                continue;
            }
            candidates.push(task);
        }
        Ok(candidates)
    }
}

#[async_trait]
impl ControlPlaneStore for SqliteStore {
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), StorageError> {
        let body = serde_json::to_string(ticket).map_err(decode_err)?;
        sqlx::query(
            "INSERT OR REPLACE INTO tickets (id, approval_status, created_at, body) VALUES (?, ?, ?, ?)",
        )
        .bind(ticket.id.to_string())
        .bind(serde_json::to_value(ticket.approval_status).map_err(decode_err)?.as_str().unwrap_or_default().to_string())
        .bind(ticket.created_at.to_rfc3339())
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn get_ticket(&self, id: EntityId) -> Result<Option<Ticket>, StorageError> {
        let row = sqlx::query("SELECT body FROM tickets WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(Self::ticket_from_row).transpose()
    }

    async fn update_ticket(&self, ticket: &Ticket) -> Result<(), StorageError> {
        if self.get_ticket(ticket.id).await?.is_none() {
            return Err(StorageError::NotFound(format!("ticket {}", ticket.id)));
        }
        self.insert_ticket(ticket).await
    }

    async fn list_tickets(&self) -> Result<Vec<Ticket>, StorageError> {
        let rows = sqlx::query("SELECT body FROM tickets ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(Self::ticket_from_row).collect()
    }

    async fn insert_task(&self, task: &Task) -> Result<(), StorageError> {
        let body = serde_json::to_string(task).map_err(decode_err)?;
        sqlx::query(
            "INSERT OR REPLACE INTO tasks
             (id, ticket_id, phase, task_type, status, sandbox_id, assigned_agent, priority_rank, created_at, started_at, body)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id.to_string())
        .bind(task.ticket_id.to_string())
        .bind(&task.phase)
        .bind(&task.task_type)
        .bind(serde_json::to_value(task.status).map_err(decode_err)?.as_str().unwrap_or_default().to_string())
        .bind(task.sandbox_id.clone())
        .bind(task.assigned_agent.map(|a| a.to_string()))
        .bind(task.priority.rank() as i64)
        .bind(task.created_at.to_rfc3339())
        .bind(task.started_at.map(|t| t.to_rfc3339()))
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn get_task(&self, id: EntityId) -> Result<Option<Task>, StorageError> {
        let row = sqlx::query("SELECT body FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(Self::task_from_row).transpose()
    }

    async fn update_task(&self, task: &Task) -> Result<(), StorageError> {
        if self.get_task(task.id).await?.is_none() {
            return Err(StorageError::NotFound(format!("task {}", task.id)));
        }
        self.insert_task(task).await
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StorageError> {
        let rows = sqlx::query("SELECT body FROM tasks ORDER BY priority_rank DESC, created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        let tasks: Vec<Task> = rows.iter().map(Self::task_from_row).collect::<Result<_, _>>()?;
        Ok(tasks
            .into_iter()
            .filter(|t| filter.ticket_id.map(|id| id == t.ticket_id).unwrap_or(true))
            .filter(|t| filter.status.map(|s| s == t.status).unwrap_or(true))
            .filter(|t| filter.assigned_agent.map(|a| Some(a) == t.assigned_agent).unwrap_or(true))
            .collect())
    }

    async fn claim_next_task(&self, filter: TaskClaimFilter) -> Result<Option<Task>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        let candidates = Self::claim_candidates(&mut tx, TaskStatus::Pending, &filter).await?;
        let Some(mut winner) = candidates.into_iter().next() else {
            tx.rollback().await.map_err(backend_err)?;
            return Ok(None);
        };
        winner.status = TaskStatus::Assigned;
        winner.updated_at = Utc::now();
        let body = serde_json::to_string(&winner).map_err(decode_err)?;
        sqlx::query("UPDATE tasks SET status = ?, body = ? WHERE id = ?")
            .bind("assigned")
            .bind(body)
            .bind(winner.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;

        tx.commit().await.map_err(backend_err)?;
        Ok(Some(winner))
    }

    async fn claim_next_validation_task(&self) -> Result<Option<Task>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        let candidates =
            Self::claim_candidates(&mut tx, TaskStatus::PendingValidation, &TaskClaimFilter::default())
                .await?;
        let winner = candidates.into_iter().next();
        tx.commit().await.map_err(backend_err)?;
        Ok(winner)
    }

    async fn get_timed_out_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StorageError> {
        let rows = sqlx::query("SELECT body FROM tasks WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        let tasks: Vec<Task> = rows.iter().map(Self::task_from_row).collect::<Result<_, _>>()?;
        Ok(tasks.into_iter().filter(|t| t.is_timed_out(now)).collect())
    }

    async fn get_cancellable_tasks(&self) -> Result<Vec<Task>, StorageError> {
        let rows = sqlx::query(
            "SELECT body FROM tasks WHERE status IN ('pending', 'assigned', 'running')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        rows.iter().map(Self::task_from_row).collect()
    }

    async fn insert_agent(&self, agent: &Agent) -> Result<(), StorageError> {
        let body = serde_json::to_string(agent).map_err(decode_err)?;
        sqlx::query("INSERT OR REPLACE INTO agents (id, body) VALUES (?, ?)")
            .bind(agent.id.to_string())
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get_agent(&self, id: EntityId) -> Result<Option<Agent>, StorageError> {
        let row = sqlx::query("SELECT body FROM agents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(Self::agent_from_row).transpose()
    }

    async fn update_agent(&self, agent: &Agent) -> Result<(), StorageError> {
        if self.get_agent(agent.id).await?.is_none() {
            return Err(StorageError::NotFound(format!("agent {}", agent.id)));
        }
        self.insert_agent(agent).await
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StorageError> {
        let rows = sqlx::query("SELECT body FROM agents")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(Self::agent_from_row).collect()
    }

    async fn insert_cost_record(&self, record: &CostRecord) -> Result<(), StorageError> {
        let body = serde_json::to_string(record).map_err(decode_err)?;
        sqlx::query("INSERT OR REPLACE INTO cost_records (id, task_id, body) VALUES (?, ?, ?)")
            .bind(record.id.to_string())
            .bind(record.task_id.to_string())
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn list_cost_records_for_task(
        &self,
        task_id: EntityId,
    ) -> Result<Vec<CostRecord>, StorageError> {
        let rows = sqlx::query("SELECT body FROM cost_records WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(Self::cost_from_row).collect()
    }

    async fn insert_budget(&self, budget: &Budget) -> Result<(), StorageError> {
        let body = serde_json::to_string(budget).map_err(decode_err)?;
        sqlx::query(
            "INSERT OR REPLACE INTO budgets (id, scope_type, scope_id, body) VALUES (?, ?, ?, ?)",
        )
        .bind(budget.id.to_string())
        .bind(serde_json::to_value(budget.scope_type).map_err(decode_err)?.as_str().unwrap_or_default().to_string())
        .bind(budget.scope_id.map(|s| s.to_string()))
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn update_budget(&self, budget: &Budget) -> Result<(), StorageError> {
        let existing = sqlx::query("SELECT 1 FROM budgets WHERE id = ?")
            .bind(budget.id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        if existing.is_none() {
            return Err(StorageError::NotFound(format!("budget {}", budget.id)));
        }
        self.insert_budget(budget).await
    }

    async fn list_budgets_for_scope(
        &self,
        scope_type: BudgetScope,
        scope_id: Option<String>,
    ) -> Result<Vec<Budget>, StorageError> {
        let scope_tag = serde_json::to_value(scope_type).map_err(decode_err)?;
        let scope_tag = scope_tag.as_str().unwrap_or_default().to_string();
        let rows = match scope_id {
            Some(id) => sqlx::query("SELECT body FROM budgets WHERE scope_type = ? AND scope_id = ?")
                .bind(scope_tag)
                .bind(id)
                .fetch_all(&self.pool)
                .await
                .map_err(backend_err)?,
            None => sqlx::query("SELECT body FROM budgets WHERE scope_type = ? AND scope_id IS NULL")
                .bind(scope_tag)
                .fetch_all(&self.pool)
                .await
                .map_err(backend_err)?,
        };
        rows.iter().map(Self::budget_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_types::{TaskDependencies, TicketPriority};

    async fn store() -> SqliteStore {
        SqliteStore::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn round_trips_a_ticket() {
        let store = store().await;
        let ticket = Ticket::new("t", "d", "backend", TicketPriority::Medium, EntityId::new(), EntityId::new()).unwrap();
        store.insert_ticket(&ticket).await.unwrap();
        let fetched = store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, ticket.id);
    }

    #[tokio::test]
    async fn claim_next_task_respects_priority_order() {
        let store = store().await;
        let ticket = Ticket::new("t", "d", "backend", TicketPriority::Medium, EntityId::new(), EntityId::new()).unwrap();
        store.insert_ticket(&ticket).await.unwrap();

        let low = Task::new(ticket.id, "backend", "implement_feature", "low", "d", TicketPriority::Low, TaskDependencies::none());
        let high = Task::new(ticket.id, "backend", "implement_feature", "high", "d", TicketPriority::Critical, TaskDependencies::none());
        store.insert_task(&low).await.unwrap();
        store.insert_task(&high).await.unwrap();

        let claimed = store.claim_next_task(TaskClaimFilter::default()).await.unwrap().unwrap();
        assert_eq!(claimed.id, high.id);
        assert_eq!(store.get_task(high.id).await.unwrap().unwrap().status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn budget_round_trip_by_scope() {
        let store = store().await;
        let budget = Budget::new(BudgetScope::Global, None, 100.0, None);
        store.insert_budget(&budget).await.unwrap();
        let found = store.list_budgets_for_scope(BudgetScope::Global, None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, budget.id);
    }
}
