//! Durable tasks made of sequential, retryable sub-tasks.
//!
//! A [`Task`] is a named list of steps. Each step runs under a timeout, is retried
//! `retry` times, and may carry a compensator that runs once when the step finally fails. The
//! task row tracks the step currently running so callers can report or resume it. Log lines are
//! written to `task_logs` and mirrored to `tracing`.

use std::{
    collections::HashSet,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    db::{Db, TASK_EXECUTING, TASK_FAILED, TASK_SUCCESS},
    error::PanelError,
    ids,
    model::{TaskLogLine, TaskRecord},
};

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type StepFn = Box<dyn Fn(TaskCtx) -> BoxFuture<anyhow::Result<()>> + Send + Sync>;
type RollbackFn = Box<dyn FnOnce(TaskCtx, String) -> BoxFuture<()> + Send>;

/// Placeholder for steps without a compensator.
pub const NO_ROLLBACK: Option<fn(TaskCtx, String) -> BoxFuture<()>> = None;

pub mod scope {
    pub const APP: &str = "App";
    pub const SNAPSHOT: &str = "Snapshot";
    pub const DATABASE: &str = "Database";
    pub const CONTAINER: &str = "Container";
}

pub mod kind {
    pub const INSTALL: &str = "TaskInstall";
    pub const UPGRADE: &str = "TaskUpgrade";
    pub const UNINSTALL: &str = "TaskUninstall";
    pub const REBUILD: &str = "TaskRebuild";
    pub const SYNC: &str = "TaskSync";
    pub const CREATE: &str = "TaskCreate";
    pub const RECREATE: &str = "TaskRecreate";
    pub const BACKUP: &str = "TaskBackup";
    pub const DELETE: &str = "TaskDelete";
}

/// `"{operate} {scope} [{name}]"`, e.g. `Install App [mysql-1]`.
pub fn task_name(operate: &str, scope: &str, name: &str) -> String {
    format!("{operate} {scope} [{name}]")
}

pub mod msg {
    pub fn start(msg: &str) -> String {
        format!("Start {msg}")
    }

    pub fn success(msg: &str) -> String {
        format!("{msg} success")
    }

    pub fn failed_with_err(msg: &str, err: &str) -> String {
        format!("{msg} failed, err: {err}")
    }

    pub fn with_status(msg: &str, err: Option<&str>) -> String {
        match err {
            None => success(msg),
            Some(err) => failed_with_err(msg, err),
        }
    }

    pub fn retry(n: u32) -> String {
        format!("retry {n}")
    }

    pub fn timeout(msg: &str) -> String {
        format!("{msg} timeout")
    }
}

/// Failure of one step; `step` is the alias that failed.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{step}: {message}")]
pub struct StepError {
    pub step: String,
    pub message: String,
}

/// Handle steps receive: task identity plus the log sink.
#[derive(Clone)]
pub struct TaskCtx {
    pub id: String,
    pub name: String,
    db: Db,
}

impl TaskCtx {
    pub async fn log(&self, msg: impl Into<String>) {
        self.write("info", msg.into()).await;
    }

    pub async fn warn(&self, msg: impl Into<String>) {
        self.write("warn", msg.into()).await;
    }

    pub async fn log_start(&self, msg: &str) {
        self.log(msg::start(msg)).await;
    }

    pub async fn log_success(&self, msg: &str) {
        self.log(msg::success(msg)).await;
    }

    pub async fn log_failed(&self, msg: &str, err: &anyhow::Error) {
        self.write("error", msg::failed_with_err(msg, &format!("{err:#}")))
            .await;
    }

    pub async fn log_with_status(&self, msg: &str, err: Option<&anyhow::Error>) {
        match err {
            None => self.log_success(msg).await,
            Some(e) => self.log_failed(msg, e).await,
        }
    }

    async fn write(&self, level: &str, msg: String) {
        match level {
            "error" => tracing::error!(task_id = %self.id, "{msg}"),
            "warn" => tracing::warn!(task_id = %self.id, "{msg}"),
            _ => tracing::info!(task_id = %self.id, "{msg}"),
        }
        let ts = ids::now_rfc3339().unwrap_or_default();
        let line = TaskLogLine {
            ts,
            level: level.to_string(),
            msg,
        };
        if let Err(e) = self.db.append_task_log(&self.id, line).await {
            tracing::warn!(task_id = %self.id, error = %e, "persist task log failed");
        }
    }
}

struct SubTask {
    alias: String,
    run: StepFn,
    on_failure: Option<RollbackFn>,
    retry: u32,
    timeout: Duration,
}

/// Removes the `(scope, resource_id)` claim when the task is dropped.
struct ActiveGuard {
    key: (String, i64),
    active: Arc<Mutex<HashSet<(String, i64)>>>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.active.lock() {
            set.remove(&self.key);
        }
    }
}

/// Allocates tasks and tracks which resources have a root task running.
#[derive(Clone)]
pub struct TaskRuntime {
    db: Db,
    active: Arc<Mutex<HashSet<(String, i64)>>>,
}

pub struct NewTask<'a> {
    pub name: String,
    pub kind: &'a str,
    pub scope: &'a str,
    /// Reattach to this task row when it exists.
    pub task_id: Option<String>,
    /// `0` opts out of the per-resource claim.
    pub resource_id: i64,
}

impl TaskRuntime {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_active(&self, scope: &str, resource_id: i64) -> bool {
        self.active
            .lock()
            .map(|set| set.contains(&(scope.to_string(), resource_id)))
            .unwrap_or(false)
    }

    pub async fn new_task(&self, req: NewTask<'_>) -> anyhow::Result<Task> {
        let guard = if req.resource_id != 0 {
            let key = (req.scope.to_string(), req.resource_id);
            let mut set = self
                .active
                .lock()
                .map_err(|_| anyhow::anyhow!("task registry poisoned"))?;
            if !set.insert(key.clone()) {
                return Err(PanelError::Busy { name: req.name }.into());
            }
            Some(ActiveGuard {
                key,
                active: self.active.clone(),
            })
        } else {
            None
        };

        let now = ids::now_rfc3339()?;
        let existing = match req.task_id.as_deref() {
            Some(id) => self.db.get_task(id).await?,
            None => None,
        };
        let id = match existing {
            Some(record) => {
                self.db.reopen_task(&record.id, &now).await?;
                record.id
            }
            None => {
                let id = req.task_id.unwrap_or_else(ids::new_task_id);
                self.db
                    .insert_task(TaskRecord {
                        id: id.clone(),
                        name: req.name.clone(),
                        kind: req.kind.to_string(),
                        scope: req.scope.to_string(),
                        resource_id: req.resource_id,
                        current_step: String::new(),
                        status: TASK_EXECUTING.to_string(),
                        error_msg: String::new(),
                        created_at: now.clone(),
                        updated_at: now,
                    })
                    .await?;
                id
            }
        };

        Ok(Task {
            ctx: TaskCtx {
                id,
                name: req.name,
                db: self.db.clone(),
            },
            steps: Vec::new(),
            _guard: guard,
        })
    }
}

pub struct Task {
    ctx: TaskCtx,
    steps: Vec<SubTask>,
    _guard: Option<ActiveGuard>,
}

impl Task {
    pub fn id(&self) -> &str {
        &self.ctx.id
    }

    pub fn ctx(&self) -> TaskCtx {
        self.ctx.clone()
    }

    /// Appends a step with the default timeout and no retry.
    pub fn add_sub_task<F, Fut>(&mut self, alias: &str, run: F)
    where
        F: Fn(TaskCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_sub_task_with(alias, run, NO_ROLLBACK, 0, DEFAULT_STEP_TIMEOUT);
    }

    /// Appends a step. `on_failure` receives the final error message and runs best-effort.
    pub fn add_sub_task_with<F, Fut, R, RFut>(
        &mut self,
        alias: &str,
        run: F,
        on_failure: Option<R>,
        retry: u32,
        timeout: Duration,
    ) where
        F: Fn(TaskCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        R: FnOnce(TaskCtx, String) -> RFut + Send + 'static,
        RFut: Future<Output = ()> + Send + 'static,
    {
        let run: StepFn =
            Box::new(move |t: TaskCtx| -> BoxFuture<anyhow::Result<()>> { Box::pin(run(t)) });
        let on_failure = on_failure.map(|f| -> RollbackFn {
            Box::new(move |t: TaskCtx, e: String| -> BoxFuture<()> { Box::pin(f(t, e)) })
        });
        self.steps.push(SubTask {
            alias: alias.to_string(),
            run,
            on_failure,
            retry,
            timeout,
        });
    }

    pub fn step_aliases(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.alias.as_str()).collect()
    }

    /// Runs every step in order and records the outcome on the task row.
    pub async fn execute(self) -> Result<(), StepError> {
        let Task {
            ctx,
            steps,
            _guard,
        } = self;

        for step in steps {
            // The compensator is only Send; keep it out of the borrowed step.
            let SubTask {
                alias,
                run,
                on_failure,
                retry,
                timeout,
            } = step;
            let now = ids::now_rfc3339().unwrap_or_default();
            if let Err(e) = ctx.db.set_task_step(&ctx.id, &alias, &now).await {
                tracing::warn!(task_id = %ctx.id, error = %e, "persist task step failed");
            }
            ctx.log_start(&alias).await;

            match run_step(&ctx, &alias, &run, retry, timeout).await {
                Ok(()) => ctx.log_success(&alias).await,
                Err(message) => {
                    ctx.write("error", msg::failed_with_err(&alias, &message))
                        .await;
                    if let Some(rollback) = on_failure {
                        rollback(ctx.clone(), message.clone()).await;
                    }
                    let now = ids::now_rfc3339().unwrap_or_default();
                    if let Err(e) = ctx.db.finish_task(&ctx.id, TASK_FAILED, &message, &now).await {
                        tracing::warn!(task_id = %ctx.id, error = %e, "persist task failure failed");
                    }
                    return Err(StepError {
                        step: alias,
                        message,
                    });
                }
            }
        }

        let now = ids::now_rfc3339().unwrap_or_default();
        if let Err(e) = ctx.db.finish_task(&ctx.id, TASK_SUCCESS, "", &now).await {
            tracing::warn!(task_id = %ctx.id, error = %e, "persist task success failed");
        }
        ctx.log(msg::success(&ctx.name)).await;
        Ok(())
    }

    /// Spawns the task on a worker and returns its id immediately.
    pub fn run_async(self) -> String {
        self.run_async_then(|_, _| async {})
    }

    /// Like [`Task::run_async`] and then hands the outcome to `after` on the same worker.
    pub fn run_async_then<A, AFut>(self, after: A) -> String
    where
        A: FnOnce(TaskCtx, Result<(), StepError>) -> AFut + Send + 'static,
        AFut: Future<Output = ()> + Send + 'static,
    {
        let id = self.ctx.id.clone();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let outcome = self.execute().await;
            after(ctx, outcome).await;
        });
        id
    }
}

async fn run_step(
    ctx: &TaskCtx,
    alias: &str,
    run: &StepFn,
    retry: u32,
    timeout: Duration,
) -> Result<(), String> {
    let mut last = String::new();
    for attempt in 0..=retry {
        if attempt > 0 {
            ctx.log(msg::retry(attempt)).await;
        }
        match tokio::time::timeout(timeout, run(ctx.clone())).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => {
                last = format!("{e:#}");
                if attempt < retry {
                    ctx.warn(msg::failed_with_err(alias, &last)).await;
                }
            }
            Err(_) => {
                ctx.warn(msg::timeout(alias)).await;
                last = "timeout".to_string();
            }
        }
    }
    Err(last)
}
