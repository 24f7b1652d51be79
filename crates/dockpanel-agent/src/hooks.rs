//! Startup repairs for work cut short by a previous shutdown.

use crate::{
    db::{Db, Filter},
    ids,
    model::{Snapshot, status},
};

pub const RESTART_INTERRUPTED: &str = "the task was interrupted due to the restart of the service";

/// Fails snapshots and tasks that were still running when the process stopped.
///
/// Installs stuck in a transient status are left to the periodic status sync.
pub async fn run_boot_hooks(db: &Db) -> anyhow::Result<()> {
    let waiting: Vec<Snapshot> = db
        .list(vec![Filter::Status(status::WAITING.to_string())])
        .await?;
    for snap in &waiting {
        db.update::<Snapshot>(
            snap.id,
            vec![
                ("status", status::FAILED.to_string().into()),
                ("message", RESTART_INTERRUPTED.to_string().into()),
            ],
        )
        .await?;
    }

    let tasks = db
        .fail_executing_tasks(RESTART_INTERRUPTED, &ids::now_rfc3339()?)
        .await?;
    if !waiting.is_empty() || tasks > 0 {
        tracing::info!(
            snapshots = waiting.len(),
            tasks,
            "marked interrupted work as failed"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        db::{TASK_EXECUTING, TASK_FAILED, TASK_SUCCESS},
        model::TaskRecord,
    };

    async fn task(db: &Db, id: &str, status: &str) {
        db.insert_task(TaskRecord {
            id: id.to_string(),
            name: id.to_string(),
            kind: "TaskCreate".to_string(),
            scope: "Snapshot".to_string(),
            status: status.to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn interrupted_snapshots_and_tasks_fail() {
        let db = Db::open(Path::new(":memory:")).await.unwrap();
        let waiting = db
            .create(Snapshot {
                name: "waiting".to_string(),
                status: status::WAITING.to_string(),
                interrupt_step: "SnapCompress".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let done = db
            .create(Snapshot {
                name: "done".to_string(),
                status: status::SUCCESS.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        task(&db, "tsk_running", TASK_EXECUTING).await;
        task(&db, "tsk_done", TASK_SUCCESS).await;

        run_boot_hooks(&db).await.unwrap();

        let snap: Snapshot = db.must(vec![Filter::Id(waiting.id)]).await.unwrap();
        assert_eq!(snap.status, status::FAILED);
        assert_eq!(snap.message, RESTART_INTERRUPTED);
        assert_eq!(snap.interrupt_step, "SnapCompress");
        let untouched: Snapshot = db.must(vec![Filter::Id(done.id)]).await.unwrap();
        assert_eq!(untouched.status, status::SUCCESS);

        let running = db.get_task("tsk_running").await.unwrap().unwrap();
        assert_eq!(running.status, TASK_FAILED);
        assert_eq!(running.error_msg, RESTART_INTERRUPTED);
        assert_eq!(db.get_task("tsk_done").await.unwrap().unwrap().status, TASK_SUCCESS);
    }
}
