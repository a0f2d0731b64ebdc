use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::Utc;
use diesel::{ExpressionMethods, QueryDsl};
use diesel_async::{RunQueryDsl, scoped_futures::ScopedFutureExt};
use lazy_static::lazy_static;

use crate::{
    acquire_db_connection, counters,
    error::Error,
    run_serializable_transaction,
    schema::{forum_group, refresh_token},
};

lazy_static! {
    static ref RUNNING_TASKS: Mutex<HashMap<&'static str, &'static AtomicBool>> =
        Mutex::new(HashMap::new());
}

/// Spawn a named background task onto the current runtime, skipping submission
/// if a task with the same name is still running.
pub fn submit_task<F, Fut>(task_name: &'static str, task: F)
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    let running = {
        let mut running_tasks = RUNNING_TASKS.lock().expect("RUNNING_TASKS mutex poisoned");
        let flag = *running_tasks
            .entry(task_name)
            .or_insert_with(|| Box::leak(Box::new(AtomicBool::new(false))));
        flag
    };

    if running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        log::warn!("Skipping task {task_name} as it is still running");
        return;
    }

    log::info!("Submitting task {task_name}");
    tokio::spawn(async move {
        let start = std::time::Instant::now();
        match task().await {
            Ok(_) => log::info!("Task {task_name} finished after {:?}", start.elapsed()),
            Err(e) => log::error!("Task {task_name} failed: {e}"),
        }
        running.store(false, Ordering::SeqCst);
    });
}

/// Repair pass over all groups, reloading every aggregate count and pointer
/// from the current set of published topics and posts.
pub async fn recompute_all_group_aggregates() -> Result<(), Error> {
    let mut connection = acquire_db_connection().await?;
    let group_pks = forum_group::table
        .select(forum_group::pk)
        .order(forum_group::pk.asc())
        .load::<i64>(&mut connection)
        .await?;

    for group_pk in group_pks {
        run_serializable_transaction(&mut connection, |connection| {
            async move {
                counters::recompute_group_aggregates(group_pk, connection)
                    .await
                    .map_err(Into::into)
            }
            .scope_boxed()
        })
        .await?;
    }

    Ok(())
}

pub async fn clear_expired_refresh_tokens() -> Result<(), Error> {
    let mut connection = acquire_db_connection().await?;
    let deleted = diesel::delete(
        refresh_token::table.filter(refresh_token::expiry.lt(Utc::now())),
    )
    .execute(&mut connection)
    .await?;

    if deleted > 0 {
        log::info!("Cleared {deleted} expired refresh tokens");
    }

    Ok(())
}
