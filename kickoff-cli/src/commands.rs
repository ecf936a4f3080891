//! One function per subcommand.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use kickoff_client::TaskClient;
use kickoff_core::{TaskCreateInfo, TaskId, TaskSchedule, TaskState, TaskStatus};
use kickoff_server::TaskServer;
use kickoff_worker::TaskWorker;

use crate::utils::{format_interval, format_timestamp_secs};

fn parse_task_id(id: &str) -> Result<TaskId> {
    TaskId::parse_hex(id)
        .ok_or_else(|| anyhow!("failed to parse hexadecimal task ID: \"{id}\""))
}

/// Render a one-line human description of a task's status.
fn describe_status(status: &TaskStatus) -> String {
    let now = Utc::now().timestamp();
    match status.run_status {
        None => format!(
            "Pending (so far waited {})",
            format_interval(now - status.create_time)
        ),
        Some(run) => format!(
            "{} (current runtime {}; worker heartbeat {} ago)",
            status.state(),
            format_interval(now - run.start_time),
            format_interval(now - run.heartbeat_time)
        ),
    }
}

pub async fn cmd_new(
    addr: &str,
    command_words: Vec<String>,
    require: Vec<String>,
    want: Vec<String>,
) -> Result<()> {
    let info = TaskCreateInfo {
        command: command_words.join(" "),
        schedule: TaskSchedule {
            required_resources: require,
            optional_resources: want,
        },
    };

    let mut client = TaskClient::connect(addr).await?;
    let id = client
        .create_task(&info)
        .await?
        .context("failed to create task")?;

    println!("Created task {id}");
    Ok(())
}

pub async fn cmd_cancel(addr: &str, id: &str) -> Result<()> {
    let id = parse_task_id(id)?;
    let mut client = TaskClient::connect(addr).await?;

    if !client.mark_task_should_cancel(id).await? {
        bail!(
            "failed to mark task {id} for cancellation; it may not exist \
             (already finished?) or may not have started running yet"
        );
    }

    println!("Canceled task {id}");
    Ok(())
}

pub async fn cmd_info(addr: &str, id: &str, json: bool) -> Result<()> {
    let id = parse_task_id(id)?;
    let mut client = TaskClient::connect(addr).await?;

    let status = client
        .get_task_status(id)
        .await?
        .context("failed to retrieve task info; the task may not exist (canceled, finished, or never created)")?;
    let schedule = client
        .get_task_schedule(id)
        .await?
        .context("retrieved task status but not its schedule")?;
    let command = client
        .get_task_command(id)
        .await?
        .context("retrieved task status but not its command")?;

    if json {
        let doc = serde_json::json!({
            "id": id.to_string(),
            "state": status.state(),
            "status": status,
            "schedule": schedule,
            "command": command,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("{id}: {}", describe_status(&status));
    println!("  created:  {}", format_timestamp_secs(status.create_time));
    println!("  command:  {command}");
    println!("  require:  {{{}}}", schedule.required_resources.join(", "));
    println!("  want:     {{{}}}", schedule.optional_resources.join(", "));
    Ok(())
}

pub async fn cmd_list(addr: &str, json: bool) -> Result<()> {
    let mut client = TaskClient::connect(addr).await?;

    let tasks = client
        .get_tasks_by_states(&TaskState::all())
        .await?
        .with_context(|| {
            format!(
                "the server refused to list tasks; listing only works with at most {} live tasks",
                kickoff_proto::MAX_STATUS_TASKS
            )
        })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    for info in &tasks {
        println!("{}: {}", info.id, describe_status(&info.status));
    }
    println!("{} task(s)", tasks.len());
    Ok(())
}

pub async fn cmd_stats(addr: &str, json: bool) -> Result<()> {
    let mut client = TaskClient::connect(addr).await?;
    let stats = client
        .get_stats()
        .await?
        .context("failed to retrieve server stats")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("pending:   {}", stats.num_pending);
    println!("running:   {}", stats.num_running);
    println!("canceling: {}", stats.num_canceling);
    println!("finished:  {}", stats.num_finished);
    Ok(())
}

pub async fn cmd_worker(addr: &str, have: Vec<String>) -> Result<()> {
    let mut worker = TaskWorker::new(addr.to_string(), have);

    // First ctrl-c: stop pulling, let the in-flight task finish.
    // Second ctrl-c: give up and terminate immediately.
    let shutdown = worker.shutdown_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!(
            "ctrl-c received; shutting down gracefully once the running task completes. \
             Press ctrl-c again to terminate immediately."
        );
        shutdown.trigger();

        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::error!("second ctrl-c received; terminating immediately");
            std::process::exit(-2);
        }
    });

    worker.run().await
}

pub async fn cmd_server(port: u16) -> Result<()> {
    let server = TaskServer::bind(port).await?;
    server.run().await?;
    Ok(())
}
