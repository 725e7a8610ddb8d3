//! `metroctl task` commands.

use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, NaiveTime, Utc};
use colored::Colorize;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::cli::{CreateTaskArgs, TaskCommands};
use crate::client::{ControlClient, ManifestEnvelope};
use crate::error::{CliError, Result};
use crate::output;

/// Time-of-day format accepted by the window flags.
pub const TIME_FORMAT: &str = "%I:%M%p";

/// Date format accepted by the window flags.
pub const DATE_FORMAT: &str = "%m-%d-%Y";

/// Padding before the first firing of a "now" windowed task.
fn create_now_pad() -> ChronoDuration {
    ChronoDuration::seconds(1)
}

pub async fn run(client: &ControlClient, command: TaskCommands) -> Result<()> {
    match command {
        TaskCommands::Create(args) => create(client, args).await,
        TaskCommands::List => {
            let tasks = client.list_tasks().await?;
            output::task_table(&tasks);
            Ok(())
        }
        TaskCommands::Start { id } => {
            let task = client.task_action(&id, "start").await?;
            println!("Task started");
            println!("ID: {}", task.id);
            println!("State: {}", task.state);
            Ok(())
        }
        TaskCommands::Stop { id } => {
            let task = client.task_action(&id, "stop").await?;
            println!("Task stopped");
            println!("ID: {}", task.id);
            println!("State: {}", task.state);
            Ok(())
        }
        TaskCommands::Enable { id } => {
            let task = client.task_action(&id, "enable").await?;
            println!("Task enabled");
            println!("ID: {}", task.id);
            println!("State: {}", task.state);
            Ok(())
        }
        TaskCommands::Remove { id } => {
            let task = client.remove_task(&id).await?;
            println!("Task removed");
            println!("ID: {}", task.id);
            Ok(())
        }
        TaskCommands::Export { id } => {
            let manifest = client.export_task(&id).await?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
            Ok(())
        }
        TaskCommands::Watch { id } => watch(client, &id).await,
    }
}

async fn create(client: &ControlClient, args: CreateTaskArgs) -> Result<()> {
    let manifest = if let Some(path) = &args.task_manifest {
        println!("Using task manifest to create task");
        let mut manifest = read_manifest(Path::new(path))?;
        if manifest.get("version").and_then(Value::as_u64) != Some(1) {
            return Err(CliError::usage("Invalid version provided"));
        }
        if let Some(name) = &args.name {
            manifest["name"] = json!(name);
        }
        if args.no_start {
            manifest["start"] = json!(false);
        }
        manifest
    } else if let Some(path) = &args.workflow_manifest {
        println!("Using workflow manifest to create task");
        let workflow = read_manifest(Path::new(path))?;
        let schedule = build_schedule(&args)?;
        serde_json::to_value(ManifestEnvelope {
            version: 1,
            name: args.name.clone(),
            schedule,
            workflow,
            start: !args.no_start,
        })?
    } else {
        return Err(CliError::usage(
            "Must provide either --task-manifest or --workflow-manifest arguments",
        ));
    };

    let task = client.create_task(&manifest).await?;
    println!("{}", "Task created".green());
    println!("ID: {}", task.id);
    println!("Name: {}", task.name);
    println!("State: {}", task.state);
    Ok(())
}

/// Read a JSON or YAML manifest file, selected by extension.
fn read_manifest(path: &Path) -> Result<Value> {
    let raw = std::fs::read(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => Ok(serde_yaml::from_slice(&raw)?),
        Some("json") => Ok(serde_json::from_slice(&raw)?),
        other => Err(CliError::usage(format!(
            "Unsupported file type {}",
            other.unwrap_or("")
        ))),
    }
}

/// Build the schedule value from the interval and window flags.
///
/// Without window flags the schedule is a plain interval. Any window
/// flag switches to a windowed schedule; a missing endpoint can be
/// derived from `--duration`.
fn build_schedule(args: &CreateTaskArgs) -> Result<Value> {
    let interval = args
        .interval
        .as_deref()
        .ok_or_else(|| CliError::usage("Bad interval format: interval is required"))?;
    validate_interval(interval)?;

    let windowed = args.start_date.is_some()
        || args.start_time.is_some()
        || args.stop_date.is_some()
        || args.stop_time.is_some();

    if !windowed {
        if let Some(duration) = &args.duration {
            // Duration alone: run from now (plus pad) for the duration.
            let start = Utc::now() + create_now_pad();
            let stop = start + parse_go_duration(duration)?;
            return Ok(json!({
                "type": "windowed",
                "interval": interval,
                "start": start,
                "stop": stop,
            }));
        }
        return Ok(json!({ "type": "simple", "interval": interval }));
    }

    let start = merge_date_time(args.start_time.as_deref(), args.start_date.as_deref())?;
    let mut stop = merge_date_time(args.stop_time.as_deref(), args.stop_date.as_deref())?;

    if stop.is_none() {
        if let Some(duration) = &args.duration {
            let base = start.unwrap_or_else(|| Utc::now() + create_now_pad());
            stop = Some(base + parse_go_duration(duration)?);
        }
    }

    let mut schedule = json!({ "type": "windowed", "interval": interval });
    if let Some(start) = start {
        schedule["start"] = json!(start);
    }
    if let Some(stop) = stop {
        schedule["stop"] = json!(stop);
    }
    Ok(schedule)
}

/// Combine `3:04PM` and `1-02-2006` flags into a UTC timestamp.
///
/// A missing date defaults to today; a missing time to the coming
/// midnight boundary of the given date. Both absent yields `None`.
fn merge_date_time(time: Option<&str>, date: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    if time.is_none() && date.is_none() {
        return Ok(None);
    }
    let now = Local::now();
    let date = match date {
        Some(raw) => NaiveDate::parse_from_str(raw, DATE_FORMAT)
            .map_err(|e| CliError::usage(format!("Usage error (time): {e}")))?,
        None => now.date_naive(),
    };
    let time = match time {
        Some(raw) => NaiveTime::parse_from_str(raw, TIME_FORMAT)
            .map_err(|e| CliError::usage(format!("Usage error (time): {e}")))?,
        None => NaiveTime::MIN,
    };
    let local = date
        .and_time(time)
        .and_local_timezone(Local)
        .single()
        .ok_or_else(|| CliError::usage("Usage error (time): ambiguous local time"))?;
    Ok(Some(local.with_timezone(&Utc)))
}

/// Validate a Go-style duration literal without converting it; the
/// control plane parses the same syntax.
fn validate_interval(raw: &str) -> Result<()> {
    parse_go_duration(raw).map(|_| ())
}

fn parse_go_duration(raw: &str) -> Result<ChronoDuration> {
    let trimmed = raw.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| CliError::usage(format!("Bad interval format: {raw}")))?;
    let (digits, unit) = trimmed.split_at(split);
    let value: i64 = digits
        .parse()
        .map_err(|_| CliError::usage(format!("Bad interval format: {raw}")))?;
    match unit {
        "ms" => Ok(ChronoDuration::milliseconds(value)),
        "s" => Ok(ChronoDuration::seconds(value)),
        "m" => Ok(ChronoDuration::minutes(value)),
        "h" => Ok(ChronoDuration::hours(value)),
        _ => Err(CliError::usage(format!("Bad interval format: {raw}"))),
    }
}

async fn watch(client: &ControlClient, id: &str) -> Result<()> {
    let response = client.watch_task(id).await?;
    println!("Watching task {id} (ctrl-c to stop)");

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            chunk = stream.next() => {
                let Some(chunk) = chunk else { break };
                buffer.extend_from_slice(&chunk?);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    if let Ok(event) = serde_json::from_slice::<Value>(&line[..line.len() - 1]) {
                        print_watch_event(&event);
                    }
                }
            }
        }
    }
    println!("Watch stream closed");
    Ok(())
}

fn print_watch_event(event: &Value) {
    let kind = event.get("event").and_then(Value::as_str).unwrap_or("?");
    match kind {
        "metric-event" => {
            let count = event
                .get("metrics")
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            println!("{} {count} metrics", kind.cyan());
            if let Some(metrics) = event.get("metrics").and_then(Value::as_array) {
                for metric in metrics {
                    println!(
                        "  {} v{} = {}",
                        metric.get("namespace").and_then(Value::as_str).unwrap_or("?"),
                        metric.get("version").and_then(Value::as_u64).unwrap_or(0),
                        metric.get("data").unwrap_or(&Value::Null),
                    );
                }
            }
        }
        "task-disabled" => {
            println!(
                "{} {}",
                kind.red(),
                event.get("reason").and_then(Value::as_str).unwrap_or("")
            );
        }
        other => println!("{}", other.yellow()),
    }
}
