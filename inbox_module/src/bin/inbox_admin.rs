//! Operator commands for the inbox database: legacy migration, replays,
//! shadow reply overrides and queue inspection.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::env;
use std::process::exit;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

use inbox_module::conversations::ConversationRef;
use inbox_module::jobs::JobRequest;
use inbox_module::{Inbox, InboxConfig, JobKind};

const DEFAULT_LIMIT: usize = 100;

fn print_usage() {
    eprintln!(
        r##"Usage: inbox-admin <command> [arguments]

Conversations:
  migrate-legacy [--limit=N]                 Move legacy dm:<id> rows onto canonical conversations
  reconcile <account_id> <counterparty_id>   Fold duplicate conversations for a pair
  resolve <ref> [--account=ID]               Print the canonical id for any identifier
  hydrate <ref> [--max=N]                    Enqueue a history backfill from the platform

Shadow replies:
  shadow-status <ref>                        Show scheduling state and the latest reply
  force-retry <ref>                          Make the conversation due immediately
  escalate <ref> --reason="text"             Hand the conversation to a human
  resolve-escalation <ref>                   Return an escalated conversation to pending
  clear-needs-link <ref>                     Return a needs_link conversation to pending

Queue:
  queue-stats                                Depth and lag per job kind
  dead-letters [kind] [--limit=N]            List dead-lettered jobs
  requeue-dead <job_id>                      Move a dead-lettered job back onto its queue
  recover-orphans [kind]                     Re-push runnable jobs missing from the wake-list
  backfill-raw --since=RFC3339 [--limit=N]   Re-enqueue processing for stored raw events
  requeue-media [--limit=N]                  Re-enqueue pending attachment downloads
  workers [--prune-older-than=SECS]          List worker heartbeats

<ref> is a numeric conversation id, a legacy dm:<counterparty> id, or an
external platform thread id. Configuration is read from the environment
(INBOX_DB_PATH, INBOX_CONFIG_PATH, PLATFORM_*).
"##
    );
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    let prefix = format!("{}=", flag);
    for (idx, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix(&prefix) {
            return Some(value.to_string());
        }
        if arg == flag {
            return args.get(idx + 1).cloned();
        }
    }
    None
}

fn parse_number<T: FromStr>(args: &[String], flag: &str) -> Result<Option<T>, String> {
    match parse_arg(args, flag) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("{} must be a number, got {}", flag, raw)),
        None => Ok(None),
    }
}

/// Positional argument `index` after the command, skipping flags and their values.
fn positional(args: &[String], index: usize) -> Option<&str> {
    let mut seen = 0;
    let mut skip_next = false;
    for arg in args.iter().skip(2) {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg.starts_with("--") {
            skip_next = !arg.contains('=');
            continue;
        }
        if seen == index {
            return Some(arg.as_str());
        }
        seen += 1;
    }
    None
}

fn require<'a>(args: &'a [String], index: usize, what: &str) -> &'a str {
    match positional(args, index) {
        Some(value) => value,
        None => {
            eprintln!("Error: {} required", what);
            print_usage();
            exit(1);
        }
    }
}

fn parse_kind(raw: Option<&str>) -> Result<Vec<JobKind>, String> {
    match raw {
        Some(raw) => JobKind::from_str(raw)
            .map(|kind| vec![kind])
            .map_err(|err| err.to_string()),
        None => Ok(JobKind::ALL.to_vec()),
    }
}

fn open_inbox() -> Result<Inbox, String> {
    let config = InboxConfig::from_env().map_err(|err| err.to_string())?;
    Inbox::open(config, true).map_err(|err| format!("failed to open inbox: {}", err))
}

fn resolve_ref(inbox: &Inbox, raw: &str, account: Option<&str>) -> Result<i64, String> {
    let reference = ConversationRef::parse(raw);
    inbox
        .resolver
        .resolve(&reference, account)
        .map_err(|err| format!("cannot resolve {}: {}", reference, err))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        exit(1);
    }
    let command = args[1].as_str();
    if matches!(command, "help" | "--help" | "-h") {
        print_usage();
        return;
    }

    let inbox = match open_inbox() {
        Ok(inbox) => inbox,
        Err(err) => {
            eprintln!("Error: {}", err);
            exit(1);
        }
    };

    let result = match command {
        "migrate-legacy" => cmd_migrate_legacy(&inbox, &args),
        "reconcile" => {
            let account = require(&args, 0, "account id");
            let counterparty = require(&args, 1, "counterparty id");
            cmd_reconcile(&inbox, account, counterparty)
        }
        "resolve" => {
            let raw = require(&args, 0, "conversation reference");
            let account = parse_arg(&args, "--account");
            resolve_ref(&inbox, raw, account.as_deref()).map(|id| id.to_string())
        }
        "hydrate" => cmd_hydrate(&inbox, require(&args, 0, "conversation reference"), &args),
        "shadow-status" => cmd_shadow_status(&inbox, require(&args, 0, "conversation reference")),
        "force-retry" => {
            let raw = require(&args, 0, "conversation reference");
            resolve_ref(&inbox, raw, None).and_then(|id| {
                inbox
                    .shadow
                    .force_retry(id)
                    .map(|_| format!("conversation {} is due now", id))
                    .map_err(|err| err.to_string())
            })
        }
        "escalate" => {
            let raw = require(&args, 0, "conversation reference");
            let Some(reason) = parse_arg(&args, "--reason").filter(|value| !value.trim().is_empty()) else {
                eprintln!("Error: --reason is required");
                exit(1);
            };
            resolve_ref(&inbox, raw, None).and_then(|id| {
                inbox
                    .shadow
                    .escalate(id, &reason)
                    .map(|_| format!("conversation {} escalated", id))
                    .map_err(|err| err.to_string())
            })
        }
        "resolve-escalation" => {
            let raw = require(&args, 0, "conversation reference");
            resolve_ref(&inbox, raw, None).and_then(|id| match inbox.shadow.resolve_escalation(id) {
                Ok(true) => Ok(format!("conversation {} returned to pending", id)),
                Ok(false) => Err(format!("conversation {} is not escalated", id)),
                Err(err) => Err(err.to_string()),
            })
        }
        "clear-needs-link" => {
            let raw = require(&args, 0, "conversation reference");
            resolve_ref(&inbox, raw, None).and_then(|id| match inbox.shadow.clear_needs_link(id) {
                Ok(true) => Ok(format!("conversation {} returned to pending", id)),
                Ok(false) => Err(format!("conversation {} is not waiting for a link", id)),
                Err(err) => Err(err.to_string()),
            })
        }
        "queue-stats" => cmd_queue_stats(&inbox),
        "dead-letters" => cmd_dead_letters(&inbox, &args),
        "requeue-dead" => {
            let raw = require(&args, 0, "job id");
            match raw.parse::<i64>() {
                Ok(job_id) => match inbox.queue.revive_dead_letter(job_id) {
                    Ok(Some(id)) => Ok(format!("job {} requeued", id)),
                    Ok(None) => Err(format!("job {} is not dead-lettered", job_id)),
                    Err(err) => Err(err.to_string()),
                },
                Err(_) => Err(format!("invalid job id: {}", raw)),
            }
        }
        "recover-orphans" => cmd_recover_orphans(&inbox, positional(&args, 0)),
        "backfill-raw" => cmd_backfill_raw(&inbox, &args),
        "requeue-media" => parse_number::<usize>(&args, "--limit").and_then(|limit| {
            inbox
                .upsert
                .requeue_pending_media(limit.unwrap_or(DEFAULT_LIMIT))
                .map(|count| format!("enqueued {} media jobs", count))
                .map_err(|err| err.to_string())
        }),
        "workers" => cmd_workers(&inbox, &args),
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            exit(1);
        }
    };

    match result {
        Ok(output) => println!("{}", output),
        Err(err) => {
            eprintln!("Error: {}", err);
            exit(1);
        }
    }
}

fn cmd_migrate_legacy(inbox: &Inbox, args: &[String]) -> Result<String, String> {
    let limit = parse_number::<usize>(args, "--limit")?.unwrap_or(DEFAULT_LIMIT);
    let report = inbox
        .resolver
        .migrate_legacy(limit)
        .map_err(|err| format!("legacy migration failed: {}", err))?;
    Ok(format!(
        "considered={} migrated={} messages_repointed={} summaries_advanced={} skipped={}",
        report.considered, report.migrated, report.messages_repointed, report.summaries_advanced, report.skipped
    ))
}

fn cmd_reconcile(inbox: &Inbox, account: &str, counterparty: &str) -> Result<String, String> {
    let report = inbox
        .resolver
        .reconcile_duplicates(account, counterparty)
        .map_err(|err| err.to_string())?;
    match report.kept {
        Some(kept) if report.merged.is_empty() => Ok(format!("conversation {} has no duplicates", kept)),
        Some(kept) => Ok(format!("kept {} merged {:?}", kept, report.merged)),
        None => Ok("no conversation for this pair".to_string()),
    }
}

fn cmd_hydrate(inbox: &Inbox, raw: &str, args: &[String]) -> Result<String, String> {
    let max_messages = parse_number::<u32>(args, "--max")?;
    let conversation_id = resolve_ref(inbox, raw, None)?;
    let request = JobRequest::hydrate(conversation_id, max_messages).map_err(|err| err.to_string())?;
    let job_id = inbox
        .queue
        .enqueue_request(request)
        .map_err(|err| err.to_string())?;
    Ok(format!("hydrate job {} queued for conversation {}", job_id, conversation_id))
}

fn cmd_shadow_status(inbox: &Inbox, raw: &str) -> Result<String, String> {
    let conversation_id = resolve_ref(inbox, raw, None)?;
    let Some(state) = inbox.shadow.get(conversation_id).map_err(|err| err.to_string())? else {
        return Ok(format!("conversation {} has no shadow state", conversation_id));
    };
    let mut output = format!(
        "conversation={} status={} postpones={} next_attempt_at={}",
        conversation_id,
        state.status,
        state.postpone_count,
        format_time(state.next_attempt_at)
    );
    if let Some(reason) = &state.escalation_reason {
        output.push_str(&format!("\nescalation: {}", reason));
    }
    if let Some(error) = &state.last_error {
        output.push_str(&format!("\nlast error: {}", error));
    }
    if let Some(reply) = inbox
        .shadow
        .latest_reply(conversation_id)
        .map_err(|err| err.to_string())?
    {
        output.push_str(&format!(
            "\nlatest reply #{} [{}] attempt={}: {}",
            reply.id,
            reply.status.as_str(),
            reply.attempt_no,
            if reply.text.is_empty() { "-" } else { reply.text.as_str() }
        ));
    }
    Ok(output)
}

fn cmd_queue_stats(inbox: &Inbox) -> Result<String, String> {
    let mut output = String::new();
    for kind in JobKind::ALL {
        let stats = inbox.queue.stats(kind).map_err(|err| err.to_string())?;
        let lag = stats
            .oldest_pending_age
            .map(|age| format!("{}s", age.num_seconds()))
            .unwrap_or_else(|| "-".to_string());
        output.push_str(&format!(
            "{:<22} depth={:<6} jobs={:<6} oldest={}\n",
            kind.as_str(),
            stats.depth,
            stats.durable_jobs,
            lag
        ));
    }
    Ok(output.trim_end().to_string())
}

fn cmd_dead_letters(inbox: &Inbox, args: &[String]) -> Result<String, String> {
    let kinds = parse_kind(positional(args, 0))?;
    let limit = parse_number::<usize>(args, "--limit")?.unwrap_or(DEFAULT_LIMIT);
    let mut output = String::new();
    for kind in kinds {
        let letters = inbox
            .queue
            .store()
            .dead_letters(kind, limit)
            .map_err(|err| err.to_string())?;
        for letter in letters {
            output.push_str(&format!(
                "- job {} {} key={} attempts={}/{} dead_at={} error={}\n",
                letter.job_id,
                letter.kind,
                letter.key,
                letter.attempts,
                letter.max_attempts,
                letter.dead_at.to_rfc3339(),
                letter.last_error.as_deref().unwrap_or("-")
            ));
        }
    }
    if output.is_empty() {
        return Ok("no dead-lettered jobs".to_string());
    }
    Ok(output.trim_end().to_string())
}

fn cmd_recover_orphans(inbox: &Inbox, kind: Option<&str>) -> Result<String, String> {
    let mut total = 0;
    for kind in parse_kind(kind)? {
        total += inbox.queue.recover_orphans(kind).map_err(|err| err.to_string())?;
    }
    Ok(format!("re-pushed {} jobs", total))
}

fn cmd_backfill_raw(inbox: &Inbox, args: &[String]) -> Result<String, String> {
    let Some(raw_since) = parse_arg(args, "--since") else {
        return Err("--since is required".to_string());
    };
    let since = DateTime::parse_from_rfc3339(&raw_since)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| format!("invalid --since {}: {}", raw_since, err))?;
    let limit = parse_number::<usize>(args, "--limit")?.unwrap_or(DEFAULT_LIMIT);
    let count = inbox
        .pipeline
        .backfill(since, limit)
        .map_err(|err| err.to_string())?;
    Ok(format!("enqueued {} raw events", count))
}

fn cmd_workers(inbox: &Inbox, args: &[String]) -> Result<String, String> {
    let heartbeats = inbox.heartbeats();
    if let Some(seconds) = parse_number::<i64>(args, "--prune-older-than")? {
        let pruned = heartbeats
            .prune(inbox.clock.now() - ChronoDuration::seconds(seconds))
            .map_err(|err| err.to_string())?;
        eprintln!("pruned {} stale heartbeats", pruned);
    }
    let beats = heartbeats.list().map_err(|err| err.to_string())?;
    if beats.is_empty() {
        return Ok("no worker heartbeats".to_string());
    }
    let now = inbox.clock.now();
    let mut output = String::new();
    for beat in beats {
        output.push_str(&format!(
            "- {} {} host={} pid={} last_beat={}s ago\n",
            beat.worker_id,
            beat.kind,
            beat.host,
            beat.pid,
            (now - beat.beat_at).num_seconds()
        ));
    }
    Ok(output.trim_end().to_string())
}

fn format_time(value: Option<DateTime<Utc>>) -> String {
    value.map(|ts| ts.to_rfc3339()).unwrap_or_else(|| "-".to_string())
}
