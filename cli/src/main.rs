use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use courier_core::prelude::*;
use courier_sqlite_storage::CourierSqliteStorage;
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "courier")]
#[command(about = "Replay decrypted envelopes into a Courier message store")]
struct Cli {
    /// SQLite database holding the message store
    #[arg(long, env = "COURIER_DB", default_value = ".courier/courier.db")]
    db: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ingest newline-delimited JSON envelopes and print one outcome per line
    Ingest {
        /// Input file (stdin when omitted)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Maximum accepted envelope age in milliseconds
        #[arg(long)]
        max_age_ms: Option<u64>,

        /// Worker threads for batch ingestion
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },

    /// List conversations with stored messages
    Conversations,

    /// Print a conversation log in arrival order
    History {
        /// Conversation id (hex)
        #[arg(long)]
        conversation: String,

        /// Resume after this cursor (JSON, as printed by a previous call)
        #[arg(long)]
        after: Option<String>,

        /// Max records to return
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Print the edit history of one message
    Edits {
        /// Conversation id (hex)
        #[arg(long)]
        conversation: String,

        /// Author id (hex)
        #[arg(long)]
        author: String,

        /// Source timestamp of the message
        #[arg(long)]
        timestamp: u64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.cmd {
        Command::Ingest {
            input,
            max_age_ms,
            workers,
        } => cmd_ingest(&cli, input.as_deref(), *max_age_ms, *workers),
        Command::Conversations => cmd_conversations(&cli),
        Command::History {
            conversation,
            after,
            limit,
        } => cmd_history(&cli, conversation, after.as_deref(), *limit),
        Command::Edits {
            conversation,
            author,
            timestamp,
        } => cmd_edits(&cli, conversation, author, *timestamp),
    }
}

fn open(cli: &Cli, config: CourierConfig) -> anyhow::Result<IngestionPipeline<CourierSqliteStorage>> {
    let storage = CourierSqliteStorage::new(&cli.db)
        .with_context(|| format!("open database {}", cli.db.display()))?;
    tracing::debug!("Opened message store at {}", cli.db.display());
    IngestionPipeline::builder(storage)
        .with_config(config)
        .build()
        .context("open ingestion pipeline")
}

fn print(v: serde_json::Value) {
    match serde_json::to_string(&v) {
        Ok(line) => println!("{line}"),
        Err(e) => eprintln!("json encode: {e}"),
    }
}

/// One input line, parsed
#[derive(Debug)]
struct InputLine {
    number: usize,
    envelope: Result<Envelope, String>,
}

/// Parse newline-delimited envelopes, skipping blank lines. A malformed line is
/// reported, not fatal.
fn read_envelopes<R>(reader: R) -> anyhow::Result<Vec<InputLine>>
where
    R: BufRead,
{
    let mut lines = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("read input")?;
        if line.trim().is_empty() {
            continue;
        }
        lines.push(InputLine {
            number: index + 1,
            envelope: serde_json::from_str(&line).map_err(|e| e.to_string()),
        });
    }
    Ok(lines)
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Summary {
    applied: usize,
    duplicate: usize,
    rejected: usize,
    deferred: usize,
    failed: usize,
}

impl Summary {
    fn count(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Inserted { .. }
            | IngestOutcome::Edited { .. }
            | IngestOutcome::Deleted { .. } => self.applied += 1,
            IngestOutcome::Duplicate { .. } => self.duplicate += 1,
            IngestOutcome::Rejected { .. } => self.rejected += 1,
            IngestOutcome::Deferred { .. } => self.deferred += 1,
            IngestOutcome::Cancelled { .. } => {}
        }
    }
}

fn cmd_ingest(
    cli: &Cli,
    input: Option<&Path>,
    max_age_ms: Option<u64>,
    workers: usize,
) -> anyhow::Result<()> {
    let mut config = CourierConfig {
        batch_workers: workers,
        ..Default::default()
    };
    if let Some(max_age_ms) = max_age_ms {
        config.max_envelope_age_ms = max_age_ms;
    }
    let pipeline = open(cli, config)?;

    let lines = match input {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("open input {}", path.display()))?;
            read_envelopes(BufReader::new(file))?
        }
        None => read_envelopes(io::stdin().lock())?,
    };

    let summary = ingest_lines(&pipeline, lines);
    let retried = pipeline.retry_deferred();
    let expired = pipeline.expire_deferred();

    print(json!({
        "summary": {
            "applied": summary.applied,
            "duplicate": summary.duplicate,
            "rejected": summary.rejected,
            "deferred": summary.deferred,
            "failed": summary.failed,
            "retried": retried,
            "still_deferred": pipeline.deferred_envelopes(),
            "expired": expired,
        }
    }));

    if summary.failed > 0 {
        return Err(anyhow!("{} envelope(s) hit storage failures", summary.failed));
    }
    Ok(())
}

fn ingest_lines<S>(pipeline: &IngestionPipeline<S>, lines: Vec<InputLine>) -> Summary
where
    S: MessageStorage,
{
    let mut summary = Summary::default();
    let mut numbers = Vec::new();
    let mut envelopes = Vec::new();

    for line in lines {
        match line.envelope {
            Ok(envelope) => {
                numbers.push(line.number);
                envelopes.push(envelope);
            }
            Err(e) => {
                summary.rejected += 1;
                print(json!({ "line": line.number, "error": format!("malformed envelope: {e}") }));
            }
        }
    }

    for (number, result) in numbers.into_iter().zip(pipeline.ingest_batch(envelopes)) {
        match result {
            Ok(outcome) => {
                summary.count(&outcome);
                print(json!({ "line": number, "result": outcome }));
            }
            Err(e) => {
                summary.failed += 1;
                print(json!({
                    "line": number,
                    "error": e.to_string(),
                    "retryable": e.is_retryable(),
                }));
            }
        }
    }

    summary
}

fn cmd_conversations(cli: &Cli) -> anyhow::Result<()> {
    let pipeline = open(cli, CourierConfig::default())?;
    let conversations = pipeline
        .store()
        .conversations()
        .context("list conversations")?;
    let out: Vec<String> = conversations.iter().map(ConversationId::to_hex).collect();
    print(json!({ "conversations": out }));
    Ok(())
}

fn cmd_history(
    cli: &Cli,
    conversation_hex: &str,
    after: Option<&str>,
    limit: usize,
) -> anyhow::Result<()> {
    let conversation_id =
        ConversationId::from_hex(conversation_hex).context("invalid conversation id")?;
    let cursor = match after {
        Some(raw) => serde_json::from_str(raw).context("invalid cursor")?,
        None => Cursor::start(),
    };

    let pipeline = open(cli, CourierConfig::default())?;
    let mut stream = pipeline.store().stream_since(&conversation_id, cursor);
    let mut records = Vec::new();
    for record in stream.by_ref().take(limit) {
        records.push(record.context("read conversation log")?);
    }

    print(json!({
        "messages": records,
        "next_cursor": stream.cursor(),
    }));
    Ok(())
}

fn cmd_edits(
    cli: &Cli,
    conversation_hex: &str,
    author_hex: &str,
    timestamp: u64,
) -> anyhow::Result<()> {
    let key = MessageKey::new(
        ConversationId::from_hex(conversation_hex).context("invalid conversation id")?,
        AuthorId::from_hex(author_hex).context("invalid author id")?,
        timestamp,
    );

    let pipeline = open(cli, CourierConfig::default())?;
    let chain = pipeline
        .store()
        .edit_chain(&key)
        .context("read edit history")?
        .ok_or_else(|| anyhow!("no message {key}"))?;

    print(json!({ "key": key, "edits": chain.entries() }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use courier_storage_traits::test_utils::{author, conversation};
    use tempfile::tempdir;

    use super::*;

    fn envelope_line(kind: &str, ts: u64, extra: &str) -> String {
        format!(
            r#"{{"conversation_id":"{}","author_id":"{}","source_timestamp":{ts},"kind":"{kind}"{extra}}}"#,
            conversation("c").to_hex(),
            author("a").to_hex()
        )
    }

    #[test]
    fn test_read_envelopes_reports_malformed_lines() {
        let input = format!(
            "{}\n\nnot json\n{}\n",
            envelope_line("new", 5, r#","body":{"type":"text","text":"hi"}"#),
            envelope_line("delete", 5, ""),
        );
        let lines = read_envelopes(input.as_bytes()).unwrap();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].number, 1);
        assert!(lines[0].envelope.is_ok());
        assert_eq!(lines[1].number, 3);
        assert!(lines[1].envelope.is_err());
        assert_eq!(lines[2].number, 4);
        assert_eq!(
            lines[2].envelope.as_ref().unwrap().kind,
            EnvelopeKind::Delete
        );
    }

    #[test]
    fn test_ingest_lines_summary() {
        let dir = tempdir().unwrap();
        let storage = CourierSqliteStorage::new(dir.path().join("courier.db")).unwrap();
        let pipeline = IngestionPipeline::builder(storage)
            .with_config(CourierConfig {
                max_envelope_age_ms: u64::MAX,
                ..Default::default()
            })
            .build()
            .unwrap();

        let input = [
            envelope_line("new", 5, r#","body":{"type":"text","text":"hi"}"#),
            envelope_line("new", 5, r#","body":{"type":"text","text":"hi"}"#),
            envelope_line("edit", 5, r#","revision":1,"body":{"type":"text","text":"hi!"}"#),
            envelope_line("delete", 6, ""),
            "{".to_string(),
        ]
        .join("\n");

        let summary = ingest_lines(&pipeline, read_envelopes(input.as_bytes()).unwrap());
        assert_eq!(
            summary,
            Summary {
                applied: 2,
                duplicate: 1,
                rejected: 1,
                deferred: 1,
                failed: 0,
            }
        );
    }
}
