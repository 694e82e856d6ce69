//! Intent log replay.
//!
//! Reads a JSON-lines log of `put`/`delete` intents and feeds it through a
//! [`PersisterQueue`].  Repeated puts of a record that is still queued are
//! merged into the queued write, and a delete cancels any queued write of the
//! same record before queueing the file removal.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use lazywrite_queue::{PersisterQueue, QueueConfig, QueueStats};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::record::{RecordDelete, RecordWrite, validate_key};

/// One line of the intent log.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Intent {
    Put {
        key: String,
        value: Value,
        #[serde(default)]
        flush: bool,
    },
    Delete {
        key: String,
        #[serde(default)]
        flush: bool,
    },
}

impl Intent {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key, .. } => key,
        }
    }
}

/// Parse one log line.  Blank lines and `#` comments yield `None`.
pub fn parse_intent(line: &str) -> Result<Option<Intent>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let intent: Intent = serde_json::from_str(line).context("malformed intent")?;
    validate_key(intent.key())?;
    Ok(Some(intent))
}

/// Summary printed once the log has been replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Intents read from the log.
    pub intents: u64,
    /// Puts folded into a write that was still queued.
    pub coalesced: u64,
    /// Queued writes dropped by a later delete of the same record.
    pub cancelled: u64,
    #[serde(flatten)]
    pub queue: QueueStats,
}

#[derive(Debug, Default)]
struct Tally {
    intents: u64,
    coalesced: u64,
    cancelled: u64,
}

/// Replay `input` into `out_dir` and wait until every accepted intent has
/// been persisted.
///
/// A bad line stops the replay.  Intents accepted before it are still
/// flushed, then the error is returned.
pub async fn run(
    input: &Path,
    out_dir: &Path,
    config: QueueConfig,
    pace: Duration,
) -> Result<ReplayReport> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create output directory {}", out_dir.display()))?;
    let file =
        File::open(input).with_context(|| format!("failed to open {}", input.display()))?;

    let queue = PersisterQueue::new(config).context("invalid queue configuration")?;
    queue
        .start_persisting()
        .context("failed to start persister worker")?;
    info!(
        input = %input.display(),
        out = %out_dir.display(),
        "replaying intent log"
    );

    let mut tally = Tally::default();
    let fed = feed(&queue, BufReader::new(file), out_dir, pace, &mut tally).await;
    if let Err(err) = &fed {
        warn!(error = %format!("{err:#}"), "replay aborted; flushing accepted intents");
    }

    queue
        .flush_async()
        .await
        .context("failed to flush persister queue")?;
    queue
        .stop_persisting()
        .context("failed to stop persister worker")?;
    fed.with_context(|| format!("failed to replay {}", input.display()))?;

    let report = ReplayReport {
        intents: tally.intents,
        coalesced: tally.coalesced,
        cancelled: tally.cancelled,
        queue: queue.stats(),
    };
    info!(
        intents = report.intents,
        coalesced = report.coalesced,
        processed = report.queue.processed,
        failed = report.queue.failed,
        "replay complete"
    );
    Ok(report)
}

async fn feed(
    queue: &PersisterQueue,
    reader: impl BufRead,
    out_dir: &Path,
    pace: Duration,
    tally: &mut Tally,
) -> Result<()> {
    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line.with_context(|| format!("failed to read line {line_no}"))?;
        let Some(intent) = parse_intent(&line).with_context(|| format!("line {line_no}"))? else {
            continue;
        };

        apply(queue, out_dir, intent, line_no, tally);

        if !pace.is_zero() {
            tokio::time::sleep(pace).await;
        }
    }
    Ok(())
}

fn apply(queue: &PersisterQueue, out_dir: &Path, intent: Intent, line_no: usize, tally: &mut Tally) {
    tally.intents += 1;
    match intent {
        Intent::Put { key, value, flush } => {
            let handle = queue
                .update_last_or_add_item(RecordWrite::new(out_dir, key, value, line_no), flush);
            if handle.origin_line() != line_no {
                tally.coalesced += 1;
                debug!(
                    key = handle.key(),
                    line = line_no,
                    into_line = handle.origin_line(),
                    "put coalesced"
                );
            }
        }
        Intent::Delete { key, flush } => {
            let cancelled = queue.remove_items(|write: &RecordWrite| write.key() == key);
            tally.cancelled += cancelled as u64;
            queue.add_item(RecordDelete::new(out_dir, key), flush);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    use crate::record::record_path;

    /// Long settle delay so the whole log lands inside one burst; the final
    /// flush skips it.
    fn test_config() -> QueueConfig {
        QueueConfig::new()
            .with_inter_write_delay(Duration::from_millis(1))
            .with_pre_task_delay(Duration::from_secs(5))
            .with_max_queue_depth(100)
    }

    fn write_log(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    fn read_record(dir: &Path, key: &str) -> Value {
        let content = std::fs::read_to_string(record_path(dir, key)).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    #[test]
    fn parse_skips_blank_and_comment_lines() {
        assert_eq!(parse_intent("").unwrap(), None);
        assert_eq!(parse_intent("   ").unwrap(), None);
        assert_eq!(parse_intent("# seed data").unwrap(), None);
    }

    #[test]
    fn parse_put_and_delete() {
        let put = parse_intent(r#"{"op":"put","key":"a","value":{"x":1}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            put,
            Intent::Put {
                key: "a".into(),
                value: json!({"x": 1}),
                flush: false,
            }
        );

        let delete = parse_intent(r#"{"op":"delete","key":"a","flush":true}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            delete,
            Intent::Delete {
                key: "a".into(),
                flush: true,
            }
        );
    }

    #[test]
    fn parse_rejects_unknown_op() {
        assert!(parse_intent(r#"{"op":"patch","key":"a"}"#).is_err());
    }

    #[test]
    fn parse_rejects_unsafe_key() {
        let err = parse_intent(r#"{"op":"put","key":"../etc","value":1}"#).unwrap_err();
        assert!(err.to_string().contains("../etc"));
    }

    #[tokio::test]
    async fn replay_coalesces_and_deletes() {
        let out = tempfile::tempdir().unwrap();
        let log = write_log(&[
            "# two puts of `a` collapse into one write",
            r#"{"op":"put","key":"a","value":1}"#,
            r#"{"op":"put","key":"b","value":"keep"}"#,
            r#"{"op":"put","key":"a","value":2}"#,
            "",
            r#"{"op":"put","key":"c","value":true}"#,
            r#"{"op":"delete","key":"c"}"#,
        ]);

        let report = run(log.path(), out.path(), test_config(), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(read_record(out.path(), "a"), json!(2));
        assert_eq!(read_record(out.path(), "b"), json!("keep"));
        assert!(!record_path(out.path(), "c").exists());

        assert_eq!(report.intents, 5);
        assert_eq!(report.coalesced, 1);
        assert_eq!(report.cancelled, 1);
        // Writes of `a` and `b`, plus the delete of `c`.
        assert_eq!(report.queue.processed, 3);
        assert_eq!(report.queue.failed, 0);
        assert_eq!(report.queue.pending, 0);
    }

    #[tokio::test]
    async fn put_after_delete_is_written() {
        let out = tempfile::tempdir().unwrap();
        let log = write_log(&[
            r#"{"op":"put","key":"a","value":1}"#,
            r#"{"op":"delete","key":"a"}"#,
            r#"{"op":"put","key":"a","value":3}"#,
        ]);

        run(log.path(), out.path(), test_config(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(read_record(out.path(), "a"), json!(3));
    }

    #[tokio::test]
    async fn bad_line_reports_line_number_and_flushes_earlier_intents() {
        let out = tempfile::tempdir().unwrap();
        let log = write_log(&[
            r#"{"op":"put","key":"a","value":1}"#,
            r#"{"op":"put","key":"","value":2}"#,
            r#"{"op":"put","key":"b","value":3}"#,
        ]);

        let err = run(log.path(), out.path(), test_config(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));

        assert_eq!(read_record(out.path(), "a"), json!(1));
        assert!(!record_path(out.path(), "b").exists());
    }

    #[tokio::test]
    async fn missing_input_is_an_error() {
        let out = tempfile::tempdir().unwrap();
        let missing = out.path().join("missing.jsonl");
        let err = run(&missing, out.path(), test_config(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing.jsonl"));
    }

    #[test]
    fn report_serializes_flat() {
        let report = ReplayReport {
            intents: 3,
            coalesced: 1,
            cancelled: 0,
            queue: QueueStats {
                phase: lazywrite_queue::QueuePhase::Stopped,
                pending: 0,
                processed: 2,
                failed: 0,
                removed: 0,
            },
        };

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["intents"], 3);
        assert_eq!(value["processed"], 2);
        assert_eq!(value["phase"], "stopped");
    }
}
