//! Newline-delimited JSON feed of platform callbacks
//!
//! Each line is one `PipelineInput` (`{"type":"ranging",...}`). Blank lines
//! and lines starting with `#` are skipped; malformed lines are logged and
//! dropped without stopping the feed.

use crate::services::engine::PipelineInput;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Parse one feed line; `Ok(None)` for blanks and comments
pub fn parse_feed_line(line: &str) -> Result<Option<PipelineInput>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

/// Counters for one feed run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedStats {
    pub forwarded: u64,
    pub malformed: u64,
}

/// Forward parsed lines into the engine until EOF, shutdown or the engine
/// hangs up. Dropping `tx` on return closes the engine input.
pub async fn read_feed<R>(
    reader: R,
    tx: mpsc::Sender<PipelineInput>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<FeedStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = FeedStats::default();
    let mut line_no: u64 = 0;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("feed_shutdown");
                    break;
                }
                continue;
            }
        };
        let Some(line) = line else {
            info!(forwarded = stats.forwarded, malformed = stats.malformed, "feed_eof");
            break;
        };
        line_no += 1;

        match parse_feed_line(&line) {
            Ok(Some(input)) => {
                if tx.send(input).await.is_err() {
                    warn!("feed_receiver_closed");
                    break;
                }
                stats.forwarded += 1;
            }
            Ok(None) => {}
            Err(e) => {
                stats.malformed += 1;
                warn!(line = line_no, error = %e, "feed_line_malformed");
            }
        }
    }
    Ok(stats)
}

/// `read_feed` over the process stdin
pub async fn read_stdin_feed(
    tx: mpsc::Sender<PipelineInput>,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<FeedStats> {
    read_feed(BufReader::new(tokio::io::stdin()), tx, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::BeaconKey;

    #[test]
    fn test_parse_skips_blank_and_comments() {
        assert!(parse_feed_line("").unwrap().is_none());
        assert!(parse_feed_line("   ").unwrap().is_none());
        assert!(parse_feed_line("# walk starts").unwrap().is_none());
        assert!(parse_feed_line("{not json").is_err());
    }

    #[test]
    fn test_parse_region_exit() {
        let input = parse_feed_line(r#"{"type":"region_exit","region":"n+a"}"#).unwrap();
        assert_eq!(input, Some(PipelineInput::RegionExit { region: BeaconKey::new("n+a") }));
    }

    #[tokio::test]
    async fn test_read_feed_forwards_and_counts() {
        let feed = concat!(
            "{\"type\":\"pause\",\"paused\":true}\n",
            "\n",
            "garbage\n",
            "{\"type\":\"background\",\"background\":false}\n",
        );
        let (tx, mut rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let stats = read_feed(feed.as_bytes(), tx, shutdown_rx).await.unwrap();

        assert_eq!(stats, FeedStats { forwarded: 2, malformed: 1 });
        assert_eq!(rx.recv().await, Some(PipelineInput::Pause { paused: true }));
        assert_eq!(rx.recv().await, Some(PipelineInput::Background { background: false }));
        assert_eq!(rx.recv().await, None, "sender dropped at EOF");
    }
}
