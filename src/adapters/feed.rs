//! JSON-Lines Push Feed
//!
//! Replays push messages from any async line source (stdin, a file, a pipe)
//! into a [`LocalPushTransport`]. One record per line:
//!
//! ```text
//! {"topic": "posts", "type": "post_updated", "id": "m1", "data": {"id": 1}}
//! {"topic": "posts", "type": "post_created", "id": "m2", "data": {"id": 3}, "timestamp": "2024-05-01T12:00:00Z"}
//! ```
//!
//! Blank lines and lines starting with `#` are ignored. A record without a
//! timestamp is stamped on arrival. Malformed lines are logged and counted,
//! never fatal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::local_transport::LocalPushTransport;
use crate::domain::ports::PushMessage;
use crate::error::Result;

/// One line of a push feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub topic: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl FeedRecord {
    /// Parse a single line. `Ok(None)` for blank and comment lines.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line)?))
    }

    pub fn into_message(self) -> (String, PushMessage) {
        let message = PushMessage::new(self.kind, self.id, self.data);
        let message = match self.timestamp {
            Some(ts) => message.at(ts),
            None => message,
        };
        (self.topic, message)
    }
}

/// Counters for one replay run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedStats {
    pub lines: u64,
    pub published: u64,
    pub deliveries: u64,
    pub rejected: u64,
}

/// Read `reader` to end of input (or until `cancel` fires) and publish
/// every record.
pub async fn replay<R>(
    reader: R,
    transport: &LocalPushTransport,
    cancel: &CancellationToken,
) -> Result<FeedStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = FeedStats::default();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Feed replay cancelled");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        stats.lines += 1;

        match FeedRecord::parse(&line) {
            Ok(Some(record)) => {
                let (topic, message) = record.into_message();
                stats.deliveries += transport.publish(&topic, &message) as u64;
                stats.published += 1;
            }
            Ok(None) => {}
            Err(e) => {
                stats.rejected += 1;
                warn!(line = stats.lines, error = %e, "Rejected feed line");
            }
        }
    }

    info!(
        published = stats.published,
        deliveries = stats.deliveries,
        rejected = stats.rejected,
        "Feed replay finished"
    );
    Ok(stats)
}
