//! Sender-to-token registry and its snapshot file format.
//!
//! A snapshot holds one line per sender:
//!
//! ```text
//! sender>2024-05-01T10:00:00Z/12#2024-05-01T10:01:00Z/3#
//! ```
//!
//! Each `#`-terminated pair is a bucket start (RFC 3339, UTC) and its
//! recipient count. Aggregates are not stored; loading replays every pair
//! through [`RateToken::record`], which rebuilds them. Older snapshots
//! written with Unix `date` style timestamps (`Wed May  1 10:00:00 UTC 2024`)
//! are still accepted on load.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::token::RateToken;
use crate::error::{Result, SendgateError};

const KEY_SEPARATOR: char = '>';
const BUCKET_TERMINATOR: char = '#';
const PAIR_SEPARATOR: char = '/';

/// All known senders and their tokens.
///
/// The lock guards membership only; each token synchronizes its own
/// buckets. Entries are never removed.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    tokens: Mutex<HashMap<String, Arc<RateToken>>>,
}

/// Aggregate view over every token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub tokens: usize,
    pub buckets: usize,
    pub messages: u64,
}

impl RegistryStats {
    pub fn buckets_per_token(&self) -> usize {
        self.buckets.checked_div(self.tokens).unwrap_or(0)
    }

    pub fn messages_per_token(&self) -> u64 {
        self.messages.checked_div(self.tokens as u64).unwrap_or(0)
    }
}

/// Outcome of reading a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotLoad {
    /// Lines that registered a sender
    pub senders: usize,
    /// Buckets replayed into tokens
    pub buckets: usize,
    /// Lines or pairs skipped as corrupt
    pub skipped: usize,
}

impl TokenRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the token for `key`, registering an empty one if needed.
    pub fn get_or_create(&self, key: &str) -> Arc<RateToken> {
        let mut tokens = self.tokens.lock();
        Self::entry(&mut tokens, key)
    }

    /// Look up a token without creating it.
    pub fn get(&self, key: &str) -> Option<Arc<RateToken>> {
        self.tokens.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }

    /// Sum buckets and messages over every token.
    pub fn stats(&self) -> RegistryStats {
        let tokens = self.tokens.lock();
        tokens.values().fold(
            RegistryStats {
                tokens: tokens.len(),
                ..RegistryStats::default()
            },
            |mut stats, token| {
                stats.buckets += token.bucket_count();
                stats.messages = stats.messages.saturating_add(token.count());
                stats
            },
        )
    }

    /// Write every token to `path`, replacing the file.
    ///
    /// Returns the number of bytes written.
    pub fn serialize<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let contents = self.encode();

        std::fs::write(path, contents.as_bytes()).map_err(|source| SendgateError::Snapshot {
            path: path.to_path_buf(),
            source,
        })?;

        info!(path = %path.display(), bytes = contents.len(), "Saved token snapshot");
        Ok(contents.len())
    }

    /// Render the registry in snapshot format.
    pub fn encode(&self) -> String {
        let tokens = self.tokens.lock();
        let mut keys: Vec<&String> = tokens.keys().collect();
        keys.sort_unstable();

        let mut out = String::new();
        for key in keys {
            out.push_str(key);
            out.push(KEY_SEPARATOR);
            for (start, recipients) in tokens[key].buckets() {
                let _ = write!(
                    out,
                    "{}{}{}{}",
                    format_timestamp(start),
                    PAIR_SEPARATOR,
                    recipients,
                    BUCKET_TERMINATOR
                );
            }
            out.push('\n');
        }
        out
    }

    /// Merge the snapshot at `path` into the registry.
    ///
    /// Corrupt lines and pairs are skipped with a warning; only a failure
    /// to read the file is an error.
    pub fn deserialize<P: AsRef<Path>>(&self, path: P) -> Result<SnapshotLoad> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| SendgateError::Snapshot {
            path: path.to_path_buf(),
            source,
        })?;

        let load = self.decode(&contents);
        info!(
            path = %path.display(),
            senders = load.senders,
            buckets = load.buckets,
            skipped = load.skipped,
            "Loaded token snapshot"
        );
        Ok(load)
    }

    /// Merge snapshot-formatted text into the registry.
    pub fn decode(&self, contents: &str) -> SnapshotLoad {
        let mut tokens = self.tokens.lock();
        let mut load = SnapshotLoad::default();

        for (index, line) in contents.lines().enumerate() {
            let line_no = index + 1;
            if line.trim().is_empty() {
                continue;
            }

            let (key, tail) = match line.split_once(KEY_SEPARATOR) {
                Some((key, tail)) if !tail.contains(KEY_SEPARATOR) => (key, tail),
                _ => {
                    warn!(line = line_no, "Skipping snapshot line without a single '>' separator");
                    load.skipped += 1;
                    continue;
                }
            };

            let token = Self::entry(&mut tokens, key);
            load.senders += 1;

            for pair in tail.split(BUCKET_TERMINATOR).filter(|p| !p.is_empty()) {
                match parse_pair(pair) {
                    Ok((start, recipients)) => match token.record(start, recipients) {
                        Ok(()) => load.buckets += 1,
                        Err(err) => {
                            warn!(line = line_no, sender = %key, pair, error = %err, "Skipping snapshot bucket");
                            load.skipped += 1;
                        }
                    },
                    Err(reason) => {
                        warn!(line = line_no, sender = %key, pair, reason, "Skipping snapshot bucket");
                        load.skipped += 1;
                    }
                }
            }
        }

        load
    }

    fn entry(tokens: &mut HashMap<String, Arc<RateToken>>, key: &str) -> Arc<RateToken> {
        if let Some(token) = tokens.get(key) {
            return token.clone();
        }
        let token = Arc::new(RateToken::new(key));
        tokens.insert(key.to_string(), token.clone());
        token
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_pair(pair: &str) -> std::result::Result<(DateTime<Utc>, u64), &'static str> {
    let fields: Vec<&str> = pair.split(PAIR_SEPARATOR).collect();
    let [timestamp, recipients] = fields.as_slice() else {
        return Err("expected timestamp/count");
    };
    let start = parse_timestamp(timestamp).ok_or("unparsable timestamp")?;
    let recipients = recipients.parse::<u64>().map_err(|_| "unparsable count")?;
    Ok((start, recipients))
}

/// RFC 3339, falling back to the legacy `Mon Jan _2 15:04:05 MST 2006` form.
///
/// Legacy timestamps were always written in UTC, so only a `UTC` or `GMT`
/// zone is accepted there.
fn parse_timestamp(timestamp: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) {
        return Some(parsed.with_timezone(&Utc));
    }

    let fields: Vec<&str> = timestamp.split_whitespace().collect();
    let [weekday, month, day, time, zone, year] = fields.as_slice() else {
        return None;
    };
    if !matches!(*zone, "UTC" | "GMT") {
        return None;
    }
    let normalized = format!("{} {} {} {} {}", weekday, month, day, time, year);
    NaiveDateTime::parse_from_str(&normalized, "%a %b %d %H:%M:%S %Y")
        .ok()
        .map(|naive| naive.and_utc())
}
