//! Inbound tally feed: one long-lived TCP connection per camera.
//!
//! Wire protocol:
//! - after connecting, the feed subscribes by writing `"<tally_id>\n"`
//! - every received line is one status code (`0` off, `1` preview, `2` program)
//! - blank lines are keep-alives
//!
//! The feed reports each status *change* exactly once, in the order received.
//! A dropped connection reads as [`TallyStatus::Unknown`] until the feed is
//! back, and reconnects follow an exponential [`Backoff`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Tally status of one camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TallyStatus {
    /// No feed, feed down, or an unreadable status
    #[default]
    Unknown,
    Off,
    Preview,
    /// On air
    Program,
}

impl TallyStatus {
    /// Wire code, also used in `update_tally` messages.
    pub fn code(self) -> i8 {
        match self {
            TallyStatus::Unknown => -1,
            TallyStatus::Off => 0,
            TallyStatus::Preview => 1,
            TallyStatus::Program => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(TallyStatus::Unknown),
            0 => Some(TallyStatus::Off),
            1 => Some(TallyStatus::Preview),
            2 => Some(TallyStatus::Program),
            _ => None,
        }
    }

    /// Parse one feed line. Anything unreadable is `Unknown`.
    pub fn parse_line(line: &str) -> Self {
        line.trim()
            .parse::<i64>()
            .ok()
            .and_then(Self::from_code)
            .unwrap_or(TallyStatus::Unknown)
    }

    pub fn is_on_air(self) -> bool {
        self == TallyStatus::Program
    }
}

impl Serialize for TallyStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i8(self.code())
    }
}

impl<'de> Deserialize<'de> for TallyStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i64::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid tally code {code}")))
    }
}

/// A status change reported by a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TallyUpdate {
    pub camera: usize,
    pub status: TallyStatus,
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles up to the cap.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Forwards changes only.
struct Reporter<F> {
    camera: usize,
    last: TallyStatus,
    callback: F,
}

impl<F: FnMut(TallyUpdate)> Reporter<F> {
    fn report(&mut self, status: TallyStatus) {
        if status == self.last {
            return;
        }
        self.last = status;
        (self.callback)(TallyUpdate {
            camera: self.camera,
            status,
        });
    }
}

/// Tally subscription for one camera.
pub struct TallyFeed {
    camera: usize,
    tally_id: u32,
    source: String,
    backoff: Backoff,
}

impl TallyFeed {
    /// `source` is a `host:port` address of the tally server.
    pub fn new(camera: usize, tally_id: u32, source: impl Into<String>, backoff: Backoff) -> Self {
        Self {
            camera,
            tally_id,
            source: source.into(),
            backoff,
        }
    }

    pub fn camera(&self) -> usize {
        self.camera
    }

    /// Run the feed on its own task until the handle is aborted.
    pub fn spawn<F>(self, callback: F) -> JoinHandle<()>
    where
        F: FnMut(TallyUpdate) + Send + 'static,
    {
        tokio::spawn(self.run(callback))
    }

    /// Connect, follow, and reconnect forever.
    pub async fn run<F: FnMut(TallyUpdate)>(mut self, callback: F) {
        let mut reporter = Reporter {
            camera: self.camera,
            last: TallyStatus::Unknown,
            callback,
        };

        loop {
            match TcpStream::connect(&self.source).await {
                Ok(stream) => {
                    self.backoff.reset();
                    log::info!(
                        "Tally feed for camera {} connected to {} (id {})",
                        self.camera,
                        self.source,
                        self.tally_id
                    );
                    match self.follow(stream, &mut reporter).await {
                        Ok(()) => log::info!("Tally feed for camera {} closed by peer", self.camera),
                        Err(e) => log::warn!("Tally feed for camera {} failed: {e}", self.camera),
                    }
                }
                Err(e) => {
                    log::debug!("Tally source {} unreachable: {e}", self.source);
                }
            }

            reporter.report(TallyStatus::Unknown);
            let delay = self.backoff.next();
            log::debug!("Tally feed for camera {} retrying in {delay:?}", self.camera);
            tokio::time::sleep(delay).await;
        }
    }

    async fn follow<F: FnMut(TallyUpdate)>(
        &self,
        mut stream: TcpStream,
        reporter: &mut Reporter<F>,
    ) -> std::io::Result<()> {
        stream
            .write_all(format!("{}\n", self.tally_id).as_bytes())
            .await?;

        let mut lines = BufReader::new(stream).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let status = TallyStatus::parse_line(&line);
            if status == TallyStatus::Unknown {
                log::warn!("Camera {}: unreadable tally line {line:?}", self.camera);
            }
            reporter.report(status);
        }
        Ok(())
    }
}
