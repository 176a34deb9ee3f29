//! Device-driver boundary.
//!
//! Instrument protocols live behind [`SensorDriver`]: whatever the wire format, a
//! driver hands the recorder a channel of [`Reading`]s between
//! `start_acquisition` and `stop_acquisition`. [`ReplayDriver`] replays a
//! prepared sequence and backs the tests and the offline CLI paths.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::Error;
use crate::io::csv;
use crate::models::reading::Reading;

/// Channel depth between a driver and its consumer.
pub const READING_CHANNEL_CAPACITY: usize = 1024;

#[async_trait]
pub trait SensorDriver: Send {
    /// Opens the instrument connection.
    async fn connect(&mut self) -> Result<(), Error>;

    /// Closes the instrument connection. Stops acquisition first if needed.
    async fn disconnect(&mut self) -> Result<(), Error>;

    /// Starts streaming samples. The channel closes when acquisition stops.
    async fn start_acquisition(&mut self) -> Result<mpsc::Receiver<Reading>, Error>;

    /// Stops streaming samples.
    async fn stop_acquisition(&mut self) -> Result<(), Error>;
}

/// Replays a fixed list of readings.
///
/// With a `pace`, readings are emitted one per tick; otherwise as fast as the
/// consumer drains them.
pub struct ReplayDriver {
    readings: Vec<Reading>,
    pace: Option<Duration>,
    connected: bool,
    task: Option<JoinHandle<()>>,
}

impl ReplayDriver {
    pub fn new(readings: Vec<Reading>) -> Self {
        Self {
            readings,
            pace: None,
            connected: false,
            task: None,
        }
    }

    /// Loads readings from a CSV document in the session file format.
    pub async fn from_csv_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        let rows = csv::parse_document(&text)?;
        Ok(Self::new(csv::readings_only(rows)))
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

#[async_trait]
impl SensorDriver for ReplayDriver {
    async fn connect(&mut self) -> Result<(), Error> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Error> {
        self.stop_acquisition().await?;
        self.connected = false;
        Ok(())
    }

    async fn start_acquisition(&mut self) -> Result<mpsc::Receiver<Reading>, Error> {
        if !self.connected {
            return Err(Error::Driver("not connected".into()));
        }
        if self.task.is_some() {
            return Err(Error::Driver("acquisition already running".into()));
        }

        let (tx, rx) = mpsc::channel(READING_CHANNEL_CAPACITY);
        let readings = std::mem::take(&mut self.readings);
        let pace = self.pace;
        self.task = Some(tokio::spawn(async move {
            for r in readings {
                if let Some(p) = pace {
                    tokio::time::sleep(p).await;
                }
                if tx.send(r).await.is_err() {
                    break;
                }
            }
        }));
        Ok(rx)
    }

    async fn stop_acquisition(&mut self) -> Result<(), Error> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        Ok(())
    }
}
