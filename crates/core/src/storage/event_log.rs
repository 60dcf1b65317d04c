use crate::events::{Event, EventLog};
use crate::types::RunId;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Event log stored as gzip-compressed JSON Lines, one file per run and day
pub struct JsonlEventLog {
    base_path: PathBuf,
    // Events not yet written to disk, per run
    buffer: RwLock<HashMap<RunId, Vec<Event>>>,
    flush_threshold: usize,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)
            .context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffer: RwLock::new(HashMap::new()),
            flush_threshold: 100,
        })
    }

    /// Get the path to the event log file for a specific run
    /// Format: events/YYYY/MM/DD/<run_id>.jsonl.gz
    fn event_log_path(&self, run_id: &RunId, date: &DateTime<Utc>) -> PathBuf {
        self.base_path
            .join("events")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl.gz", run_id))
    }

    /// Flush buffered events of one run to disk
    pub async fn flush(&self, run_id: &RunId) -> Result<()> {
        let events = match self.buffer.write().await.remove(run_id) {
            Some(events) if !events.is_empty() => events,
            _ => return Ok(()),
        };

        // Group events by day
        let mut events_by_date: HashMap<(i32, u32, u32), Vec<Event>> = HashMap::new();
        for event in events {
            let key = (
                event.timestamp.year(),
                event.timestamp.month(),
                event.timestamp.day(),
            );
            events_by_date.entry(key).or_default().push(event);
        }

        for (_, events) in events_by_date {
            let path = self.event_log_path(run_id, &events[0].timestamp);

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create event log directory")?;
            }

            let mut all_events = if path.exists() {
                read_jsonl_gz(&path)?
            } else {
                Vec::new()
            };
            all_events.extend(events);

            write_jsonl_gz(&path, &all_events).await?;
        }

        Ok(())
    }

    /// Flush every buffered run
    pub async fn flush_all(&self) -> Result<()> {
        let runs: Vec<RunId> = self.buffer.read().await.keys().copied().collect();
        for run_id in runs {
            self.flush(&run_id).await?;
        }
        Ok(())
    }

    /// Get all event log files for a run
    fn get_log_files(&self, run_id: &RunId) -> Result<Vec<PathBuf>> {
        let events_dir = self.base_path.join("events");
        if !events_dir.exists() {
            return Ok(Vec::new());
        }

        let filename = format!("{}.jsonl.gz", run_id);
        let mut files = Vec::new();

        // Walk year/month/day directories
        for year in subdirectories(&events_dir)? {
            for month in subdirectories(&year)? {
                for day in subdirectories(&month)? {
                    let log_file = day.join(&filename);
                    if log_file.exists() {
                        files.push(log_file);
                    }
                }
            }
        }

        Ok(files)
    }
}

fn subdirectories(path: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(path)
        .with_context(|| format!("Failed to read directory {}", path.display()))?
    {
        let entry = entry.context("Failed to read directory entry")?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
    use flate2::read::GzDecoder;
    use std::io::BufRead;

    let file = std::fs::File::open(path).context("Failed to open event log")?;
    let reader = std::io::BufReader::new(GzDecoder::new(file));

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from event log")?;
        let event: Event = serde_json::from_str(&line).context("Failed to parse event")?;
        events.push(event);
    }

    Ok(events)
}

async fn write_jsonl_gz(path: &Path, events: &[Event]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }

    let compressed = encoder.finish().context("Failed to finish compression")?;

    tokio::fs::write(path, compressed)
        .await
        .context("Failed to write event log file")?;

    Ok(())
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let run_id = event.run_id;
        let pending = {
            let mut buffer = self.buffer.write().await;
            let events = buffer.entry(run_id).or_default();
            events.push(event);
            events.len()
        };

        if pending > self.flush_threshold {
            self.flush(&run_id).await?;
        }

        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        self.flush(&run_id).await?;

        let mut all_events = Vec::new();
        for file in self.get_log_files(&run_id)? {
            all_events.extend(read_jsonl_gz(&file)?);
        }

        all_events.sort_by_key(|e| e.timestamp);

        Ok(all_events)
    }
}

/// Event log kept in memory
#[derive(Default)]
pub struct MemoryEventLog {
    events: RwLock<Vec<Event>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }
}
