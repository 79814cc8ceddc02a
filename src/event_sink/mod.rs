//! Event Sink: subscribes to every topic on the [`EventBus`] and persists
//! each event as a JSON-Lines record, one subdirectory per topic. Segments
//! rotate by size or age; retired segments are archived into a `.tar.gz`
//! the same way the rest of this codebase's log-archiving logic works.

use crate::config::EventSinkConfig;
use crate::events::{Event, EventBus, Topic};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct Segment {
    path: PathBuf,
    file: File,
    bytes_written: u64,
    opened_at: std::time::Instant,
}

pub struct EventSink {
    config: EventSinkConfig,
    events: std::sync::Arc<EventBus>,
    cancellation: CancellationToken,
}

impl EventSink {
    pub fn new(config: EventSinkConfig, events: std::sync::Arc<EventBus>) -> Self {
        Self {
            config,
            events,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }

    /// Spawns one background task per topic, each writing into its own
    /// subdirectory. No-op if the sink is disabled in config.
    pub fn spawn(self: std::sync::Arc<Self>) {
        if !self.config.enabled {
            info!("event sink disabled, not persisting events");
            return;
        }
        for topic in [Topic::Task, Topic::Agent, Topic::Security, Topic::System, Topic::Caws] {
            let sink = self.clone();
            tokio::spawn(async move {
                sink.run_topic(topic).await;
            });
        }
    }

    async fn run_topic(&self, topic: Topic) {
        let dir = Path::new(&self.config.directory).join(topic.as_str());
        if let Err(err) = fs::create_dir_all(&dir) {
            error!(?err, topic = topic.as_str(), "failed to create event sink directory");
            return;
        }
        let mut segment = match open_segment(&dir) {
            Ok(segment) => segment,
            Err(err) => {
                error!(?err, "failed to open initial event sink segment");
                return;
            }
        };

        let mut subscription = self.events.subscribe(topic);
        let rotate_bytes = self.config.rotate_mb * 1024 * 1024;
        let max_age = std::time::Duration::from_secs(60 * 60 * 24 * self.config.retention_days as u64);

        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => break,
                maybe_event = subscription.recv() => {
                    let Some(event) = maybe_event else { break };
                    if let Err(err) = write_event(&mut segment, &event) {
                        error!(?err, "failed to write event to sink segment");
                        continue;
                    }
                    if segment.bytes_written >= rotate_bytes || segment.opened_at.elapsed() >= max_age {
                        if let Err(err) = rotate(&dir, &mut segment) {
                            warn!(?err, "failed to rotate event sink segment");
                        }
                    }
                }
            }
        }
    }
}

fn open_segment(dir: &Path) -> std::io::Result<Segment> {
    let path = dir.join(format!("{}.jsonl", segment_name()));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Segment {
        path,
        file,
        bytes_written: 0,
        opened_at: std::time::Instant::now(),
    })
}

fn segment_name() -> String {
    format!("segment-{:x}", std::process::id())
}

fn write_event(segment: &mut Segment, event: &Event) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    segment.file.write_all(&line)?;
    segment.bytes_written += line.len() as u64;
    Ok(())
}

/// Archives the current segment into a gzip-compressed tarball and opens
/// a fresh one in its place.
fn rotate(dir: &Path, segment: &mut Segment) -> std::io::Result<()> {
    let archive_path = segment.path.with_extension("jsonl.tar.gz");
    let archive = File::create(&archive_path)?;
    let encoder = GzEncoder::new(archive, Compression::default());
    let mut tar = tar::Builder::new(encoder);
    let file_name = segment
        .path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("segment.jsonl"));
    tar.append_path_with_name(&segment.path, &file_name)?;
    tar.into_inner()?.finish()?;
    fs::remove_file(&segment.path)?;

    *segment = open_segment(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Payload, Severity};
    use tempfile::tempdir;

    #[tokio::test]
    async fn disabled_sink_spawns_nothing() {
        let dir = tempdir().unwrap();
        let events = std::sync::Arc::new(EventBus::new(16));
        let config = EventSinkConfig {
            enabled: false,
            directory: dir.path().to_string_lossy().to_string(),
            rotate_mb: 1,
            retention_days: 1,
        };
        let sink = std::sync::Arc::new(EventSink::new(config, events));
        sink.spawn();
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn writes_jsonl_line_per_event() {
        let dir = tempdir().unwrap();
        let events = std::sync::Arc::new(EventBus::new(16));
        let config = EventSinkConfig {
            enabled: true,
            directory: dir.path().to_string_lossy().to_string(),
            rotate_mb: 64,
            retention_days: 14,
        };
        let sink = std::sync::Arc::new(EventSink::new(config, events.clone()));
        sink.clone().spawn();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        events.publish(Event::new(
            Topic::System,
            "corr-1",
            Severity::Info,
            Payload::SystemDegraded {
                component: "store".into(),
                detail: "test".into(),
            },
        ));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        sink.shutdown();

        let system_dir = dir.path().join("system");
        let mut found_content = false;
        for entry in fs::read_dir(&system_dir).unwrap() {
            let entry = entry.unwrap();
            if entry.path().extension().and_then(|e| e.to_str()) == Some("jsonl") {
                let content = fs::read_to_string(entry.path()).unwrap();
                if content.contains("corr-1") {
                    found_content = true;
                }
            }
        }
        assert!(found_content);
    }
}
