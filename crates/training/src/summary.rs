//! Append-only JSON-lines summary streams, one per execution mode.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::net::StepSummary;

pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryEvent {
    pub step: usize,
    /// Seconds since the Unix epoch.
    pub wall_time: f64,
    /// `None` when the step produced a non-finite loss, which JSON cannot carry.
    #[serde(default)]
    pub loss: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_all: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_nonzero: Option<f32>,
}

impl SummaryEvent {
    pub fn new(step: usize, summary: &StepSummary) -> Self {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            step,
            wall_time,
            loss: summary.loss.is_finite().then_some(summary.loss),
            accuracy_all: summary.accuracy.map(|a| a.all),
            accuracy_nonzero: summary.accuracy.and_then(|a| a.nonzero),
        }
    }
}

pub struct SummaryWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl SummaryWriter {
    /// Open `dir/events.jsonl` for appending, creating `dir` when needed.
    pub fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(EVENTS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one event line and flush it.
    pub fn add_summary(&mut self, step: usize, summary: &StepSummary) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, &SummaryEvent::new(step, summary))?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

pub fn read_events(path: &Path) -> io::Result<Vec<SummaryEvent>> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line)?);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::PixelAccuracy;

    #[test]
    fn events_append_across_writers() {
        let dir = tempfile::tempdir().unwrap();
        let train = StepSummary {
            loss: 1.5,
            accuracy: Some(PixelAccuracy {
                all: 0.9,
                nonzero: None,
            }),
        };
        let test = StepSummary {
            loss: 2.0,
            accuracy: None,
        };

        let mut writer = SummaryWriter::create(dir.path()).unwrap();
        writer.add_summary(1, &train).unwrap();
        drop(writer);
        let mut writer = SummaryWriter::create(dir.path()).unwrap();
        writer.add_summary(2, &test).unwrap();

        let events = read_events(writer.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].step, 1);
        assert_eq!(events[0].accuracy_all, Some(0.9));
        assert_eq!(events[0].accuracy_nonzero, None);
        assert_eq!(events[1].loss, Some(2.0));
        assert_eq!(events[1].accuracy_all, None);
    }

    #[test]
    fn absent_metrics_are_omitted_from_the_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SummaryWriter::create(&dir.path().join("test")).unwrap();
        writer
            .add_summary(
                5,
                &StepSummary {
                    loss: 0.25,
                    accuracy: None,
                },
            )
            .unwrap();
        let line = fs::read_to_string(writer.path()).unwrap();
        assert!(line.ends_with('\n'));
        assert!(!line.contains("accuracy"));
    }

    #[test]
    fn non_finite_loss_keeps_stream_readable() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SummaryWriter::create(dir.path()).unwrap();
        for (step, loss) in [(1, f32::NAN), (2, f32::INFINITY), (3, 0.5)] {
            writer
                .add_summary(
                    step,
                    &StepSummary {
                        loss,
                        accuracy: None,
                    },
                )
                .unwrap();
        }

        let events = read_events(writer.path()).unwrap();
        let losses: Vec<Option<f32>> = events.iter().map(|e| e.loss).collect();
        assert_eq!(losses, [None, None, Some(0.5)]);
        let steps: Vec<usize> = events.iter().map(|e| e.step).collect();
        assert_eq!(steps, [1, 2, 3]);
    }
}
