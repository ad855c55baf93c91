// Copyright 2020 Guillaume Becquin
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::common::io_utils::publish_atomically;
use crate::PretrainError;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

pub const METRICS_FILE_NAME: &str = "metrics.jsonl";

/// Scalars reported after every optimizer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub global_step: u64,
    pub epoch: usize,
    pub loss: f64,
    /// Token accuracy on the targets, in percent
    pub accuracy: f64,
    /// Learning rate set for the next step, once the schedule has advanced
    pub learning_rate: f64,
    /// Gradient norm before clipping
    pub grad_norm: f64,
    pub seq_length: usize,
    pub loss_scale: f64,
    /// The update was skipped because of non-finite gradients
    pub skipped: bool,
}

/// # Destination of the per-step metrics
///
/// Only the main process records metrics; the other processes use [`NoMetrics`].
pub trait MetricsSink {
    fn record(&mut self, metrics: &StepMetrics) -> Result<(), PretrainError>;

    /// Called at the end of every epoch, after the checkpoint.
    fn end_epoch(&mut self, _epoch: usize) -> Result<(), PretrainError> {
        Ok(())
    }
}

impl<S: MetricsSink + ?Sized> MetricsSink for Box<S> {
    fn record(&mut self, metrics: &StepMetrics) -> Result<(), PretrainError> {
        (**self).record(metrics)
    }

    fn end_epoch(&mut self, epoch: usize) -> Result<(), PretrainError> {
        (**self).end_epoch(epoch)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoMetrics;

impl MetricsSink for NoMetrics {
    fn record(&mut self, _metrics: &StepMetrics) -> Result<(), PretrainError> {
        Ok(())
    }
}

/// # Metrics appended as JSON lines
///
/// The file is opened in append mode so that a resumed run continues the record of the
/// interrupted one (see [`JsonlMetrics::resume`]). Lines are flushed at the end of every epoch.
pub struct JsonlMetrics {
    writer: BufWriter<File>,
}

impl JsonlMetrics {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<JsonlMetrics, PretrainError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                PretrainError::IOError(format!("could not open {}: {e}", path.display()))
            })?;
        Ok(JsonlMetrics {
            writer: BufWriter::new(file),
        })
    }

    /// Opens the record of a run resumed at `global_step`.
    ///
    /// Steps logged after the checkpoint by the interrupted run are replayed by the resumed one:
    /// their records (and lines that cannot be parsed, such as a line cut by the interruption) are
    /// removed before appending.
    pub fn resume<P: AsRef<Path>>(path: P, global_step: u64) -> Result<JsonlMetrics, PretrainError> {
        let path = path.as_ref();
        if path.is_file() {
            let file = File::open(path).map_err(|e| {
                PretrainError::IOError(format!("could not open {}: {e}", path.display()))
            })?;
            let mut kept = Vec::new();
            let mut dropped = 0usize;
            for line in BufReader::new(file).lines() {
                let line = line?;
                match serde_json::from_str::<StepMetrics>(&line) {
                    Ok(metrics) if metrics.global_step <= global_step => kept.push(line),
                    _ => dropped += 1,
                }
            }
            if dropped > 0 {
                tracing::info!(dropped, global_step, "removed metrics recorded after the checkpoint");
                publish_atomically(path, |writer| {
                    for line in &kept {
                        writer.write_all(line.as_bytes())?;
                        writer.write_all(b"\n")?;
                    }
                    Ok(())
                })?;
            }
        }
        JsonlMetrics::open(path)
    }
}

impl MetricsSink for JsonlMetrics {
    fn record(&mut self, metrics: &StepMetrics) -> Result<(), PretrainError> {
        serde_json::to_writer(&mut self.writer, metrics)
            .map_err(|e| PretrainError::IOError(format!("could not write metrics: {e}")))?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn end_epoch(&mut self, _epoch: usize) -> Result<(), PretrainError> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlMetrics {
    fn drop(&mut self) {
        if let Err(error) = self.writer.flush() {
            tracing::warn!("could not flush metrics: {error}");
        }
    }
}

/// Progress over the whole run, starting at the global step of a resumed run.
pub(crate) fn run_progress_bar(visible: bool, global_step: u64, max_steps: u64) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(max_steps);
    let style = ProgressStyle::default_bar()
        .template("{bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}<{eta_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.set_position(global_step);
    bar
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn appends_json_lines() -> anyhow::Result<()> {
        let directory = tempfile::tempdir()?;
        let path = directory.path().join("run").join(METRICS_FILE_NAME);
        let metrics = StepMetrics {
            global_step: 1,
            epoch: 0,
            loss: 9.5,
            accuracy: 1.25,
            learning_rate: 2e-5,
            grad_norm: 3.0,
            seq_length: 512,
            loss_scale: 65536.0,
            skipped: false,
        };
        {
            let mut sink = JsonlMetrics::open(&path)?;
            sink.record(&metrics)?;
        }
        {
            let mut sink = JsonlMetrics::open(&path)?;
            sink.record(&StepMetrics {
                global_step: 2,
                ..metrics.clone()
            })?;
            sink.end_epoch(0)?;
        }

        let content = std::fs::read_to_string(&path)?;
        let lines: Vec<StepMetrics> = content
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], metrics);
        assert_eq!(lines[1].global_step, 2);
        Ok(())
    }

    #[test]
    fn resume_drops_steps_after_the_checkpoint() -> anyhow::Result<()> {
        let directory = tempfile::tempdir()?;
        let path = directory.path().join(METRICS_FILE_NAME);
        let metrics = |global_step| StepMetrics {
            global_step,
            epoch: 0,
            loss: 4.0,
            accuracy: 10.0,
            learning_rate: 1e-3,
            grad_norm: 1.0,
            seq_length: 128,
            loss_scale: 1.0,
            skipped: false,
        };
        {
            let mut sink = JsonlMetrics::open(&path)?;
            for step in 1..=5 {
                sink.record(&metrics(step))?;
            }
        }
        // interrupted in the middle of a line
        let mut content = std::fs::read_to_string(&path)?;
        content.push_str("{\"global_step\": 6, \"ep");
        std::fs::write(&path, content)?;

        {
            let mut sink = JsonlMetrics::resume(&path, 3)?;
            sink.record(&metrics(4))?;
        }
        let steps: Vec<u64> = std::fs::read_to_string(&path)?
            .lines()
            .map(|line| serde_json::from_str::<StepMetrics>(line).map(|m| m.global_step))
            .collect::<Result<_, _>>()?;
        assert_eq!(steps, vec![1, 2, 3, 4]);

        let fresh = directory.path().join("fresh").join(METRICS_FILE_NAME);
        JsonlMetrics::resume(&fresh, 10)?;
        assert!(fresh.is_file());
        Ok(())
    }
}
