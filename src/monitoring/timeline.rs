//! Execution Timeline
//!
//! Records when each node instance of a run starts and finishes, keyed by
//! its path id, and renders the result as an ASCII Gantt chart written to
//! `timeline.txt` in the run directory:
//!
//! ```text
//! decl-xs                   |#                                                 | (0 ms)
//! scatter-L3C1/0/call-align |  ##############################                  | (1520 ms)
//! scatter-L3C1/1/call-align |  ######################################## FAILED| (2010 ms)
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::Result;

/// Width of the chart bars in characters.
const CHART_WIDTH: usize = 50;

/// Widest node label before truncation.
const MAX_LABEL: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Path id of the node instance
    pub node: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// One node instance's run interval, in milliseconds since the run began.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub node: String,
    pub start_ms: u128,
    pub end_ms: Option<u128>,
    pub failed: bool,
}

#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn add_event(&mut self, node: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            node: node.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Run intervals ordered by start time. Nodes still running have no end.
    pub fn spans(&self) -> Vec<Span> {
        let mut spans: Vec<Span> = Vec::new();
        let mut open: HashMap<&str, usize> = HashMap::new();
        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            match event.event_type {
                EventType::Started => {
                    open.insert(&event.node, spans.len());
                    spans.push(Span {
                        node: event.node.clone(),
                        start_ms: elapsed,
                        end_ms: None,
                        failed: false,
                    });
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(index) = open.remove(event.node.as_str()) {
                        spans[index].end_ms = Some(elapsed);
                        spans[index].failed = event.event_type == EventType::Failed;
                    }
                }
            }
        }
        spans.sort_by_key(|s| s.start_ms);
        spans
    }

    /// Duration of every finished node instance.
    pub fn durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .filter_map(|s| s.end_ms.map(|end| (s.node, end - s.start_ms)))
            .collect()
    }

    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("Execution Timeline:\n\n");
        let total = self.elapsed().as_millis().max(1);
        let scale = CHART_WIDTH as f64 / total as f64;
        let spans = self.spans();
        let width = spans
            .iter()
            .map(|s| s.node.chars().count().min(MAX_LABEL))
            .max()
            .unwrap_or(0);

        for span in &spans {
            let end = span.end_ms.unwrap_or(total);
            let start_pos = ((span.start_ms as f64 * scale) as usize).min(CHART_WIDTH - 1);
            let length = (((end - span.start_ms) as f64 * scale).max(1.0) as usize)
                .min(CHART_WIDTH - start_pos);
            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(length));
            let bar = format!("{:width$}", bar, width = CHART_WIDTH);
            let status = match (span.end_ms, span.failed) {
                (None, _) => " RUNNING",
                (Some(_), true) => " FAILED",
                _ => "",
            };
            output.push_str(&format!(
                "{} |{}| ({} ms){}\n",
                truncate(&span.node, width),
                bar,
                end - span.start_ms,
                status
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", self.elapsed().as_millis()));
        output
    }

    /// Writes the Gantt chart to `path`.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.gantt_chart())?;
        Ok(())
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates `s` to exactly `width` characters.
fn truncate(s: &str, width: usize) -> String {
    let count = s.chars().count();
    if count <= width {
        format!("{:width$}", s, width = width)
    } else {
        let keep: String = s.chars().skip(count - (width - 3)).collect();
        format!("...{}", keep)
    }
}
