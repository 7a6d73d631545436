//! Run Monitoring Module
//!
//! Records when each node of a run starts, completes or fails, and
//! renders the result as a text Gantt chart (`timeline.txt` in the run
//! directory).

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, Span, TimelineEvent};
