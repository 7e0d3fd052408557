//! Trace event records and the JSON document they are written into.
//!
//! Every stage of the pipeline operates on [`Event`]: the parser builds
//! them from log lines, the reconstruction passes rewrite them in place,
//! and the merger assembles the final `traceEvents` array consumed by
//! Perfetto and chrome://tracing.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

/// Single-character phase code from the trace event format. The phase
/// determines how the viewer interprets duration and linking fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// Begin of a duration slice.
    #[serde(rename = "B")]
    Begin,
    /// End of a duration slice.
    #[serde(rename = "E")]
    End,
    /// Complete slice carrying its own duration.
    #[serde(rename = "X")]
    Complete,
    /// Point in time with no duration.
    #[serde(rename = "i")]
    Instant,
    /// Process/thread naming record.
    #[serde(rename = "M")]
    Metadata,
    /// Counter sample, drawn as a line graph.
    #[serde(rename = "C")]
    Counter,
    /// Start of a flow arrow between two timeline points.
    #[serde(rename = "s")]
    FlowStart,
    /// End of a flow arrow.
    #[serde(rename = "f")]
    FlowEnd,
}

/// Event classification. Assigned once by the line classifier (or by the
/// stage that synthesizes the event) and branched on downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Syscall that returned without error.
    Successful,
    /// Syscall whose return value is negative.
    Failed,
    /// Call interrupted by another thread; completion not yet seen.
    Unfinished,
    /// Resumed half of an interrupted call.
    Detached,
    /// Thread or process termination marker.
    Lifetime,
    /// Synthesized flow edge between creator and created id.
    Clone,
    /// Synthesized global marker event.
    Event,
    /// Process/thread naming record.
    #[serde(rename = "__metadata")]
    Metadata,
    /// Resource-usage sample.
    Counter,
    /// Line that matched no grammar; dropped before the pipeline.
    Other,
}

/// Visual scope of an instant event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Scope {
    /// Spans the entire timeline, top to bottom.
    #[serde(rename = "g")]
    Global,
}

/// Variant payload of an event. Exactly one subset of fields is populated
/// depending on the category; absent fields are left off the wire.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Args {
    /// Human-readable name carried by metadata events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// CPU utilization percentage on counter events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    /// Memory usage in bytes on counter events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    /// Raw argument text of the call (or of its interrupted half).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first: Option<String>,
    /// Raw argument text of the resumed half of an interrupted call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub second: Option<String>,
    /// Raw return-value text.
    #[serde(rename = "returnValue", skip_serializing_if = "Option::is_none")]
    pub return_value: Option<String>,
}

/// Zero is the schema's "not present" for the optional numeric fields;
/// viewers treat a missing value and zero identically.
fn zero_or_none(value: &Option<u64>) -> bool {
    matches!(value, None | Some(0))
}

/// The universal record flowing through every pipeline stage.
///
/// Events are created by the parser (or synthesized by later stages),
/// mutated in place by ancestry reconstruction (`pid`) and pairing
/// (`ts`, `dur`, args merge), and either emitted into the merged output
/// or dropped. Timestamps are integer microseconds.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub name: String,
    pub cat: Category,
    pub ph: Phase,
    pub pid: u32,
    pub tid: u32,
    pub ts: u64,
    #[serde(skip_serializing_if = "zero_or_none")]
    pub dur: Option<u64>,
    #[serde(skip_serializing_if = "zero_or_none")]
    pub id: Option<u64>,
    #[serde(rename = "s", skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    pub args: Args,
}

impl Event {
    /// Build an event with empty args and no optional fields. Stages that
    /// synthesize events start from this and fill in what they need.
    pub fn synthetic(
        name: impl Into<String>,
        cat: Category,
        ph: Phase,
        pid: u32,
        tid: u32,
        ts: u64,
    ) -> Self {
        Self {
            name: name.into(),
            cat,
            ph,
            pid,
            tid,
            ts,
            dur: None,
            id: None,
            scope: None,
            args: Args::default(),
        }
    }
}

/// The output document: one array field holding the merged event stream.
#[derive(Debug, Serialize)]
pub struct TraceFile {
    #[serde(rename = "traceEvents")]
    pub trace_events: Vec<Event>,
}

impl TraceFile {
    /// Serialize to the pretty-printed JSON document the viewers consume.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to encode trace events as JSON")
    }

    /// Write the document to `path`. The trace file is the whole point of
    /// the run, so any failure here is fatal to the caller.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        fs::write(path, json)
            .with_context(|| format!("failed to write trace file {}", path.display()))
    }
}
