//! Display names, global markers, and flow edges.
//!
//! Runs as a third pass once ancestry is final: resolves process and thread
//! display names from naming calls, turns specially formatted writes into
//! global instant markers, and connects each creation call to its child
//! with a flow-edge pair so the viewer can draw the parent/child arrow.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::ancestry;
use crate::event::{Category, Event, Phase, Scope};

/// Thread name set through prctl. Captures the quoted name.
static RE_PRCTL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\(PR_SET_NAME, "([^"]+)""#).expect("invalid prctl pattern")
});

/// Program path and argv[0] of an exec call; the third capture marks a
/// truncated argv.
static RE_EXECVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\("([^"]+)", \["([^"]+)"(\.\.\.)?.*"#).expect("invalid execve pattern")
});

/// Global-event marker embedded in a write payload.
static RE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"===([^=]+)===").expect("invalid marker pattern"));

/// Walk the pid-corrected event list and synthesize the metadata stream:
/// flow-edge pairs for creation calls, global instants for marker writes,
/// and one naming record per discovered process and thread id.
pub fn synthesize(events: &mut [Event], owners: &HashMap<u32, u32>) -> Vec<Event> {
    let mut process_names: HashMap<u32, String> = HashMap::new();
    let mut thread_names: HashMap<u32, String> = HashMap::new();
    let mut metadata = Vec::new();
    // Flow ids start at 1; a zero id would be dropped from the wire as an
    // absent optional field, orphaning the first parent/child edge.
    let mut next_flow_id: u64 = 1;

    for event in events.iter_mut() {
        // Pass two corrects some owners entries only after it has already
        // walked earlier events, so the pid assignment repeats here.
        if let Some(&pid) = owners.get(&event.tid) {
            event.pid = pid;
        }

        match event.name.as_str() {
            "prctl" => {
                if let Some(args) = event.args.first.as_deref() {
                    if args.contains("PR_SET_NAME") {
                        let name = RE_PRCTL
                            .captures(args)
                            .map(|caps| caps[1].to_string())
                            .unwrap_or_else(|| args.to_string());
                        thread_names.insert(event.tid, name);
                    }
                }
            }
            "execve" => {
                if let Some(args) = event.args.first.as_deref() {
                    let name = program_name(args);
                    process_names.insert(event.pid, name.clone());
                    thread_names.insert(event.tid, name);
                }
            }
            "write" => {
                if let Some(args) = event.args.first.as_deref() {
                    if let Some(caps) = RE_MARKER.captures(args) {
                        let mut marker = Event::synthetic(
                            caps[1].trim(),
                            Category::Event,
                            Phase::Instant,
                            event.pid,
                            event.tid,
                            event.ts,
                        );
                        marker.scope = Some(Scope::Global);
                        metadata.push(marker);
                    }
                }
            }
            _ => {}
        }

        if !ancestry::is_spawn_call(&event.name) {
            continue;
        }
        let Some(child) = ancestry::spawned_id(event) else {
            continue;
        };

        // ts+1 sorts the edge after the creation call itself.
        let mut start = Event::synthetic(
            event.name.clone(),
            Category::Clone,
            Phase::FlowStart,
            event.pid,
            event.tid,
            event.ts + 1,
        );
        start.id = Some(next_flow_id);
        metadata.push(start);

        // The child starts out under its creator's name until a naming
        // call of its own is seen.
        let inherited = thread_names.get(&event.tid).cloned().unwrap_or_default();
        thread_names.insert(child, inherited);

        let mut end = if ancestry::shares_address_space(event) {
            Event::synthetic(
                event.name.clone(),
                Category::Clone,
                Phase::FlowEnd,
                event.pid,
                child,
                event.ts + 1,
            )
        } else {
            let inherited = process_names.get(&event.pid).cloned().unwrap_or_default();
            process_names.insert(child, inherited);
            Event::synthetic(
                event.name.clone(),
                Category::Clone,
                Phase::FlowEnd,
                child,
                child,
                event.ts + 1,
            )
        };
        end.id = Some(next_flow_id);
        metadata.push(end);
        next_flow_id += 1;
    }

    for (&pid, name) in &process_names {
        let mut meta =
            Event::synthetic("process_name", Category::Metadata, Phase::Metadata, pid, pid, 0);
        meta.args.name = Some(name.clone());
        metadata.push(meta);
    }
    for (&tid, name) in &thread_names {
        let pid = owners.get(&tid).copied().unwrap_or(0);
        let mut meta =
            Event::synthetic("thread_name", Category::Metadata, Phase::Metadata, pid, tid, 0);
        meta.args.name = Some(name.clone());
        metadata.push(meta);
    }

    metadata
}

/// Extract the display name from an exec call's argument text. A truncated
/// argv falls back to the final path segment of the full command.
fn program_name(args: &str) -> String {
    let Some(caps) = RE_EXECVE.captures(args) else {
        return args.to_string();
    };
    if caps.get(3).is_some() {
        Path::new(&caps[1])
            .file_name()
            .map(|segment| segment.to_string_lossy().into_owned())
            .unwrap_or_else(|| caps[1].to_string())
    } else {
        caps[2].to_string()
    }
}
