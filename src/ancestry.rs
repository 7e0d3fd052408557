//! Thread-to-process ancestry reconstruction.
//!
//! The log interleaves calls from every traced thread, and a creation
//! call's return line (carrying the new id) can appear after the log
//! already shows activity attributed to that id. Each event's recorded
//! owning-process id therefore has to be rewritten once the creation
//! relationships are known.

use std::collections::HashMap;

use crate::event::Event;

/// A process- or thread-creation call.
pub fn is_spawn_call(name: &str) -> bool {
    name == "fork" || name.starts_with("clone")
}

/// Rewrite every event's pid from an owners table built out of the
/// creation calls, and return the table for the metadata stage.
///
/// Two full passes: the first pass can record a child under its creator's
/// not-yet-corrected pid when the creation line itself is forward-referenced,
/// and the second pass re-derives those entries from corrected creators.
/// This is a fixed point for the single-level forward references the log
/// format exhibits; deeper nesting in adverse textual order is a known
/// limitation.
pub fn resolve(events: &mut [Event]) -> HashMap<u32, u32> {
    let mut owners = HashMap::new();
    if let Some(first) = events.first() {
        owners.insert(first.tid, first.pid);
    }
    for _ in 0..2 {
        assign_pass(events, &mut owners);
    }
    owners
}

fn assign_pass(events: &mut [Event], owners: &mut HashMap<u32, u32>) {
    for event in events.iter_mut() {
        if let Some(&pid) = owners.get(&event.tid) {
            event.pid = pid;
        }
        if !is_spawn_call(&event.name) {
            continue;
        }
        // Non-numeric return values (e.g. restarted calls) carry no child id.
        let Some(child) = spawned_id(event) else {
            continue;
        };
        if shares_address_space(event) {
            owners.insert(child, event.pid);
        } else {
            owners.insert(child, child);
        }
    }
}

/// The new thread/process id is the creation call's return value.
pub fn spawned_id(event: &Event) -> Option<u32> {
    event
        .args
        .return_value
        .as_deref()
        .and_then(|raw| raw.trim().parse().ok())
}

/// A shared-address-space creation makes a thread in the creator's process;
/// anything else makes a new process.
pub fn shares_address_space(event: &Event) -> bool {
    event
        .args
        .first
        .as_deref()
        .is_some_and(|args| args.contains("CLONE_THREAD"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Category, Phase};

    fn call(name: &str, pid: u32, ts: u64) -> Event {
        Event::synthetic(name, Category::Successful, Phase::Complete, pid, pid, ts)
    }

    fn spawn(name: &str, pid: u32, ts: u64, child: u32, flags: &str) -> Event {
        let mut event = call(name, pid, ts);
        event.args.first = Some(format!("({flags})"));
        event.args.return_value = Some(child.to_string());
        event
    }

    #[test]
    fn test_thread_maps_to_creator_process() {
        let mut events = vec![
            call("write", 100, 1),
            spawn("clone", 100, 2, 101, "CLONE_THREAD|CLONE_VM"),
            call("write", 101, 3),
        ];
        let owners = resolve(&mut events);
        assert_eq!(owners.get(&101), Some(&100));
        assert_eq!(events[2].pid, 100);
    }

    #[test]
    fn test_fork_maps_child_to_itself() {
        let mut events = vec![
            call("write", 100, 1),
            spawn("fork", 100, 2, 200, ""),
            call("write", 200, 3),
        ];
        let owners = resolve(&mut events);
        assert_eq!(owners.get(&200), Some(&200));
        assert_eq!(events[2].pid, 200);
    }

    #[test]
    fn test_forward_referenced_creation_converges() {
        // The child's first event is logged before the creation call's
        // return line; the second pass must still resolve its pid.
        let mut events = vec![
            call("write", 100, 1),
            call("write", 101, 2),
            spawn("clone3", 100, 3, 101, "CLONE_THREAD"),
        ];
        let owners = resolve(&mut events);
        assert_eq!(owners.get(&101), Some(&100));
        assert_eq!(events[1].pid, 100);
    }

    #[test]
    fn test_unparseable_spawn_return_is_skipped() {
        let mut events = vec![
            call("write", 100, 1),
            spawn("clone", 100, 2, 0, "CLONE_THREAD"),
        ];
        events[1].args.return_value = Some("? ERESTARTSYS".to_string());
        let owners = resolve(&mut events);
        assert!(!owners.contains_key(&0));
        assert_eq!(owners.len(), 1);
    }

    #[test]
    fn test_empty_event_list() {
        let mut events: Vec<Event> = Vec::new();
        assert!(resolve(&mut events).is_empty());
    }
}
