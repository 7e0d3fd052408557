//! Log-line classification and event building.
//!
//! The strace log (produced with `-f -T -ttt -q`) is line oriented and only
//! partially ordered: a call interrupted by another thread is logged as an
//! `<unfinished ...>` line and a later `<... resumed>` line. This module
//! classifies each line against a fixed, ordered set of grammars, converts
//! the numeric fields to integer microseconds, and pairs the interrupted
//! halves back into single events.

use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use thiserror::Error;

use crate::event::{Category, Event, Phase};

/// Completed call whose return value is negative. Tested before the
/// successful grammar, of which it is a strict syntactic subset trigger.
/// Captures: pid, ts, name, args, returnValue, duration.
static RE_FAILED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+) +(\d+\.\d+) +(\w+)(\(\)|\(.+\)) += (-.+) +<(.+)>")
        .expect("invalid failed-call pattern")
});

/// Completed call logged on a single line.
/// Captures: pid, ts, name, args, returnValue, duration.
static RE_SUCCESSFUL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+) +(\d+\.\d+) +(\w+)(\(\)|\(.+\)) += (.+) +<(.+)>")
        .expect("invalid successful-call pattern")
});

/// Call interrupted before completion. Captures: pid, ts, name, args.
static RE_UNFINISHED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+) +(\d+\.\d+) +(\w+)(.+)<unfinished \.\.\.>")
        .expect("invalid unfinished-call pattern")
});

/// Resumed half of an interrupted call.
/// Captures: pid, ts, name, args, returnValue, duration.
static RE_DETACHED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+) +(\d+\.\d+) <\.\.\. +(\w+) resumed>(.|.+\)) += (.+) +<(.+)>")
        .expect("invalid resumed-call pattern")
});

/// Thread or process termination marker. Captures: pid, ts, marker, status.
static RE_LIFETIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+) +(\d+\.\d+) +(\+\+\+\s+(.*)\s+\+\+\+)")
        .expect("invalid termination-marker pattern")
});

/// Errors that invalidate the whole run. A silently misparsed numeric field
/// would corrupt every downstream ordering guarantee, so none of these are
/// recoverable per line.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed {field} in log line: {line:?}")]
    BadNumber { field: &'static str, line: String },
    #[error("resumed call {name:?} on pid {pid} has no interrupted counterpart")]
    UnmatchedResume { name: String, pid: u32 },
    #[error("failed to read log line")]
    Io(#[from] std::io::Error),
}

/// Match one line against the grammars, first match wins.
fn classify(line: &str) -> Option<(Category, Captures<'_>)> {
    let rules: [(Category, &LazyLock<Regex>); 5] = [
        (Category::Failed, &RE_FAILED),
        (Category::Successful, &RE_SUCCESSFUL),
        (Category::Unfinished, &RE_UNFINISHED),
        (Category::Detached, &RE_DETACHED),
        (Category::Lifetime, &RE_LIFETIME),
    ];
    rules
        .into_iter()
        .find_map(|(cat, re)| re.captures(line).map(|caps| (cat, caps)))
}

fn convert_id(raw: &str, line: &str) -> Result<u32, ParseError> {
    raw.parse().map_err(|_| ParseError::BadNumber {
        field: "id",
        line: line.to_string(),
    })
}

/// Convert a fractional-seconds field to integer microseconds. strace always
/// emits a fixed number of fractional digits, so the integer and fractional
/// digit groups concatenate directly; multiplying would need float parsing
/// and lose exactness.
fn convert_micros(raw: &str, field: &'static str, line: &str) -> Result<u64, ParseError> {
    let Some((secs, frac)) = raw.split_once('.') else {
        return Ok(0);
    };
    let mut digits = String::with_capacity(secs.len() + frac.len());
    digits.push_str(secs);
    digits.push_str(frac);
    digits.parse().map_err(|_| ParseError::BadNumber {
        field,
        line: line.to_string(),
    })
}

/// Classify one log line and build its event. Lines matching no grammar
/// return `None` and never reach later stages.
pub fn parse_line(line: &str) -> Result<Option<Event>, ParseError> {
    let Some((cat, caps)) = classify(line) else {
        return Ok(None);
    };

    let pid = convert_id(&caps[1], line)?;
    let ts = convert_micros(&caps[2], "timestamp", line)?;
    let mut event = Event::synthetic(&caps[3], cat, Phase::Instant, pid, pid, ts);

    match cat {
        Category::Successful | Category::Failed => {
            event.ph = Phase::Complete;
            event.dur = Some(convert_micros(&caps[6], "duration", line)?);
            event.args.first = Some(caps[4].to_string());
            event.args.return_value = Some(caps[5].to_string());
        }
        Category::Detached => {
            // Start timestamp and duration are wrong on this line; pairing
            // recomputes both from the interrupted half.
            event.ph = Phase::Complete;
            event.dur = Some(convert_micros(&caps[6], "duration", line)?);
            event.args.second = Some(caps[4].to_string());
            event.args.return_value = Some(caps[5].to_string());
        }
        Category::Unfinished => {
            event.ph = Phase::Begin;
            event.args.first = Some(caps[4].to_string());
        }
        Category::Lifetime => {
            event.ph = Phase::End;
            event.name = "lifetime".to_string();
            event.args.first = Some(caps[4].to_string());
        }
        _ => {}
    }

    Ok(Some(event))
}

/// Scan a complete captured log into the raw event list.
///
/// Besides building events this injects a Begin-phase "lifetime" event the
/// first time each thread id is observed, pairs interrupted calls with their
/// resumed halves through a pending table keyed on (pid, name), and flushes
/// calls that were still pending when the trace ended as instants.
pub fn parse_log<R: BufRead>(reader: R) -> Result<Vec<Event>, ParseError> {
    let mut events = Vec::new();
    let mut pending: HashMap<(u32, String), Event> = HashMap::new();
    let mut seen_threads: HashSet<u32> = HashSet::new();

    for line in reader.lines() {
        let line = line?;
        let Some(mut event) = parse_line(&line)? else {
            continue;
        };
        if seen_threads.insert(event.tid) {
            events.push(Event::synthetic(
                "lifetime",
                Category::Lifetime,
                Phase::Begin,
                event.pid,
                event.tid,
                event.ts,
            ));
        }
        match event.cat {
            Category::Unfinished => {
                pending.insert((event.pid, event.name.clone()), event);
            }
            Category::Detached => {
                let key = (event.pid, event.name.clone());
                let Some(opened) = pending.remove(&key) else {
                    return Err(ParseError::UnmatchedResume {
                        name: event.name,
                        pid: event.pid,
                    });
                };
                event.dur = Some(event.ts.saturating_sub(opened.ts));
                event.ts = opened.ts;
                event.args.first = opened.args.first;
                events.push(event);
            }
            _ => events.push(event),
        }
    }

    // The call never completed before the trace ended.
    for (_, mut event) in pending {
        event.ph = Phase::Instant;
        events.push(event);
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_successful_line() {
        let event = parse_line("100 0.000123 write(1, \"hi\", 2) = 2 <0.000010>")
            .unwrap()
            .unwrap();
        assert_eq!(event.cat, Category::Successful);
        assert_eq!(event.ph, Phase::Complete);
        assert_eq!(event.name, "write");
        assert_eq!(event.pid, 100);
        assert_eq!(event.tid, 100);
        assert_eq!(event.ts, 123);
        assert_eq!(event.dur, Some(10));
        assert_eq!(event.args.first.as_deref(), Some("(1, \"hi\", 2)"));
        assert_eq!(event.args.return_value.as_deref(), Some("2"));
    }

    #[test]
    fn test_failed_wins_over_successful() {
        let event = parse_line("100 0.000123 openat(AT_FDCWD, \"/nope\") = -1 ENOENT <0.000004>")
            .unwrap()
            .unwrap();
        assert_eq!(event.cat, Category::Failed);
        assert_eq!(event.args.return_value.as_deref(), Some("-1 ENOENT"));
    }

    #[test]
    fn test_unfinished_line() {
        let event = parse_line("100 0.000200 futex(0x7f0, FUTEX_WAIT, 0 <unfinished ...>")
            .unwrap()
            .unwrap();
        assert_eq!(event.cat, Category::Unfinished);
        assert_eq!(event.ph, Phase::Begin);
        assert_eq!(event.name, "futex");
    }

    #[test]
    fn test_detached_line() {
        let event = parse_line("100 0.000300 <... futex resumed>) = 0 <0.000100>")
            .unwrap()
            .unwrap();
        assert_eq!(event.cat, Category::Detached);
        assert_eq!(event.name, "futex");
        assert_eq!(event.args.return_value.as_deref(), Some("0"));
    }

    #[test]
    fn test_lifetime_line_forces_name() {
        let event = parse_line("100 0.000400 +++ exited with 0 +++")
            .unwrap()
            .unwrap();
        assert_eq!(event.cat, Category::Lifetime);
        assert_eq!(event.ph, Phase::End);
        assert_eq!(event.name, "lifetime");
        assert_eq!(event.args.first.as_deref(), Some("exited with 0"));
    }

    #[test]
    fn test_unmatched_line_is_none() {
        assert!(parse_line("strace: Process 100 attached").unwrap().is_none());
        assert!(parse_line("").unwrap().is_none());
    }

    #[test]
    fn test_timestamp_concatenation() {
        let event = parse_line("1 1722890000.123456 read(3, \"\", 0) = 0 <0.000001>")
            .unwrap()
            .unwrap();
        assert_eq!(event.ts, 1_722_890_000_123_456);
        assert_eq!(event.dur, Some(1));
    }

    #[test]
    fn test_lifetime_begin_injected_before_first_event() {
        let log = "100 0.000010 write(1, \"a\", 1) = 1 <0.000002>\n";
        let events = parse_log(Cursor::new(log)).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "lifetime");
        assert_eq!(events[0].ph, Phase::Begin);
        assert_eq!(events[0].ts, 10);
        assert_eq!(events[1].name, "write");
    }

    #[test]
    fn test_pairing_merges_interrupted_call() {
        let log = "\
100 0.000100 futex(0x7f0, FUTEX_WAIT, 0 <unfinished ...>
100 0.000250 <... futex resumed>) = 0 <0.000150>
";
        let events = parse_log(Cursor::new(log)).unwrap();
        // lifetime begin + one paired event, not two
        assert_eq!(events.len(), 2);
        let paired = &events[1];
        assert_eq!(paired.cat, Category::Detached);
        assert_eq!(paired.ts, 100);
        assert_eq!(paired.dur, Some(150));
        assert_eq!(
            paired.args.first.as_deref(),
            Some("(0x7f0, FUTEX_WAIT, 0 ")
        );
        assert_eq!(paired.args.return_value.as_deref(), Some("0"));
    }

    #[test]
    fn test_straggler_flushed_as_instant() {
        let log = "100 0.000100 futex(0x7f0, FUTEX_WAIT, 0 <unfinished ...>\n";
        let events = parse_log(Cursor::new(log)).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].cat, Category::Unfinished);
        assert_eq!(events[1].ph, Phase::Instant);
    }

    #[test]
    fn test_unmatched_resume_is_fatal() {
        let log = "100 0.000250 <... futex resumed>) = 0 <0.000150>\n";
        let err = parse_log(Cursor::new(log)).unwrap_err();
        assert!(matches!(err, ParseError::UnmatchedResume { .. }));
    }

    #[test]
    fn test_malformed_duration_is_fatal() {
        let err = parse_line("100 0.000123 write(1, \"hi\", 2) = 2 <12.bogus>").unwrap_err();
        assert!(matches!(err, ParseError::BadNumber { field: "duration", .. }));
    }

    #[test]
    fn test_noise_lines_dropped_from_log() {
        let log = "\
strace: Process 100 attached
100 0.000010 write(1, \"a\", 1) = 1 <0.000002>
";
        let events = parse_log(Cursor::new(log)).unwrap();
        assert_eq!(events.len(), 2);
    }
}
