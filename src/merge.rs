//! Chronological k-way merge of independently ordered event lists.

use std::collections::VecDeque;

use crate::event::Event;

/// Merge N pre-sorted event lists into one list sorted by timestamp.
///
/// Each step takes the lowest-timestamp head across all lists; ties keep
/// the order of the input lists, which is what keeps zero-timestamp
/// metadata ahead of the real events that first use it. Empty inputs are
/// skipped. The output length is the sum of the input lengths.
pub fn merge(sources: Vec<Vec<Event>>) -> Vec<Event> {
    let mut queues: Vec<VecDeque<Event>> = sources
        .into_iter()
        .filter(|source| !source.is_empty())
        .map(VecDeque::from)
        .collect();

    let total = queues.iter().map(VecDeque::len).sum();
    let mut merged = Vec::with_capacity(total);

    while !queues.is_empty() {
        let mut lowest = 0;
        for (index, queue) in queues.iter().enumerate().skip(1) {
            if queue[0].ts < queues[lowest][0].ts {
                lowest = index;
            }
        }
        if let Some(event) = queues[lowest].pop_front() {
            merged.push(event);
        }
        if queues[lowest].is_empty() {
            queues.remove(lowest);
        }
    }

    merged
}
