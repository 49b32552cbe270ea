//! Small runtime utilities shared across the crate.

use std::collections::HashMap;
use std::time::{Duration, Instant};

struct TimeRecord {
    desc: String,
    elapsed: Duration,
    start: Option<Instant>,
    count: usize,
}

/// Named wall-clock accumulators for coarse-grained timing of hot-path
/// phases. Each item accumulates across `count_start`/`count` pairs; the
/// report prints total seconds and the number of completed intervals.
pub struct TimeRecords {
    items: HashMap<String, TimeRecord>,
    ordering: Vec<String>,
}

impl TimeRecords {
    pub fn new() -> TimeRecords {
        TimeRecords {
            items: HashMap::new(),
            ordering: Vec::new(),
        }
    }

    pub fn new_item(&mut self, name: &str, desc: &str) {
        if self.items.contains_key(name) {
            return;
        }
        self.items.insert(
            name.to_string(),
            TimeRecord {
                desc: desc.to_string(),
                elapsed: Duration::ZERO,
                start: None,
                count: 0,
            },
        );
        self.ordering.push(name.to_string());
    }

    pub fn count_start(&mut self, name: &str) {
        if let Some(item) = self.items.get_mut(name) {
            item.start = Some(Instant::now());
        } else {
            println!("WARNING: count_start for unknown time record '{}'", name);
        }
    }

    pub fn count(&mut self, name: &str) {
        if let Some(item) = self.items.get_mut(name) {
            if let Some(start) = item.start.take() {
                item.elapsed += start.elapsed();
                item.count += 1;
            } else {
                println!("WARNING: count without count_start for time record '{}'", name);
            }
        } else {
            println!("WARNING: count for unknown time record '{}'", name);
        }
    }

    pub fn report(&self, name: &str) {
        if let Some(item) = self.items.get(name) {
            println!(
                "TimeRecord: {:16.8} s for {:5} counts of <{}>: {}",
                item.elapsed.as_secs_f64(),
                item.count,
                name,
                item.desc
            );
        }
    }

    pub fn report_all(&self) {
        println!("TimeRecords report:");
        for name in &self.ordering {
            self.report(name);
        }
    }
}

impl Default for TimeRecords {
    fn default() -> TimeRecords {
        TimeRecords::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_intervals() {
        let mut records = TimeRecords::new();
        records.new_item("loop", "test interval");
        for _ in 0..3 {
            records.count_start("loop");
            records.count("loop");
        }
        let item = records.items.get("loop").unwrap();
        assert_eq!(item.count, 3);
        assert!(item.start.is_none());
    }

    #[test]
    fn unknown_items_do_not_panic() {
        let mut records = TimeRecords::new();
        records.count_start("missing");
        records.count("missing");
        records.report("missing");
    }

    #[test]
    fn duplicate_new_item_keeps_first() {
        let mut records = TimeRecords::new();
        records.new_item("x", "first");
        records.new_item("x", "second");
        assert_eq!(records.items.get("x").unwrap().desc, "first");
        assert_eq!(records.ordering.len(), 1);
    }
}
