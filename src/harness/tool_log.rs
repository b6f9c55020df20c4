use std::collections::VecDeque;
use std::sync::Mutex;

/// Rolling window over the agent's most recent stderr lines
#[derive(Debug)]
pub struct ToolLog {
    capacity: usize,
    entries: Mutex<VecDeque<String>>,
}

impl ToolLog {
    pub const DEFAULT_CAPACITY: usize = 4;

    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a line, evicting the oldest once full; blank lines are ignored
    pub fn push(&self, line: &str) {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return;
        }

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(line.to_string());
    }

    /// Oldest first
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Default for ToolLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
