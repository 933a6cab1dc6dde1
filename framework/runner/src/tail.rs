use std::collections::VecDeque;

/// Keeps the most recent engine output up to a byte budget, whole lines at a time.
#[derive(Debug)]
pub struct OutputTail {
    capacity: usize,
    lines: VecDeque<String>,
    bytes: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: VecDeque::new(),
            bytes: 0,
        }
    }

    pub fn push(&mut self, line: &str) {
        let mut line = line.to_string();
        if line.len() > self.capacity {
            // Keep the end of an oversized line, on a char boundary
            let mut start = line.len() - self.capacity;
            while !line.is_char_boundary(start) {
                start += 1;
            }
            line = line.split_off(start);
        }

        self.bytes += line.len() + 1;
        self.lines.push_back(line);

        while self.bytes > self.capacity + 1 {
            match self.lines.pop_front() {
                Some(evicted) => self.bytes -= evicted.len() + 1,
                None => break,
            }
        }
    }

    pub fn contents(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    /// The last `count` lines, used as the fragment attached to an error.
    pub fn last_lines(&self, count: usize) -> String {
        let skip = self.lines.len().saturating_sub(count);
        self.lines
            .iter()
            .skip(skip)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|line| line.contains(needle))
    }
}
