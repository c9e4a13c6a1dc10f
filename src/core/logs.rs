//! Log reader - Tail of an app's log file with an optional filter

use std::collections::VecDeque;
use std::path::Path;

use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

pub const DEFAULT_LOG_LINES: usize = 100;

/// The tail of a log file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogTail {
    pub lines: Vec<String>,
    /// Lines that matched the filter, before the tail was taken
    pub total: usize,
    pub returned: usize,
}

impl LogTail {
    fn empty() -> Self {
        Self {
            lines: Vec::new(),
            total: 0,
            returned: 0,
        }
    }
}

/// Last `lines` lines of `path`, keeping only those containing `search`
/// (case-insensitive). A missing file reads as empty.
///
/// The file is streamed line by line; at most `lines` are held in memory.
pub async fn read_tail(
    path: &Path,
    lines: Option<usize>,
    search: Option<&str>,
    max_lines: usize,
) -> std::io::Result<LogTail> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogTail::empty()),
        Err(e) => return Err(e),
    };

    let mut reader = BufReader::new(file);
    let mut tail = Tail::new(lines, search, max_lines);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        tail.push(line.trim_end_matches(['\n', '\r']));
    }
    Ok(tail.finish())
}

/// Bounded accumulator for the last matching lines
struct Tail {
    limit: usize,
    needle: Option<String>,
    kept: VecDeque<String>,
    total: usize,
}

impl Tail {
    fn new(lines: Option<usize>, search: Option<&str>, max_lines: usize) -> Self {
        let limit = lines.unwrap_or(DEFAULT_LOG_LINES).min(max_lines);
        let needle = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);
        Self {
            limit,
            needle,
            kept: VecDeque::with_capacity(limit.min(1024)),
            total: 0,
        }
    }

    fn push(&mut self, line: &str) {
        if let Some(needle) = &self.needle {
            if !line.to_lowercase().contains(needle) {
                return;
            }
        }
        self.total += 1;
        if self.limit == 0 {
            return;
        }
        if self.kept.len() == self.limit {
            self.kept.pop_front();
        }
        self.kept.push_back(line.to_string());
    }

    fn finish(self) -> LogTail {
        let lines: Vec<String> = self.kept.into();
        LogTail {
            returned: lines.len(),
            lines,
            total: self.total,
        }
    }
}
