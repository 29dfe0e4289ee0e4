//! Terminal formatting helpers for progress and status output.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Compact count (e.g. 999, 1.2k, 15k)
pub fn format_count(n: u64) -> String {
    if n >= 10_000 {
        format!("{}k", n / 1000)
    } else if n >= 1000 {
        format!("{:.1}k", n as f64 / 1000.0)
    } else {
        n.to_string()
    }
}

/// Truncate string safely at char boundary
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else if max_chars <= 3 {
        s.chars().take(max_chars).collect()
    } else {
        let truncated: String = s.chars().take(max_chars - 3).collect();
        format!("{}...", truncated)
    }
}

/// Human duration: `45s`, `3m05s`, `1h02m`
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Share of `part` in `total` with one decimal; empty totals count as done
pub fn format_percent(part: usize, total: usize) -> String {
    if total == 0 {
        return "100.0%".to_string();
    }
    format!("{:.1}%", part as f64 * 100.0 / total as f64)
}

/// Animated dots spinner on stderr; silent when stderr is not a terminal
pub struct Dots {
    running: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Dots {
    pub fn start(message: &str) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        if !io::stderr().is_terminal() {
            return Self { running, handle: None };
        }

        let running_clone = running.clone();
        let msg = message.to_string();
        let handle = std::thread::spawn(move || {
            const FRAMES: &[&str] = &["\u{28CB}", "\u{28D9}", "\u{28F9}", "\u{28F8}", "\u{28FC}", "\u{28F4}"];
            let mut i = 0;
            while running_clone.load(Ordering::Relaxed) {
                eprint!("\r\x1b[36m{}\x1b[0m {}", FRAMES[i % FRAMES.len()], msg);
                let _ = io::stderr().flush();
                std::thread::sleep(Duration::from_millis(80));
                i += 1;
            }
        });

        Self {
            running,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
            eprint!("\r\x1b[K"); // Clear line
        }
    }
}

impl Drop for Dots {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_count() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1000), "1.0k");
        assert_eq!(format_count(1234), "1.2k");
        assert_eq!(format_count(15000), "15k");
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("hello", 5), "hello");
        assert_eq!(truncate_str("hello world", 8), "hello...");
        // Too short for an ellipsis
        assert_eq!(truncate_str("hello", 2), "he");
    }

    #[test]
    fn test_truncate_str_multibyte() {
        let truncated = truncate_str("你好世界测试字符串", 6);
        assert_eq!(truncated, "你好世...");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(185)), "3m05s");
        assert_eq!(format_duration(Duration::from_secs(3720)), "1h02m");
    }

    #[test]
    fn test_format_percent() {
        assert_eq!(format_percent(1, 3), "33.3%");
        assert_eq!(format_percent(0, 0), "100.0%");
    }
}
