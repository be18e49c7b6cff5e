//! Human-readable progress output.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Append-only sink for progress lines. The default sink discards output.
#[derive(Clone, Default)]
pub struct ProgressSink {
    out: Option<Arc<Mutex<Box<dyn Write + Send>>>>,
}

impl ProgressSink {
    /// A sink that discards everything.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Some(Arc::new(Mutex::new(Box::new(out)))),
        }
    }

    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }

    pub fn is_enabled(&self) -> bool {
        self.out.is_some()
    }

    /// Write one line.
    pub fn line(&self, text: &str) {
        let Some(out) = &self.out else {
            return;
        };
        let mut out = out.lock().unwrap_or_else(|e| e.into_inner());
        // Write errors are ignored.
        let _ = writeln!(out, "{text}");
        let _ = out.flush();
    }

    /// Start a task of `total` units.
    pub fn begin_task(&self, title: impl Into<String>, total: usize) -> ProgressTask {
        ProgressTask {
            sink: self.clone(),
            title: title.into(),
            total,
            done: AtomicUsize::new(0),
        }
    }
}

/// Progress of one task; prints a line whenever it advances.
pub struct ProgressTask {
    sink: ProgressSink,
    title: String,
    total: usize,
    done: AtomicUsize,
}

impl ProgressTask {
    pub fn update(&self, n: usize) {
        let done = self.done.fetch_add(n, Ordering::Relaxed) + n;
        if self.sink.is_enabled() {
            self.sink
                .line(&format!("{}: {}/{}", self.title, done, self.total));
        }
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::Relaxed)
    }

    /// Finish the task.
    pub fn end(&self) {
        if self.sink.is_enabled() {
            self.sink.line(&format!("{}: done", self.title));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_task_lines() {
        let buf = Buffer::default();
        let sink = ProgressSink::new(buf.clone());
        let task = sink.begin_task("Rebuilding p", 2);
        task.update(1);
        task.update(1);
        assert_eq!(task.done(), 2);
        task.end();

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(
            text,
            "Rebuilding p: 1/2\nRebuilding p: 2/2\nRebuilding p: done\n"
        );
    }

    #[test]
    fn test_none_discards() {
        let task = ProgressSink::none().begin_task("t", 1);
        task.update(1);
        task.end();
    }
}
