use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const TASK_DOWNLOAD: &str = "Download";
pub const TASK_CHECKSUM: &str = "Compute MD5Sum";
pub const TASK_EXTRACT: &str = "Extract";

/// Bytes between two debug lines when a task has no known total.
const UNBOUNDED_LOG_STEP: u64 = 64 * 1024 * 1024;

pub type TaskId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started {
        task: TaskId,
        label: &'static str,
        name: String,
        /// `None` renders as an indeterminate task.
        total: Option<u64>,
    },
    Advanced {
        task: TaskId,
        done: u64,
    },
    Finished {
        task: TaskId,
        done: u64,
    },
}

/// Push-only consumer of engine progress. Implementations are called from
/// worker threads and must return quickly.
pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);

    /// Called once when a batch ends, on every exit path.
    fn flush(&self) {}
}

pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn event(&self, _event: ProgressEvent) {}
}

/// Hands out task handles that report to one sink.
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn ProgressSink>,
    next_task: Arc<AtomicU64>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            next_task: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn silent() -> Self {
        Self::new(Arc::new(NoopProgress))
    }

    pub fn task(&self, label: &'static str, name: &str, total: Option<u64>) -> ProgressTask<'_> {
        let id = self.next_task.fetch_add(1, Ordering::Relaxed);
        self.sink.event(ProgressEvent::Started {
            task: id,
            label,
            name: name.to_string(),
            total,
        });
        ProgressTask {
            reporter: self,
            id,
            done: 0,
            finished: false,
        }
    }

    pub fn flush(&self) {
        self.sink.flush();
    }
}

pub struct ProgressTask<'a> {
    reporter: &'a Reporter,
    id: TaskId,
    done: u64,
    finished: bool,
}

impl ProgressTask<'_> {
    pub fn done(&self) -> u64 {
        self.done
    }

    pub fn advance(&mut self, bytes: u64) {
        self.done = self.done.saturating_add(bytes);
        self.reporter.sink.event(ProgressEvent::Advanced {
            task: self.id,
            done: self.done,
        });
    }

    pub fn finish(mut self) {
        self.emit_finished();
    }

    fn emit_finished(&mut self) {
        if !self.finished {
            self.finished = true;
            self.reporter.sink.event(ProgressEvent::Finished {
                task: self.id,
                done: self.done,
            });
        }
    }
}

impl Drop for ProgressTask<'_> {
    fn drop(&mut self) {
        self.emit_finished();
    }
}

/// Reader adapter that advances a task by every byte read.
pub struct ProgressReader<'a, R> {
    inner: R,
    task: ProgressTask<'a>,
}

impl<'a, R: Read> ProgressReader<'a, R> {
    pub fn new(inner: R, task: ProgressTask<'a>) -> Self {
        Self { inner, task }
    }
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        if read > 0 {
            self.task.advance(read as u64);
        }
        Ok(read)
    }
}

struct LoggedTask {
    label: &'static str,
    name: String,
    total: Option<u64>,
    last_logged: u64,
}

/// Renders progress as `tracing` events: start and finish at info, coarse
/// advancement at debug.
#[derive(Default)]
pub struct TracingProgress {
    tasks: Mutex<HashMap<TaskId, LoggedTask>>,
}

impl TracingProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for TracingProgress {
    fn event(&self, event: ProgressEvent) {
        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        match event {
            ProgressEvent::Started {
                task,
                label,
                name,
                total,
            } => {
                tracing::info!(task, total = ?total, "{label} {name}");
                tasks.insert(
                    task,
                    LoggedTask {
                        label,
                        name,
                        total,
                        last_logged: 0,
                    },
                );
            }
            ProgressEvent::Advanced { task, done } => {
                let Some(state) = tasks.get_mut(&task) else {
                    return;
                };
                let step = match state.total {
                    Some(total) => (total / 10).max(1),
                    None => UNBOUNDED_LOG_STEP,
                };
                if done.saturating_sub(state.last_logged) >= step {
                    state.last_logged = done;
                    match state.total {
                        Some(total) => tracing::debug!(
                            task,
                            "{} {}: {done}/{total} bytes ({:.0}%)",
                            state.label,
                            state.name,
                            done as f64 * 100.0 / total.max(1) as f64
                        ),
                        None => {
                            tracing::debug!(task, "{} {}: {done} bytes", state.label, state.name)
                        }
                    }
                }
            }
            ProgressEvent::Finished { task, done } => {
                if let Some(state) = tasks.remove(&task) {
                    tracing::info!(task, bytes = done, "{} {} finished", state.label, state.name);
                }
            }
        }
    }
}
