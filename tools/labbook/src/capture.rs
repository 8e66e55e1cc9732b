//! Console and artifact capture for a running computation.
//!
//! A [`CaptureScope`] binds a [`CaptureSink`] to the current thread for the
//! duration of one run. Code deep inside a computation can reach it through
//! the ambient [`print`], [`println`] and [`emit_artifact`] functions without
//! threading a context value through every call.

use crate::errors::LabError;
use crate::record::Artifact;
use crate::runtime::Terminal;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};

pub trait CaptureSink: Send + Sync {
    fn write_console(&self, text: &str);
    fn push_artifact(&self, artifact: Artifact);
}

#[derive(Default)]
struct BufferState {
    console: String,
    artifacts: Vec<Artifact>,
    pending_line: String,
}

/// Collects console text and artifacts in memory, optionally echoing each
/// completed console line to a terminal as it is produced.
pub struct BufferSink {
    state: Mutex<BufferState>,
    echo: Option<Arc<dyn Terminal>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            echo: None,
        }
    }

    pub fn echoing(terminal: Arc<dyn Terminal>) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            echo: Some(terminal),
        }
    }

    pub fn console(&self) -> String {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .console
            .clone()
    }

    pub fn artifact_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .artifacts
            .len()
    }

    /// Drains the buffer. An unterminated trailing line is echoed now.
    pub fn take(&self) -> (String, Vec<Artifact>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(terminal) = &self.echo {
            if !state.pending_line.is_empty() {
                let _ = terminal.write_line(&state.pending_line);
            }
        }
        state.pending_line.clear();
        (
            std::mem::take(&mut state.console),
            std::mem::take(&mut state.artifacts),
        )
    }
}

impl Default for BufferSink {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSink for BufferSink {
    fn write_console(&self, text: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.console.push_str(text);
        let Some(terminal) = &self.echo else {
            return;
        };
        state.pending_line.push_str(text);
        while let Some(pos) = state.pending_line.find('\n') {
            let line = state.pending_line[..pos].trim_end_matches('\r').to_string();
            let _ = terminal.write_line(&line);
            state.pending_line.drain(..=pos);
        }
    }

    fn push_artifact(&self, artifact: Artifact) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .artifacts
            .push(artifact);
    }
}

thread_local! {
    static ACTIVE_CAPTURE: RefCell<Option<Arc<dyn CaptureSink>>> = const { RefCell::new(None) };
}

/// Active capture on the current thread. Dropping it releases the slot.
pub struct CaptureScope {
    sink: Arc<dyn CaptureSink>,
    _thread_bound: PhantomData<Rc<()>>,
}

impl std::fmt::Debug for CaptureScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureScope").finish_non_exhaustive()
    }
}

impl CaptureScope {
    pub fn enter(sink: Arc<dyn CaptureSink>) -> Result<Self, LabError> {
        ACTIVE_CAPTURE.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return Err(LabError::CaptureConflict(
                    "a capture scope is already active on this thread".to_string(),
                ));
            }
            *slot = Some(Arc::clone(&sink));
            Ok(Self {
                sink,
                _thread_bound: PhantomData,
            })
        })
    }

    pub fn sink(&self) -> &Arc<dyn CaptureSink> {
        &self.sink
    }

    pub fn is_active() -> bool {
        ACTIVE_CAPTURE
            .try_with(|slot| slot.borrow().is_some())
            .unwrap_or(false)
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        let _ = ACTIVE_CAPTURE.try_with(|slot| slot.borrow_mut().take());
    }
}

fn active_sink() -> Option<Arc<dyn CaptureSink>> {
    ACTIVE_CAPTURE
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten()
}

/// Writes to the active capture, or to stdout when none is active.
/// Returns whether the text was captured.
///
/// The capture belongs to the thread that entered the scope. Text printed
/// from threads a computation spawns goes to stdout and is not recorded;
/// such threads should write through their `RunContext`, which may be
/// shared with them.
pub fn print(text: &str) -> bool {
    match active_sink() {
        Some(sink) => {
            sink.write_console(text);
            true
        }
        None => {
            std::print!("{text}");
            false
        }
    }
}

/// [`print`] followed by a newline. Captured only on the scope's own thread.
pub fn println(text: &str) -> bool {
    print(&format!("{text}\n"))
}

/// Hands an artifact to the active capture. Without one the artifact is
/// dropped, which includes calls from threads other than the scope's own.
pub fn emit_artifact(artifact: Artifact) -> bool {
    match active_sink() {
        Some(sink) => {
            sink.push_artifact(artifact);
            true
        }
        None => false,
    }
}

#[macro_export]
macro_rules! capture_println {
    ($($arg:tt)*) => {
        $crate::capture::println(&format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeTerminal;

    #[test]
    fn ambient_calls_reach_the_active_scope() {
        let sink = Arc::new(BufferSink::new());
        {
            let _scope = CaptureScope::enter(sink.clone()).expect("enter");
            assert!(CaptureScope::is_active());
            assert!(print("a"));
            assert!(println("b"));
            assert!(crate::capture_println!("step {}", 3));
            assert!(emit_artifact(Artifact::text("plot")));
        }
        assert!(!CaptureScope::is_active());
        assert!(!emit_artifact(Artifact::text("lost")));

        let (console, artifacts) = sink.take();
        assert_eq!(console, "ab\nstep 3\n");
        assert_eq!(artifacts.len(), 1);
    }

    #[test]
    fn nested_scope_on_one_thread_is_a_conflict() {
        let _outer = CaptureScope::enter(Arc::new(BufferSink::new())).expect("outer");
        let err = CaptureScope::enter(Arc::new(BufferSink::new())).expect_err("inner");
        assert!(matches!(err, LabError::CaptureConflict(_)));
    }

    #[test]
    fn scopes_on_different_threads_are_independent() {
        let _here = CaptureScope::enter(Arc::new(BufferSink::new())).expect("here");
        let other = std::thread::spawn(|| {
            let sink = Arc::new(BufferSink::new());
            let _there = CaptureScope::enter(sink.clone()).expect("there");
            println("from thread");
            sink.console()
        })
        .join()
        .expect("join");
        assert_eq!(other, "from thread\n");
    }

    #[test]
    fn spawned_threads_do_not_inherit_the_scope() {
        let sink = Arc::new(BufferSink::new());
        let _scope = CaptureScope::enter(sink.clone()).expect("enter");
        let (printed, emitted) = std::thread::spawn(|| {
            (println("from a worker"), emit_artifact(Artifact::text("lost")))
        })
        .join()
        .expect("join");
        assert!(!printed);
        assert!(!emitted);
        assert!(println("from the owner"));

        let (console, artifacts) = sink.take();
        assert_eq!(console, "from the owner\n");
        assert!(artifacts.is_empty());
    }

    #[test]
    fn echo_forwards_complete_lines_and_flushes_the_tail() {
        let terminal = Arc::new(FakeTerminal::new(false));
        let sink = BufferSink::echoing(terminal.clone());
        sink.write_console("one\ntw");
        assert_eq!(terminal.written_lines(), vec!["one".to_string()]);
        sink.write_console("o\nthree");
        let (console, _) = sink.take();
        assert_eq!(console, "one\ntwo\nthree");
        assert_eq!(
            terminal.written_lines(),
            vec!["one".to_string(), "two".to_string(), "three".to_string()]
        );
    }
}
