//! Operations in progress.
//!
//! An operation in progress is a monitor over an underlying operation,
//! used to expose the status of long-running work (plugin installs,
//! downloads) in a standard way.
//!
//! State always follows the sequence waiting -> progress -> success|fail.
//! An operation with sub-operations completes only after all of its
//! sub-operations have completed. Sub-operations can be added but never
//! removed.

use std::sync::{Arc, Mutex};

/// State of an operation in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OipState {
    Waiting,
    Progress,
    Success,
    Fail,
}

impl OipState {
    fn as_str(&self) -> &'static str {
        match self {
            OipState::Waiting => "waiting",
            OipState::Progress => "progress",
            OipState::Success => "success",
            OipState::Fail => "fail",
        }
    }
}

#[derive(Debug)]
struct OipInner {
    label: Option<String>,
    state: OipState,
    current: Option<u64>,
    end: Option<u64>,
    sub_oips: Vec<OperationInProgress>,
}

/// Shared handle over an operation in progress.
///
/// Cloning the handle shares the underlying monitor, so a background task
/// can advance the state while observers format it.
#[derive(Debug, Clone)]
pub struct OperationInProgress {
    inner: Arc<Mutex<OipInner>>,
}

impl OperationInProgress {
    pub fn new(label: impl Into<String>, state: OipState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OipInner {
                label: Some(label.into()),
                state,
                current: None,
                end: None,
                sub_oips: Vec::new(),
            })),
        }
    }

    pub fn unlabeled(state: OipState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OipInner {
                label: None,
                state,
                current: None,
                end: None,
                sub_oips: Vec::new(),
            })),
        }
    }

    pub fn state(&self) -> OipState {
        self.inner.lock().expect("oip lock poisoned").state
    }

    pub fn set_state(&self, state: OipState) {
        self.inner.lock().expect("oip lock poisoned").state = state;
    }

    pub fn set_label(&self, label: impl Into<String>) {
        self.inner.lock().expect("oip lock poisoned").label = Some(label.into());
    }

    pub fn set_end(&self, end: Option<u64>) {
        self.inner.lock().expect("oip lock poisoned").end = end;
    }

    pub fn set_current(&self, current: u64) {
        self.inner.lock().expect("oip lock poisoned").current = Some(current);
    }

    /// Add `amount` to the current counter, starting from zero.
    pub fn advance(&self, amount: u64) {
        let mut inner = self.inner.lock().expect("oip lock poisoned");
        inner.current = Some(inner.current.unwrap_or(0) + amount);
    }

    /// Attach a sub-operation. Sub-operations are never removed.
    pub fn push_sub_oip(&self, sub: OperationInProgress) {
        self.inner
            .lock()
            .expect("oip lock poisoned")
            .sub_oips
            .push(sub);
    }

    /// Format the operation to its wire representation.
    ///
    /// The format is `[label|]state[;current[/end]](sub)...`, for example
    /// `install|progress(download|progress;10/100)`.
    pub fn format(&self) -> String {
        let inner = self.inner.lock().expect("oip lock poisoned");
        let mut s = String::new();
        if let Some(label) = &inner.label {
            s.push_str(label);
            s.push('|');
        }
        s.push_str(inner.state.as_str());
        if let Some(current) = inner.current {
            s.push_str(&format!(";{current}"));
            if let Some(end) = inner.end {
                if end > 0 {
                    s.push_str(&format!("/{end}"));
                }
            }
        }
        for sub in &inner.sub_oips {
            s.push('(');
            s.push_str(&sub.format());
            s.push(')');
        }
        s
    }
}
