//! Tool call timing with START/END events and a parent/child call stack.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::text::truncate_chars;
use crate::core::types::LogLevel;
use crate::observe::entry::LogEntry;
use crate::observe::multiplexer::ObservabilityMultiplexer;

const COMPONENT: &str = "ToolCall";
const ARGS_PREVIEW_CHARS: usize = 100;

/// One recorded tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEvent {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub parent_call_id: Option<String>,
    pub result: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

/// Returned by [`ToolCallTracker::start_call`]; pass it back to `end_call`.
#[derive(Debug)]
pub struct ToolCallHandle {
    call_id: String,
    started: Instant,
}

impl ToolCallHandle {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolStats {
    pub count: u64,
    pub total_ms: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub total_calls: u64,
    pub successful: u64,
    pub failed: u64,
    pub total_duration_ms: u64,
    pub by_tool: BTreeMap<String, ToolStats>,
}

#[derive(Default)]
struct TrackerState {
    stack: Vec<String>,
    calls: Vec<ToolCallEvent>,
}

pub struct ToolCallTracker {
    mux: Arc<ObservabilityMultiplexer>,
    state: Mutex<TrackerState>,
}

impl ToolCallTracker {
    pub fn new(mux: Arc<ObservabilityMultiplexer>) -> Self {
        Self {
            mux,
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the start of a call. The innermost unfinished call becomes its
    /// parent.
    pub fn start_call(&self, tool_name: &str, arguments: Value) -> ToolCallHandle {
        let call_id = Uuid::new_v4().to_string();
        let args_preview = truncate_chars(&arguments.to_string(), ARGS_PREVIEW_CHARS).to_string();
        {
            let mut state = self.lock();
            let parent_call_id = state.stack.last().cloned();
            state.calls.push(ToolCallEvent {
                call_id: call_id.clone(),
                tool_name: tool_name.to_string(),
                arguments,
                started_at: Utc::now(),
                ended_at: None,
                duration_ms: None,
                parent_call_id,
                result: None,
                success: true,
                error: None,
            });
            state.stack.push(call_id.clone());
        }

        self.mux.emit(
            LogEntry::new(LogLevel::Info, COMPONENT, format!("START {tool_name}"))
                .with_meta("tool_name", tool_name)
                .with_meta("call_id", call_id.as_str())
                .with_meta("args_preview", args_preview),
        );

        ToolCallHandle {
            call_id,
            started: Instant::now(),
        }
    }

    /// Close a call. The stack is popped only when this call is on top, so
    /// out-of-order ends leave the stack intact.
    ///
    /// Returns the completed event, or `None` if the call is unknown (for
    /// example after [`reset`](Self::reset)).
    pub fn end_call(
        &self,
        handle: ToolCallHandle,
        result: Option<&str>,
        success: bool,
        error: Option<&str>,
    ) -> Option<ToolCallEvent> {
        let duration_ms = u64::try_from(handle.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let event = {
            let mut state = self.lock();
            let event = state
                .calls
                .iter_mut()
                .rev()
                .find(|call| call.call_id == handle.call_id)?;
            event.ended_at = Some(Utc::now());
            event.duration_ms = Some(duration_ms);
            event.result = result.map(str::to_string);
            event.success = success;
            event.error = error.map(str::to_string);
            let event = event.clone();
            if state.stack.last() == Some(&handle.call_id) {
                state.stack.pop();
            }
            event
        };

        let status = if success { "SUCCESS" } else { "FAILED" };
        let mut entry = LogEntry::new(
            LogLevel::Info,
            COMPONENT,
            format!("END {} [{status}] ({duration_ms}ms)", event.tool_name),
        )
        .with_meta("tool_name", event.tool_name.as_str())
        .with_meta("call_id", event.call_id.as_str())
        .with_meta("duration_ms", duration_ms)
        .with_meta("success", success);
        if let Some(error) = error {
            entry = entry.with_meta("error", error);
        }
        self.mux.emit(entry);
        Some(event)
    }

    /// Innermost unfinished call.
    pub fn current_call(&self) -> Option<ToolCallEvent> {
        let state = self.lock();
        let top = state.stack.last()?;
        state.calls.iter().rev().find(|call| &call.call_id == top).cloned()
    }

    pub fn depth(&self) -> usize {
        self.lock().stack.len()
    }

    pub fn all_calls(&self) -> Vec<ToolCallEvent> {
        self.lock().calls.clone()
    }

    pub fn summary(&self) -> ToolCallSummary {
        let state = self.lock();
        let mut summary = ToolCallSummary::default();
        for call in &state.calls {
            let duration = call.duration_ms.unwrap_or(0);
            summary.total_calls += 1;
            summary.total_duration_ms += duration;
            let stats = summary.by_tool.entry(call.tool_name.clone()).or_default();
            stats.count += 1;
            stats.total_ms += duration;
            if call.success {
                summary.successful += 1;
            } else {
                summary.failed += 1;
                stats.failed += 1;
            }
        }
        summary
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.stack.clear();
        state.calls.clear();
    }
}
