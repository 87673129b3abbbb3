use crate::classify;
use crate::kernel_protocol::{ExecutionFailure, ExecutionResult, ResultEvent};

/// Everything the drain loop collected for one request.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    pub events: Vec<ResultEvent>,
    pub failure: Option<ExecutionFailure>,
    pub failure_remediation: Vec<String>,
    /// Late or malformed messages dropped while this request was in flight.
    pub skipped_messages: u64,
}

/// Builds the result envelope. Event order is kept; adjacent chunks on the
/// same stream are merged.
pub fn normalize(outcome: DrainOutcome, execution_count: u64) -> ExecutionResult {
    let DrainOutcome {
        events,
        failure,
        failure_remediation,
        skipped_messages,
    } = outcome;

    let outputs = coalesce_streams(events);
    let classification = outputs.iter().find_map(|event| match event {
        ResultEvent::Error {
            ename,
            evalue,
            traceback,
        } => Some(classify::classify(ename, evalue, traceback)),
        _ => None,
    });
    let has_error = classification.is_some() || failure.is_some();

    let remediation = if has_error {
        let mut hints = classification
            .as_ref()
            .map(|classification| classification.remediation.clone())
            .unwrap_or_default();
        hints.extend(failure_remediation);
        Some(hints)
    } else {
        None
    };

    ExecutionResult {
        execution_count,
        outputs,
        has_error,
        remediation,
        classification,
        failure,
        skipped_messages,
    }
}

fn coalesce_streams(events: Vec<ResultEvent>) -> Vec<ResultEvent> {
    let mut merged: Vec<ResultEvent> = Vec::with_capacity(events.len());
    for event in events {
        if let ResultEvent::Stream { name, text } = &event
            && let Some(ResultEvent::Stream {
                name: last_name,
                text: last_text,
            }) = merged.last_mut()
            && last_name == name
        {
            last_text.push_str(text);
            continue;
        }
        merged.push(event);
    }
    merged
}
