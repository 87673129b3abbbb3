use std::time::Duration;

use rmcp::model::ErrorData as McpError;

/// Upper bound for any caller-supplied timeout.
const MAX_TOOL_TIMEOUT_SECS: f64 = 24.0 * 60.0 * 60.0;

pub(crate) const INSPECT_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn parse_timeout(
    timeout: Option<f64>,
    default: Duration,
    tool_name: &str,
) -> Result<Duration, McpError> {
    let Some(value) = timeout else {
        return Ok(default);
    };
    if !value.is_finite() || value <= 0.0 {
        return Err(McpError::invalid_params(
            format!("timeout for {tool_name} must be a positive number of seconds"),
            None,
        ));
    }
    if value > MAX_TOOL_TIMEOUT_SECS {
        return Err(McpError::invalid_params(
            format!("timeout for {tool_name} must be at most {MAX_TOOL_TIMEOUT_SECS} seconds"),
            None,
        ));
    }
    Ok(Duration::from_secs_f64(value))
}
