use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct ReportMeta {
    pub request_id: Uuid,
    pub command: &'static str,
    pub latency_ms: u64,
}

/// Everything a command prints on stdout.
#[derive(Debug, Serialize)]
pub struct CommandReport {
    pub meta: ReportMeta,
    pub data: Value,
}

impl CommandReport {
    pub fn new(request_id: Uuid, command: &'static str, elapsed: Duration, data: Value) -> Self {
        Self {
            meta: ReportMeta {
                request_id,
                command,
                latency_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            },
            data,
        }
    }
}

pub fn render(report: &CommandReport, pretty: bool) -> Result<(), CliError> {
    let payload = if pretty {
        serde_json::to_string_pretty(report)?
    } else {
        serde_json::to_string(report)?
    };
    println!("{payload}");
    Ok(())
}
