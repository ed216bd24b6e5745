//! Managed dev-server process tools.

use std::collections::HashMap;
use std::path::PathBuf;

use pagebridge_mcp_types::CallToolResult;
use pagebridge_mcp_types::Tool;
use pagebridge_procman::StartRequest;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;

use super::ToolKit;
use super::browser::parse_args;
use super::json_result;
use super::tool;

type Result<T> = std::result::Result<T, String>;

pub(crate) fn definitions() -> Vec<Tool> {
    vec![
        tool(
            "process_start",
            "Start a long-running dev-server process under an agent-supplied id.",
            json!({
                "id": {"type": "string"},
                "command": {"type": "string"},
                "args": {"type": "array", "items": {"type": "string"}},
                "cwd": {"type": "string"},
                "env": {"type": "object"},
            }),
            &["id", "command"],
        ),
        tool(
            "process_stop",
            "Stop a managed process (tree-terminate with a bounded grace period).",
            json!({"id": {"type": "string"}}),
            &["id"],
        ),
        tool(
            "process_list",
            "List managed processes with pid, liveness and retained exit status.",
            json!({}),
            &[],
        ),
        tool(
            "process_logs",
            "Read a managed process's buffered stdout/stderr lines, optionally clearing the buffer.",
            json!({
                "id": {"type": "string"},
                "clear": {"type": "boolean"},
            }),
            &["id"],
        ),
    ]
}

#[derive(Deserialize)]
struct StartArgs {
    id: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
}

pub(crate) async fn start(kit: &ToolKit, arguments: &Value) -> Result<CallToolResult> {
    let args: StartArgs = parse_args(arguments)?;
    let descriptor = kit
        .processes
        .start(StartRequest {
            id: args.id,
            command: args.command,
            args: args.args,
            cwd: args.cwd,
            env: args.env,
        })
        .await
        .map_err(|e| e.to_string())?;
    Ok(json_result(json!({"success": true, "process": descriptor})))
}

#[derive(Deserialize)]
struct IdArgs {
    id: String,
}

pub(crate) async fn stop(kit: &ToolKit, arguments: &Value) -> Result<CallToolResult> {
    let args: IdArgs = parse_args(arguments)?;
    let descriptor = kit
        .processes
        .stop(&args.id)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json_result(json!({"success": true, "process": descriptor})))
}

pub(crate) async fn list(kit: &ToolKit) -> Result<CallToolResult> {
    let processes = kit.processes.list().await;
    Ok(json_result(json!({
        "count": processes.len(),
        "processes": processes,
    })))
}

#[derive(Deserialize)]
struct LogsArgs {
    id: String,
    #[serde(default)]
    clear: bool,
}

pub(crate) async fn logs(kit: &ToolKit, arguments: &Value) -> Result<CallToolResult> {
    let args: LogsArgs = parse_args(arguments)?;
    let logs = kit
        .processes
        .logs(&args.id, args.clear)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json_result(json!({
        "id": args.id,
        "stdoutLines": logs.stdout_lines,
        "stderrLines": logs.stderr_lines,
    })))
}
