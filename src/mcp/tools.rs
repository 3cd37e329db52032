use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{McpError, McpToolDefinition, INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::handlers::{error_json, CommandHandler, CreateRequest, SnapshotAction};
use crate::vm::error::Result;

pub fn definitions() -> Vec<McpToolDefinition> {
    let name_only = json!({
        "type": "object",
        "properties": { "name": { "type": "string", "description": "VM name" } },
        "required": ["name"]
    });
    vec![
        McpToolDefinition {
            name: "vm_list",
            description: "List all virtual machines with their state and backend",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        McpToolDefinition {
            name: "vm_info",
            description: "Show details of one virtual machine",
            input_schema: name_only.clone(),
        },
        McpToolDefinition {
            name: "vm_create",
            description: "Create a virtual machine from an ISO, a template or an OS type",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "os_type": { "type": "string" },
                    "template": { "type": "string" },
                    "iso": { "type": "string" },
                    "ram": { "type": "string", "description": "e.g. 4G" },
                    "cpus": { "type": "integer", "minimum": 1 },
                    "disk_size": { "type": "string", "description": "e.g. 40G" },
                    "network": { "type": "string", "enum": ["nat", "bridge", "host"] },
                    "post_create": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["name"]
            }),
        },
        McpToolDefinition {
            name: "vm_start",
            description: "Start a virtual machine, optionally waiting for SSH",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "wait_ssh": { "type": "boolean", "default": false }
                },
                "required": ["name"]
            }),
        },
        McpToolDefinition {
            name: "vm_stop",
            description: "Stop a virtual machine gracefully, or immediately with force",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "force": { "type": "boolean", "default": false }
                },
                "required": ["name"]
            }),
        },
        McpToolDefinition {
            name: "vm_restart",
            description: "Restart a virtual machine",
            input_schema: name_only.clone(),
        },
        McpToolDefinition {
            name: "vm_delete",
            description: "Delete a virtual machine, optionally keeping its disk",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "keep_disk": { "type": "boolean", "default": false }
                },
                "required": ["name"]
            }),
        },
        McpToolDefinition {
            name: "vm_snapshot",
            description: "Create, restore, list or delete snapshots of a virtual machine",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "action": { "type": "string", "enum": ["create", "restore", "list", "delete"] },
                    "snapshot": { "type": "string" },
                    "description": { "type": "string" }
                },
                "required": ["name", "action"]
            }),
        },
        McpToolDefinition {
            name: "vm_ssh_check",
            description: "Check whether a virtual machine accepts SSH connections",
            input_schema: name_only,
        },
    ]
}

#[derive(Deserialize)]
struct NameArgs {
    name: String,
}

#[derive(Deserialize)]
struct StartArgs {
    name: String,
    #[serde(default)]
    wait_ssh: bool,
}

#[derive(Deserialize)]
struct StopArgs {
    name: String,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
struct DeleteArgs {
    name: String,
    #[serde(default)]
    keep_disk: bool,
}

#[derive(Deserialize)]
struct SnapshotArgs {
    name: String,
    action: SnapshotAction,
    snapshot: Option<String>,
    description: Option<String>,
}

fn parse<T: for<'de> Deserialize<'de>>(tool: &str, args: &Value) -> std::result::Result<T, McpError> {
    serde_json::from_value(args.clone())
        .map_err(|e| McpError::new(INVALID_PARAMS, format!("invalid arguments for {tool}: {e}")))
}

fn payload<T: serde::Serialize>(key: &str, result: Result<T>) -> Value {
    match result {
        Ok(value) => json!({ "success": true, key: value }),
        Err(e) => json!({ "success": false, "error": error_json(&e) }),
    }
}

/// Run one tool. Operation failures are part of the payload
/// (`success: false`); only unknown tools and malformed arguments are
/// protocol errors.
pub async fn call(handler: &CommandHandler, tool: &str, args: &Value) -> std::result::Result<Value, McpError> {
    debug!("tools/call {} {}", tool, args);
    let value = match tool {
        "vm_list" => payload("vms", handler.list().await),
        "vm_info" => {
            let a: NameArgs = parse(tool, args)?;
            payload("vm", handler.info(&a.name).await)
        }
        "vm_create" => {
            let request: CreateRequest = parse(tool, args)?;
            if request.name.is_empty() {
                return Err(McpError::new(INVALID_PARAMS, "vm_create requires a name"));
            }
            let name = request.name.clone();
            let result = handler.create(request).await;
            let mut v = payload("backend", result);
            v["name"] = json!(name);
            v
        }
        "vm_start" => {
            let a: StartArgs = parse(tool, args)?;
            payload("backend", handler.start(&a.name, a.wait_ssh).await)
        }
        "vm_stop" => {
            let a: StopArgs = parse(tool, args)?;
            payload("backend", handler.stop(&a.name, a.force).await)
        }
        "vm_restart" => {
            let a: NameArgs = parse(tool, args)?;
            payload("backend", handler.restart(&a.name).await)
        }
        "vm_delete" => {
            let a: DeleteArgs = parse(tool, args)?;
            let result = handler.delete(&a.name, a.keep_disk).await.map(|owner| match owner {
                crate::vm::registry::Owner::Backend(kind) => kind.to_string(),
                crate::vm::registry::Owner::Filesystem => "filesystem".to_string(),
            });
            payload("backend", result)
        }
        "vm_snapshot" => {
            let a: SnapshotArgs = parse(tool, args)?;
            payload(
                "result",
                handler
                    .snapshot(&a.name, a.action, a.snapshot.as_deref(), a.description)
                    .await,
            )
        }
        "vm_ssh_check" => {
            let a: NameArgs = parse(tool, args)?;
            payload("ready", handler.ssh_check(&a.name).await)
        }
        other => {
            return Err(McpError::new(METHOD_NOT_FOUND, format!("unknown tool: {other}")));
        }
    };
    Ok(value)
}

/// Wrap a tool payload in the MCP `tools/call` result shape.
pub fn tool_result(payload: Value) -> Value {
    let is_error = payload["success"] == json!(false);
    let text = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string());
    json!({
        "content": [{ "type": "text", "text": text }],
        "structuredContent": payload,
        "isError": is_error,
    })
}
