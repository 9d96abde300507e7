//! Python tool-client generation
//!
//! Turns a tool server's advertised tools into an importable Python
//! package: one module per tool with a pydantic parameter model and an
//! async wrapper that delegates to the in-container `pycell-toolcall`
//! runner, plus a package `__init__.py` holding the server parameters.
//!
//! Generation is atomic per server name: modules are rendered and written
//! to a staging directory, then swapped into place.

use std::collections::HashSet;
use std::path::Path;

use pycell_spec::{validate_server_name, ToolServerParams, TOOL_RUNNER_PATH};
use serde_json::Value;

use crate::error::{Result, ToolError};
use crate::session::ToolSession;
use crate::types::Tool;

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

const INIT_TEMPLATE: &str = r#""""Generated tool clients for the `@SERVER_NAME@` tool server."""

import asyncio
import json

SERVER_PARAMS = json.loads(r'''@SERVER_PARAMS@''')

_RUNNER = "@RUNNER@"


async def invoke_tool(tool: str, arguments: dict) -> str:
    request = json.dumps({"server": SERVER_PARAMS, "tool": tool, "arguments": arguments})
    process = await asyncio.create_subprocess_exec(
        _RUNNER,
        stdin=asyncio.subprocess.PIPE,
        stdout=asyncio.subprocess.PIPE,
        stderr=asyncio.subprocess.PIPE,
    )
    stdout, stderr = await process.communicate(request.encode())
    if process.returncode != 0:
        raise RuntimeError(stderr.decode().strip() or f"tool call {tool!r} failed")
    return json.loads(stdout)["result"]
"#;

/// Generate client modules for every tool advertised by the configured
/// server.
///
/// Modules are written under `<namespace_root>/<server_name>/`; an existing
/// package for the same server name is replaced atomically. Returns the
/// sanitized tool names in advertisement order.
pub async fn generate_tool_clients(
    params: &ToolServerParams,
    namespace_root: &Path,
    server_name: &str,
) -> Result<Vec<String>> {
    validate_server_name(server_name)?;

    let mut session = ToolSession::connect(params).await?;
    let tools = session.list_tools().await?;
    session.close().await;

    let mut files = vec![("__init__.py".to_string(), render_package_init(server_name, params))];
    let mut names = Vec::new();
    let mut seen = HashSet::new();
    for tool in &tools {
        let sanitized = sanitize_name(&tool.name);
        if !seen.insert(sanitized.clone()) {
            return Err(ToolError::UnsupportedSchema {
                tool: tool.name.clone(),
                reason: format!("sanitized name {sanitized:?} collides with another tool"),
            });
        }
        files.push((format!("{sanitized}.py"), render_tool_module(server_name, &sanitized, tool)?));
        names.push(sanitized);
    }

    write_package(namespace_root, server_name, &files).await?;
    tracing::info!(server = %server_name, tools = names.len(), "tool clients written");
    Ok(names)
}

/// Sanitize a tool name into a Python identifier: lowercased, with every
/// non-alphanumeric character mapped to an underscore
pub fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn render_package_init(server_name: &str, params: &ToolServerParams) -> String {
    let params_json =
        serde_json::to_string_pretty(params).expect("server params serialization");
    INIT_TEMPLATE
        .replace("@SERVER_NAME@", server_name)
        .replace("@SERVER_PARAMS@", &params_json)
        .replace("@RUNNER@", TOOL_RUNNER_PATH)
}

/// One field of a tool's parameter model
struct FieldSpec {
    name: String,
    py_type: String,
    required: bool,
    default: Option<String>,
    description: Option<String>,
}

fn render_tool_module(server_name: &str, sanitized: &str, tool: &Tool) -> Result<String> {
    let (fields, open) = schema_fields(&tool.name, &tool.input_schema)?;

    let uses_optional = fields.iter().any(|f| !f.required);
    let uses_any = open || fields.iter().any(|f| f.py_type.contains("Any"));

    let mut src = String::new();
    src.push_str(&format!(
        "\"\"\"Generated client for the `{}` tool of the `{}` tool server.\"\"\"\n\n",
        tool.name, server_name
    ));

    match (uses_any, uses_optional) {
        (true, true) => src.push_str("from typing import Any, Optional\n\n"),
        (true, false) => src.push_str("from typing import Any\n\n"),
        (false, true) => src.push_str("from typing import Optional\n\n"),
        (false, false) => {}
    }

    let uses_field = fields.iter().any(|f| f.description.is_some());
    let mut pydantic_imports = vec!["BaseModel"];
    if open {
        pydantic_imports.push("ConfigDict");
    }
    if uses_field {
        pydantic_imports.push("Field");
    }
    src.push_str(&format!(
        "from pydantic import {}\n\nfrom . import invoke_tool\n\n\n",
        pydantic_imports.join(", ")
    ));

    // Parameter model
    src.push_str("class Params(BaseModel):\n");
    if open {
        src.push_str("    model_config = ConfigDict(extra=\"allow\")\n");
    }
    if fields.is_empty() && !open {
        src.push_str("    pass\n");
    }
    for field in &fields {
        src.push_str(&format!("    {}\n", model_field_line(field)));
    }
    src.push('\n');

    // Async wrapper delegating to the runner
    let docstring = docstring_for(tool, server_name);
    let tool_name_literal = python_str(&tool.name);
    if open {
        src.push_str(&format!("\nasync def {sanitized}(**arguments: Any) -> str:\n"));
        src.push_str(&docstring);
        src.push_str("    params = Params(**arguments)\n");
        src.push_str(&format!(
            "    return await invoke_tool({tool_name_literal}, params.model_dump(exclude_none=True))\n"
        ));
    } else {
        let signature = signature_params(&fields);
        src.push_str(&format!("\nasync def {sanitized}({signature}) -> str:\n"));
        src.push_str(&docstring);
        let kwargs: Vec<String> = fields
            .iter()
            .map(|f| format!("{}={}", f.name, f.name))
            .collect();
        src.push_str(&format!("    params = Params({})\n", kwargs.join(", ")));
        src.push_str(&format!(
            "    return await invoke_tool({tool_name_literal}, params.model_dump(exclude_none=True))\n"
        ));
    }

    Ok(src)
}

fn model_field_line(field: &FieldSpec) -> String {
    let annotation = if field.required {
        field.py_type.clone()
    } else {
        format!("Optional[{}]", field.py_type)
    };
    let default = match (&field.default, field.required) {
        (Some(default), _) => Some(default.clone()),
        (None, false) => Some("None".to_string()),
        (None, true) => None,
    };

    match &field.description {
        Some(description) => {
            let desc = python_str(description);
            match default {
                Some(default) => format!(
                    "{}: {} = Field({}, description={})",
                    field.name, annotation, default, desc
                ),
                None => format!(
                    "{}: {} = Field(..., description={})",
                    field.name, annotation, desc
                ),
            }
        }
        None => match default {
            Some(default) => format!("{}: {} = {}", field.name, annotation, default),
            None => format!("{}: {}", field.name, annotation),
        },
    }
}

fn signature_params(fields: &[FieldSpec]) -> String {
    let mut parts = Vec::new();
    for field in fields.iter().filter(|f| f.required) {
        parts.push(format!("{}: {}", field.name, field.py_type));
    }
    for field in fields.iter().filter(|f| !f.required) {
        let default = field.default.clone().unwrap_or_else(|| "None".to_string());
        parts.push(format!(
            "{}: Optional[{}] = {}",
            field.name, field.py_type, default
        ));
    }
    parts.join(", ")
}

fn docstring_for(tool: &Tool, server_name: &str) -> String {
    let text = match tool.description.as_deref().map(str::trim) {
        Some(description) if !description.is_empty() => description.to_string(),
        _ => format!(
            "Invoke the `{}` tool of the `{}` tool server.",
            tool.name, server_name
        ),
    };
    let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
    let mut out = String::from("    \"\"\"");
    let mut lines = escaped.lines();
    if let Some(first) = lines.next() {
        out.push_str(first);
    }
    for line in lines {
        out.push('\n');
        if line.is_empty() {
            continue;
        }
        out.push_str("    ");
        out.push_str(line);
    }
    out.push_str("\"\"\"\n");
    out
}

/// Translate a tool's input schema into parameter-model fields.
///
/// Returns the fields and whether the model is open (unknown keys are
/// accepted and forwarded as-is).
fn schema_fields(tool_name: &str, schema: &Value) -> Result<(Vec<FieldSpec>, bool)> {
    let unsupported = |reason: String| ToolError::UnsupportedSchema {
        tool: tool_name.to_string(),
        reason,
    };

    let object = match schema {
        // No schema advertised: accept anything and forward as-is
        Value::Null => return Ok((Vec::new(), true)),
        Value::Object(object) => object,
        other => {
            return Err(unsupported(format!(
                "input schema must be a JSON object, got {other}"
            )))
        }
    };

    if let Some(kind) = object.get("type").and_then(Value::as_str) {
        if kind != "object" {
            return Err(unsupported(format!(
                "input schema must describe an object, got type {kind:?}"
            )));
        }
    }

    let required: HashSet<&str> = object
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let properties = object.get("properties").and_then(Value::as_object);

    // `additionalProperties: true` (or an unconstrained schema) degrades to
    // an open record
    let open = match object.get("additionalProperties") {
        Some(Value::Bool(additional)) => *additional,
        Some(Value::Object(_)) => true,
        _ => properties.is_none(),
    };

    let mut fields = Vec::new();
    if let Some(properties) = properties {
        for (name, prop) in properties {
            if !is_python_identifier(name) || PYTHON_KEYWORDS.contains(&name.as_str()) {
                return Err(unsupported(format!(
                    "property {name:?} is not usable as a Python parameter name"
                )));
            }
            fields.push(FieldSpec {
                name: name.clone(),
                py_type: python_type(prop),
                required: required.contains(name.as_str()),
                default: prop.get("default").map(python_literal),
                description: prop
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
    }

    Ok((fields, open))
}

fn python_type(prop: &Value) -> String {
    match prop.get("type").and_then(Value::as_str) {
        Some("string") => "str",
        Some("integer") => "int",
        Some("number") => "float",
        Some("boolean") => "bool",
        Some("array") => "list",
        Some("object") => "dict[str, Any]",
        _ => "Any",
    }
    .to_string()
}

fn is_python_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// Render a JSON value as a Python literal
fn python_literal(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(_) => python_str(value.as_str().unwrap_or_default()),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(python_literal).collect();
            format!("[{}]", rendered.join(", "))
        }
        Value::Object(entries) => {
            let rendered: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{}: {}", python_str(k), python_literal(v)))
                .collect();
            format!("{{{}}}", rendered.join(", "))
        }
    }
}

/// Render a string as a double-quoted Python literal. JSON string escaping
/// is a subset of Python's, so the JSON form is reused.
fn python_str(text: &str) -> String {
    serde_json::to_string(text).expect("string serialization")
}

async fn write_package(
    namespace_root: &Path,
    server_name: &str,
    files: &[(String, String)],
) -> Result<()> {
    let write_err = |e: std::io::Error| ToolError::Write {
        reason: e.to_string(),
    };

    tokio::fs::create_dir_all(namespace_root)
        .await
        .map_err(write_err)?;
    let staging = tempfile::tempdir_in(namespace_root).map_err(write_err)?;
    for (name, content) in files {
        tokio::fs::write(staging.path().join(name), content)
            .await
            .map_err(write_err)?;
    }

    let target = namespace_root.join(server_name);
    if tokio::fs::metadata(&target).await.is_ok() {
        tokio::fs::remove_dir_all(&target).await.map_err(write_err)?;
    }
    tokio::fs::rename(staging.into_path(), &target)
        .await
        .map_err(write_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pycell_spec::{RemoteServerParams, RemoteTransport, StdioServerParams};

    fn tool(name: &str, description: Option<&str>, schema: Value) -> Tool {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "description": description,
            "inputSchema": schema,
        }))
        .unwrap()
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("tool-1"), "tool_1");
        assert_eq!(sanitize_name("tool_2"), "tool_2");
        assert_eq!(sanitize_name("Tool_3"), "tool_3");
        assert_eq!(sanitize_name("tool with spaces"), "tool_with_spaces");
        assert_eq!(sanitize_name("2fast"), "_2fast");
    }

    #[test]
    fn test_package_init_stdio() {
        let params = ToolServerParams::Stdio(StdioServerParams {
            command: "python".to_string(),
            args: vec!["workspace/server.py".to_string()],
            env: Default::default(),
        });
        let init = render_package_init("test", &params);
        assert!(init.contains("SERVER_PARAMS = "));
        assert!(init.contains("\"command\": \"python\""));
        assert!(init.contains("workspace/server.py"));
        assert!(init.contains(TOOL_RUNNER_PATH));
    }

    #[test]
    fn test_package_init_remote() {
        let params = ToolServerParams::Remote(RemoteServerParams {
            transport: RemoteTransport::Sse,
            url: "http://tools.local/sse".to_string(),
        });
        let init = render_package_init("test", &params);
        assert!(init.contains("\"type\": \"sse\""));
        assert!(init.contains("http://tools.local/sse"));
    }

    #[test]
    fn test_simple_schema_module() {
        let tool = tool(
            "tool-1",
            Some("This is tool 1."),
            serde_json::json!({
                "type": "object",
                "properties": {"s": {"type": "string"}},
                "required": ["s"],
            }),
        );
        let module = render_tool_module("test", "tool_1", &tool).unwrap();
        assert!(module.contains("class Params(BaseModel):"));
        assert!(module.contains("    s: str\n"));
        assert!(module.contains("async def tool_1(s: str) -> str:"));
        assert!(module.contains("This is tool 1."));
        assert!(module.contains("invoke_tool(\"tool-1\""));
        assert!(module.contains("params.model_dump(exclude_none=True)"));
    }

    #[test]
    fn test_mixed_schema_fields() {
        let tool = tool(
            "tool_2",
            None,
            serde_json::json!({
                "type": "object",
                "properties": {
                    "s": {"type": "string"},
                    "n": {"type": "number"},
                    "b": {"type": "boolean", "default": true},
                },
                "required": ["s", "n"],
            }),
        );
        let module = render_tool_module("test", "tool_2", &tool).unwrap();
        assert!(module.contains("s: str"));
        assert!(module.contains("n: float"));
        assert!(module.contains("b: Optional[bool] = True"));
        assert!(module.contains("async def tool_2(s: str, n: float, b: Optional[bool] = True) -> str:"));
    }

    #[test]
    fn test_field_description_rendered() {
        let tool = tool(
            "lookup",
            None,
            serde_json::json!({
                "type": "object",
                "properties": {
                    "city": {"type": "string", "description": "The city to look up"},
                },
                "required": ["city"],
            }),
        );
        let module = render_tool_module("test", "lookup", &tool).unwrap();
        assert!(module.contains("city: str = Field(..., description=\"The city to look up\")"));
    }

    #[test]
    fn test_open_schema_degrades_to_kwargs() {
        let tool = tool(
            "anything",
            None,
            serde_json::json!({"type": "object", "additionalProperties": true}),
        );
        let module = render_tool_module("test", "anything", &tool).unwrap();
        assert!(module.contains("model_config = ConfigDict(extra=\"allow\")"));
        assert!(module.contains("async def anything(**arguments: Any) -> str:"));
    }

    #[test]
    fn test_docstring_triple_quotes_escaped() {
        let tool = tool(
            "tool_with_quotes",
            Some(r#"This contains """triple quotes"""."#),
            serde_json::json!({"type": "object", "properties": {}}),
        );
        let module = render_tool_module("test", "tool_with_quotes", &tool).unwrap();
        assert!(module.contains(r#"This contains \"\"\"triple quotes\"\"\"."#));
    }

    #[test]
    fn test_invalid_schema_names_tool() {
        let tool = tool("broken", None, serde_json::json!({"type": "array"}));
        let err = render_tool_module("test", "broken", &tool).unwrap_err();
        match err {
            ToolError::UnsupportedSchema { tool, reason } => {
                assert_eq!(tool, "broken");
                assert!(reason.contains("object"));
            }
            other => panic!("expected schema error, got {other}"),
        }
    }

    #[test]
    fn test_keyword_property_rejected() {
        let tool = tool(
            "broken",
            None,
            serde_json::json!({
                "type": "object",
                "properties": {"from": {"type": "string"}},
            }),
        );
        assert!(matches!(
            render_tool_module("test", "broken", &tool),
            Err(ToolError::UnsupportedSchema { .. })
        ));
    }

    #[test]
    fn test_python_literals() {
        assert_eq!(python_literal(&serde_json::json!(null)), "None");
        assert_eq!(python_literal(&serde_json::json!(true)), "True");
        assert_eq!(python_literal(&serde_json::json!(3.5)), "3.5");
        assert_eq!(python_literal(&serde_json::json!("a\"b")), r#""a\"b""#);
        assert_eq!(python_literal(&serde_json::json!([1, false])), "[1, False]");
        assert_eq!(
            python_literal(&serde_json::json!({"k": null})),
            r#"{"k": None}"#
        );
    }

    #[test]
    fn test_no_schema_is_open() {
        let tool = tool("bare", None, Value::Null);
        let module = render_tool_module("test", "bare", &tool).unwrap();
        assert!(module.contains("**arguments: Any"));
    }
}
