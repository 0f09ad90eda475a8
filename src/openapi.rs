//! OpenAPI 3.1 document generation from a merged tool list.
//!
//! Each tool becomes one path `/{toolName}` mounted under
//! `/metamcp/{endpoint}/api`. Tools that declare input properties are
//! exposed as `post` with the tool's input schema as the request body;
//! parameterless tools are `get`. The output is byte-stable for identical
//! tool lists: tools are sorted by name and the JSON map ordering is
//! deterministic.

use rmcp::model::Tool;
use serde_json::{json, Map, Value};

pub fn openapi_document(endpoint: &str, tools: &[Tool]) -> Value {
    let mut sorted: Vec<&Tool> = tools.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut paths = Map::new();
    for tool in sorted {
        let input_schema = Value::Object(tool.input_schema.as_ref().clone());
        let has_input = tool
            .input_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| !props.is_empty())
            .unwrap_or(false);

        let mut operation = Map::new();
        operation.insert("operationId".to_string(), json!(tool.name));
        if let Some(description) = &tool.description {
            operation.insert("description".to_string(), json!(description));
        }
        if has_input {
            operation.insert(
                "requestBody".to_string(),
                json!({
                    "required": true,
                    "content": {
                        "application/json": { "schema": input_schema }
                    }
                }),
            );
        }
        operation.insert(
            "responses".to_string(),
            json!({
                "200": {
                    "description": "Successful Response",
                    "content": { "application/json": { "schema": {} } }
                },
                "422": {
                    "description": "Validation Error",
                    "content": {
                        "application/json": {
                            "schema": { "$ref": "#/components/schemas/HTTPValidationError" }
                        }
                    }
                }
            }),
        );

        let method = if has_input { "post" } else { "get" };
        paths.insert(
            format!("/{}", tool.name),
            Value::Object({
                let mut item = Map::new();
                item.insert(method.to_string(), Value::Object(operation));
                item
            }),
        );
    }

    json!({
        "openapi": "3.1.0",
        "info": {
            "title": endpoint,
            "version": "1.0.0"
        },
        "servers": [
            { "url": format!("/metamcp/{endpoint}/api") }
        ],
        "paths": paths,
        "components": {
            "schemas": {
                "HTTPValidationError": {
                    "title": "HTTPValidationError",
                    "type": "object",
                    "properties": {
                        "detail": {
                            "title": "Detail",
                            "type": "array",
                            "items": { "$ref": "#/components/schemas/ValidationError" }
                        }
                    }
                },
                "ValidationError": {
                    "title": "ValidationError",
                    "type": "object",
                    "required": ["loc", "msg", "type"],
                    "properties": {
                        "loc": {
                            "title": "Location",
                            "type": "array",
                            "items": { "anyOf": [ { "type": "string" }, { "type": "integer" } ] }
                        },
                        "msg": { "title": "Message", "type": "string" },
                        "type": { "title": "Error Type", "type": "string" }
                    }
                }
            }
        }
    })
}
