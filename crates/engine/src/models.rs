//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow looks like in
//! memory. The serialised form is the camelCase JSON shape produced by the
//! editor (and by the workflow generator upstream of us):
//!
//! ```json
//! { "id": "n1", "title": "Post", "type": "action",
//!   "config": { "service": "slack", "action": "post", "parameters": { .. } } }
//! ```
//!
//! Node configuration is converted into a typed [`StepKind`] when the JSON is
//! parsed, so the rest of the engine never has to re-check which fields a
//! node type carries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GraphError;
use crate::schema::ObjectSchema;

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A complete workflow definition: nodes plus the connections between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl WorkflowDefinition {
    /// Convenience constructor for testing.
    pub fn new(id: impl Into<String>, nodes: Vec<Node>, connections: Vec<Connection>) -> Self {
        Self {
            id: id.into(),
            name: None,
            nodes,
            connections,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Directed edge from one node to another, optionally gated by a condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Connection {
    /// An unconditional dependency.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: None,
        }
    }

    /// A dependency that only activates when `condition` holds.
    pub fn when(
        source: impl Into<String>,
        target: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: Some(condition.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// The three node types an editor can place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Trigger,
    Action,
    Condition,
}

/// A single step in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct Node {
    /// Unique identifier within this workflow (referenced by connections and
    /// by `${id...}` variable references).
    pub id: String,
    pub title: String,
    pub kind: StepKind,
}

/// Per-type node configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    /// Entry point. Its output is the execution inputs overlaid with its own
    /// resolved parameters; nothing is dispatched.
    Trigger(TriggerConfig),
    /// A call through the action dispatcher.
    Action(ActionConfig),
    /// Evaluates an expression; its output is `{"result": bool}`.
    Condition(ConditionConfig),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TriggerConfig {
    /// Informational only (e.g. `gmail` / `new_email`).
    pub service: Option<String>,
    pub action: Option<String>,
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionConfig {
    pub service: String,
    pub action: String,
    pub parameters: Map<String, Value>,
    pub continue_on_error: bool,
    pub input_schema: Option<ObjectSchema>,
    pub output_schema: Option<ObjectSchema>,
    /// Overrides the engine-wide per-call timeout.
    pub timeout_ms: Option<u64>,
    /// Overrides the engine-wide attempt budget.
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionConfig {
    pub expression: String,
}

impl Node {
    pub fn trigger(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            kind: StepKind::Trigger(TriggerConfig::default()),
        }
    }

    pub fn action(
        id: impl Into<String>,
        service: impl Into<String>,
        action: impl Into<String>,
        parameters: Value,
    ) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            kind: StepKind::Action(ActionConfig {
                service: service.into(),
                action: action.into(),
                parameters: object_or_empty(parameters),
                continue_on_error: false,
                input_schema: None,
                output_schema: None,
                timeout_ms: None,
                max_attempts: None,
            }),
        }
    }

    pub fn condition(id: impl Into<String>, expression: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            kind: StepKind::Condition(ConditionConfig {
                expression: expression.into(),
            }),
        }
    }

    /// Builder-style: set `continueOnError` on an action node.
    pub fn continue_on_error(mut self) -> Self {
        if let StepKind::Action(cfg) = &mut self.kind {
            cfg.continue_on_error = true;
        }
        self
    }

    /// Builder-style: set the input schema of an action node.
    pub fn with_input_schema(mut self, schema: ObjectSchema) -> Self {
        if let StepKind::Action(cfg) = &mut self.kind {
            cfg.input_schema = Some(schema);
        }
        self
    }

    /// Builder-style: set the output schema of an action node.
    pub fn with_output_schema(mut self, schema: ObjectSchema) -> Self {
        if let StepKind::Action(cfg) = &mut self.kind {
            cfg.output_schema = Some(schema);
        }
        self
    }

    /// Builder-style: set the trigger's parameters.
    pub fn with_trigger_parameters(mut self, parameters: Value) -> Self {
        if let StepKind::Trigger(cfg) = &mut self.kind {
            cfg.parameters = object_or_empty(parameters);
        }
        self
    }

    pub fn node_type(&self) -> NodeType {
        match self.kind {
            StepKind::Trigger(_) => NodeType::Trigger,
            StepKind::Action(_) => NodeType::Action,
            StepKind::Condition(_) => NodeType::Condition,
        }
    }

    /// Only action nodes can fail in a recoverable way.
    pub fn continues_on_error(&self) -> bool {
        matches!(&self.kind, StepKind::Action(cfg) if cfg.continue_on_error)
    }
}

fn object_or_empty(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

// ---------------------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(rename = "type")]
    node_type: NodeType,
    #[serde(default)]
    config: RawConfig,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    continue_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    input_schema: Option<ObjectSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_schema: Option<ObjectSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    condition: Option<String>,
}

impl TryFrom<RawNode> for Node {
    type Error = GraphError;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let invalid = |reason: &str| GraphError::InvalidNode {
            node_id: raw.id.clone(),
            reason: reason.to_string(),
        };

        if raw.id.trim().is_empty() {
            return Err(invalid("node id must not be empty"));
        }

        let cfg = &raw.config;
        let kind = match raw.node_type {
            NodeType::Trigger => StepKind::Trigger(TriggerConfig {
                service: cfg.service.clone(),
                action: cfg.action.clone(),
                parameters: cfg.parameters.clone(),
            }),
            NodeType::Action => {
                let service = non_empty(&cfg.service)
                    .ok_or_else(|| invalid("action node requires config.service"))?;
                let action = non_empty(&cfg.action)
                    .ok_or_else(|| invalid("action node requires config.action"))?;
                if cfg.max_attempts == Some(0) {
                    return Err(invalid("config.maxAttempts must be at least 1"));
                }
                if cfg.timeout_ms == Some(0) {
                    return Err(invalid("config.timeoutMs must be at least 1"));
                }
                StepKind::Action(ActionConfig {
                    service,
                    action,
                    parameters: cfg.parameters.clone(),
                    continue_on_error: cfg.continue_on_error,
                    input_schema: cfg.input_schema.clone(),
                    output_schema: cfg.output_schema.clone(),
                    timeout_ms: cfg.timeout_ms,
                    max_attempts: cfg.max_attempts,
                })
            }
            NodeType::Condition => {
                let expression = non_empty(&cfg.condition)
                    .ok_or_else(|| invalid("condition node requires config.condition"))?;
                StepKind::Condition(ConditionConfig { expression })
            }
        };

        let title = if raw.title.is_empty() {
            raw.id.clone()
        } else {
            raw.title.clone()
        };

        Ok(Node {
            id: raw.id,
            title,
            kind,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        let node_type = node.node_type();
        let config = match node.kind {
            StepKind::Trigger(t) => RawConfig {
                service: t.service,
                action: t.action,
                parameters: t.parameters,
                ..RawConfig::default()
            },
            StepKind::Action(a) => RawConfig {
                service: Some(a.service),
                action: Some(a.action),
                parameters: a.parameters,
                continue_on_error: a.continue_on_error,
                input_schema: a.input_schema,
                output_schema: a.output_schema,
                timeout_ms: a.timeout_ms,
                max_attempts: a.max_attempts,
                condition: None,
            },
            StepKind::Condition(c) => RawConfig {
                condition: Some(c.expression),
                ..RawConfig::default()
            },
        };

        RawNode {
            id: node.id,
            title: node.title,
            node_type,
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_editor_json_into_typed_steps() {
        let def: WorkflowDefinition = serde_json::from_value(json!({
            "id": "wf-1",
            "nodes": [
                { "id": "t", "title": "New email", "type": "trigger",
                  "config": { "service": "gmail", "action": "new_email" } },
                { "id": "a", "title": "Notify", "type": "action",
                  "config": {
                      "service": "slack", "action": "post_message",
                      "parameters": { "text": "${t.subject}" },
                      "continueOnError": true,
                      "inputSchema": { "type": "object", "required": ["text"],
                                       "properties": { "text": { "type": "string" } } }
                  } },
                { "id": "c", "type": "condition",
                  "config": { "condition": "${a.ok} == true" } }
            ],
            "connections": [
                { "source": "t", "target": "a" },
                { "source": "a", "target": "c", "condition": "${a.ok} == true" }
            ]
        }))
        .expect("definition should parse");

        assert_eq!(def.nodes.len(), 3);
        assert_eq!(def.nodes[0].node_type(), NodeType::Trigger);
        match &def.nodes[1].kind {
            StepKind::Action(cfg) => {
                assert_eq!(cfg.service, "slack");
                assert!(cfg.continue_on_error);
                assert!(cfg.input_schema.is_some());
                assert_eq!(cfg.parameters["text"], json!("${t.subject}"));
            }
            other => panic!("expected action, got {other:?}"),
        }
        // Missing title falls back to the id.
        assert_eq!(def.nodes[2].title, "c");
        assert_eq!(def.connections[1].condition.as_deref(), Some("${a.ok} == true"));
    }

    #[test]
    fn action_without_service_is_rejected() {
        let err = serde_json::from_value::<Node>(json!({
            "id": "a", "type": "action", "config": { "action": "post" }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("config.service"), "{err}");
    }

    #[test]
    fn condition_without_expression_is_rejected() {
        let err = serde_json::from_value::<Node>(json!({ "id": "c", "type": "condition" }))
            .unwrap_err();
        assert!(err.to_string().contains("config.condition"), "{err}");
    }

    #[test]
    fn unknown_node_type_is_rejected() {
        assert!(serde_json::from_value::<Node>(json!({ "id": "x", "type": "loop" })).is_err());
    }

    #[test]
    fn serialises_back_to_wire_shape() {
        let node = Node::action("a", "core", "echo", json!({ "x": 1 })).continue_on_error();
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "a", "title": "a", "type": "action",
                "config": { "service": "core", "action": "echo",
                            "parameters": { "x": 1 }, "continueOnError": true }
            })
        );
        let back: Node = serde_json::from_value(value).unwrap();
        assert_eq!(back, node);
    }
}
