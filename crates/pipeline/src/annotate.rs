//! Stage 2: LLM annotation of tool arguments with registry roles.
//!
//! The prompt embeds the role registry's guidance verbatim so the model
//! and the engine share one vocabulary. Heuristic validation runs after
//! the model: every argument needs at least one role, and path-shaped
//! argument names may not go unroled. One repair turn is attempted before
//! the stage fails.

use {
    anyhow::{Context, Result},
    ironcurtain_llm::{ChatMessage, LlmClient},
    ironcurtain_policy::{ArgumentRole, ServerAnnotations, ToolAnnotation},
    tracing::{info, warn},
};

use crate::{
    artifacts::{content_hash, extract_json},
    discover::DiscoveredServer,
};

/// Argument-name fragments that strongly suggest a filesystem path.
const PATH_SHAPED: &[&str] = &["path", "file", "dir", "directory", "source", "destination"];

const SYSTEM_PROMPT: &str = "\
You annotate the arguments of agent tools with semantic roles so a policy \
engine can reason about what each call touches. Reply with JSON only: an \
array of objects {\"toolName\", \"serverName\", \"comment\", \"sideEffects\", \
\"args\": {argName: [role, ...]}}. Every argument of every tool must appear \
with at least one role. Use \"none\" for arguments with no resource \
semantics. An argument may carry several roles: a move's source is both \
\"read-path\" and \"delete-path\".";

/// Build the annotation prompt for one server.
pub fn annotation_prompt(server: &DiscoveredServer) -> String {
    let mut prompt = String::from("Roles (use exactly these names):\n");
    for role in ArgumentRole::ALL {
        let spec = role.spec();
        prompt.push_str(&format!(
            "- {}: {}{}\n",
            role.wire_name(),
            spec.annotation_guidance,
            match spec.server_scope {
                Some(scope) => format!(" (only for servers: {})", scope.join(", ")),
                None => String::new(),
            }
        ));
    }
    prompt.push_str(&format!("\nServer: {}\nTools:\n", server.name));
    for (name, schema) in &server.tools {
        prompt.push_str(&format!("- {name}: {schema}\n"));
    }
    prompt
}

/// The per-server cache key: server name, tool schemas, and the prompt
/// text itself (a prompt change invalidates the cache).
pub fn server_input_hash(server: &DiscoveredServer) -> String {
    let schemas = server
        .tools
        .iter()
        .map(|(name, schema)| format!("{name}={schema}"))
        .collect::<Vec<_>>()
        .join("\n");
    content_hash(&[&server.name, &schemas, SYSTEM_PROMPT])
}

/// Annotate one server's tools, reusing `cached` when its input hash still
/// matches.
pub async fn annotate_server(
    client: &LlmClient,
    server: &DiscoveredServer,
    cached: Option<&ServerAnnotations>,
) -> Result<ServerAnnotations> {
    let input_hash = server_input_hash(server);
    if let Some(cached) = cached
        && cached.input_hash == input_hash
    {
        info!(server = %server.name, "annotations cached");
        return Ok(cached.clone());
    }

    let prompt = annotation_prompt(server);
    let mut messages = vec![ChatMessage::user(prompt)];
    let response = client
        .complete("annotate-tools", SYSTEM_PROMPT, &messages)
        .await?;
    let mut annotations = parse_annotations(&response.text, &server.name)?;

    if let Err(errors) = validate_annotations(server, &annotations) {
        warn!(server = %server.name, errors = errors.len(), "annotation errors; repairing");
        messages.push(ChatMessage::assistant(response.text));
        messages.push(ChatMessage::user(format!(
            "Your annotations have problems:\n{}\nReply with the complete corrected JSON array.",
            errors.join("\n")
        )));
        let repaired = client
            .complete("annotate-tools-repair", SYSTEM_PROMPT, &messages)
            .await?;
        annotations = parse_annotations(&repaired.text, &server.name)?;
        validate_annotations(server, &annotations).map_err(|errors| {
            anyhow::anyhow!(
                "annotation validation failed for '{}' after repair:\n{}",
                server.name,
                errors.join("\n")
            )
        })?;
    }

    Ok(ServerAnnotations {
        input_hash,
        tools: annotations,
    })
}

fn parse_annotations(text: &str, server: &str) -> Result<Vec<ToolAnnotation>> {
    let mut annotations: Vec<ToolAnnotation> = serde_json::from_str(extract_json(text))
        .with_context(|| format!("unparseable annotations for server '{server}'"))?;
    // The model occasionally echoes the wrong server name; the discovery
    // stage is authoritative.
    for annotation in &mut annotations {
        annotation.server_name = server.to_string();
    }
    Ok(annotations)
}

/// Heuristic post-LLM validation. Returns every problem found, for the
/// repair prompt.
pub fn validate_annotations(
    server: &DiscoveredServer,
    annotations: &[ToolAnnotation],
) -> std::result::Result<(), Vec<String>> {
    let mut errors = Vec::new();

    for (tool_name, schema) in &server.tools {
        let Some(annotation) = annotations.iter().find(|a| &a.tool_name == tool_name) else {
            errors.push(format!("tool '{tool_name}' is not annotated"));
            continue;
        };
        let args: Vec<&str> = schema
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|p| p.keys().map(String::as_str).collect())
            .unwrap_or_default();
        for arg in args {
            match annotation.args.get(arg) {
                None => errors.push(format!("tool '{tool_name}' argument '{arg}' has no roles")),
                Some(roles) if roles.is_empty() => {
                    errors.push(format!("tool '{tool_name}' argument '{arg}' has empty roles"));
                },
                Some(roles) => {
                    let path_shaped = PATH_SHAPED.iter().any(|hint| {
                        arg.to_ascii_lowercase().contains(hint)
                    });
                    let has_resource_role = roles.iter().any(|r| *r != ArgumentRole::None);
                    if path_shaped && !has_resource_role {
                        errors.push(format!(
                            "tool '{tool_name}' argument '{arg}' looks like a path but is \
                             annotated 'none'; give it a path role or justify via comment"
                        ));
                    }
                },
            }
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}
