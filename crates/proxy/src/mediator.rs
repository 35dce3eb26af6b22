//! The trusted mediator: an MCP server to the agent, an MCP client to the
//! real tool servers, with the policy engine in between.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use {
    anyhow::{Context, Result},
    async_trait::async_trait,
    ironcurtain_audit::{AuditEntry, AuditLog, CallResult, EscalationResult},
    ironcurtain_config::{Home, SandboxMode, UserConfig},
    ironcurtain_escalation::{AutoApprover, EscalationDecision, EscalationRequest, Rendezvous},
    ironcurtain_mcp::{
        McpClient, McpClientTrait, McpServerHandler,
        types::{McpToolDef, ToolsCallResult},
    },
    ironcurtain_policy::{
        CompiledPolicy, Decision, DynamicLists, EngineConfig, PolicyDecision, PolicyEngine,
        RoleCategory, ToolAnnotationsFile, ToolCallRequest, normalize_arguments,
    },
    serde_json::{Map, Value},
    tokio::sync::{Mutex, RwLock},
    tracing::{info, warn},
};

use crate::breaker::CircuitBreaker;

pub struct MediatorConfig {
    pub home: Home,
    pub user_config: UserConfig,
    pub auto_approver: Option<AutoApprover>,
    /// Unix socket bound into sandboxed servers for outbound network.
    pub network_socket: Option<PathBuf>,
}

pub struct Mediator {
    engine: PolicyEngine,
    annotations: ToolAnnotationsFile,
    clients: HashMap<String, Arc<RwLock<dyn McpClientTrait>>>,
    /// Agent-facing tool name → owning server. First server wins on
    /// collision.
    tool_index: HashMap<String, String>,
    /// Aggregated tool list in discovery order, schemas verbatim.
    tool_defs: Vec<McpToolDef>,
    audit: AuditLog,
    breaker: Mutex<CircuitBreaker>,
    rendezvous: Rendezvous,
    auto_approver: Option<AutoApprover>,
    sandbox_dir: PathBuf,
    /// Per-server containment state, recorded on every audit line.
    sandboxed: HashMap<String, bool>,
    pending_escalations: Mutex<HashSet<String>>,
}

impl Mediator {
    /// Load artifacts, wrap and connect the tool servers, and assemble the
    /// per-session state.
    pub async fn start(config: MediatorConfig) -> Result<Self> {
        let home = &config.home;
        home.ensure_layout()?;
        let sandbox_dir = config
            .user_config
            .sandbox
            .dir
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| home.sandbox_dir());

        let policy = CompiledPolicy::load(&home.compiled_policy())
            .context("no compiled policy; run `ironcurtain compile-policy` first")?;
        let annotations = ToolAnnotationsFile::load(&home.tool_annotations())
            .context("no tool annotations; run `ironcurtain compile-policy` first")?;
        let dynamic_lists = match home.dynamic_lists().exists() {
            true => Some(DynamicLists::load(&home.dynamic_lists())?),
            false => None,
        };

        // OS containment: refuse to start in enforce mode without it.
        let preflight = ironcurtain_sandbox::preflight();
        let containment_available = preflight.supported;
        if !containment_available {
            let reason = preflight.reason.unwrap_or_default();
            match config.user_config.sandbox.mode {
                SandboxMode::Enforce => anyhow::bail!(
                    "sandbox mode is 'enforce' but containment is unavailable: {reason}"
                ),
                SandboxMode::Warn => {
                    warn!(reason = %reason, "continuing WITHOUT OS-level containment");
                },
            }
        }

        // Connect the tool servers, wrapped where configured.
        let mut clients: HashMap<String, Arc<RwLock<dyn McpClientTrait>>> = HashMap::new();
        let mut sandboxed = HashMap::new();
        let mut tool_index = HashMap::new();
        let mut tool_defs = Vec::new();

        let mut servers: Vec<_> = config.user_config.servers.iter().collect();
        servers.sort_by(|a, b| a.0.cmp(b.0));
        for (name, server) in servers {
            if !server.enabled {
                continue;
            }
            let wrap = server.sandboxed && containment_available;
            let (command, args) = if wrap {
                let wrapped = ironcurtain_sandbox::wrap_command(
                    &server.command,
                    &server.args,
                    &ironcurtain_sandbox::SandboxSpec {
                        sandbox_dir: sandbox_dir.clone(),
                        network_socket: config.network_socket.clone(),
                        scratch_dir: home.base().join("scratch").join(name),
                    },
                )?;
                (wrapped.command, wrapped.args)
            } else {
                (server.command.clone(), server.args.clone())
            };
            sandboxed.insert(name.clone(), wrap);

            let mut client =
                McpClient::connect(name, &command, &args, &server.env, vec![sandbox_dir.clone()])
                    .await
                    .with_context(|| format!("failed to start tool server '{name}'"))?;
            let tools = client.list_tools().await?.to_vec();

            // Annotation drift is fatal: the policy was compiled for other
            // schemas.
            let schemas: Vec<(String, Value)> = tools
                .iter()
                .map(|tool| (tool.name.clone(), tool.input_schema.clone()))
                .collect();
            annotations.validate_against_schemas(name, &schemas)?;

            for tool in tools {
                if tool_index.contains_key(&tool.name) {
                    warn!(tool = %tool.name, server = %name, "tool name collision; first server wins");
                    continue;
                }
                tool_index.insert(tool.name.clone(), name.clone());
                tool_defs.push(tool);
            }
            clients.insert(name.clone(), Arc::new(RwLock::new(client)));
        }

        let engine = PolicyEngine::new(EngineConfig {
            policy,
            annotations: annotations.clone(),
            protected_paths: home.protected_paths(),
            sandbox_dir: Some(sandbox_dir.clone()),
            domain_allowlists: config.user_config.domain_allowlists.clone(),
            dynamic_lists,
        })?;

        let timeout =
            Duration::from_secs(config.user_config.escalation.clamped_timeout_secs());
        info!(
            servers = clients.len(),
            tools = tool_defs.len(),
            sandbox = %sandbox_dir.display(),
            "mediator ready"
        );

        Ok(Self {
            engine,
            annotations,
            clients,
            tool_index,
            tool_defs,
            audit: AuditLog::new(home.audit_log()),
            breaker: Mutex::new(CircuitBreaker::default()),
            rendezvous: Rendezvous::new(home.escalations_dir(), timeout),
            auto_approver: config.auto_approver,
            sandbox_dir,
            sandboxed,
            pending_escalations: Mutex::new(HashSet::new()),
        })
    }

    /// Mediate one tool call end to end.
    pub async fn mediate(&self, tool_name: &str, arguments: Map<String, Value>) -> ToolsCallResult {
        let started = Instant::now();

        let Some(server_name) = self.tool_index.get(tool_name).cloned() else {
            return ToolsCallResult::error(format!("unknown tool: {tool_name}"));
        };
        let request = ToolCallRequest::new(&server_name, tool_name, arguments);
        let annotation = self.annotations.lookup(&server_name, tool_name);
        let views =
            normalize_arguments(annotation, &request.arguments, Some(&self.sandbox_dir)).await;

        let decision = self.engine.evaluate(&request.with_arguments(views.policy.clone()));
        info!(
            request_id = %request.request_id,
            server = %server_name,
            tool = %tool_name,
            status = ?decision.status,
            rule = %decision.rule,
            "policy decision"
        );

        let mut escalation_result = None;
        let mut auto_approved = None;
        match decision.status {
            Decision::Deny => {
                let result = ToolsCallResult::error(format!("DENIED: {}", decision.reason));
                self.record(&request, &views.transport, &decision, None, CallResult::denied(), started, None);
                return result;
            },
            Decision::Escalate => {
                let escalation = EscalationRequest::new(
                    &server_name,
                    tool_name,
                    views.policy.clone(),
                    &decision.reason,
                );

                let approved = match self.auto_approve(&escalation).await {
                    Some(()) => {
                        auto_approved = Some(true);
                        true
                    },
                    None => {
                        let id = escalation.escalation_id.clone();
                        self.pending_escalations.lock().await.insert(id.clone());
                        let human = self.rendezvous.escalate(&escalation).await;
                        self.pending_escalations.lock().await.remove(&id);
                        human == EscalationDecision::Approved
                    },
                };

                if !approved {
                    escalation_result = Some(EscalationResult::Denied);
                    let result = ToolsCallResult::error(format!(
                        "DENIED: escalation was not approved: {}",
                        decision.reason
                    ));
                    self.record(
                        &request,
                        &views.transport,
                        &decision,
                        escalation_result,
                        CallResult::denied(),
                        started,
                        auto_approved,
                    );
                    return result;
                }
                escalation_result = Some(EscalationResult::Approved);
                self.expand_roots(&server_name, annotation, &views.policy).await;
            },
            Decision::Allow => {},
        }

        // Runaway-loop protection sits after policy so a denied call never
        // charges the breaker window.
        if let Err(reason) = self
            .breaker
            .lock()
            .await
            .check(tool_name, &request.arguments)
        {
            self.record(
                &request,
                &views.transport,
                &decision,
                escalation_result,
                CallResult::denied(),
                started,
                auto_approved,
            );
            return ToolsCallResult::error(reason);
        }

        let outcome = self.forward(&server_name, tool_name, &views.transport).await;
        let (call_result, result) = match outcome {
            Ok(result) if result.is_error => {
                let text = flatten_text(&result);
                (CallResult::error(text), result)
            },
            Ok(result) => (CallResult::success(), result),
            Err(e) => {
                let mut message = format!("tool call failed: {e}");
                if self.sandboxed.get(&server_name).copied().unwrap_or(false) {
                    message.push_str(" (the sandbox may have blocked this)");
                }
                (CallResult::error(message.clone()), ToolsCallResult::error(message))
            },
        };
        self.record(
            &request,
            &views.transport,
            &decision,
            escalation_result,
            call_result,
            started,
            auto_approved,
        );
        result
    }

    async fn auto_approve(&self, escalation: &EscalationRequest) -> Option<()> {
        let approver = self.auto_approver.as_ref()?;
        let verdict = approver.judge(escalation).await?;
        info!(
            id = %escalation.escalation_id,
            reasoning = %verdict.reasoning,
            "escalation resolved by auto-approver"
        );
        Some(())
    }

    /// After an approved escalation, grow the upstream server's roots to
    /// cover the approved paths so its own containment does not reject the
    /// forwarded call.
    async fn expand_roots(
        &self,
        server_name: &str,
        annotation: Option<&ironcurtain_policy::ToolAnnotation>,
        policy_args: &Map<String, Value>,
    ) {
        let Some(annotation) = annotation else {
            return;
        };
        let Some(client) = self.clients.get(server_name) else {
            return;
        };

        for (arg, roles) in &annotation.args {
            if !roles.iter().any(|r| r.category() == RoleCategory::Path) {
                continue;
            }
            let values: Vec<&str> = match policy_args.get(arg) {
                Some(Value::String(s)) => vec![s.as_str()],
                Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
                _ => Vec::new(),
            };
            for value in values {
                let path = PathBuf::from(value);
                let dir = path.parent().map(PathBuf::from).unwrap_or(path);
                if let Err(e) = client.read().await.add_root(dir.clone()).await {
                    warn!(server = %server_name, dir = %dir.display(), error = %e,
                          "failed to expand roots");
                }
            }
        }
    }

    async fn forward(
        &self,
        server_name: &str,
        tool_name: &str,
        transport_args: &Map<String, Value>,
    ) -> Result<ToolsCallResult> {
        let client = self
            .clients
            .get(server_name)
            .with_context(|| format!("no client for server '{server_name}'"))?;
        let client = client.read().await;
        client
            .call_tool(tool_name, Value::Object(transport_args.clone()))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        request: &ToolCallRequest,
        transport_args: &Map<String, Value>,
        decision: &PolicyDecision,
        escalation_result: Option<EscalationResult>,
        result: CallResult,
        started: Instant,
        auto_approved: Option<bool>,
    ) {
        self.audit.record(&AuditEntry {
            timestamp: chrono::Utc::now(),
            request_id: request.request_id.clone(),
            server_name: request.server_name.clone(),
            tool_name: request.tool_name.clone(),
            arguments: transport_args.clone(),
            policy_decision: decision.clone(),
            escalation_result,
            result,
            duration_ms: started.elapsed().as_millis() as u64,
            sandboxed: self.sandboxed.get(&request.server_name).copied(),
            auto_approved,
        });
    }

    /// Session close: resolve pending escalations as denied and stop every
    /// upstream server.
    pub async fn shutdown(&self) {
        for id in self.pending_escalations.lock().await.drain() {
            self.rendezvous.cancel(&id);
        }
        for (name, client) in &self.clients {
            info!(server = %name, "shutting down tool server");
            client.write().await.shutdown().await;
        }
    }
}

fn flatten_text(result: &ToolsCallResult) -> String {
    result
        .content
        .iter()
        .filter_map(|content| match content {
            ironcurtain_mcp::types::ToolContent::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl McpServerHandler for Mediator {
    async fn list_tools(&self) -> Vec<McpToolDef> {
        self.tool_defs.clone()
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> ToolsCallResult {
        let arguments = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return ToolsCallResult::error(format!(
                    "tool arguments must be an object, got: {other}"
                ));
            },
        };
        self.mediate(name, arguments).await
    }
}
