//! Pipeline orchestration: cache checks, stage sequencing, and the
//! verify-repair loop.

use std::{
    collections::HashMap,
    path::PathBuf,
};

use {
    anyhow::Result,
    ironcurtain_config::{Home, ToolServerConfig, UserConfig},
    ironcurtain_llm::LlmClient,
    ironcurtain_policy::{
        CompiledPolicy, DynamicLists, EngineConfig, PolicyEngine, ScenarioFile,
        ToolAnnotationsFile,
    },
    tracing::{error, info, warn},
};

use crate::{
    annotate::annotate_server,
    artifacts::{generated_at, read_artifact, write_artifact},
    compile::{CompilerSession, build_policy, compile_input_hash},
    discover::{DiscoveredServer, discover_servers},
    scenarios::{generate_scenarios, scenarios_input_hash},
    verify::{apply_feedback, judge_mismatches, run_scenarios},
};

pub struct PipelineConfig {
    pub home: Home,
    pub user_config: UserConfig,
    pub constitution: String,
    pub compiler: LlmClient,
    pub judge: LlmClient,
}

/// Coarse cap on model calls per pipeline run.
struct LlmBudget {
    cap: u32,
    spent: u32,
}

impl LlmBudget {
    fn new(cap: u32) -> Self {
        Self { cap, spent: 0 }
    }

    fn spend(&mut self, calls: u32) -> Result<()> {
        self.spent += calls;
        if self.spent > self.cap {
            anyhow::bail!(
                "LLM budget exhausted ({} calls > cap {}); raise budget.maxLlmCalls",
                self.spent,
                self.cap
            );
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Everything verified; fresh artifacts written.
    Verified,
    /// Every stage was cached; nothing changed.
    Cached,
    /// Retries exhausted; artifacts written anyway, caller exits non-zero.
    VerificationFailed { remaining_mismatches: usize },
}

/// Run the full pipeline: discovery against the live servers, then the
/// LLM stages.
pub async fn run_pipeline(config: PipelineConfig) -> Result<PipelineOutcome> {
    let mut servers: Vec<(String, ToolServerConfig)> = config
        .user_config
        .servers
        .iter()
        .map(|(name, server)| (name.clone(), server.clone()))
        .collect();
    servers.sort_by(|a, b| a.0.cmp(&b.0));

    let discovered = discover_servers(&servers).await?;
    run_with_discovered(config, discovered).await
}

/// The LLM stages, with discovery injected (tests use synthetic servers).
pub async fn run_with_discovered(
    config: PipelineConfig,
    discovered: Vec<DiscoveredServer>,
) -> Result<PipelineOutcome> {
    let home = &config.home;
    home.ensure_layout()?;
    let sandbox_dir = config
        .user_config
        .sandbox
        .dir
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| home.sandbox_dir());
    let protected_paths = home.protected_paths();

    // Coarse budget: each stage costs at most two model calls (one plus a
    // repair turn), each verify round two more.
    let mut budget = LlmBudget::new(config.user_config.budget.max_llm_calls);

    // ── Annotate ────────────────────────────────────────────────────────
    let cached_annotations: Option<ToolAnnotationsFile> =
        read_artifact(&home.tool_annotations())?;
    let mut annotations = ToolAnnotationsFile {
        generated_at: generated_at(),
        servers: HashMap::new(),
    };
    let mut annotations_changed = false;
    for server in &discovered {
        let cached = cached_annotations
            .as_ref()
            .and_then(|file| file.servers.get(&server.name));
        let cache_hit = cached
            .is_some_and(|c| c.input_hash == crate::annotate::server_input_hash(server));
        if !cache_hit {
            budget.spend(2)?;
        }
        let fresh = annotate_server(&config.compiler, server, cached).await?;
        if cached.map(|c| c.input_hash.as_str()) != Some(fresh.input_hash.as_str()) {
            annotations_changed = true;
        }
        annotations.servers.insert(server.name.clone(), fresh);
    }
    // Dropped servers also invalidate the artifact.
    if let Some(cached) = &cached_annotations
        && cached.servers.len() != annotations.servers.len()
    {
        annotations_changed = true;
    }
    if annotations_changed {
        write_artifact(&home.tool_annotations(), &annotations)?;
        info!("tool annotations written");
    } else if let Some(cached) = cached_annotations {
        annotations = cached;
        info!("tool annotations cached");
    }

    // ── Compile ─────────────────────────────────────────────────────────
    let input_hash =
        compile_input_hash(&config.constitution, &annotations, &sandbox_dir, &protected_paths);
    let cached_policy: Option<CompiledPolicy> = read_artifact(&home.compiled_policy())?
        .filter(|policy: &CompiledPolicy| policy.input_hash == input_hash);
    let policy_cached = cached_policy.is_some();

    let mut session: Option<CompilerSession> = None;
    let mut policy = match cached_policy {
        Some(mut policy) => {
            info!("compiled policy cached");
            policy.normalize_legacy_names();
            policy.validate()?;
            policy
        },
        None => {
            budget.spend(1)?;
            let mut fresh_session = CompilerSession::new(
                config.compiler.clone(),
                &config.constitution,
                &annotations,
                &sandbox_dir,
                &protected_paths,
            );
            let rules = fresh_session.initial_rules().await?;
            let policy = build_policy(rules, &config.constitution, input_hash.clone())?;
            session = Some(fresh_session);
            policy
        },
    };

    // ── Scenarios ───────────────────────────────────────────────────────
    let scenario_hash =
        scenarios_input_hash(&config.constitution, &annotations, &sandbox_dir);
    let cached_scenarios: Option<ScenarioFile> = read_artifact(&home.test_scenarios())?
        .filter(|file: &ScenarioFile| file.input_hash == scenario_hash);
    let scenarios_cached = cached_scenarios.is_some();
    let mut scenarios = match cached_scenarios {
        Some(file) => {
            info!("test scenarios cached");
            file.scenarios
        },
        None => {
            budget.spend(1)?;
            generate_scenarios(
                &config.compiler,
                &config.constitution,
                &annotations,
                &sandbox_dir,
            )
            .await?
        },
    };

    if !annotations_changed && policy_cached && scenarios_cached {
        info!("all pipeline stages cached; nothing to do");
        return Ok(PipelineOutcome::Cached);
    }

    // ── Verify ──────────────────────────────────────────────────────────
    let dynamic_lists: Option<DynamicLists> = read_artifact(&home.dynamic_lists())?;
    let max_rounds = config.user_config.budget.max_repair_rounds;
    let mut outcome = PipelineOutcome::Verified;

    for round in 0..=max_rounds {
        let engine = PolicyEngine::new(EngineConfig {
            policy: policy.clone(),
            annotations: annotations.clone(),
            protected_paths: protected_paths.clone(),
            sandbox_dir: Some(sandbox_dir.clone()),
            domain_allowlists: config.user_config.domain_allowlists.clone(),
            dynamic_lists: dynamic_lists.clone(),
        })?;
        let mismatches = run_scenarios(&engine, &scenarios);
        if mismatches.is_empty() {
            info!(round, scenarios = scenarios.len(), "verification passed");
            break;
        }
        if round == max_rounds {
            error!(
                remaining = mismatches.len(),
                "verification failed after {max_rounds} repair rounds"
            );
            outcome = PipelineOutcome::VerificationFailed {
                remaining_mismatches: mismatches.len(),
            };
            break;
        }

        warn!(round, mismatches = mismatches.len(), "verification mismatches; judging");
        budget.spend(1)?;
        let feedback = judge_mismatches(&config.judge, &config.constitution, &mismatches).await?;
        apply_feedback(&mut scenarios, &feedback);

        if !feedback.feedback.is_empty() {
            budget.spend(1)?;
            let session = session.get_or_insert_with(|| {
                CompilerSession::new(
                    config.compiler.clone(),
                    &config.constitution,
                    &annotations,
                    &sandbox_dir,
                    &protected_paths,
                )
            });
            let rules = session.repair(&feedback.feedback, &policy.rules).await?;
            policy = build_policy(rules, &config.constitution, input_hash.clone())?;
        }
    }

    // Artifacts are written even on failure so the operator can inspect
    // what the pipeline produced; the non-zero exit happens in the CLI.
    write_artifact(&home.compiled_policy(), &policy)?;
    write_artifact(&home.test_scenarios(), &ScenarioFile {
        generated_at: generated_at(),
        input_hash: scenario_hash,
        scenarios,
    })?;
    info!("pipeline artifacts written");

    Ok(outcome)
}
