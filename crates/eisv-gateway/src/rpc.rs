//! RPC router: dispatches tool calls to the governance services
//!
//! Each method is handled by a dedicated async function. The caller's
//! identity comes from the transport session key, optionally overridden by an
//! `identity` param; other agents are addressed by display id or name via
//! `agent`. Responses never carry another agent's UUID.

use crate::state::AppState;
use eisv_core::{
    AgentId, AgentMetadata, DialecticContent, DialecticId, DialecticSession, Error,
    LifecycleStatus, MessageType, Result, RpcResponse, SessionKey, SessionType,
};
use eisv_dialectic::OpenRequest;
use eisv_engine::{TagUpdate, UpdateReport};
use eisv_identity::{AgentView, ResolveRequest, Resolved};
use serde_json::{json, Value};
use tracing::{debug, info};

/// Per-call transport context.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub session: Option<SessionKey>,
    pub client_hint: Option<String>,
}

impl CallContext {
    pub fn new(session: Option<SessionKey>, client_hint: Option<String>) -> Self {
        Self {
            session,
            client_hint,
        }
    }

    fn session(&self) -> Result<&SessionKey> {
        self.session.as_ref().ok_or_else(|| {
            Error::InvalidArgument("session key required (x-session-id header)".into())
        })
    }
}

/// Method names and descriptions served by `tools.list`.
pub const TOOLS: &[(&str, &str)] = &[
    ("process_update", "Report one unit of work and receive a governance verdict"),
    ("simulate_update", "Evaluate a report without persisting anything"),
    ("get_metrics", "Current EISV state, risk and health of an agent"),
    ("set_identity", "Bind this session to an agent, optionally by name"),
    ("whoami", "The agent bound to this session, without creating one"),
    ("set_label", "Set or clear this agent's free-form label"),
    ("get_agent_metadata", "Lifecycle metadata of an agent"),
    ("list_agents", "All agents, optionally filtered by status"),
    ("update_agent_metadata", "Replace, add or remove tags"),
    ("mark_response_complete", "Mark this agent as waiting for input"),
    ("archive_agent", "Archive an agent; its next update resumes it"),
    ("delete_agent", "Soft-delete an agent; protected agents are refused"),
    ("spawn_agent", "Create a child agent with lineage to this one"),
    ("open_dialectic", "Open a peer-review session for a paused agent"),
    ("submit_dialectic_message", "Submit a thesis, antithesis or synthesis"),
    ("resolve_dialectic", "Outcome of a finished dialectic session"),
    ("get_dialectic", "One dialectic session"),
    ("list_dialectic", "Dialectic sessions, optionally for one agent"),
    ("request_delegate_draft", "Draft the next dialectic message via the reasoning delegate"),
    ("health", "Service health"),
    ("tools.list", "This list"),
];

/// Route one call. Faults come back as typed errors; reject verdicts are
/// ordinary results.
pub async fn route_rpc(method: &str, params: Value, state: &AppState, ctx: &CallContext) -> Result<Value> {
    match method {
        "process_update" => handle_process_update(params, state, ctx).await,
        "simulate_update" => handle_simulate_update(params, state, ctx).await,
        "get_metrics" => handle_get_metrics(params, state, ctx).await,
        "set_identity" => handle_set_identity(params, state, ctx).await,
        "whoami" => handle_whoami(state, ctx).await,
        "set_label" => handle_set_label(params, state, ctx).await,
        "get_agent_metadata" => handle_get_agent_metadata(params, state, ctx).await,
        "list_agents" => handle_list_agents(params, state, ctx).await,
        "update_agent_metadata" => handle_update_agent_metadata(params, state, ctx).await,
        "mark_response_complete" => handle_mark_response_complete(params, state, ctx).await,
        "archive_agent" => handle_archive_agent(params, state, ctx).await,
        "delete_agent" => handle_delete_agent(params, state, ctx).await,
        "spawn_agent" => handle_spawn_agent(params, state, ctx).await,
        "open_dialectic" => handle_open_dialectic(params, state, ctx).await,
        "submit_dialectic_message" => handle_submit_dialectic(params, state, ctx).await,
        "resolve_dialectic" => handle_resolve_dialectic(params, state).await,
        "get_dialectic" => handle_get_dialectic(params, state).await,
        "list_dialectic" => handle_list_dialectic(params, state).await,
        "request_delegate_draft" => handle_request_draft(params, state).await,
        "health" => Ok(health(state).await),
        "tools.list" => Ok(tools_list()),
        _ => Err(Error::MethodNotFound(method.to_string())),
    }
}

/// Route and log the outcome.
pub async fn dispatch(method: &str, params: Value, state: &AppState, ctx: &CallContext) -> Result<Value> {
    let result = route_rpc(method, params, state, ctx).await;
    if let Err(e) = &result {
        debug!("{} failed: {} ({})", method, e, e.reason_code());
    }
    result
}

pub fn to_response(id: Value, result: Result<Value>) -> RpcResponse {
    match result {
        Ok(value) => RpcResponse::ok(id, value),
        Err(e) => RpcResponse::from_error(id, &e),
    }
}

// ---------------------------------------------------------------------------
// Params
// ---------------------------------------------------------------------------

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn required<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    str_param(params, key).ok_or_else(|| Error::InvalidArgument(format!("missing required param: {key}")))
}

fn string_list(params: &Value, key: &str) -> Result<Option<Vec<String>>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|_| Error::InvalidArgument(format!("{key} must be a list of strings"))),
    }
}

fn dialectic_id(params: &Value) -> Result<DialecticId> {
    let raw = required(params, "session_id")?;
    DialecticId::parse(raw).ok_or_else(|| Error::InvalidArgument(format!("invalid session_id {raw:?}")))
}

/// The report is either under `report` or the params object itself.
fn report(params: &Value) -> Result<UpdateReport> {
    let raw = params.get("report").cloned().unwrap_or_else(|| params.clone());
    serde_json::from_value(raw).map_err(|e| Error::InvalidArgument(format!("invalid report: {e}")))
}

async fn caller(state: &AppState, ctx: &CallContext, params: &Value) -> Result<Resolved> {
    let session = ctx.session()?;
    state
        .registry
        .resolve(ResolveRequest {
            session,
            supplied: str_param(params, "identity"),
            client_hint: ctx.client_hint.as_deref(),
        })
        .await
}

/// `agent` param when given, else the caller.
async fn target(state: &AppState, ctx: &CallContext, params: &Value) -> Result<AgentId> {
    match str_param(params, "agent") {
        Some(key) => Ok(state.registry.lookup(key).await?.agent_id),
        None => Ok(caller(state, ctx, params).await?.agent_id),
    }
}

fn own_agent(state: &AppState, ctx: &CallContext) -> Option<AgentId> {
    ctx.session.as_ref().and_then(|s| state.registry.bound_agent(s))
}

fn view(state: &AppState, ctx: &CallContext, meta: &AgentMetadata) -> Result<Value> {
    let now = state.clock.now();
    let view = if own_agent(state, ctx) == Some(meta.agent_id) {
        AgentView::owner(meta, now)
    } else {
        AgentView::peer(meta, now)
    };
    Ok(serde_json::to_value(view)?)
}

fn identity_json(resolved: &Resolved) -> Value {
    json!({
        "agent_id": resolved.agent_id.to_string(),
        "display_id": resolved.display_id,
        "display_name": resolved.display_name,
        "created": resolved.created,
        "rebound": resolved.rebound,
    })
}

// ---------------------------------------------------------------------------
// Governance
// ---------------------------------------------------------------------------

async fn handle_process_update(params: Value, state: &AppState, ctx: &CallContext) -> Result<Value> {
    let report = report(&params)?;
    let agent = caller(state, ctx, &params).await?;
    let response = state.governor.process_update(agent.agent_id, &report).await?;
    Ok(serde_json::to_value(response)?)
}

async fn handle_simulate_update(params: Value, state: &AppState, ctx: &CallContext) -> Result<Value> {
    let report = report(&params)?;
    let agent = target(state, ctx, &params).await?;
    let response = state.governor.simulate_update(agent, &report).await?;
    Ok(serde_json::to_value(response)?)
}

async fn handle_get_metrics(params: Value, state: &AppState, ctx: &CallContext) -> Result<Value> {
    let agent = target(state, ctx, &params).await?;
    Ok(serde_json::to_value(state.governor.get_metrics(agent).await?)?)
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// An existing agent's id or name binds to it; a new name renames the bound
/// agent, or creates a named one when the session is unbound.
async fn handle_set_identity(params: Value, state: &AppState, ctx: &CallContext) -> Result<Value> {
    let session = ctx.session()?;
    let registry = &state.registry;
    let Some(name) = str_param(&params, "name") else {
        return Ok(identity_json(&caller(state, ctx, &params).await?));
    };

    let existing = match registry.lookup(name).await {
        Ok(meta) => Some(meta),
        Err(Error::NotFound(_)) => None,
        Err(e) => return Err(e),
    };
    let resolved = match (existing, registry.bound_agent(session)) {
        (None, Some(bound)) => {
            let meta = registry.set_name(bound, name).await?;
            info!("session {} renamed its agent to {}", session, meta.public_name());
            Resolved {
                agent_id: meta.agent_id,
                display_id: meta.display_id,
                display_name: meta.display_name,
                created: false,
                rebound: false,
            }
        }
        _ => {
            registry
                .resolve(ResolveRequest {
                    session,
                    supplied: Some(name),
                    client_hint: ctx.client_hint.as_deref(),
                })
                .await?
        }
    };
    Ok(identity_json(&resolved))
}

async fn handle_whoami(state: &AppState, ctx: &CallContext) -> Result<Value> {
    let agent = match state.registry.whoami(ctx.session()?).await? {
        Some(meta) => Some(AgentView::owner(&meta, state.clock.now())),
        None => None,
    };
    Ok(json!({ "agent": agent }))
}

async fn handle_set_label(params: Value, state: &AppState, ctx: &CallContext) -> Result<Value> {
    let agent = caller(state, ctx, &params).await?;
    let meta = state
        .registry
        .set_label(agent.agent_id, str_param(&params, "label"))
        .await?;
    view(state, ctx, &meta)
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

async fn handle_get_agent_metadata(params: Value, state: &AppState, ctx: &CallContext) -> Result<Value> {
    let agent = target(state, ctx, &params).await?;
    let meta = state.registry.metadata(agent).await?;
    view(state, ctx, &meta)
}

async fn handle_list_agents(params: Value, state: &AppState, ctx: &CallContext) -> Result<Value> {
    let status = match str_param(&params, "status") {
        Some(raw) => Some(
            LifecycleStatus::parse(raw)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown status {raw:?}")))?,
        ),
        None => None,
    };
    let agents = state
        .registry
        .list(status)
        .await?
        .iter()
        .map(|meta| view(state, ctx, meta))
        .collect::<Result<Vec<Value>>>()?;
    Ok(json!({ "agents": agents }))
}

async fn handle_update_agent_metadata(params: Value, state: &AppState, ctx: &CallContext) -> Result<Value> {
    let agent = caller(state, ctx, &params).await?;
    let update = TagUpdate {
        set: string_list(&params, "tags")?,
        add: string_list(&params, "add_tags")?.unwrap_or_default(),
        remove: string_list(&params, "remove_tags")?.unwrap_or_default(),
    };
    let mut meta = state.governor.update_tags(agent.agent_id, &update).await?;
    if params.get("label").is_some() {
        meta = state
            .registry
            .set_label(agent.agent_id, str_param(&params, "label"))
            .await?;
    }
    view(state, ctx, &meta)
}

async fn handle_mark_response_complete(params: Value, state: &AppState, ctx: &CallContext) -> Result<Value> {
    let agent = caller(state, ctx, &params).await?;
    let meta = state.governor.mark_response_complete(agent.agent_id).await?;
    Ok(json!({ "agent": meta.public_name(), "status": meta.status }))
}

async fn handle_archive_agent(params: Value, state: &AppState, ctx: &CallContext) -> Result<Value> {
    let agent = target(state, ctx, &params).await?;
    let meta = state
        .governor
        .archive(agent, str_param(&params, "reason"))
        .await?;
    view(state, ctx, &meta)
}

async fn handle_delete_agent(params: Value, state: &AppState, ctx: &CallContext) -> Result<Value> {
    let agent = target(state, ctx, &params).await?;
    let meta = state.governor.delete(agent).await?;
    Ok(json!({ "deleted": meta.public_name() }))
}

async fn handle_spawn_agent(params: Value, state: &AppState, ctx: &CallContext) -> Result<Value> {
    let parent = caller(state, ctx, &params).await?;
    let reason = str_param(&params, "reason").unwrap_or("spawned");
    let child = state
        .registry
        .spawn(parent.agent_id, str_param(&params, "name"), reason)
        .await?;
    view(state, ctx, &child)
}

// ---------------------------------------------------------------------------
// Dialectic
// ---------------------------------------------------------------------------

async fn handle_open_dialectic(params: Value, state: &AppState, ctx: &CallContext) -> Result<Value> {
    let paused_agent = target(state, ctx, &params).await?;
    let session_type = match str_param(&params, "session_type") {
        None | Some("review") => SessionType::Review,
        Some("exploration") => SessionType::Exploration,
        Some(other) => {
            return Err(Error::InvalidArgument(format!("unknown session_type {other:?}")));
        }
    };
    let reviewer = match str_param(&params, "reviewer") {
        Some(key) => Some(state.registry.lookup(key).await?.agent_id),
        None => None,
    };
    let session = state
        .dialectic
        .open(OpenRequest {
            paused_agent,
            reason: str_param(&params, "reason")
                .unwrap_or("explicit dialectic request")
                .to_string(),
            session_type,
            reviewer,
        })
        .await?;
    Ok(session_view(state, &session).await)
}

async fn handle_submit_dialectic(params: Value, state: &AppState, ctx: &CallContext) -> Result<Value> {
    let id = dialectic_id(&params)?;
    let raw = required(&params, "type")?;
    let kind = MessageType::parse(raw)
        .ok_or_else(|| Error::InvalidArgument(format!("unknown message type {raw:?}")))?;
    let content: DialecticContent = match params.get("content") {
        None | Some(Value::Null) => DialecticContent::default(),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| Error::InvalidArgument(format!("invalid content: {e}")))?,
    };
    let author = caller(state, ctx, &params).await?;
    let session = state
        .dialectic
        .submit(id, author.agent_id, kind, content)
        .await?;
    Ok(session_view(state, &session).await)
}

async fn handle_resolve_dialectic(params: Value, state: &AppState) -> Result<Value> {
    let resolution = state.dialectic.resolve(dialectic_id(&params)?).await?;
    Ok(serde_json::to_value(resolution)?)
}

async fn handle_get_dialectic(params: Value, state: &AppState) -> Result<Value> {
    let session = state.dialectic.get(dialectic_id(&params)?).await?;
    Ok(session_view(state, &session).await)
}

async fn handle_list_dialectic(params: Value, state: &AppState) -> Result<Value> {
    let agent = match str_param(&params, "agent") {
        Some(key) => Some(state.registry.lookup(key).await?.agent_id),
        None => None,
    };
    let mut sessions = Vec::new();
    for session in state.dialectic.list(agent).await? {
        sessions.push(session_view(state, &session).await);
    }
    Ok(json!({ "sessions": sessions }))
}

async fn handle_request_draft(params: Value, state: &AppState) -> Result<Value> {
    let id = dialectic_id(&params)?;
    let ticket = state.dialectic.request_draft(id).await?;
    Ok(json!({
        "session_id": id.to_string(),
        "type": ticket.kind,
        "author": ticket.author,
        "status": "drafting",
    }))
}

async fn display_name(state: &AppState, id: AgentId) -> String {
    match state.registry.metadata(id).await {
        Ok(meta) => meta.public_name().to_string(),
        Err(_) => "unknown".to_string(),
    }
}

/// Session with agents shown by display name.
async fn session_view(state: &AppState, s: &DialecticSession) -> Value {
    let paused = display_name(state, s.paused_agent).await;
    let reviewer = match s.reviewer {
        Some(r) => Some(display_name(state, r).await),
        None => None,
    };
    let messages: Vec<Value> = s
        .messages
        .iter()
        .map(|m| {
            json!({
                "seq": m.seq,
                "type": m.kind,
                "author": m.author_display,
                "content": m.content,
                "at": m.at,
            })
        })
        .collect();
    json!({
        "session_id": s.id.to_string(),
        "session_type": s.session_type,
        "status": s.status,
        "paused_agent": paused,
        "reviewer": reviewer,
        "reason": s.reason,
        "messages": messages,
        "synthesis_rounds": s.synthesis_rounds,
        "agreement": s.agreement,
        "resolution": s.resolution,
        "created_at": s.created_at,
        "updated_at": s.updated_at,
        "resolved_at": s.resolved_at,
    })
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub async fn health(state: &AppState) -> Value {
    let agents = state.registry.list(None).await.map(|a| a.len()).ok();
    json!({
        "status": if agents.is_some() { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "backend": state.store.backend(),
        "agents": agents,
        "bindings": state.registry.binding_count(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    })
}

fn tools_list() -> Value {
    let tools: Vec<Value> = TOOLS
        .iter()
        .map(|(name, description)| json!({ "name": name, "description": description }))
        .collect();
    json!({ "tools": tools })
}
