//! ABOUTME: Tool invocation: HTTP client for API tools, dispatch for native functions
//! ABOUTME: Shared by the InvokeTool executor and the agent tool-call cycle

use crate::context::RunContext;
use crate::executor::{per_message, FlowStream, StepExecutor};
use crate::message::FlowMessage;
use crate::retry::retry_transient;
use qtype_core::traits::secret::SecretValue;
use qtype_core::{codes, QTypeError, Result, Value};
use qtype_dsl::document::AuthProviderDef;
use qtype_semantics::{StepIr, ToolIr};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Invoke a tool with JSON arguments, retrying transient failures.
pub(crate) async fn invoke_tool(
    tool: &ToolIr,
    args: serde_json::Value,
    ctx: &RunContext,
) -> Result<serde_json::Value> {
    match tool {
        ToolIr::Function {
            module_path,
            function_name,
            ..
        } => {
            let function = ctx.clients.native_function(module_path, function_name)?;
            retry_transient(&ctx.options.retry, &ctx.cancel, || {
                function.invoke(args.clone())
            })
            .await
        }
        ToolIr::Api {
            endpoint,
            method,
            headers,
            auth,
            name,
            ..
        } => {
            debug!(tool = name, endpoint, "invoking API tool");
            retry_transient(&ctx.options.retry, &ctx.cancel, || {
                http_call(endpoint, method, headers, auth.as_deref(), &args, ctx)
            })
            .await
        }
    }
}

async fn http_call(
    endpoint: &str,
    method: &str,
    headers: &indexmap::IndexMap<String, String>,
    auth: Option<&AuthProviderDef>,
    args: &serde_json::Value,
    ctx: &RunContext,
) -> Result<serde_json::Value> {
    let client = reqwest::Client::new();
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| QTypeError::fatal(format!("unsupported HTTP method '{method}'")))?;

    let mut request = client.request(method.clone(), endpoint);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request = apply_auth(request, auth, ctx).await?;
    request = if method == reqwest::Method::GET {
        match args.as_object() {
            Some(object) => {
                let query: Vec<(String, String)> = object
                    .iter()
                    .map(|(k, v)| {
                        let rendered = match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), rendered)
                    })
                    .collect();
                request.query(&query)
            }
            None => request,
        }
    } else {
        request.json(args)
    };

    let send = async {
        let response = request
            .send()
            .await
            .map_err(|err| QTypeError::transient(format!("tool request failed: {err}")))?;
        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .unwrap_or(serde_json::Value::Null);
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(QTypeError::transient(format!("tool returned {status}")));
        }
        if !status.is_success() {
            return Err(QTypeError::message_failure(
                codes::TOOL_ERROR,
                format!("tool returned {status}: {body}"),
            ));
        }
        Ok(body)
    };

    tokio::select! {
        () = ctx.cancel.cancelled() => Err(QTypeError::Cancelled),
        outcome = send => outcome,
    }
}

async fn apply_auth(
    request: reqwest::RequestBuilder,
    auth: Option<&AuthProviderDef>,
    ctx: &RunContext,
) -> Result<reqwest::RequestBuilder> {
    let Some(auth) = auth else {
        return Ok(request);
    };
    match auth {
        AuthProviderDef::ApiKey {
            api_key, header, ..
        } => {
            let key = resolve(api_key, ctx).await?;
            let header = header.as_deref().unwrap_or("Authorization");
            Ok(request.header(header, key))
        }
        AuthProviderDef::Bearer { token, .. } => {
            let token = resolve(token, ctx).await?;
            Ok(request.bearer_auth(token))
        }
        AuthProviderDef::Oauth2 { id, .. } | AuthProviderDef::Aws { id, .. } => {
            Err(QTypeError::message_failure(
                codes::TOOL_ERROR,
                format!("auth provider '{id}' is not supported by the built-in HTTP tool client"),
            ))
        }
    }
}

async fn resolve(secret: &SecretValue, ctx: &RunContext) -> Result<String> {
    secret.resolve(ctx.secrets.as_ref()).await
}

/// Explicit tool invocation with parameter bindings.
pub struct InvokeToolExecutor {
    step: Arc<StepIr>,
    tool: Arc<ToolIr>,
    input_bindings: BTreeMap<String, String>,
    output_bindings: BTreeMap<String, String>,
}

impl InvokeToolExecutor {
    #[must_use]
    pub fn new(
        step: Arc<StepIr>,
        tool: Arc<ToolIr>,
        input_bindings: BTreeMap<String, String>,
        output_bindings: BTreeMap<String, String>,
    ) -> Self {
        Self {
            step,
            tool,
            input_bindings,
            output_bindings,
        }
    }

    fn bind_args(&self, message: &FlowMessage) -> serde_json::Value {
        let mut args = serde_json::Map::new();
        for (param, var_id) in &self.input_bindings {
            if let Some(value) = message.get(var_id) {
                args.insert(param.clone(), value.to_json());
            }
        }
        serde_json::Value::Object(args)
    }

    fn bind_outputs(&self, message: &FlowMessage, result: &serde_json::Value) -> FlowMessage {
        let mut updated = message.clone();
        for (param, var_id) in &self.output_bindings {
            let value = result
                .get(param)
                .map_or(Value::Null, Value::from_json);
            updated = updated.with_variable(var_id.clone(), value);
        }
        // A tool returning a bare value binds to a single declared output.
        if self.output_bindings.is_empty() {
            if let Some(output) = self.step.outputs.first() {
                updated = updated.with_variable(output.id.clone(), Value::from_json(result));
            }
        }
        updated
    }
}

impl StepExecutor for InvokeToolExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        let step = Arc::clone(&self.step);
        let ctx_outer = Arc::clone(&ctx);
        per_message(input, ctx_outer, step, move |message| {
            let this = Arc::clone(&self);
            let ctx = Arc::clone(&ctx);
            async move {
                let args = this.bind_args(&message);
                match invoke_tool(&this.tool, args, &ctx).await {
                    Ok(result) => this.bind_outputs(&message, &result),
                    Err(QTypeError::Cancelled) => {
                        message.failed(codes::CANCELLED, "run cancelled", Some(&this.step.id))
                    }
                    Err(err) => message.failed(
                        codes::TOOL_ERROR,
                        format!("tool '{}' failed: {err}", this.tool.name()),
                        Some(&this.step.id),
                    ),
                }
            }
        })
    }
}
