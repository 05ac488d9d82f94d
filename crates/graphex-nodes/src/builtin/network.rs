use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use graphex_core::node::{
    InputPort, NodeConfig, NodeContext, NodeRequest, NodeValues, OutputPort, PortDeclaration,
};
use graphex_core::traits::NodeType;
use graphex_core::{DataType, NodeError};

use super::{cancellable, outputs, parse_config};

// ── TcpProbeNode ────────────────────────────────────────────────

pub struct TcpProbeNode;

impl NodeType for TcpProbeNode {
    fn type_tag(&self) -> &str {
        "net.tcp_probe"
    }

    fn description(&self) -> &str {
        "Check TCP connectivity to a host:port."
    }

    fn category(&self) -> &str {
        "Network"
    }

    fn ports(&self, _config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        Ok(PortDeclaration::new()
            .input(InputPort::new("host", DataType::String))
            .input(InputPort::new("port", DataType::Integer))
            .input(
                InputPort::new("timeout_ms", DataType::Integer)
                    .optional()
                    .with_default(json!(5000)),
            )
            .output(OutputPort::new("reachable", DataType::Boolean))
            .output(OutputPort::new("latency_ms", DataType::Integer)))
    }

    fn validate_inputs(&self, request: &NodeRequest) -> Result<(), NodeError> {
        let port = request.u64_input("port")?;
        if port == 0 || port > u16::MAX as u64 {
            return Err(NodeError::input("port", format!("{} is not a TCP port", port)));
        }
        Ok(())
    }

    fn execute(
        &self,
        request: NodeRequest,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move {
            let host = request.str_input("host")?;
            let port = request.u64_input("port")?;
            let timeout = Duration::from_millis(request.opt_u64_input("timeout_ms").unwrap_or(5000));
            let addr = format!("{}:{}", host, port);

            let start = Instant::now();
            let attempt = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr));
            let reachable = match cancellable(&ctx, attempt).await? {
                Ok(Ok(_stream)) => {
                    ctx.info(format!("Connected to {}", addr));
                    true
                }
                Ok(Err(e)) => {
                    ctx.warn(format!("Connection to {} refused: {}", addr, e));
                    false
                }
                Err(_) => {
                    ctx.warn(format!("Connection to {} timed out after {:?}", addr, timeout));
                    false
                }
            };
            let latency_ms = start.elapsed().as_millis() as u64;
            debug!(addr = %addr, reachable, latency_ms, "TCP probe finished");

            Ok(outputs([
                ("reachable", json!(reachable)),
                ("latency_ms", json!(latency_ms)),
            ]))
        })
    }
}

// ── DnsLookupNode ───────────────────────────────────────────────

pub struct DnsLookupNode;

impl NodeType for DnsLookupNode {
    fn type_tag(&self) -> &str {
        "net.dns_lookup"
    }

    fn description(&self) -> &str {
        "Resolve a hostname to its IP addresses."
    }

    fn category(&self) -> &str {
        "Network"
    }

    fn ports(&self, _config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        Ok(PortDeclaration::new()
            .input(InputPort::new("hostname", DataType::String))
            .output(OutputPort::new("addresses", DataType::list(DataType::String)))
            .output(OutputPort::new("address", DataType::String)))
    }

    fn execute(
        &self,
        request: NodeRequest,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move {
            let hostname = request.str_input("hostname")?;
            let addr = format!("{}:0", hostname);
            let resolved = cancellable(&ctx, tokio::net::lookup_host(addr.as_str()))
                .await?
                .map_err(|e| NodeError::execution(format!("DNS lookup failed: {}", e)))?;

            let mut ips: Vec<String> = Vec::new();
            for a in resolved {
                let ip = a.ip().to_string();
                if !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
            let Some(first) = ips.first().cloned() else {
                return Err(NodeError::execution(format!(
                    "{} did not resolve to any address",
                    hostname
                )));
            };
            ctx.info(format!("{} resolves to {}", hostname, ips.join(", ")));

            Ok(outputs([("addresses", json!(ips)), ("address", json!(first))]))
        })
    }
}

// ── HttpRequestNode ─────────────────────────────────────────────

pub struct HttpRequestNode;

#[derive(Deserialize)]
struct HttpRequestConfig {
    /// Secret whose value is sent as a bearer token.
    #[serde(default)]
    bearer_secret: Option<String>,
    /// Response bodies are cut to this many bytes.
    #[serde(default = "default_max_body")]
    max_body_bytes: usize,
}

fn default_max_body() -> usize {
    64 * 1024
}

impl NodeType for HttpRequestNode {
    fn type_tag(&self) -> &str {
        "net.http_request"
    }

    fn description(&self) -> &str {
        "Make an HTTP request. Returns status and body."
    }

    fn category(&self) -> &str {
        "Network"
    }

    fn timeout_secs(&self) -> Option<u64> {
        Some(60)
    }

    fn ports(&self, config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        let _: HttpRequestConfig = parse_config(config)?;
        Ok(PortDeclaration::new()
            .input(InputPort::new("url", DataType::String))
            .input(
                InputPort::new("method", DataType::String)
                    .optional()
                    .with_default(json!("GET")),
            )
            .input(InputPort::new("headers", DataType::Object).optional())
            .input(InputPort::new("body", DataType::String).optional())
            .output(OutputPort::new("status", DataType::Integer))
            .output(OutputPort::new("ok", DataType::Boolean))
            .output(OutputPort::new("body", DataType::String)))
    }

    fn validate_inputs(&self, request: &NodeRequest) -> Result<(), NodeError> {
        let method = request.opt_str_input("method").unwrap_or("GET");
        method
            .to_uppercase()
            .parse::<reqwest::Method>()
            .map_err(|e| NodeError::input("method", format!("Invalid method: {}", e)))?;
        if let Some(headers) = request.input("headers") {
            let all_strings = headers
                .as_object()
                .is_some_and(|h| h.values().all(Value::is_string));
            if !all_strings {
                return Err(NodeError::input("headers", "header values must be strings"));
            }
        }
        Ok(())
    }

    fn execute(
        &self,
        request: NodeRequest,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move {
            let config: HttpRequestConfig = parse_config(&request.config)?;
            let url = request.str_input("url")?;
            let method = request
                .opt_str_input("method")
                .unwrap_or("GET")
                .to_uppercase()
                .parse::<reqwest::Method>()
                .map_err(|e| NodeError::input("method", e.to_string()))?;

            let mut builder = reqwest::Client::builder();
            if let Some(remaining) = ctx.remaining() {
                builder = builder.timeout(remaining);
            }
            let client = builder.build().map_err(NodeError::execution)?;

            let mut req = client.request(method.clone(), url);
            let headers: HashMap<String, String> = request
                .input("headers")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| NodeError::input("headers", e.to_string()))?
                .unwrap_or_default();
            for (k, v) in &headers {
                req = req.header(k.as_str(), v.as_str());
            }
            if let Some(name) = &config.bearer_secret {
                let token = ctx
                    .secret(name)
                    .ok_or_else(|| NodeError::InvalidConfig(format!("unknown secret '{}'", name)))?;
                req = req.bearer_auth(token);
            }
            if let Some(body) = request.opt_str_input("body") {
                req = req.body(body.to_string());
            }

            debug!(method = %method, url = %url, "Sending HTTP request");
            let resp = cancellable(&ctx, req.send())
                .await?
                .map_err(NodeError::execution)?;
            let status = resp.status();
            let text = cancellable(&ctx, resp.text())
                .await?
                .map_err(NodeError::execution)?;
            let body = truncate(text, config.max_body_bytes);
            ctx.info(format!("{} {} -> HTTP {}", method, url, status.as_u16()));

            Ok(outputs([
                ("status", json!(status.as_u16())),
                ("ok", json!(status.is_success())),
                ("body", json!(body)),
            ]))
        })
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}
