use std::process::Stdio;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

use graphex_core::node::{
    InputPort, NodeConfig, NodeContext, NodeRequest, NodeValues, OutputPort, PortDeclaration,
};
use graphex_core::traits::NodeType;
use graphex_core::{DataType, LogLevel, NodeError};

use super::{cancellable, outputs, parse_config};

const MAX_CAPTURE: usize = 30_000;

pub struct ShellCommandNode;

#[derive(Deserialize)]
struct ShellConfig {
    #[serde(default = "default_shell")]
    shell: String,
    /// Fail the node on a non-zero exit code.
    #[serde(default = "default_true")]
    fail_on_error: bool,
    /// Secrets exported to the child as environment variables of the same name.
    #[serde(default)]
    env_secrets: Vec<String>,
}

fn default_shell() -> String {
    "sh".into()
}

fn default_true() -> bool {
    true
}

/// Read lines from a child pipe, forwarding each to the node log.
async fn pump<R: AsyncRead + Unpin>(
    reader: Option<R>,
    ctx: &NodeContext,
    level: LogLevel,
) -> std::io::Result<String> {
    let mut captured = String::new();
    let Some(reader) = reader else {
        return Ok(captured);
    };
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        ctx.log(level, line.clone());
        if captured.len() < MAX_CAPTURE {
            captured.push_str(&line);
            captured.push('\n');
        }
    }
    Ok(captured)
}

impl NodeType for ShellCommandNode {
    fn type_tag(&self) -> &str {
        "shell.command"
    }

    fn description(&self) -> &str {
        "Run a shell command. Output lines stream to the run log."
    }

    fn category(&self) -> &str {
        "System"
    }

    fn timeout_secs(&self) -> Option<u64> {
        Some(120)
    }

    fn ports(&self, config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        let _: ShellConfig = parse_config(config)?;
        Ok(PortDeclaration::new()
            .input(InputPort::new("command", DataType::String))
            .input(InputPort::new("cwd", DataType::String).optional())
            .output(OutputPort::new("stdout", DataType::String))
            .output(OutputPort::new("stderr", DataType::String))
            .output(OutputPort::new("exit_code", DataType::Integer))
            .output(OutputPort::new("success", DataType::Boolean)))
    }

    fn validate_inputs(&self, request: &NodeRequest) -> Result<(), NodeError> {
        if request.str_input("command")?.trim().is_empty() {
            return Err(NodeError::input("command", "command is empty"));
        }
        Ok(())
    }

    fn execute(
        &self,
        request: NodeRequest,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move {
            let config: ShellConfig = parse_config(&request.config)?;
            let command = request.str_input("command")?;
            let cwd = ctx.resolve_path(request.opt_str_input("cwd").unwrap_or("."));

            let mut cmd = tokio::process::Command::new(&config.shell);
            cmd.arg("-c")
                .arg(command)
                .current_dir(&cwd)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            for name in &config.env_secrets {
                let value = ctx
                    .secret(name)
                    .ok_or_else(|| NodeError::InvalidConfig(format!("unknown secret '{}'", name)))?;
                cmd.env(name, value);
            }

            debug!(node_id = %ctx.node_id, command = %command, "Executing shell command");
            let mut child = cmd.spawn()?;
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();

            let run = async {
                let (out, err) = tokio::join!(
                    pump(stdout, &ctx, LogLevel::Info),
                    pump(stderr, &ctx, LogLevel::Warning)
                );
                let status = child.wait().await?;
                Ok::<_, std::io::Error>((out?, err?, status))
            };
            let (stdout, stderr, status) = cancellable(&ctx, run).await??;

            let code = status.code().unwrap_or(-1);
            if config.fail_on_error && !status.success() {
                let detail = if stderr.trim().is_empty() { &stdout } else { &stderr };
                return Err(NodeError::execution(format!(
                    "Exit code {}\n{}",
                    code,
                    detail.trim_end()
                )));
            }

            Ok(outputs([
                ("stdout", json!(stdout)),
                ("stderr", json!(stderr)),
                ("exit_code", json!(code)),
                ("success", json!(status.success())),
            ]))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use graphex_core::traits::NodeLogSink;
    use graphex_core::{NodeId, RunId};
    use serde_json::Value;

    #[derive(Default)]
    struct Lines(Mutex<Vec<(LogLevel, String)>>);

    impl NodeLogSink for Lines {
        fn log(&self, _node: &NodeId, level: LogLevel, message: String) {
            self.0.lock().unwrap().push((level, message));
        }
    }

    fn request(config: Value, command: &str) -> NodeRequest {
        let mut inputs = NodeValues::new();
        inputs.insert("command".into(), json!(command));
        NodeRequest {
            node_id: "sh".into(),
            config: config.as_object().cloned().unwrap(),
            inputs,
        }
    }

    #[tokio::test]
    async fn test_captures_and_streams_output() {
        let lines = Arc::new(Lines::default());
        let mut ctx = NodeContext::detached(RunId::new(), "sh".into(), ".");
        ctx.log = Some(lines.clone());

        let out = ShellCommandNode
            .execute(request(json!({}), "echo one; echo two >&2"), ctx)
            .await
            .unwrap();
        assert_eq!(out["stdout"], json!("one\n"));
        assert_eq!(out["stderr"], json!("two\n"));
        assert_eq!(out["exit_code"], json!(0));

        let lines = lines.0.lock().unwrap();
        assert!(lines.contains(&(LogLevel::Info, "one".to_string())));
        assert!(lines.contains(&(LogLevel::Warning, "two".to_string())));
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let ctx = NodeContext::detached(RunId::new(), "sh".into(), ".");
        let err = ShellCommandNode
            .execute(request(json!({}), "echo bad >&2; exit 3"), ctx.clone())
            .await
            .unwrap_err();
        assert_eq!(err, NodeError::Execution("Exit code 3\nbad".into()));

        let out = ShellCommandNode
            .execute(request(json!({"fail_on_error": false}), "exit 3"), ctx)
            .await
            .unwrap();
        assert_eq!(out["success"], json!(false));
        assert_eq!(out["exit_code"], json!(3));
    }

    #[tokio::test]
    async fn test_secrets_exported_to_env() {
        let mut ctx = NodeContext::detached(RunId::new(), "sh".into(), ".");
        let mut secrets = BTreeMap::new();
        secrets.insert("GRAPHEX_TEST_TOKEN".to_string(), "s3cret".to_string());
        ctx.secrets = Arc::new(secrets);

        let out = ShellCommandNode
            .execute(
                request(
                    json!({"env_secrets": ["GRAPHEX_TEST_TOKEN"]}),
                    "printf %s \"$GRAPHEX_TEST_TOKEN\"",
                ),
                ctx,
            )
            .await
            .unwrap();
        assert_eq!(out["stdout"], json!("s3cret\n"));
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let ctx = NodeContext::detached(RunId::new(), "sh".into(), ".");
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let err = ShellCommandNode
            .execute(request(json!({}), "sleep 30"), ctx)
            .await
            .unwrap_err();
        assert_eq!(err, NodeError::Cancelled);
    }
}
