use std::path::Path;
use std::process::Stdio;

use futures::future::BoxFuture;
use serde_json::json;

use graphex_core::node::{
    InputPort, NodeConfig, NodeContext, NodeRequest, NodeValues, OutputPort, PortDeclaration,
};
use graphex_core::traits::NodeType;
use graphex_core::{DataType, NodeError};

use super::{cancellable, outputs};

async fn run_git(
    args: &[&str],
    cwd: &Path,
    ctx: &NodeContext,
) -> Result<String, NodeError> {
    let child = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| NodeError::execution(format!("Failed to run git: {}", e)))?;
    let output = cancellable(ctx, child.wait_with_output()).await??;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if output.status.success() {
        Ok(stdout)
    } else {
        Err(NodeError::execution(if stderr.is_empty() { stdout } else { stderr }))
    }
}

#[derive(Debug, Default, PartialEq)]
struct RepoStatus {
    branch: String,
    changes: Vec<String>,
}

/// Parse `git status --porcelain=v2 --branch`.
fn parse_status(out: &str) -> RepoStatus {
    let mut status = RepoStatus::default();
    for line in out.lines() {
        if let Some(head) = line.strip_prefix("# branch.head ") {
            status.branch = head.trim().to_string();
        } else if line.starts_with('#') || line.trim().is_empty() {
            continue;
        } else if let Some(path) = line.strip_prefix("? ") {
            status.changes.push(format!("?? {}", path));
        } else {
            // Ordinary, renamed and unmerged entries carry 9, 10 and 11 fields.
            let field_count = match line.as_bytes()[0] {
                b'2' => 10,
                b'u' => 11,
                _ => 9,
            };
            let fields: Vec<&str> = line.splitn(field_count, ' ').collect();
            let xy = fields.get(1).copied().unwrap_or("");
            let path = fields.last().copied().unwrap_or("");
            let path = path.split('\t').next().unwrap_or(path);
            status.changes.push(format!("{} {}", xy, path));
        }
    }
    status
}

// ── GitStatusNode ───────────────────────────────────────────────

pub struct GitStatusNode;

impl NodeType for GitStatusNode {
    fn type_tag(&self) -> &str {
        "git.status"
    }

    fn description(&self) -> &str {
        "Show the branch and pending changes of a git repository."
    }

    fn category(&self) -> &str {
        "Git"
    }

    fn ports(&self, _config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        Ok(PortDeclaration::new()
            .input(
                InputPort::new("repo", DataType::String)
                    .optional()
                    .with_default(json!(".")),
            )
            .output(OutputPort::new("branch", DataType::String))
            .output(OutputPort::new("clean", DataType::Boolean))
            .output(OutputPort::new("changes", DataType::list(DataType::String))))
    }

    fn execute(
        &self,
        request: NodeRequest,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move {
            let repo = ctx.resolve_path(request.opt_str_input("repo").unwrap_or("."));
            let out = run_git(&["status", "--porcelain=v2", "--branch"], &repo, &ctx).await?;
            let status = parse_status(&out);
            ctx.info(format!(
                "{} on {}: {} change(s)",
                repo.display(),
                status.branch,
                status.changes.len()
            ));
            Ok(outputs([
                ("branch", json!(status.branch)),
                ("clean", json!(status.changes.is_empty())),
                ("changes", json!(status.changes)),
            ]))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clean_repo() {
        let out = "# branch.oid 1234abcd\n# branch.head main\n# branch.upstream origin/main\n# branch.ab +0 -0\n";
        let status = parse_status(out);
        assert_eq!(status.branch, "main");
        assert!(status.changes.is_empty());
    }

    #[test]
    fn test_parse_changes() {
        let out = "# branch.head feature/x\n\
                   1 .M N... 100644 100644 100644 aaaa bbbb src/lib.rs\n\
                   2 R. N... 100644 100644 100644 aaaa bbbb R100 new name.rs\told.rs\n\
                   ? notes.txt\n";
        let status = parse_status(out);
        assert_eq!(status.branch, "feature/x");
        assert_eq!(
            status.changes,
            vec![
                ".M src/lib.rs".to_string(),
                "R. new name.rs".to_string(),
                "?? notes.txt".to_string(),
            ]
        );
    }
}
