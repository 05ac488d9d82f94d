use futures::future::BoxFuture;
use serde_json::json;
use tokio::io::AsyncWriteExt;

use graphex_core::node::{
    InputPort, NodeConfig, NodeContext, NodeRequest, NodeValues, OutputPort, PortDeclaration,
};
use graphex_core::traits::NodeType;
use graphex_core::{DataType, NodeError};

use super::{cancellable, outputs};

fn path_input() -> InputPort {
    InputPort::new("path", DataType::String).describe("Absolute, or relative to the working directory")
}

// ── FileReadNode ────────────────────────────────────────────────

pub struct FileReadNode;

impl NodeType for FileReadNode {
    fn type_tag(&self) -> &str {
        "file.read"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file."
    }

    fn category(&self) -> &str {
        "Files"
    }

    fn ports(&self, _config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        Ok(PortDeclaration::new()
            .input(path_input())
            .output(OutputPort::new("content", DataType::String))
            .output(OutputPort::new("size", DataType::Integer)))
    }

    fn execute(
        &self,
        request: NodeRequest,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move {
            let path = ctx.resolve_path(request.str_input("path")?);
            let content = cancellable(&ctx, tokio::fs::read_to_string(&path))
                .await?
                .map_err(|e| NodeError::Io(format!("{}: {}", path.display(), e)))?;
            let size = content.len();
            Ok(outputs([("content", json!(content)), ("size", json!(size))]))
        })
    }
}

// ── FileWriteNode ───────────────────────────────────────────────

pub struct FileWriteNode;

impl NodeType for FileWriteNode {
    fn type_tag(&self) -> &str {
        "file.write"
    }

    fn description(&self) -> &str {
        "Write text to a file, creating parent directories."
    }

    fn category(&self) -> &str {
        "Files"
    }

    fn ports(&self, _config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        Ok(PortDeclaration::new()
            .input(path_input())
            .input(InputPort::new("content", DataType::String))
            .input(
                InputPort::new("append", DataType::Boolean)
                    .optional()
                    .with_default(json!(false)),
            )
            .output(OutputPort::new("path", DataType::String))
            .output(OutputPort::new("bytes", DataType::Integer)))
    }

    fn execute(
        &self,
        request: NodeRequest,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move {
            let path = ctx.resolve_path(request.str_input("path")?);
            let content = request.str_input("content")?;
            let append = request.bool_input("append").unwrap_or(false);

            let write = async {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(append)
                    .truncate(!append)
                    .open(&path)
                    .await?;
                file.write_all(content.as_bytes()).await?;
                file.flush().await
            };
            cancellable(&ctx, write)
                .await?
                .map_err(|e| NodeError::Io(format!("{}: {}", path.display(), e)))?;

            ctx.info(format!("Wrote {} bytes to {}", content.len(), path.display()));
            Ok(outputs([
                ("path", json!(path.display().to_string())),
                ("bytes", json!(content.len())),
            ]))
        })
    }
}

// ── FileExistsNode ──────────────────────────────────────────────

pub struct FileExistsNode;

impl NodeType for FileExistsNode {
    fn type_tag(&self) -> &str {
        "file.exists"
    }

    fn description(&self) -> &str {
        "Check whether a path exists and what kind of entry it is."
    }

    fn category(&self) -> &str {
        "Files"
    }

    fn ports(&self, _config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        Ok(PortDeclaration::new()
            .input(path_input())
            .output(OutputPort::new("exists", DataType::Boolean))
            .output(OutputPort::new("is_file", DataType::Boolean))
            .output(OutputPort::new("is_dir", DataType::Boolean)))
    }

    fn execute(
        &self,
        request: NodeRequest,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move {
            let path = ctx.resolve_path(request.str_input("path")?);
            let (exists, is_file, is_dir) = match tokio::fs::metadata(&path).await {
                Ok(meta) => (true, meta.is_file(), meta.is_dir()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (false, false, false),
                Err(e) => return Err(NodeError::Io(format!("{}: {}", path.display(), e))),
            };
            Ok(outputs([
                ("exists", json!(exists)),
                ("is_file", json!(is_file)),
                ("is_dir", json!(is_dir)),
            ]))
        })
    }
}
