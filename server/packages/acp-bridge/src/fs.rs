//! `fs/read_text_file` and `fs/write_text_file`, gated by provider capabilities.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::provider::ProviderCapabilities;
use crate::transport::{RpcError, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadTextFileParams {
    path: PathBuf,
    #[serde(default)]
    line: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteTextFileParams {
    path: PathBuf,
    content: String,
}

pub async fn handle_request(
    root: &Path,
    capabilities: ProviderCapabilities,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    match method {
        "fs/read_text_file" if capabilities.read_text_file => {
            let params: ReadTextFileParams = parse_params(params)?;
            let path = resolve(root, params.path);
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|err| io_error(&path, err))?;
            Ok(json!({ "content": slice_lines(&content, params.line, params.limit) }))
        }
        "fs/write_text_file" if capabilities.write_text_file => {
            let params: WriteTextFileParams = parse_params(params)?;
            let path = resolve(root, params.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| io_error(parent, err))?;
            }
            tokio::fs::write(&path, params.content)
                .await
                .map_err(|err| io_error(&path, err))?;
            tracing::debug!(path = %path.display(), "agent wrote file");
            Ok(Value::Null)
        }
        other => Err(RpcError {
            code: METHOD_NOT_FOUND,
            message: format!("method not supported by this client: {other}"),
            data: None,
        }),
    }
}

fn resolve(root: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

/// `line` is 1-based; `limit` counts lines from there.
fn slice_lines(content: &str, line: Option<usize>, limit: Option<usize>) -> String {
    if line.is_none() && limit.is_none() {
        return content.to_string();
    }
    let skip = line.unwrap_or(1).saturating_sub(1);
    let lines = content.split_inclusive('\n').skip(skip);
    match limit {
        Some(limit) => lines.take(limit).collect(),
        None => lines.collect(),
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|err| RpcError {
        code: INVALID_PARAMS,
        message: format!("invalid params: {err}"),
        data: None,
    })
}

fn io_error(path: &Path, err: std::io::Error) -> RpcError {
    RpcError {
        code: INTERNAL_ERROR,
        message: format!("{}: {err}", path.display()),
        data: None,
    }
}
