//! LSP payload builders and file-URI helpers for the session layer.

use std::path::Path;

use anyhow::Result;
use serde_json::Value;

/// Minimal `initialize` payload: no workspace root, no advertised
/// capabilities. Callers that need more go through `request` directly.
pub(crate) fn initialize_params() -> Value {
    serde_json::json!({
        "processId": std::process::id(),
        "rootUri": null,
        "capabilities": {}
    })
}

pub(crate) fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url> {
    url::Url::from_file_path(path)
        .map_err(|()| anyhow::anyhow!("cannot convert path to file URI: {}", path.display()))
}

/// Language id derived from the file extension, like most editors do
/// when nothing better is known.
pub(crate) fn language_id_for(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("plaintext")
        .to_string()
}
