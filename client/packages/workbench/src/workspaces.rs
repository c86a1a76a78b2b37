use std::path::{Path, PathBuf};

use workbench_sync::types::Workspace;

use crate::cli::CliError;

const WORKSPACES_FILE: &str = "workspaces.json";

pub fn default_workspaces_file() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("workbench").join(WORKSPACES_FILE))
        .unwrap_or_else(|| PathBuf::from(".").join(".workbench").join(WORKSPACES_FILE))
}

/// Parses `id=http(s)://host[:port]`.
pub fn parse_workspace_arg(value: &str) -> Result<Workspace, CliError> {
    let invalid = || CliError::InvalidWorkspace(value.to_string());
    let (id, url) = value.split_once('=').ok_or_else(invalid)?;
    let (id, url) = (id.trim(), url.trim());
    if id.is_empty() || !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(invalid());
    }
    Ok(Workspace::new(id, url))
}

/// A JSON array of `{ "id", "name"?, "baseUrl" }` objects.
pub fn load_workspaces_file(path: &Path) -> Result<Vec<Workspace>, CliError> {
    let text = std::fs::read_to_string(path)?;
    let workspaces: Vec<Workspace> = serde_json::from_str(&text)?;
    Ok(workspaces)
}

/// Flags win over the file. A missing default file means no workspaces; a
/// missing explicit file is an error.
pub fn resolve_workspaces(
    args: &[String],
    file: Option<&Path>,
) -> Result<Vec<Workspace>, CliError> {
    if !args.is_empty() {
        return args.iter().map(|arg| parse_workspace_arg(arg)).collect();
    }
    match file {
        Some(path) => load_workspaces_file(path),
        None => {
            let path = default_workspaces_file();
            if path.exists() {
                load_workspaces_file(&path)
            } else {
                Ok(Vec::new())
            }
        }
    }
}

pub fn select_workspace(workspaces: &[Workspace], id: Option<&str>) -> Result<Workspace, CliError> {
    match (id, workspaces) {
        (Some(id), _) => workspaces
            .iter()
            .find(|workspace| workspace.id == id)
            .cloned()
            .ok_or_else(|| CliError::UnknownWorkspace(id.to_string())),
        (None, [only]) => Ok(only.clone()),
        (None, []) => Err(CliError::NoWorkspaces),
        (None, _) => Err(CliError::AmbiguousWorkspace),
    }
}
