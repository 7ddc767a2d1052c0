//! Flow-file upload handling.
//!
//! Uploaded definitions are stored into the upload directory. Imports that
//! would resolve outside the upload root are copied in from the configured
//! search roots and their references rewritten; unreachable escapes reject
//! the upload.

use serde_json::Value;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use crate::errors::{ServerError, ServerResult};

/// Store an uploaded flow document. Returns the path it was written to.
pub fn store_flow(
    body: &[u8],
    filename: Option<&str>,
    upload_root: &Path,
    search_roots: &[PathBuf],
) -> ServerResult<PathBuf> {
    let mut document: Value = serde_json::from_slice(body)
        .map_err(|e| ServerError::InvalidRequest(format!("flow body is not JSON: {e}")))?;

    let flow_id = document
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ServerError::InvalidRequest("flow is missing an 'id'".to_string()))?
        .to_string();

    let filename = sanitise_filename(filename, &flow_id);
    std::fs::create_dir_all(upload_root)?;

    let mut copied = HashSet::new();
    rewrite_imports(&mut document, upload_root, search_roots, &mut copied)?;

    let target = upload_root.join(&filename);
    let content = serde_json::to_string_pretty(&document)
        .map_err(|e| ServerError::ServerError(e.to_string()))?;
    std::fs::write(&target, content)?;
    info!(flow_id = %flow_id, "stored uploaded flow at {}", target.display());
    Ok(target)
}

/// Rewrite a document's imports in place, copying escaping imports into the
/// upload root. Copied files are processed recursively so their own imports
/// cannot escape either.
fn rewrite_imports(
    document: &mut Value,
    upload_root: &Path,
    search_roots: &[PathBuf],
    copied: &mut HashSet<PathBuf>,
) -> ServerResult<()> {
    let Some(imports) = document
        .get_mut("imports")
        .and_then(Value::as_array_mut)
    else {
        return Ok(());
    };

    for import in imports {
        let Some(reference) = import.as_str() else {
            return Err(ServerError::InvalidRequest(
                "imports must be strings".to_string(),
            ));
        };
        let reference = reference.replace('\\', "/");

        if stays_inside(upload_root, &reference) {
            continue;
        }

        let source = find_in_search_roots(&reference, search_roots).ok_or_else(|| {
            ServerError::ImportEscapes(reference.clone())
        })?;

        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| ServerError::ImportEscapes(reference.clone()))?;
        let target = upload_root.join(&file_name);

        if copied.insert(target.clone()) {
            debug!(
                "copying escaping import '{}' from {} into upload root",
                reference,
                source.display()
            );
            let mut imported: Value = serde_json::from_str(
                &std::fs::read_to_string(&source)?,
            )
            .map_err(|e| {
                ServerError::InvalidRequest(format!("import '{reference}' is not JSON: {e}"))
            })?;
            rewrite_imports(&mut imported, upload_root, search_roots, copied)?;
            let content = serde_json::to_string_pretty(&imported)
                .map_err(|e| ServerError::ServerError(e.to_string()))?;
            std::fs::create_dir_all(upload_root)?;
            std::fs::write(&target, content)?;
        }

        *import = Value::String(file_name);
    }
    Ok(())
}

/// Whether a reference resolved against the upload root stays lexically
/// inside it. The check is lexical on purpose: the referenced file may not
/// exist yet.
fn stays_inside(upload_root: &Path, reference: &str) -> bool {
    let candidate = Path::new(reference);
    if candidate.is_absolute() {
        return normalise(candidate)
            .map(|resolved| resolved.starts_with(normalise_existing(upload_root)))
            .unwrap_or(false);
    }
    let joined = upload_root.join(candidate);
    normalise(&joined)
        .map(|resolved| resolved.starts_with(normalise_existing(upload_root)))
        .unwrap_or(false)
}

/// Collapse `.` and `..` components without touching the filesystem. Returns
/// `None` when `..` would climb above the path's start.
fn normalise(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

fn normalise_existing(path: &Path) -> PathBuf {
    normalise(path).unwrap_or_else(|| path.to_path_buf())
}

fn find_in_search_roots(reference: &str, search_roots: &[PathBuf]) -> Option<PathBuf> {
    let relative = Path::new(reference);

    // Absolute references are accepted when they already point below a
    // search root.
    if relative.is_absolute() {
        let resolved = normalise_existing(relative);
        return search_roots
            .iter()
            .any(|root| resolved.starts_with(normalise_existing(root)) && resolved.is_file())
            .then_some(resolved);
    }

    for root in search_roots {
        let candidate = normalise_existing(&root.join(relative));
        if !candidate.starts_with(normalise_existing(root)) {
            continue;
        }
        if candidate.is_file() {
            return Some(candidate);
        }
        // Fall back to the bare file name anywhere directly under the root.
        if let Some(name) = relative.file_name() {
            let flat = root.join(name);
            if flat.is_file() {
                return Some(flat);
            }
        }
    }
    None
}

fn sanitise_filename(filename: Option<&str>, flow_id: &str) -> String {
    let name = filename
        .and_then(|f| Path::new(f).file_name())
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("{flow_id}.json"));
    if name.ends_with(".json") {
        name
    } else {
        format!("{name}.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn body(value: &Value) -> Vec<u8> {
        serde_json::to_vec(value).unwrap()
    }

    #[test]
    fn test_store_simple_flow() {
        let dir = TempDir::new().unwrap();
        let upload = dir.path().join("uploads");

        let path = store_flow(
            &body(&json!({"id": "f1", "tasks": []})),
            None,
            &upload,
            &[],
        )
        .unwrap();

        assert_eq!(path, upload.join("f1.json"));
        assert!(path.is_file());
    }

    #[test]
    fn test_filename_header_is_sanitised() {
        let dir = TempDir::new().unwrap();
        let upload = dir.path().join("uploads");

        let path = store_flow(
            &body(&json!({"id": "f1", "tasks": []})),
            Some("../../evil"),
            &upload,
            &[],
        )
        .unwrap();

        assert_eq!(path, upload.join("evil.json"));
    }

    #[test]
    fn test_inside_import_untouched() {
        let dir = TempDir::new().unwrap();
        let upload = dir.path().join("uploads");

        let path = store_flow(
            &body(&json!({"id": "f1", "imports": ["lib.json"], "tasks": []})),
            None,
            &upload,
            &[],
        )
        .unwrap();

        let stored: Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(stored["imports"][0], "lib.json");
    }

    #[test]
    fn test_escaping_import_copied_and_rewritten() {
        let dir = TempDir::new().unwrap();
        let upload = dir.path().join("uploads");
        let library = dir.path().join("library");
        std::fs::create_dir_all(&library).unwrap();
        std::fs::write(
            library.join("shared.json"),
            serde_json::to_string(&json!({"id": "shared", "tasks": []})).unwrap(),
        )
        .unwrap();

        let path = store_flow(
            &body(&json!({"id": "f1", "imports": ["../library/shared.json"], "tasks": []})),
            None,
            &upload,
            &[library.clone()],
        )
        .unwrap();

        let stored: Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(stored["imports"][0], "shared.json");
        assert!(upload.join("shared.json").is_file());
    }

    #[test]
    fn test_unreachable_escape_rejected() {
        let dir = TempDir::new().unwrap();
        let upload = dir.path().join("uploads");

        let result = store_flow(
            &body(&json!({"id": "f1", "imports": ["../../etc/passwd.json"], "tasks": []})),
            None,
            &upload,
            &[],
        );
        assert!(matches!(result, Err(ServerError::ImportEscapes(_))));
    }

    #[test]
    fn test_copied_imports_are_processed_recursively() {
        let dir = TempDir::new().unwrap();
        let upload = dir.path().join("uploads");
        let library = dir.path().join("library");
        std::fs::create_dir_all(&library).unwrap();
        std::fs::write(
            library.join("outer.json"),
            serde_json::to_string(
                &json!({"id": "outer", "imports": ["../library/inner.json"], "tasks": []}),
            )
            .unwrap(),
        )
        .unwrap();
        std::fs::write(
            library.join("inner.json"),
            serde_json::to_string(&json!({"id": "inner", "tasks": []})).unwrap(),
        )
        .unwrap();

        store_flow(
            &body(&json!({"id": "f1", "imports": ["../library/outer.json"], "tasks": []})),
            None,
            &upload,
            &[library],
        )
        .unwrap();

        assert!(upload.join("outer.json").is_file());
        assert!(upload.join("inner.json").is_file());
        let outer: Value =
            serde_json::from_str(&std::fs::read_to_string(upload.join("outer.json")).unwrap())
                .unwrap();
        assert_eq!(outer["imports"][0], "inner.json");
    }
}
