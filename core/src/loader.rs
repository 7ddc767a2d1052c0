//! Flow definition loading.
//!
//! Loads the root flow file, recursively resolves `imports`, validates every
//! file against the combined schema, and splices imported tasks ahead of the
//! root's own tasks. Each spliced task is tagged with the id of the
//! definition that contributed it.
//!
//! Cycle handling: a DFS stack of canonical paths catches true cycles
//! (re-entering a file still being loaded fails with `ImportCycle`), while a
//! visited set lets diamond-shaped import graphs accept a shared file once
//! without splicing it twice.

use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::definition::{Definition, Task, ENGINE_ACTIONS};
use crate::errors::{LoadError, LoadResult};
use crate::registry::ActionRegistry;
use crate::schema;

/// Loads and validates flow definitions against a registry's action set.
pub struct DefinitionLoader<'a> {
    registry: &'a ActionRegistry,
}

struct LoadContext {
    stack: Vec<PathBuf>,
    visited: HashSet<PathBuf>,
    flow_ids: Vec<String>,
}

impl<'a> DefinitionLoader<'a> {
    pub fn new(registry: &'a ActionRegistry) -> Self {
        Self { registry }
    }

    /// Load a flow file and everything it imports into a single validated
    /// definition.
    pub fn load(&self, path: &Path) -> LoadResult<Definition> {
        let mut ctx = LoadContext {
            stack: Vec::new(),
            visited: HashSet::new(),
            flow_ids: Vec::new(),
        };

        let definition = self
            .load_file(path, &mut ctx)?
            .ok_or_else(|| LoadError::Invalid(format!("nothing loaded from {}", path.display())))?;

        self.check_unique_flow_ids(&ctx.flow_ids)?;
        self.check_semantics(&definition, &ctx.flow_ids)?;
        Ok(definition)
    }

    fn load_file(&self, path: &Path, ctx: &mut LoadContext) -> LoadResult<Option<Definition>> {
        let canonical = path
            .canonicalize()
            .map_err(|_| LoadError::FileNotFound(path.to_path_buf()))?;

        if ctx.stack.contains(&canonical) {
            return Err(LoadError::ImportCycle(canonical));
        }
        if !ctx.visited.insert(canonical.clone()) {
            debug!("skipping already imported flow {}", canonical.display());
            return Ok(None);
        }

        let text = std::fs::read_to_string(&canonical).map_err(|source| LoadError::Io {
            path: canonical.clone(),
            source,
        })?;
        let document: Value = serde_json::from_str(&text).map_err(|source| LoadError::Parse {
            path: canonical.clone(),
            source,
        })?;

        let violations = schema::validate(&document, self.registry)?;
        if !violations.is_empty() {
            return Err(LoadError::Schema {
                path: canonical.clone(),
                violations: violations.join("; "),
            });
        }

        let mut definition: Definition =
            serde_json::from_value(document).map_err(|source| LoadError::Parse {
                path: canonical.clone(),
                source,
            })?;

        // Tag tasks with their source definition. Explicit flow_id values
        // (as produced by re-serialising a merged definition) are kept.
        for task in &mut definition.tasks {
            if task.flow_id.is_empty() {
                task.flow_id = definition.id.clone();
            }
        }
        ctx.flow_ids.push(definition.id.clone());

        ctx.stack.push(canonical.clone());
        let mut imported_tasks: Vec<Task> = Vec::new();
        let base_dir = canonical.parent().map(Path::to_path_buf).unwrap_or_default();
        for import in &definition.imports {
            let import_path = resolve_import(&base_dir, import);
            if let Some(imported) = self.load_file(&import_path, ctx)? {
                imported_tasks.extend(imported.tasks);
            }
        }
        ctx.stack.pop();

        if !imported_tasks.is_empty() {
            imported_tasks.extend(std::mem::take(&mut definition.tasks));
            definition.tasks = imported_tasks;
        }

        debug!(
            flow_id = %definition.id,
            tasks = definition.tasks.len(),
            "loaded flow {}",
            canonical.display()
        );
        Ok(Some(definition))
    }

    fn check_unique_flow_ids(&self, flow_ids: &[String]) -> LoadResult<()> {
        let mut seen = HashSet::new();
        for id in flow_ids {
            if !seen.insert(id) {
                return Err(LoadError::Invalid(format!(
                    "flow id '{id}' is declared by more than one definition"
                )));
            }
        }
        Ok(())
    }

    fn check_semantics(&self, definition: &Definition, flow_ids: &[String]) -> LoadResult<()> {
        let mut seen_task_ids = HashSet::new();
        for task in &definition.tasks {
            // Composite children may omit ids (they get synthetic ones), but
            // top-level tasks must be addressable.
            if task.id.is_empty() {
                return Err(LoadError::Invalid(format!(
                    "flow '{}' contains a top-level task without an id",
                    task.flow_id
                )));
            }
            self.check_task(task, &mut seen_task_ids)?;
        }

        for (field, reference) in [
            ("on_error_flow", &definition.on_error_flow),
            ("finally_flow", &definition.finally_flow),
        ] {
            if let Some(flow_id) = reference {
                if !flow_ids.iter().any(|id| id == flow_id) {
                    return Err(LoadError::UnknownFlowReference {
                        field: field.to_string(),
                        flow_id: flow_id.clone(),
                    });
                }
            }
        }

        if let Some(task_id) = &definition.finally_task {
            if definition.find_task(task_id).is_none() {
                return Err(LoadError::UnknownTaskReference {
                    field: "finally_task".to_string(),
                    task_id: task_id.clone(),
                });
            }
        }

        Ok(())
    }

    fn check_task(&self, task: &Task, seen: &mut HashSet<String>) -> LoadResult<()> {
        if !seen.insert(task.id.clone()) {
            return Err(LoadError::DuplicateTaskId(task.id.clone()));
        }

        let action = task.action.to_uppercase();
        let engine_handled = ENGINE_ACTIONS.contains(&action.as_str());
        if !engine_handled && !self.registry.contains(&task.action) {
            return Err(LoadError::UnknownAction {
                task_id: task.id.clone(),
                action: task.action.clone(),
            });
        }

        for child in task.children() {
            self.check_task(&child, seen)?;
        }
        Ok(())
    }
}

/// Resolve an import reference against the importing file's directory.
/// Separators are canonicalised to forward slashes; absolute paths pass
/// through.
fn resolve_import(base_dir: &Path, import: &str) -> PathBuf {
    let normalised = import.replace('\\', "/");
    let path = PathBuf::from(&normalised);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::register_builtin_actions;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        register_builtin_actions(&mut registry).unwrap();
        registry
    }

    fn write_flow(dir: &TempDir, name: &str, value: Value) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_load_simple_flow() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        let path = write_flow(
            &dir,
            "flow.json",
            json!({
                "id": "root",
                "tasks": [{"id": "a", "action": "PRINT", "entries": [{"message": "hi"}]}]
            }),
        );

        let definition = DefinitionLoader::new(&registry).load(&path).unwrap();
        assert_eq!(definition.id, "root");
        assert_eq!(definition.tasks.len(), 1);
        assert_eq!(definition.tasks[0].flow_id, "root");
    }

    #[test]
    fn test_missing_file() {
        let registry = registry();
        let err = DefinitionLoader::new(&registry)
            .load(Path::new("/definitely/not/here.json"))
            .unwrap_err();
        assert!(matches!(err, LoadError::FileNotFound(_)));
    }

    #[test]
    fn test_parse_error() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        let err = DefinitionLoader::new(&registry).load(&path).unwrap_err();
        assert!(matches!(err, LoadError::Parse { .. }));
    }

    #[test]
    fn test_imports_are_prepended_with_flow_ids() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        write_flow(
            &dir,
            "lib.json",
            json!({
                "id": "lib",
                "tasks": [{"id": "setup", "action": "PRINT", "entries": []}]
            }),
        );
        let root = write_flow(
            &dir,
            "root.json",
            json!({
                "id": "root",
                "imports": ["lib.json"],
                "tasks": [{"id": "main", "action": "PRINT", "entries": []}]
            }),
        );

        let definition = DefinitionLoader::new(&registry).load(&root).unwrap();
        assert_eq!(definition.tasks.len(), 2);
        assert_eq!(definition.tasks[0].id, "setup");
        assert_eq!(definition.tasks[0].flow_id, "lib");
        assert_eq!(definition.tasks[1].id, "main");
        assert_eq!(definition.tasks[1].flow_id, "root");
    }

    #[test]
    fn test_import_cycle_detected() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        write_flow(
            &dir,
            "a.json",
            json!({"id": "a", "imports": ["b.json"], "tasks": [
                {"id": "ta", "action": "PRINT", "entries": []}
            ]}),
        );
        write_flow(
            &dir,
            "b.json",
            json!({"id": "b", "imports": ["a.json"], "tasks": [
                {"id": "tb", "action": "PRINT", "entries": []}
            ]}),
        );

        let err = DefinitionLoader::new(&registry)
            .load(&dir.path().join("a.json"))
            .unwrap_err();
        assert!(matches!(err, LoadError::ImportCycle(_)));
    }

    #[test]
    fn test_diamond_import_accepted_once() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        write_flow(
            &dir,
            "shared.json",
            json!({"id": "shared", "tasks": [
                {"id": "common", "action": "PRINT", "entries": []}
            ]}),
        );
        write_flow(
            &dir,
            "left.json",
            json!({"id": "left", "imports": ["shared.json"], "tasks": []}),
        );
        write_flow(
            &dir,
            "right.json",
            json!({"id": "right", "imports": ["shared.json"], "tasks": []}),
        );
        let root = write_flow(
            &dir,
            "root.json",
            json!({"id": "root", "imports": ["left.json", "right.json"], "tasks": [
                {"id": "main", "action": "PRINT", "entries": []}
            ]}),
        );

        let definition = DefinitionLoader::new(&registry).load(&root).unwrap();
        let ids: Vec<&str> = definition.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["common", "main"]);
    }

    #[test]
    fn test_unknown_action_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        let path = write_flow(
            &dir,
            "flow.json",
            json!({"id": "root", "tasks": [{"id": "a", "action": "TELEPORT"}]}),
        );
        let err = DefinitionLoader::new(&registry).load(&path).unwrap_err();
        assert!(matches!(err, LoadError::UnknownAction { .. }));
    }

    #[test]
    fn test_duplicate_task_id_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        let path = write_flow(
            &dir,
            "flow.json",
            json!({"id": "root", "tasks": [
                {"id": "a", "action": "PRINT", "entries": []},
                {"id": "a", "action": "PRINT", "entries": []}
            ]}),
        );
        let err = DefinitionLoader::new(&registry).load(&path).unwrap_err();
        assert!(matches!(err, LoadError::DuplicateTaskId(_)));
    }

    #[test]
    fn test_duplicate_child_id_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        let path = write_flow(
            &dir,
            "flow.json",
            json!({"id": "root", "tasks": [
                {"id": "a", "action": "PRINT", "entries": []},
                {"id": "par", "action": "PARALLEL", "tasks": [
                    {"id": "a", "action": "PRINT", "entries": []}
                ]}
            ]}),
        );
        let err = DefinitionLoader::new(&registry).load(&path).unwrap_err();
        assert!(matches!(err, LoadError::DuplicateTaskId(_)));
    }

    #[test]
    fn test_dangling_hook_references() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        let path = write_flow(
            &dir,
            "flow.json",
            json!({"id": "root", "on_error_flow": "missing", "tasks": [
                {"id": "a", "action": "PRINT", "entries": []}
            ]}),
        );
        let err = DefinitionLoader::new(&registry).load(&path).unwrap_err();
        assert!(matches!(err, LoadError::UnknownFlowReference { .. }));

        let path = write_flow(
            &dir,
            "flow2.json",
            json!({"id": "root2", "finally_task": "missing", "tasks": [
                {"id": "a", "action": "PRINT", "entries": []}
            ]}),
        );
        let err = DefinitionLoader::new(&registry).load(&path).unwrap_err();
        assert!(matches!(err, LoadError::UnknownTaskReference { .. }));
    }

    #[test]
    fn test_reload_roundtrip_preserves_tasks() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        write_flow(
            &dir,
            "lib.json",
            json!({"id": "lib", "tasks": [
                {"id": "setup", "action": "PRINT", "entries": []}
            ]}),
        );
        let root = write_flow(
            &dir,
            "root.json",
            json!({"id": "root", "imports": ["lib.json"], "tasks": [
                {"id": "main", "action": "SLEEP", "seconds": 1}
            ]}),
        );

        let loader = DefinitionLoader::new(&registry);
        let first = loader.load(&root).unwrap();

        // Serialise the merged definition (imports already spliced) and load
        // it again from disk.
        let mut merged = first.clone();
        merged.imports.clear();
        let reloaded_path = write_flow(&dir, "merged.json", serde_json::to_value(&merged).unwrap());
        let second = loader.load(&reloaded_path).unwrap();

        let first_view: Vec<(String, String)> = first
            .tasks
            .iter()
            .map(|t| (t.id.clone(), t.flow_id.clone()))
            .collect();
        let second_view: Vec<(String, String)> = second
            .tasks
            .iter()
            .map(|t| (t.id.clone(), t.flow_id.clone()))
            .collect();
        assert_eq!(first_view, second_view);
    }
}
