//! Built-in leaf actions.

pub mod print;
pub mod sleep;

use std::sync::Arc;

use crate::errors::RegistryError;
use crate::registry::ActionRegistry;

pub use print::PrintAction;
pub use sleep::SleepAction;

/// Wire the built-in actions into a registry. Embedding binaries call this
/// from their bootstrap so the action set stays explicit and testable.
pub fn register_builtin_actions(registry: &mut ActionRegistry) -> Result<(), RegistryError> {
    registry.register(Arc::new(PrintAction))?;
    registry.register(Arc::new(SleepAction))?;
    Ok(())
}
