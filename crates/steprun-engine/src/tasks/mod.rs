//! Built-in task types.

mod copy;
mod explode;
mod fail;
mod find_latest;
mod hello_world;
mod sleep;

pub use copy::{CopyFile, CopyMany};
pub use explode::{substitute, Explode, ExplodeGlob};
pub use fail::{Exit, Fail};
pub use find_latest::FindLatest;
pub use hello_world::HelloWorld;
pub use sleep::{Sleep, SleepBlocking};

use crate::registry::TaskRegistry;

/// Registry holding every built-in task type.
pub fn builtin_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register_blocking("hello_world", HelloWorld::from_spec)
        .register_cooperative("sleep", Sleep::from_spec)
        .register_blocking("sleep_blocking", SleepBlocking::from_spec)
        .register_blocking("fail", Fail::from_spec)
        .register_blocking("exit", Exit::from_spec)
        .register_blocking("copy", CopyFile::from_spec)
        .register_cooperative("copy_many", CopyMany::from_spec)
        .register_cooperative("find_latest", FindLatest::from_spec)
        .register_blocking("explode", Explode::from_spec)
        .register_blocking("explode_glob", ExplodeGlob::from_spec);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ExecutionMode;

    #[test]
    fn test_builtin_modes() {
        let registry = builtin_registry();
        assert_eq!(registry.resolve("sleep").unwrap().mode(), ExecutionMode::Cooperative);
        assert_eq!(registry.resolve("copy").unwrap().mode(), ExecutionMode::Blocking);
        assert_eq!(
            registry.resolve("sleep_blocking").unwrap().mode(),
            ExecutionMode::Blocking
        );
        assert_eq!(
            registry.resolve("find_latest").unwrap().mode(),
            ExecutionMode::Cooperative
        );
        assert_eq!(registry.tags().count(), 10);
    }
}
