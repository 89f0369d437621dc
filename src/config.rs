//! Named, typed, defaulted configuration lookups.
//!
//! Grounded on the `Config::Lookup` registry from the system this crate
//! implements the core of: a flat dotted namespace (`fiber.stack_size`,
//! `tcp_server.read_timeout`, ...) resolved once per process and cached.
//! Unlike that source, there is exactly one lookup spelling -- an older
//! copy of the same source also exported a `Lockup` alias (a typo); this
//! port intentionally does not recreate it.
use std::any::Any;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use once_cell::sync::Lazy;

/// A single named configuration value, holding its current resolved value
/// alongside the description it was registered with.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: T,
}

impl<T: fmt::Debug> fmt::Debug for ConfigVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigVar")
            .field("name", &self.name)
            .field("value", &self.value)
            .finish()
    }
}

impl<T: Clone> ConfigVar<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn get_value(&self) -> T {
        self.value.clone()
    }
}

static REGISTRY: Lazy<RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn env_key(name: &str) -> String {
    format!(
        "RUNTIME_{}",
        name.to_uppercase().replace('.', "_").replace('-', "_")
    )
}

/// Resolves a named, typed configuration value.
///
/// Resolution order: a value previously registered via [`set_override`],
/// then the `RUNTIME_<NAME>` environment variable, then `default`. The
/// result is cached under `name` so repeated lookups are cheap and the
/// same process never returns two different values for one `name` once
/// it has been resolved.
pub struct Config;

impl Config {
    pub fn lookup<T>(name: &str, default: T, description: &str) -> ConfigVar<T>
    where
        T: Clone + FromStr + Send + Sync + 'static,
    {
        {
            let registry = REGISTRY.read().unwrap();
            if let Some(cached) = registry.get(name) {
                if let Some(value) = cached.downcast_ref::<T>() {
                    return ConfigVar {
                        name: name.to_owned(),
                        description: description.to_owned(),
                        value: value.clone(),
                    };
                }
            }
        }

        let resolved = env::var(env_key(name))
            .ok()
            .and_then(|raw| raw.parse::<T>().ok())
            .unwrap_or(default);

        REGISTRY
            .write()
            .unwrap()
            .insert(name.to_owned(), Box::new(resolved.clone()));

        ConfigVar {
            name: name.to_owned(),
            description: description.to_owned(),
            value: resolved,
        }
    }

    /// Registers an explicit override, taking priority over the
    /// environment and the compiled-in default for subsequent lookups.
    /// Mainly useful for tests that need a deterministic stack size or
    /// timeout regardless of the host environment.
    pub fn set_override<T>(name: &str, value: T)
    where
        T: Send + Sync + 'static,
    {
        REGISTRY
            .write()
            .unwrap()
            .insert(name.to_owned(), Box::new(value));
    }
}

/// Default fiber stack size, spec section 3 ("Fiber").
pub fn fiber_stack_size() -> usize {
    Config::lookup("fiber.stack_size", 128 * 1024usize, "fiber stack size").get_value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_falls_back_to_default() {
        let v = Config::lookup("test.nonexistent_key_xyz", 42u32, "answer");
        assert_eq!(v.get_value(), 42);
    }

    #[test]
    fn explicit_override_wins() {
        Config::set_override("test.overridden_key_xyz", 7u32);
        let v = Config::lookup("test.overridden_key_xyz", 1u32, "");
        assert_eq!(v.get_value(), 7);
    }
}
