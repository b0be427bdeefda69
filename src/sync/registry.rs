use crate::config::Config;
use crate::error::Result;
use crate::process::{self, ActivationHooks, ChildError, ForkEvent, ProcessHandle};
use crate::sanitize::Sanitizer;
use crate::value::Value;

use super::endpoint::SyncEndpoint;
use super::stand_in::StandIn;
use super::target::Target;

/// The context stand-ins and forks share: every stand-in created through a
/// registry is armed by every fork made through it.
#[derive(Default)]
pub struct Registry {
    config: Config,
    sanitizer: Sanitizer,
    hooks: ActivationHooks,
}

impl Registry {
    /// A registry configured from the environment.
    pub fn new() -> Self {
        Registry::with_config(Config::from_env())
    }

    pub fn with_config(config: Config) -> Self {
        Registry {
            config,
            sanitizer: Sanitizer::default(),
            hooks: ActivationHooks::new(),
        }
    }

    /// Sanitizer applied to values mirrored by stand-ins created afterwards.
    pub fn with_sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Wraps `target` in a stand-in with its own sync channel. It stays
    /// local-only until the next fork made through this registry.
    pub fn synchronize<T: Target + 'static>(&mut self, target: T) -> Result<StandIn<T>> {
        let endpoint = SyncEndpoint::new(self.config.clone(), self.sanitizer.clone())?;
        let stand_in = StandIn::new(target, endpoint);
        self.hooks.prune();
        self.hooks.register_channel(stand_in.fork_channel());
        log::debug!("{} activation hooks registered", self.hooks.len());
        Ok(stand_in)
    }

    /// Adds a hook run in both processes after every fork made through this
    /// registry, after the hooks registered before it.
    pub fn register_activation_hook<F>(&mut self, hook: F)
    where
        F: Fn(&ForkEvent) + 'static,
    {
        self.hooks.register(hook);
    }

    pub fn spawn<F, T, E>(&self, f: F) -> Result<ProcessHandle>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        T: Into<Value>,
        E: Into<ChildError>,
    {
        process::spawn_with(&self.config, &self.hooks, f)
    }

    pub fn run<F, T, E>(&self, f: F) -> Result<Value>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        T: Into<Value>,
        E: Into<ChildError>,
    {
        self.spawn(f)?.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Side;
    use crate::value::{Object, ObjectRef};
    use anyhow::Result;
    use serial_test::serial;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    #[serial]
    fn test_child_write_is_seen_by_parent() -> Result<()> {
        let mut registry = Registry::with_config(Config::default());
        let counter = registry.synchronize(ObjectRef::new(Object::new("Counter").with("count", 0)))?;
        assert_eq!(counter.depth(), 0);

        let child_counter = counter.clone();
        let depth_in_child = registry.run(move || {
            child_counter.set("count", 5)?;
            Ok::<_, ChildError>(child_counter.depth() as i64)
        })?;

        assert_eq!(depth_in_child, Value::Int(1));
        assert_eq!(counter.depth(), 1);
        assert_eq!(counter.get("count")?, Value::Int(5));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_hooks_run_in_registration_order() -> Result<()> {
        let mut registry = Registry::with_config(Config::default());
        let seen = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            registry.register_activation_hook(move |event: &ForkEvent| {
                if event.side() == Side::Parent {
                    seen.borrow_mut().push(i);
                }
            });
        }
        registry.run(|| Ok::<_, ChildError>(()))?;
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_dropped_stand_ins_are_pruned() -> Result<()> {
        let mut registry = Registry::with_config(Config::default());
        registry.register_activation_hook(|_: &ForkEvent| {});
        for _ in 0..3 {
            registry.synchronize(ObjectRef::new(Object::new("Scratch")))?;
        }
        let kept = registry.synchronize(ObjectRef::new(Object::new("Kept")))?;
        assert_eq!(registry.hooks.len(), 2);
        assert_eq!(kept.depth(), 0);
        Ok(())
    }

    #[test]
    #[serial]
    fn test_long_child_session_is_fully_mirrored() -> Result<()> {
        let mut registry = Registry::with_config(Config {
            poll_interval_ms: 100,
            write_timeout_ms: 200,
            ..Default::default()
        });
        let counter = registry.synchronize(ObjectRef::new(Object::new("Counter").with("count", 0)))?;

        let child_counter = counter.clone();
        registry.run(move || {
            for i in 0..1000 {
                child_counter.set("count", i)?;
            }
            Ok::<_, ChildError>(())
        })?;

        assert_eq!(counter.sync()?, 1000);
        assert_eq!(counter.get("count")?, Value::Int(999));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_opaque_classes_are_not_mirrored() -> Result<()> {
        let mut registry = Registry::with_config(Config::default())
            .with_sanitizer(Sanitizer::new().with_opaque_class("Connection"));
        let service = registry.synchronize(ObjectRef::new(Object::new("Service")))?;

        let child_service = service.clone();
        registry.run(move || {
            child_service.set("db", Object::new("Connection").with("dsn", "sqlite::memory:"))?;
            Ok::<_, ChildError>(())
        })?;

        assert!(!service.isset("db")?);
        assert_eq!(service.get("db")?, Value::Absent);
        Ok(())
    }
}
