//! Named-event callback registry.
//!
//! Components own a [`HookRegistry`] and expose `hook`/`call_hook` as plain
//! methods. Callbacks for one name run strictly one after another; a failing
//! or panicking callback is logged and skipped, the rest still run.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use tracing::error;

/// Boxed hook callback.
pub type Hook<A, R> = Box<dyn FnMut(&A) -> anyhow::Result<R> + Send>;

/// Callbacks grouped by event name, in registration order.
pub struct HookRegistry<A, R = ()> {
    hooks: HashMap<String, Vec<Hook<A, R>>>,
}

impl<A, R> HookRegistry<A, R> {
    pub fn new() -> Self {
        Self {
            hooks: HashMap::new(),
        }
    }

    /// Append a callback for `name`. Ignored when `name` is empty.
    pub fn hook<F>(&mut self, name: &str, callback: F)
    where
        F: FnMut(&A) -> anyhow::Result<R> + Send + 'static,
    {
        if name.is_empty() {
            return;
        }
        self.hooks
            .entry(name.to_string())
            .or_default()
            .push(Box::new(callback));
    }

    /// Run every callback for `name` in order and collect the successful results.
    pub fn call_hook(&mut self, name: &str, args: &A) -> Vec<R> {
        let Some(hooks) = self.hooks.get_mut(name) else {
            return Vec::new();
        };

        let mut results = Vec::with_capacity(hooks.len());
        for (index, callback) in hooks.iter_mut().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(args))) {
                Ok(Ok(value)) => results.push(value),
                Ok(Err(e)) => {
                    error!(hook = name, index, error = %format!("{:#}", e), "Error on hook");
                }
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(hook = name, index, panic = %message, "Hook panicked");
                }
            }
        }
        results
    }
}

impl<A, R> Default for HookRegistry<A, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, R> std::fmt::Debug for HookRegistry<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&str, usize> = self
            .hooks
            .iter()
            .map(|(name, hooks)| (name.as_str(), hooks.len()))
            .collect();
        f.debug_struct("HookRegistry").field("hooks", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_hooks_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry: HookRegistry<u32> = HookRegistry::new();

        for tag in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            registry.hook("done", move |n: &u32| {
                order.lock().unwrap().push(format!("{}{}", tag, n));
                Ok(())
            });
        }

        let results = registry.call_hook("done", &1);
        assert_eq!(results.len(), 3);
        assert_eq!(*order.lock().unwrap(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn test_failing_hook_does_not_stop_the_rest() {
        let mut registry: HookRegistry<(), u8> = HookRegistry::new();
        registry.hook("built", |_| Ok(1));
        registry.hook("built", |_| anyhow::bail!("disk full"));
        registry.hook("built", |_| panic!("bad hook"));
        registry.hook("built", |_| Ok(4));

        assert_eq!(registry.call_hook("built", &()), vec![1, 4]);
    }

    #[test]
    fn test_unknown_and_empty_names() {
        let mut registry: HookRegistry<()> = HookRegistry::default();
        registry.hook("", |_| Ok(()));
        assert!(registry.call_hook("", &()).is_empty());
        assert!(registry.call_hook("done", &()).is_empty());
    }
}
