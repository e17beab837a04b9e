//! The callable registry.
//!
//! Wire messages reference task functions by name; every worker runs
//! the same program text and registers the same table at bootstrap, so
//! a name submitted on one worker resolves to the same function on
//! whichever worker executes it. This replaces by-name dynamic import
//! with an explicit, inspectable table.

use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};

use crate::error::{Error, TaskError};
use crate::value::{Args, Value};

/// Outcome of one task body.
pub type TaskResult = Result<Value, TaskError>;

/// A registered task function: invoked with the task's arguments, it
/// yields a local future that may itself submit and await children.
pub type TaskFn = Rc<dyn Fn(Args) -> LocalBoxFuture<'static, TaskResult>>;

#[derive(Default)]
pub struct Registry {
    table: HashMap<String, TaskFn>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Registers an async task body.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Args) -> Fut + 'static,
        Fut: Future<Output = TaskResult> + 'static,
    {
        self.table.insert(name.into(), Rc::new(move |args| f(args).boxed_local()));
    }

    /// Registers a plain synchronous function. The body runs on the
    /// task's own stack, not at registration or submission time.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Args) -> TaskResult + 'static,
    {
        let f = Rc::new(f);
        self.table.insert(
            name.into(),
            Rc::new(move |args| {
                let f = f.clone();
                async move { f(args) }.boxed_local()
            }),
        );
    }

    pub fn resolve(&self, name: &str) -> Result<TaskFn, Error> {
        self.table.get(name).cloned().ok_or_else(|| Error::UnknownCallable(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_by_name() {
        let mut registry = Registry::new();
        registry.register_fn("double", |args| Ok(json!(args.int(0)? * 2)));
        let f = registry.resolve("double").unwrap();
        let result = futures::executor::block_on(f(Args::new().arg(21)));
        assert_eq!(result.unwrap(), json!(42));
    }

    #[test]
    fn unknown_names_are_an_error() {
        let registry = Registry::new();
        assert!(matches!(registry.resolve("nope"), Err(Error::UnknownCallable(_))));
    }

    #[test]
    fn sync_bodies_run_lazily() {
        use std::cell::Cell;
        use std::rc::Rc;

        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let mut registry = Registry::new();
        registry.register_fn("probe", move |_| {
            flag.set(true);
            Ok(Value::Null)
        });

        let fut = registry.resolve("probe").unwrap()(Args::new());
        assert!(!ran.get());
        futures::executor::block_on(fut).unwrap();
        assert!(ran.get());
    }
}
