//! The generic lazy-evaluation engine.
//!
//! A [`Task`] is a named function with explicitly declared inputs and
//! outputs. Tasks are registered in a [`Plan`], keyed by the names of the
//! outputs they produce. A [`Session`] resolves a requested output by
//! walking declared inputs back to their producers, sorting the resulting
//! graph topologically and running only what is missing.
//!
//! ## Input resolution
//!
//! For every declared input the session looks, in order, at:
//!
//! 1. values already present in the session (supplied from outside or
//!    computed by an earlier request),
//! 2. the task registered in the plan as the producer of that name,
//! 3. the default declared on the task, for optional inputs.
//!
//! A required input that matches none of these fails the request before any
//! task runs.
//!
//! ## Cached tasks
//!
//! Tasks registered through [`TaskDef::cached`] are wrapped in a
//! [`CachePolicy`]: their output is a file path derived from the subject
//! identity and a fingerprint of the declared parameters. When that file is
//! already on disk the computation is skipped.

mod cache;
mod diagnostics;
mod plan;
mod session;

use std::any::type_name;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

pub use crate::engine::cache::{Artifact, CachePolicy, SUBSES, Target, read_sidecar};
pub use crate::engine::diagnostics::{Diagnostics, TaskExecution, TaskStatus};
pub use crate::engine::plan::{Plan, Variants, check_selector};
pub use crate::engine::session::Session;

use crate::core::{ArcStr, Dynamic};
use crate::error::InputError;

/// Values handed to a task body, one per declared input.
pub struct Inputs<'a> {
    task: &'a str,
    values: HashMap<ArcStr, Dynamic>,
}

impl<'a> Inputs<'a> {
    pub(crate) fn new(task: &'a str, values: HashMap<ArcStr, Dynamic>) -> Self {
        Self { task, values }
    }

    /// Name of the task these inputs belong to.
    pub fn task(&self) -> &str {
        self.task
    }

    /// Retrieves a declared input, downcast to the expected type.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Result<&T, InputError> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| InputError::Undeclared {
                task: self.task.to_string(),
                input: name.to_string(),
            })?;

        value
            .downcast_ref::<T>()
            .ok_or_else(|| InputError::WrongType {
                task: self.task.to_string(),
                input: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Retrieves a declared input as its type-erased handle.
    pub fn get_dynamic(&self, name: &str) -> Result<Dynamic, InputError> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| InputError::Undeclared {
                task: self.task.to_string(),
                input: name.to_string(),
            })
    }
}

/// Named values produced by a multi-output task.
#[derive(Default)]
pub struct Outputs {
    pub(crate) values: Vec<(ArcStr, Dynamic)>,
    pub(crate) status: TaskStatus,
}

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Send + Sync + 'static>(mut self, name: impl Into<ArcStr>, value: T) -> Self {
        self.values.push((name.into(), Arc::new(value)));
        self
    }

    /// Marks how the values came to be, [`TaskStatus::Computed`] unless set.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub(crate) fn single(name: ArcStr, value: Dynamic, status: TaskStatus) -> Self {
        Self {
            values: vec![(name, value)],
            status,
        }
    }
}

/// Type-erased task body.
pub(crate) trait Compute: Send + Sync {
    fn call(&self, inputs: &Inputs<'_>, outputs: &[ArcStr]) -> anyhow::Result<Outputs>;
}

struct Many<F>(F);

impl<F> Compute for Many<F>
where
    F: Fn(&Inputs<'_>) -> anyhow::Result<Outputs> + Send + Sync,
{
    fn call(&self, inputs: &Inputs<'_>, _: &[ArcStr]) -> anyhow::Result<Outputs> {
        (self.0)(inputs)
    }
}

struct One<R, F> {
    callback: F,
    _phantom: PhantomData<fn() -> R>,
}

impl<R, F> Compute for One<R, F>
where
    R: Send + Sync + 'static,
    F: Fn(&Inputs<'_>) -> anyhow::Result<R> + Send + Sync,
{
    fn call(&self, inputs: &Inputs<'_>, outputs: &[ArcStr]) -> anyhow::Result<Outputs> {
        let value = (self.callback)(inputs)?;
        Ok(Outputs::single(
            outputs[0].clone(),
            Arc::new(value),
            TaskStatus::Computed,
        ))
    }
}

/// A unit of work with statically declared inputs and outputs.
#[derive(Clone)]
pub struct Task {
    pub(crate) label: ArcStr,
    pub(crate) required: Vec<ArcStr>,
    pub(crate) optional: Vec<(ArcStr, Dynamic)>,
    pub(crate) outputs: Vec<ArcStr>,
    pub(crate) compute: Arc<dyn Compute>,
    pub(crate) cached: bool,
}

impl Task {
    /// Human readable name, used in logs and diagnostics.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(AsRef::as_ref)
    }

    pub fn optional(&self) -> impl Iterator<Item = &str> {
        self.optional.iter().map(|(name, _)| name.as_ref())
    }

    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(AsRef::as_ref)
    }

    /// Every declared input, required first.
    pub fn inputs(&self) -> impl Iterator<Item = &str> {
        self.required().chain(self.optional())
    }

    /// Whether the task is wrapped in a file cache.
    pub fn is_cached(&self) -> bool {
        self.cached
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("required", &self.required)
            .field("optional", &self.optional.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("outputs", &self.outputs)
            .field("cached", &self.cached)
            .finish()
    }
}

/// Builder returned by [`Plan::task`].
///
/// The name passed to [`Plan::task`] is the name of the output the task
/// produces, unless the task is registered with [`TaskDef::run_many`].
pub struct TaskDef<'a> {
    plan: &'a mut Plan,
    name: ArcStr,
    label: Option<ArcStr>,
    required: Vec<ArcStr>,
    optional: Vec<(ArcStr, Dynamic)>,
}

impl<'a> TaskDef<'a> {
    pub(crate) fn new(plan: &'a mut Plan, name: ArcStr) -> Self {
        Self {
            plan,
            name,
            label: None,
            required: Vec::new(),
            optional: Vec::new(),
        }
    }

    /// Sets the label shown in logs, defaults to the output name.
    pub fn label(mut self, label: impl Into<ArcStr>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Declares a required input.
    pub fn input(mut self, name: impl Into<ArcStr>) -> Self {
        let name = name.into();
        if !self.required.contains(&name) {
            self.required.push(name);
        }
        self
    }

    /// Declares several required inputs.
    pub fn inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ArcStr>,
    {
        for name in names {
            self = self.input(name);
        }
        self
    }

    /// Declares an optional input with a default value.
    pub fn optional<T: Send + Sync + 'static>(self, name: impl Into<ArcStr>, default: T) -> Self {
        self.optional_dynamic(name, Arc::new(default))
    }

    pub fn optional_dynamic(mut self, name: impl Into<ArcStr>, default: Dynamic) -> Self {
        let name = name.into();
        self.optional.retain(|(n, _)| *n != name);
        self.optional.push((name, default));
        self
    }

    /// Registers a task producing a single in-memory value.
    pub fn run<F, R>(self, callback: F)
    where
        F: Fn(&Inputs<'_>) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        let outputs = vec![self.name.clone()];
        let compute = One {
            callback,
            _phantom: PhantomData,
        };
        self.register(outputs, Arc::new(compute), false);
    }

    /// Registers a task producing several named values at once.
    pub fn run_many<I, S, F>(self, outputs: I, callback: F)
    where
        I: IntoIterator<Item = S>,
        S: Into<ArcStr>,
        F: Fn(&Inputs<'_>) -> anyhow::Result<Outputs> + Send + Sync + 'static,
    {
        let outputs = outputs.into_iter().map(Into::into).collect();
        self.register(outputs, Arc::new(Many(callback)), false);
    }

    /// Wraps the task in a file cache described by `policy`.
    pub fn cached(self, policy: CachePolicy) -> CachedTaskDef<'a> {
        CachedTaskDef { def: self, policy }
    }

    fn register(self, outputs: Vec<ArcStr>, compute: Arc<dyn Compute>, cached: bool) {
        let task = Task {
            label: self.label.unwrap_or_else(|| self.name.clone()),
            required: self.required,
            optional: self.optional,
            outputs,
            compute,
            cached,
        };

        self.plan.insert(task);
    }
}

/// Builder for a task whose output is persisted under a deterministic path.
pub struct CachedTaskDef<'a> {
    def: TaskDef<'a>,
    policy: CachePolicy,
}

impl<'a> CachedTaskDef<'a> {
    /// Registers the task. The callback returns the artifact to persist and
    /// a JSON object with metadata for its sidecar. The output value seen by
    /// downstream tasks is the artifact's path, a [`camino::Utf8PathBuf`].
    pub fn run<A, F>(self, callback: F)
    where
        A: Artifact,
        F: Fn(&Inputs<'_>) -> anyhow::Result<(A, serde_json::Value)> + Send + Sync + 'static,
    {
        let CachedTaskDef { mut def, policy } = self;

        for name in policy.inputs() {
            let declared = def.required.contains(name) || def.optional.iter().any(|(n, _)| n == name);
            if !declared {
                def.required.push(name.clone());
            }
        }

        let outputs = vec![def.name.clone()];
        let compute = cache::Cached::<A, F>::new(policy, callback);
        def.register(outputs, Arc::new(compute), true);
    }
}
