use std::collections::HashMap;
use std::sync::Arc;

use crate::core::ArcStr;
use crate::engine::{Task, TaskDef};
use crate::error::ConfigError;

/// A mapping from output name to the task that produces it.
///
/// Registering a task for a name that already has a producer replaces the
/// previous producer for that name; the last registration wins. Tasks are
/// shared behind [`Arc`], so cloning a plan is cheap and plans built from
/// the same parts can be specialised independently.
#[derive(Clone, Default)]
pub struct Plan {
    tasks: Vec<Arc<Task>>,
    producers: HashMap<ArcStr, usize>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the definition of a task producing the output `name`.
    pub fn task(&mut self, name: impl Into<ArcStr>) -> TaskDef<'_> {
        TaskDef::new(self, name.into())
    }

    pub(crate) fn insert(&mut self, task: Task) {
        let index = self.tasks.len();

        for output in &task.outputs {
            if let Some(previous) = self.producers.insert(output.clone(), index) {
                tracing::trace!(
                    "Output '{output}' of '{}' replaced by '{}'",
                    self.tasks[previous].label,
                    task.label
                );
            }
        }

        self.tasks.push(Arc::new(task));
    }

    /// Adds every task of `other`, overriding producers of shared names.
    pub fn merge(mut self, other: Plan) -> Self {
        for task in other.tasks() {
            self.insert(task.clone());
        }
        self
    }

    /// The task currently registered for `output`.
    pub fn producer(&self, output: &str) -> Option<&Task> {
        self.producers
            .get(output)
            .map(|&index| self.tasks[index].as_ref())
    }

    pub(crate) fn producer_index(&self, output: &str) -> Option<usize> {
        self.producers.get(output).copied()
    }

    pub(crate) fn task_at(&self, index: usize) -> &Task {
        &self.tasks[index]
    }

    pub fn contains(&self, output: &str) -> bool {
        self.producers.contains_key(output)
    }

    /// All output names the plan can produce, sorted.
    pub fn outputs(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.producers.keys().map(AsRef::as_ref).collect();
        names.sort_unstable();
        names
    }

    /// Tasks that still produce at least one output, in registration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.active().map(|(_, task)| task)
    }

    pub(crate) fn active(&self) -> impl Iterator<Item = (usize, &Task)> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(index, _)| self.producers.values().any(|p| p == index))
            .map(|(index, task)| (index, task.as_ref()))
    }

    /// Dependency edges `(producer, input name, consumer)` between active
    /// tasks, as indices into the plan.
    pub(crate) fn edges(&self) -> Vec<(usize, &str, usize)> {
        let mut edges = Vec::new();

        for (consumer, task) in self.active() {
            for input in task.inputs() {
                if let Some(producer) = self.producer_index(input) {
                    edges.push((producer, input, consumer));
                }
            }
        }

        edges
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.tasks()).finish()
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for (index, task) in self.active() {
            let name = task.label().replace('"', "\\\"");
            let shape = if task.is_cached() { ("[(", ")]") } else { ("[", "]") };
            writeln!(f, "    {index}{}\"{name}\"{}", shape.0, shape.1)?;
        }

        for (source, input, target) in self.edges() {
            writeln!(f, "    {source} -- \"{input}\" --> {target}")?;
        }

        Ok(())
    }
}

/// Validates `value` against a closed set of recognised values, ignoring
/// ASCII case, and returns the canonical spelling.
pub fn check_selector(
    flag: &'static str,
    value: &str,
    allowed: &[&'static str],
) -> Result<&'static str, ConfigError> {
    allowed
        .iter()
        .find(|candidate| candidate.eq_ignore_ascii_case(value))
        .copied()
        .ok_or_else(|| ConfigError::Selector {
            flag,
            value: value.to_string(),
            allowed: allowed.to_vec(),
        })
}

type Apply = Box<dyn FnOnce(&mut Plan)>;

/// Alternate task sets chosen by a selector flag.
///
/// Each option is a function that registers its tasks on top of a base
/// plan. Because registration replaces producers by output name, an option
/// overrides the tasks it redefines and leaves every other task untouched.
///
/// ```rust
/// use tractometry::engine::{Plan, Variants};
///
/// let mut base = Plan::new();
/// base.task("mapping").run(|_| Ok("syn"));
///
/// let plan = Variants::new("mapping")
///     .option("syn", |_| {})
///     .option("sls", |plan| plan.task("mapping").label("sls_mapping").run(|_| Ok("sls")))
///     .apply(base, "sls")
///     .unwrap();
///
/// assert_eq!(plan.producer("mapping").unwrap().label(), "sls_mapping");
/// ```
pub struct Variants {
    flag: &'static str,
    options: Vec<(&'static str, Apply)>,
}

impl Variants {
    pub fn new(flag: &'static str) -> Self {
        Self {
            flag,
            options: Vec::new(),
        }
    }

    pub fn option<F>(mut self, value: &'static str, apply: F) -> Self
    where
        F: FnOnce(&mut Plan) + 'static,
    {
        self.options.push((value, Box::new(apply)));
        self
    }

    /// The recognised values, in registration order.
    pub fn allowed(&self) -> Vec<&'static str> {
        self.options.iter().map(|(value, _)| *value).collect()
    }

    /// Applies the option named `value` to `plan`. Nothing is applied when
    /// `value` is not one of the recognised options.
    pub fn apply(self, mut plan: Plan, value: &str) -> Result<Plan, ConfigError> {
        let allowed = self.allowed();
        let chosen = check_selector(self.flag, value, &allowed)?;

        let apply = self
            .options
            .into_iter()
            .find_map(|(name, apply)| (name == chosen).then_some(apply));

        if let Some(apply) = apply {
            apply(&mut plan);
        }

        Ok(plan)
    }
}
