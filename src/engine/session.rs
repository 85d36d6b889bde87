use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use indicatif::ProgressStyle;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{ArcStr, Dynamic};
use crate::engine::{Diagnostics, Inputs, Plan, TaskExecution};
use crate::error::{ConfigError, InputError, PlanError, TractometryError};

/// One resolution context over a [`Plan`], typically one per subject and
/// session.
///
/// Values supplied from outside and every value computed while answering a
/// request stay in the session, so later requests reuse them instead of
/// running their producers again. Sessions share nothing mutable with each
/// other and can be driven from different threads over the same plan.
pub struct Session<'p> {
    plan: &'p Plan,
    values: HashMap<ArcStr, Dynamic>,
    diagnostics: Diagnostics,
    style: Option<ProgressStyle>,
}

impl<'p> Session<'p> {
    pub fn new(plan: &'p Plan) -> Self {
        Self {
            plan,
            values: HashMap::new(),
            diagnostics: Diagnostics::default(),
            style: crate::utils::get_style_task().ok(),
        }
    }

    pub fn plan(&self) -> &'p Plan {
        self.plan
    }

    /// Supplies an external value. Supplied values take precedence over the
    /// task the plan registers for the same name.
    pub fn supply<T: Send + Sync + 'static>(
        &mut self,
        name: impl Into<ArcStr>,
        value: T,
    ) -> &mut Self {
        self.supply_dynamic(name, Arc::new(value))
    }

    pub fn supply_dynamic(&mut self, name: impl Into<ArcStr>, value: Dynamic) -> &mut Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Looks up a value without computing anything.
    pub fn value<T: Send + Sync + 'static>(&self, name: &str) -> Option<&T> {
        self.values.get(name)?.downcast_ref::<T>()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Computes the tasks needed for `output`, in execution order, without
    /// running any of them.
    pub fn schedule(&self, output: &str) -> Result<Vec<usize>, PlanError> {
        let root = self
            .plan
            .producer_index(output)
            .ok_or_else(|| PlanError::UnknownOutput(output.to_string()))?;

        if self.values.contains_key(output) {
            return Ok(Vec::new());
        }

        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let mut nodes: HashMap<usize, NodeIndex> = HashMap::new();
        let mut stack = vec![root];
        nodes.insert(root, graph.add_node(root));

        while let Some(index) = stack.pop() {
            let task = self.plan.task_at(index);
            let consumer = nodes[&index];

            let required = task.required.iter().map(|name| (name, true));
            let optional = task.optional.iter().map(|(name, _)| (name, false));

            for (input, is_required) in required.chain(optional) {
                if self.values.contains_key(input) {
                    continue;
                }

                match self.plan.producer_index(input) {
                    Some(producer) => {
                        let node = match nodes.get(&producer) {
                            Some(&node) => node,
                            None => {
                                let node = graph.add_node(producer);
                                nodes.insert(producer, node);
                                stack.push(producer);
                                node
                            }
                        };
                        graph.update_edge(node, consumer, ());
                    }
                    None if is_required => {
                        return Err(PlanError::Unresolvable {
                            task: task.label.to_string(),
                            input: input.to_string(),
                        });
                    }
                    None => {}
                }
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            let node = cycle.node_id();
            let component = tarjan_scc(&graph)
                .into_iter()
                .find(|component| component.contains(&node))
                .unwrap_or_else(|| vec![node]);

            let mut tasks: Vec<String> = component
                .into_iter()
                .map(|n| self.plan.task_at(graph[n]).label.to_string())
                .collect();
            tasks.sort();

            PlanError::Cyclic { tasks }
        })?;

        Ok(order.into_iter().map(|node| graph[node]).collect())
    }

    /// Resolves `output`, running every missing task it depends on.
    pub fn resolve(&mut self, output: &str) -> Result<Dynamic, TractometryError> {
        let order = self.schedule(output)?;

        if !order.is_empty() {
            let labels: Vec<&str> = order
                .iter()
                .map(|&index| self.plan.task_at(index).label())
                .collect();
            tracing::debug!("Resolving '{output}' through {}", labels.join(", "));
        }

        for index in order {
            self.execute(index)?;
        }

        self.values.get(output).cloned().ok_or_else(|| {
            let task = self.plan.producer(output).map(|t| t.label()).unwrap_or(output);
            TractometryError::Task(
                task.to_string(),
                anyhow::anyhow!("did not produce '{output}'"),
            )
        })
    }

    /// Resolves `output` and downcasts it.
    pub fn get<T: Send + Sync + 'static>(&mut self, output: &str) -> Result<&T, TractometryError> {
        self.resolve(output)?;

        let task = self.plan.producer(output).map(|t| t.label()).unwrap_or(output);
        self.values
            .get(output)
            .and_then(|value| value.downcast_ref::<T>())
            .ok_or_else(|| {
                ConfigError::Input(InputError::WrongType {
                    task: task.to_string(),
                    input: output.to_string(),
                    expected: std::any::type_name::<T>(),
                })
                .into()
            })
    }

    fn execute(&mut self, index: usize) -> Result<(), TractometryError> {
        let plan = self.plan;
        let task = plan.task_at(index);

        let mut values = HashMap::new();
        for name in &task.required {
            let value = self.values.get(name).cloned().ok_or_else(|| {
                PlanError::Unresolvable {
                    task: task.label.to_string(),
                    input: name.to_string(),
                }
            })?;
            values.insert(name.clone(), value);
        }
        for (name, default) in &task.optional {
            let value = self.values.get(name).unwrap_or(default).clone();
            values.insert(name.clone(), value);
        }

        let inputs = Inputs::new(&task.label, values);

        let span = tracing::info_span!("task", name = %task.label);
        if let Some(style) = &self.style {
            span.pb_set_style(style);
        }
        span.pb_set_message(&format!("Running {}", task.label));
        let _enter = span.enter();

        let start = Instant::now();
        let result = task
            .compute
            .call(&inputs, &task.outputs)
            .map_err(|err| TractometryError::from_task(&task.label, err))?;
        let duration = start.elapsed();

        for declared in &task.outputs {
            if !result.values.iter().any(|(name, _)| name == declared) {
                return Err(TractometryError::Task(
                    task.label.to_string(),
                    anyhow::anyhow!("did not produce declared output '{declared}'"),
                ));
            }
        }

        for (name, value) in result.values {
            if task.outputs.contains(&name) {
                self.values.entry(name).or_insert(value);
            } else {
                tracing::warn!("Task '{}' produced undeclared output '{name}'", task.label);
            }
        }

        self.diagnostics.record(TaskExecution {
            task: task.label.to_string(),
            status: result.status,
            start,
            duration,
        });

        Ok(())
    }
}
