use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::engine::Plan;

/// How a task's outputs came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
    /// The task body ran.
    #[default]
    Computed,
    /// A cached artifact was found on disk and the body was skipped.
    Cached,
}

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub task: String,
    pub status: TaskStatus,
    pub start: Instant,
    pub duration: Duration,
}

/// Execution record of a session.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    pub executions: Vec<TaskExecution>,
}

impl Diagnostics {
    pub(crate) fn record(&mut self, execution: TaskExecution) {
        self.executions.push(execution);
    }

    /// How many times the body of `task` actually ran.
    pub fn computed(&self, task: &str) -> usize {
        self.count(task, TaskStatus::Computed)
    }

    /// How many times `task` was answered from an on-disk artifact.
    pub fn cached(&self, task: &str) -> usize {
        self.count(task, TaskStatus::Cached)
    }

    fn count(&self, task: &str, status: TaskStatus) -> usize {
        self.executions
            .iter()
            .filter(|e| e.task == task && e.status == status)
            .count()
    }

    /// Task labels in the order they were invoked.
    pub fn order(&self) -> Vec<&str> {
        self.executions.iter().map(|e| e.task.as_str()).collect()
    }

    /// Renders the plan as a Mermaid diagram, color-coded by what happened
    /// to each task in this session.
    ///
    /// * **Green** to **Red**: computed, from fastest to slowest
    /// * **Blue**: loaded from cache
    /// * **Grey**: not needed
    pub fn render_mermaid(&self, plan: &Plan) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let mut latest: HashMap<&str, &TaskExecution> = HashMap::new();
        for exec in &self.executions {
            latest.insert(exec.task.as_str(), exec);
        }

        let computed = latest
            .values()
            .filter(|e| e.status == TaskStatus::Computed)
            .map(|e| e.duration.as_secs_f64());
        let (mut min_time, mut max_time) = computed.fold((f64::MAX, f64::MIN), |(lo, hi), t| {
            (lo.min(t), hi.max(t))
        });

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for (index, task) in plan.active() {
            let name = task.label().replace('"', "\\\"");

            let (extra, color) = match latest.get(task.label()) {
                Some(exec) if exec.status == TaskStatus::Computed => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    let (r, g) = if t < 0.5 {
                        ((255.0 * t * 2.0) as u8, 255)
                    } else {
                        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
                    };
                    (format!("{:.2?}", exec.duration), format!("#{r:02X}{g:02X}00"))
                }
                Some(_) => ("Cached".to_string(), "#ADD8E6".to_string()),
                None => ("Idle".to_string(), "#D3D3D3".to_string()),
            };

            let _ = writeln!(f, "    {index}[\"{name}\\n{extra}\"]");
            let _ = writeln!(f, "    style {index} fill:{color}");
        }

        for (source, input, target) in plan.edges() {
            let _ = writeln!(f, "    {source} -- \"{input}\" --> {target}");
        }

        f
    }
}
