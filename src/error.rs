use thiserror::Error;

/// Errors raised while resolving a plan. All of them are detected before any
/// task is executed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("Unknown output '{0}'")]
    UnknownOutput(String),

    #[error("Unresolvable dependency '{input}' required by task '{task}'")]
    Unresolvable { task: String, input: String },

    #[error("Cyclic plan: {}", .tasks.join(" -> "))]
    Cyclic { tasks: Vec<String> },
}

/// Errors raised while reading task inputs at invocation time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("Task '{task}' did not declare input '{input}'")]
    Undeclared { task: String, input: String },

    #[error("Input '{input}' of task '{task}' has the wrong type, expected {expected}")]
    WrongType {
        task: String,
        input: String,
        expected: &'static str,
    },
}

/// Configuration errors, raised at plan construction or task invocation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for '{flag}', expected one of: {}", .allowed.join(", "))]
    Selector {
        flag: &'static str,
        value: String,
        allowed: Vec<&'static str>,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error("Couldn't read configuration file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse configuration.\n{0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors raised while reading or writing cached artifacts.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error on '{0}': {1}")]
    Io(camino::Utf8PathBuf, std::io::Error),

    #[error("Couldn't serialize metadata for '{0}': {1}")]
    Sidecar(camino::Utf8PathBuf, serde_json::Error),

    #[error("Couldn't write artifact '{0}':\n{1}")]
    Artifact(camino::Utf8PathBuf, anyhow::Error),
}

#[derive(Debug, Error)]
pub enum TractometryError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Task '{0}':\n{1}")]
    Task(String, anyhow::Error),

    #[error("Couldn't query the dataset layout.\n{0}")]
    Layout(anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TractometryError {
    /// Wraps an error raised from inside a task body. Input lookups that
    /// failed inside the task surface as configuration errors.
    pub(crate) fn from_task(task: &str, error: anyhow::Error) -> Self {
        match error.downcast::<InputError>() {
            Ok(input) => TractometryError::Config(ConfigError::Input(input)),
            Err(error) => match error.downcast::<ConfigError>() {
                Ok(config) => TractometryError::Config(config),
                Err(error) => match error.downcast::<CacheError>() {
                    Ok(cache) => TractometryError::Cache(cache),
                    Err(error) => TractometryError::Task(task.to_string(), error),
                },
            },
        }
    }
}
