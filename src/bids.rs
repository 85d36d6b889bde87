//! Discovery of subjects, sessions and their files in a BIDS dataset.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use glob::{Pattern, glob};

/// What to look for in a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filters {
    pub subject: String,
    pub session: Option<String>,
    /// Last `_`-separated entity of the file name, e.g. `dwi`.
    pub suffix: String,
    /// Extension without the leading dot, may contain dots (`nii.gz`).
    pub extension: String,
    /// Derivatives pipeline to search, the raw dataset when `None`.
    pub scope: Option<String>,
    pub datatype: String,
}

impl Filters {
    pub fn new(subject: impl Into<String>, session: Option<&str>) -> Self {
        Self {
            subject: subject.into(),
            session: session.map(str::to_string),
            suffix: "dwi".into(),
            extension: "nii.gz".into(),
            scope: None,
            datatype: "dwi".into(),
        }
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn scope(mut self, scope: Option<&str>) -> Self {
        self.scope = scope.map(str::to_string);
        self
    }

    fn matches(&self, name: &str) -> bool {
        let tail = format!("{}.{}", self.suffix, self.extension);
        name == tail || name.ends_with(&format!("_{tail}"))
    }
}

/// A queryable dataset layout.
pub trait BidsQuery: Send + Sync {
    /// Files matching `filters`, sorted.
    fn find_files(&self, filters: &Filters) -> anyhow::Result<Vec<Utf8PathBuf>>;

    /// Subject labels, without the `sub-` prefix, sorted.
    fn subjects(&self, scope: Option<&str>) -> anyhow::Result<Vec<String>>;

    /// Session labels of `subject`, without the `ses-` prefix, sorted.
    /// Empty when the subject has no session level.
    fn sessions(&self, subject: &str, scope: Option<&str>) -> anyhow::Result<Vec<String>>;
}

/// Layout backed by the file system, searched with glob patterns:
/// `<root>[/derivatives/<scope>]/sub-<S>[/ses-<T>]/<datatype>/*_<suffix>.<ext>`.
#[derive(Debug, Clone)]
pub struct GlobLayout {
    root: Utf8PathBuf,
}

impl GlobLayout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn base(&self, scope: Option<&str>) -> Utf8PathBuf {
        match scope {
            Some(scope) => self.root.join("derivatives").join(scope),
            None => self.root.clone(),
        }
    }
}

/// Directories directly under `dir` named `<prefix>-<label>`, as labels.
fn labels(dir: &Utf8Path, prefix: &str) -> anyhow::Result<Vec<String>> {
    let pattern = format!("{}/{prefix}-*", Pattern::escape(dir.as_str()));

    let mut labels = Vec::new();
    for path in glob(&pattern)? {
        let path = Utf8PathBuf::try_from(path?)?;
        if !fs::metadata(&path).is_ok_and(|m| m.is_dir()) {
            continue;
        }
        if let Some(label) = path
            .file_name()
            .and_then(|name| name.strip_prefix(prefix))
            .and_then(|name| name.strip_prefix('-'))
        {
            labels.push(label.to_string());
        }
    }

    labels.sort();
    Ok(labels)
}

impl BidsQuery for GlobLayout {
    fn find_files(&self, filters: &Filters) -> anyhow::Result<Vec<Utf8PathBuf>> {
        let mut dir = self
            .base(filters.scope.as_deref())
            .join(format!("sub-{}", filters.subject));
        if let Some(session) = &filters.session {
            dir.push(format!("ses-{session}"));
        }
        dir.push(&filters.datatype);

        let pattern = format!(
            "{}/*{}.{}",
            Pattern::escape(dir.as_str()),
            Pattern::escape(&filters.suffix),
            Pattern::escape(&filters.extension),
        );

        let mut files = Vec::new();
        for path in glob(&pattern)? {
            let path = Utf8PathBuf::try_from(path?)?;
            if path.file_name().is_some_and(|name| filters.matches(name)) {
                files.push(path);
            }
        }

        files.sort();
        Ok(files)
    }

    fn subjects(&self, scope: Option<&str>) -> anyhow::Result<Vec<String>> {
        labels(&self.base(scope), "sub")
    }

    fn sessions(&self, subject: &str, scope: Option<&str>) -> anyhow::Result<Vec<String>> {
        labels(&self.base(scope).join(format!("sub-{subject}")), "ses")
    }
}
