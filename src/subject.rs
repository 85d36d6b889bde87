use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// Identity of one subject and session: where its diffusion data lives and
/// where its results go.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subses {
    pub subject: String,
    pub session: Option<String>,
    pub dwi_file: Utf8PathBuf,
    pub results_dir: Utf8PathBuf,
}

impl Subses {
    /// Results land in `output_root/sub-<subject>[/ses-<session>]`.
    pub fn new(
        subject: &str,
        session: Option<&str>,
        dwi_file: impl Into<Utf8PathBuf>,
        output_root: &Utf8Path,
    ) -> Self {
        let mut results_dir = output_root.join(format!("sub-{subject}"));
        if let Some(session) = session {
            results_dir.push(format!("ses-{session}"));
        }

        Self {
            subject: subject.to_string(),
            session: session.map(str::to_string),
            dwi_file: dwi_file.into(),
            results_dir,
        }
    }

    /// File name of the diffusion data without any extension, the prefix
    /// of every artifact name.
    pub fn base_name(&self) -> &str {
        let name = self.dwi_file.file_name().unwrap_or(self.dwi_file.as_str());
        name.split('.').next().unwrap_or(name)
    }
}

impl std::fmt::Display for Subses {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.subject)?;
        if let Some(session) = &self.session {
            write!(f, "/ses-{session}")?;
        }
        Ok(())
    }
}
