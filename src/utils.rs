use std::fmt::Display;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use console::Style;
use indicatif::ProgressStyle;

const ANSI_BLUE: Style = Style::new().blue();

pub(crate) fn as_overhead(s: Instant) -> impl Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Installs the `tracing` subscriber used by the pipeline. Progress bars for
/// running tasks are drawn through `tracing-indicatif`, log lines are routed
/// through the same writer so they don't tear the bars.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()?;

    Ok(())
}

#[cfg(not(feature = "logging"))]
pub fn init_logging() -> anyhow::Result<()> {
    Ok(())
}

pub(crate) fn get_style_task() -> Result<ProgressStyle, indicatif::style::TemplateError> {
    ProgressStyle::with_template("{spinner:.blue} {msg}")
}

pub(crate) fn get_style_study() -> Result<ProgressStyle, indicatif::style::TemplateError> {
    Ok(ProgressStyle::with_template(
        "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )?
    .progress_chars("=>-"))
}

/// Path of the JSON sidecar belonging to an artifact: same directory, the
/// file name cut at its first dot.
pub fn sidecar_path(artifact: &Utf8Path) -> Utf8PathBuf {
    let name = artifact.file_name().unwrap_or_default();
    let stem = name.split('.').next().unwrap_or(name);
    artifact.with_file_name(format!("{stem}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_path_multi_extension() {
        let path = Utf8Path::new("out/sub-01/sub-01_dwi_b0_in_MNI.nii.gz");
        assert_eq!(
            sidecar_path(path),
            Utf8Path::new("out/sub-01/sub-01_dwi_b0_in_MNI.json")
        );
    }

    #[test]
    fn test_sidecar_path_dotted_directory() {
        let path = Utf8Path::new("v1.2/results/sub-01_dwi_profiles.csv");
        assert_eq!(
            sidecar_path(path),
            Utf8Path::new("v1.2/results/sub-01_dwi_profiles.json")
        );
    }
}
