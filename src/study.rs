//! Running the plan over every subject and session of a dataset.

use std::fmt::Write;
use std::fs;
use std::io::Write as _;
use std::sync::Arc;

use anyhow::anyhow;
use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tempfile::NamedTempFile;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::bids::{BidsQuery, Filters};
use crate::config::Config;
use crate::core::Dynamic;
use crate::data::{BundleDict, ProfileTable, csv_field};
use crate::engine::{Diagnostics, Plan, Session};
use crate::error::{ConfigError, TractometryError};
use crate::external::Toolkit;
use crate::pipeline::{self, BUNDLE_DICT, PROFILES_FILE, REG_TEMPLATE, SUBSES, TEMPLATE_SLS};
use crate::subject::Subses;
use crate::utils::{as_overhead, get_style_study};

/// File name of the group profile table, in the output root.
pub const GROUP_PROFILES: &str = "tract_profiles.csv";

/// Outcome of one request for one subject and session.
pub struct SubjectRun {
    pub subject: String,
    pub session: Option<String>,
    pub result: Result<Dynamic, TractometryError>,
    pub diagnostics: Diagnostics,
}

impl SubjectRun {
    /// The produced value, if the request succeeded and has type `T`.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.result.as_ref().ok()?.downcast_ref::<T>()
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// A group of subjects sharing one plan and one output root.
///
/// Each subject and session gets its own [`Session`], run in parallel on
/// the rayon pool. Sessions share nothing mutable and write into their own
/// results directory.
pub struct Study {
    layout: Arc<dyn BidsQuery>,
    config: Config,
    plan: Plan,
    output_root: Utf8PathBuf,
    bundle_dict: Option<BundleDict>,
}

impl Study {
    /// Builds the plan for `config`. Bundle definitions are read from
    /// `config.bundle_info` when it is set.
    pub fn new(
        layout: impl BidsQuery + 'static,
        config: Config,
        toolkit: &Toolkit,
        output_root: impl Into<Utf8PathBuf>,
    ) -> Result<Self, TractometryError> {
        let plan = pipeline::plan(&config, toolkit)?;

        let bundle_dict = match &config.bundle_info {
            Some(path) => Some(
                BundleDict::load(path).map_err(|err| ConfigError::Invalid(format!("{err:#}")))?,
            ),
            None => None,
        };

        Ok(Self {
            layout: Arc::new(layout),
            config,
            plan,
            output_root: output_root.into(),
            bundle_dict,
        })
    }

    pub fn with_bundle_dict(mut self, bundle_dict: BundleDict) -> Self {
        self.bundle_dict = Some(bundle_dict);
        self
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn output_root(&self) -> &Utf8Path {
        &self.output_root
    }

    /// Every subject and session pair of the dataset, sorted. Subjects
    /// without a session level appear once, with no session.
    pub fn subjects(&self) -> Result<Vec<(String, Option<String>)>, TractometryError> {
        let scope = self.config.bids.scope.as_deref();
        let mut pairs = Vec::new();

        for subject in self.layout.subjects(scope).map_err(TractometryError::Layout)? {
            let sessions = self
                .layout
                .sessions(&subject, scope)
                .map_err(TractometryError::Layout)?;

            if sessions.is_empty() {
                pairs.push((subject, None));
            } else {
                pairs.extend(sessions.into_iter().map(|s| (subject.clone(), Some(s))));
            }
        }

        Ok(pairs)
    }

    /// A session for one subject, with the dataset files and the shared
    /// inputs supplied.
    ///
    /// Files of the configured inputs that are missing from the dataset are
    /// left out; a request that needs one fails as unresolvable.
    pub fn session(
        &self,
        subject: &str,
        session: Option<&str>,
    ) -> Result<Session<'_>, TractometryError> {
        let bids = &self.config.bids;
        let scope = bids.scope.as_deref();

        let bundle_dict = self
            .bundle_dict
            .clone()
            .ok_or_else(|| ConfigError::Invalid("no bundle definitions, set bundle_info".into()))?;

        let filters = Filters::new(subject, session)
            .suffix(&bids.dwi_suffix)
            .extension(&bids.dwi_extension)
            .scope(scope);
        let dwi_file = self
            .find(&filters)?
            .ok_or_else(|| {
                let scope = scope.unwrap_or("the raw dataset");
                TractometryError::Layout(anyhow!(
                    "No '{}' file for sub-{subject} in {scope}",
                    bids.dwi_suffix
                ))
            })?;

        let subses = Subses::new(subject, session, dwi_file, &self.output_root);
        tracing::debug!("Found {} for {subses}", subses.dwi_file);

        let mut out = Session::new(&self.plan);
        out.supply(SUBSES, subses).supply(BUNDLE_DICT, bundle_dict);

        if let Some(path) = &self.config.reg_template {
            out.supply(REG_TEMPLATE, path.clone());
        }
        if let Some(path) = &self.config.template_sls {
            out.supply(TEMPLATE_SLS, path.clone());
        }

        for (input, suffix) in &bids.files {
            let filters = Filters::new(subject, session)
                .suffix(suffix)
                .extension(&bids.extension)
                .scope(scope);

            match self.find(&filters)? {
                Some(path) => {
                    out.supply(input.as_str(), path);
                }
                None => tracing::debug!("No '{suffix}' file for sub-{subject}"),
            }
        }

        Ok(out)
    }

    fn find(&self, filters: &Filters) -> Result<Option<Utf8PathBuf>, TractometryError> {
        let mut files = self
            .layout
            .find_files(filters)
            .map_err(TractometryError::Layout)?;

        if files.len() > 1 {
            tracing::warn!(
                "{} '{}' files for sub-{}, using {}",
                files.len(),
                filters.suffix,
                filters.subject,
                files[0]
            );
        }

        Ok((!files.is_empty()).then(|| files.swap_remove(0)))
    }

    /// Resolves `output` for every subject and session in parallel.
    ///
    /// A failing subject does not stop the others; its error is kept in
    /// its [`SubjectRun`].
    pub fn run(&self, output: &str) -> Result<Vec<SubjectRun>, TractometryError> {
        let pairs = self.subjects()?;

        let span = tracing::info_span!("study", output);
        span.pb_set_length(pairs.len() as u64);
        if let Ok(style) = get_style_study() {
            span.pb_set_style(&style);
        }
        span.pb_set_message(&format!("Resolving {output}"));

        let runs: Vec<SubjectRun> = pairs
            .par_iter()
            .map(|(subject, session)| {
                let _enter = span.enter();
                let run = self.run_one(subject, session.as_deref(), output);
                span.pb_inc(1);
                run
            })
            .collect();

        let failed = runs.iter().filter(|run| !run.is_ok()).count();
        tracing::info!(
            "Resolved {output} for {} of {} subjects",
            runs.len() - failed,
            runs.len()
        );

        Ok(runs)
    }

    fn run_one(&self, subject: &str, session: Option<&str>, output: &str) -> SubjectRun {
        let (result, diagnostics) = match self.session(subject, session) {
            Ok(mut resolver) => {
                let result = resolver.resolve(output);
                (result, resolver.diagnostics().clone())
            }
            Err(err) => (Err(err), Diagnostics::default()),
        };

        if let Err(err) = &result {
            tracing::error!("sub-{subject}: {err}");
        }

        SubjectRun {
            subject: subject.to_string(),
            session: session.map(str::to_string),
            result,
            diagnostics,
        }
    }

    /// Computes the profiles of every subject and concatenates them into
    /// `<output_root>/tract_profiles.csv`, with `subjectID` and `sessionID`
    /// columns in front. Subjects that fail are left out.
    pub fn combine_profiles(&self) -> Result<Utf8PathBuf, TractometryError> {
        let started = std::time::Instant::now();
        let runs = self.run(PROFILES_FILE)?;

        let mut header = None;
        let mut body = String::new();

        for run in &runs {
            let Some(path) = run.get::<Utf8PathBuf>() else {
                continue;
            };
            let table = match ProfileTable::read(path) {
                Ok(table) => table,
                Err(err) => {
                    tracing::error!("Skipping {path}: {err:#}");
                    continue;
                }
            };

            let columns = table.header();
            match &header {
                None => header = Some(columns),
                Some(expected) if *expected != columns => {
                    tracing::error!("Skipping {path}, columns differ from the first table");
                    continue;
                }
                Some(_) => {}
            }

            let subject = csv_field(&run.subject);
            let session = csv_field(run.session.as_deref().unwrap_or_default());
            for row in &table.rows {
                let tract = csv_field(&row.tract);
                let _ = write!(body, "{subject},{session},{tract},{}", row.node);
                for value in &row.values {
                    let _ = write!(body, ",{value}");
                }
                body.push('\n');
            }
        }

        let Some(header) = header else {
            return Err(TractometryError::Task(
                "combine_profiles".into(),
                anyhow!("No subject produced profiles"),
            ));
        };

        fs::create_dir_all(&self.output_root)?;
        let path = self.output_root.join(GROUP_PROFILES);
        let mut scratch = NamedTempFile::new_in(&self.output_root)?;
        write!(scratch, "subjectID,sessionID,{header}\n{body}")?;
        scratch.persist(&path).map_err(|e| e.error)?;

        tracing::info!("Saved {path} {}", as_overhead(started));
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bids::GlobLayout;
    use crate::error::PlanError;
    use crate::external::mock;
    use crate::pipeline::fixture::Fixture;

    /// Lays the fixture images out as a BIDS dataset.
    fn dataset(fixture: &Fixture, subjects: &[(&str, Option<&str>)], skip: &[&str]) -> Utf8PathBuf {
        let root = fixture.root.join("bids");
        let config = Config::default();

        for (subject, session) in subjects {
            let mut dir = root.join(format!("sub-{subject}"));
            let mut prefix = format!("sub-{subject}");
            if let Some(session) = session {
                dir.push(format!("ses-{session}"));
                prefix.push_str(&format!("_ses-{session}"));
            }
            dir.push("dwi");
            fs::create_dir_all(&dir).unwrap();

            fs::write(dir.join(format!("{prefix}_dwi.nii.gz")), b"").unwrap();
            for (input, suffix) in &config.bids.files {
                if skip.contains(&input.as_str()) {
                    continue;
                }
                let source = &fixture.files[input.as_str()];
                fs::copy(source, dir.join(format!("{prefix}_{suffix}.cbor"))).unwrap();
            }
        }

        root
    }

    fn study(fixture: &Fixture, root: Utf8PathBuf, toolkit: &Toolkit) -> Study {
        let config = Config {
            n_points: 5,
            reg_template: Some(fixture.files[REG_TEMPLATE].clone()),
            ..Config::default()
        };

        Study::new(GlobLayout::new(root), config, toolkit, fixture.output())
            .unwrap()
            .with_bundle_dict(fixture.bundle_dict.clone())
    }

    #[test]
    fn test_subjects() {
        let fixture = Fixture::new();
        let root = dataset(&fixture, &[("01", Some("a")), ("01", Some("b")), ("02", None)], &[]);
        let (_, toolkit) = mock::toolkit();
        let study = study(&fixture, root, &toolkit);

        assert_eq!(
            study.subjects().unwrap(),
            [
                ("01".to_string(), Some("a".to_string())),
                ("01".to_string(), Some("b".to_string())),
                ("02".to_string(), None),
            ]
        );
    }

    #[test]
    fn test_combine_profiles() {
        let fixture = Fixture::new();
        let root = dataset(&fixture, &[("01", Some("a")), ("01", Some("b")), ("02", None)], &[]);
        let (mock, toolkit) = mock::toolkit();
        let study = study(&fixture, root, &toolkit);

        let path = study.combine_profiles().unwrap();
        assert_eq!(path, fixture.output().join(GROUP_PROFILES));

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "subjectID,sessionID,tractID,nodeID,dti_fa,dti_md");
        assert_eq!(lines.len(), 1 + 3 * 2 * 5);
        assert!(lines.contains(&"01,a,CST_L,0,0.5,0.25"));
        assert!(lines.contains(&"02,,ARC_R,4,0.5,0.25"));
        assert!(fixture.output().join("sub-01/ses-b").is_dir());
        assert_eq!(mock.calls("generate_streamlines"), 3);

        let calls = mock.total();
        study.combine_profiles().unwrap();
        assert_eq!(mock.total(), calls);
    }

    #[test]
    fn test_failing_subject_is_skipped() {
        let fixture = Fixture::new();
        let root = dataset(&fixture, &[("01", None)], &[]);
        dataset(&fixture, &[("02", None)], &["dti_fa_file"]);
        let (_, toolkit) = mock::toolkit();
        let study = study(&fixture, root, &toolkit);

        let runs = study.run(PROFILES_FILE).unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].is_ok());
        assert!(matches!(
            runs[1].result,
            Err(TractometryError::Plan(PlanError::Unresolvable { ref input, .. }))
                if input == "dti_fa_file"
        ));

        let text = fs::read_to_string(study.combine_profiles().unwrap()).unwrap();
        assert!(text.lines().skip(1).all(|line| line.starts_with("01,")));
    }

    #[test]
    fn test_unreadable_profiles_are_skipped() {
        let fixture = Fixture::new();
        let root = dataset(&fixture, &[("01", None), ("02", None)], &[]);
        let (_, toolkit) = mock::toolkit();
        let study = study(&fixture, root, &toolkit);

        let runs = study.run(PROFILES_FILE).unwrap();
        let broken = runs[1].get::<Utf8PathBuf>().unwrap();
        fs::write(broken, "tractID,nodeID,dti_fa,dti_md\nLeft Arcuate, anterior,0,0.5,1\n")
            .unwrap();

        let text = fs::read_to_string(study.combine_profiles().unwrap()).unwrap();
        assert_eq!(text.lines().count(), 1 + 2 * 5);
        assert!(text.lines().skip(1).all(|line| line.starts_with("01,,")));
    }

    #[test]
    fn test_nothing_to_combine() {
        let fixture = Fixture::new();
        let root = dataset(&fixture, &[("01", None)], &["brain_mask_file"]);
        let (_, toolkit) = mock::toolkit();
        let study = study(&fixture, root, &toolkit);

        let err = study.combine_profiles().unwrap_err();
        assert!(matches!(err, TractometryError::Task(ref name, _) if name == "combine_profiles"));
        assert!(!fixture.output().join(GROUP_PROFILES).exists());
    }

    #[test]
    fn test_missing_bundle_dict() {
        let fixture = Fixture::new();
        let root = dataset(&fixture, &[("01", None)], &[]);
        let (_, toolkit) = mock::toolkit();
        let study = Study::new(GlobLayout::new(root), Config::default(), &toolkit, fixture.output())
            .unwrap();

        let err = study.session("01", None).err().unwrap();
        assert!(matches!(err, TractometryError::Config(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_dwi() {
        let fixture = Fixture::new();
        let root = dataset(&fixture, &[("01", None)], &[]);
        let (_, toolkit) = mock::toolkit();
        let study = study(&fixture, root, &toolkit);

        let err = study.session("07", None).err().unwrap();
        assert!(matches!(err, TractometryError::Layout(_)));
    }
}
