use std::borrow::Cow;
use std::fs;
use std::io::{self, Write as _};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tempfile::NamedTempFile;

use crate::core::{ArcStr, Fingerprint, Hash32};
use crate::engine::{Compute, Inputs, Outputs, TaskStatus};
use crate::error::CacheError;
use crate::subject::Subses;
use crate::utils::{as_overhead, sidecar_path};

/// Name of the input every cached task receives: the [`Subses`] identity
/// the artifact belongs to.
pub const SUBSES: &str = "subses";

/// A value that can be persisted as a cached artifact.
pub trait Artifact: Send + Sync + 'static {
    /// File extension, without the leading dot.
    const EXTENSION: &'static str;

    /// Writes the value to `path`. The path is a scratch location that is
    /// moved into place once the write succeeded.
    fn write(&self, path: &Utf8Path) -> anyhow::Result<()>;
}

type ParamFn = Arc<dyn Fn(&Inputs<'_>) -> Result<Value, anyhow::Error> + Send + Sync>;
type DescribeFn = Arc<dyn Fn(&Inputs<'_>) -> anyhow::Result<String> + Send + Sync>;

/// Describes where a cached task stores its artifact and which parameters
/// distinguish one artifact from another.
///
/// The artifact lands in `results_dir[/subdir]/<base><descriptors>[_fp-<hex>]<suffix>.<ext>`
/// where `<base>` comes from the [`Subses`] input, descriptors are
/// human-readable fragments built from inputs, and the fingerprint covers
/// every parameter registered through [`fingerprint`](Self::fingerprint) or
/// [`upstream`](Self::upstream).
#[derive(Clone)]
pub struct CachePolicy {
    suffix: Cow<'static, str>,
    subdir: Option<Cow<'static, str>>,
    params: Vec<(ArcStr, ParamFn)>,
    describe: Vec<DescribeFn>,
    verify: bool,
    inputs: Vec<ArcStr>,
}

impl CachePolicy {
    pub fn new(suffix: impl Into<Cow<'static, str>>) -> Self {
        Self {
            suffix: suffix.into(),
            subdir: None,
            params: Vec::new(),
            describe: Vec::new(),
            verify: false,
            inputs: vec![ArcStr::from(SUBSES)],
        }
    }

    /// Store the artifact in a subdirectory of the results directory.
    pub fn subdir(mut self, dir: impl Into<Cow<'static, str>>) -> Self {
        self.subdir = Some(dir.into());
        self
    }

    /// Include the input `name`, of type `T`, in the fingerprint.
    pub fn fingerprint<T>(self, name: impl Into<ArcStr>) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        let name = name.into();
        let key = name.clone();
        self.param(name, move |inputs| {
            let value = inputs.get::<T>(&key)?;
            Ok(serde_json::to_value(value)?)
        })
    }

    /// Include the file name of an upstream artifact in the fingerprint.
    /// Upstream names carry their own fingerprint, so a parameter change
    /// anywhere up the chain yields a new name here as well.
    pub fn upstream(self, name: impl Into<ArcStr>) -> Self {
        let name = name.into();
        let key = name.clone();
        self.param(name, move |inputs| {
            let path = inputs.get::<Utf8PathBuf>(&key)?;
            Ok(json!(path.file_name().unwrap_or(path.as_str())))
        })
    }

    /// Include a fixed value in the fingerprint, for choices made when the
    /// plan was built rather than passed as inputs.
    pub fn constant(mut self, name: impl Into<ArcStr>, value: Value) -> Self {
        let name = name.into();
        self.params.retain(|(n, _)| *n != name);
        self.params.push((name, Arc::new(move |_: &Inputs<'_>| Ok(value.clone()))));
        self
    }

    fn param<F>(mut self, name: ArcStr, extract: F) -> Self
    where
        F: Fn(&Inputs<'_>) -> Result<Value, anyhow::Error> + Send + Sync + 'static,
    {
        if !self.inputs.contains(&name) {
            self.inputs.push(name.clone());
        }
        self.params.retain(|(n, _)| *n != name);
        self.params.push((name, Arc::new(extract)));
        self
    }

    /// Adds a human-readable fragment to the file name. Fragments are
    /// appended in registration order, right after the subject base name.
    pub fn describe<F>(mut self, describe: F) -> Self
    where
        F: Fn(&Inputs<'_>) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.describe.push(Arc::new(describe));
        self
    }

    /// Declares an input the descriptors read, so the task receives it.
    pub fn reads(mut self, name: impl Into<ArcStr>) -> Self {
        let name = name.into();
        if !self.inputs.contains(&name) {
            self.inputs.push(name);
        }
        self
    }

    /// Check the recorded content hash on every cache hit.
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub(crate) fn inputs(&self) -> impl Iterator<Item = &ArcStr> {
        self.inputs.iter()
    }

    /// Derives the deterministic location of the artifact for `inputs`.
    pub fn target(&self, inputs: &Inputs<'_>, extension: &str) -> anyhow::Result<Target> {
        let subses = inputs.get::<Subses>(SUBSES)?;

        let mut parameters = Map::new();
        for (name, extract) in &self.params {
            parameters.insert(name.to_string(), extract(inputs)?);
        }

        let mut name = String::from(subses.base_name());
        for describe in &self.describe {
            name.push_str(&describe(inputs)?);
        }

        let fingerprint = if parameters.is_empty() {
            None
        } else {
            let fingerprint = Fingerprint::of_map(&parameters);
            name.push_str("_fp-");
            name.push_str(&fingerprint.short());
            Some(fingerprint)
        };

        name.push_str(&self.suffix);
        name.push('.');
        name.push_str(extension);

        let dir = match &self.subdir {
            Some(subdir) => subses.results_dir.join(subdir.as_ref()),
            None => subses.results_dir.clone(),
        };

        Ok(Target {
            path: dir.join(name),
            fingerprint,
            parameters,
            verify: self.verify,
        })
    }
}

/// The resolved location of one cached artifact.
#[derive(Debug, Clone)]
pub struct Target {
    pub path: Utf8PathBuf,
    pub fingerprint: Option<Fingerprint>,
    pub parameters: Map<String, Value>,
    pub verify: bool,
}

impl Target {
    /// A target at a fixed path, without fingerprinted parameters.
    pub fn at(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            fingerprint: None,
            parameters: Map::new(),
            verify: false,
        }
    }

    pub fn sidecar(&self) -> Utf8PathBuf {
        sidecar_path(&self.path)
    }

    /// Whether a previous run already left a complete artifact here.
    ///
    /// The artifact and its sidecar must both exist; the sidecar is moved
    /// into place last, so a run interrupted in between leaves no hit. With
    /// verification enabled the content hash recorded in the sidecar must
    /// also match the file.
    pub fn is_fresh(&self) -> bool {
        if !self.path.exists() || !self.sidecar().exists() {
            return false;
        }

        if !self.verify {
            return true;
        }

        let recorded = match read_sidecar(&self.sidecar()) {
            Ok(meta) => meta
                .get("ContentHash")
                .and_then(Value::as_str)
                .map(str::to_owned),
            Err(err) => {
                tracing::warn!("Unreadable sidecar for {}: {err}", self.path);
                None
            }
        };

        let current = Hash32::hash_file(&self.path).map(Hash32::to_hex).ok();

        match (recorded, current) {
            (Some(recorded), Some(current)) if recorded == current => true,
            _ => {
                tracing::warn!("Cached artifact {} failed verification", self.path);
                false
            }
        }
    }

    /// Persists `artifact` together with its sidecar.
    ///
    /// Both files are written to uniquely named scratch files in the target
    /// directory first. The artifact is moved into place before the sidecar,
    /// so a failure at any point leaves no pair that
    /// [`is_fresh`](Self::is_fresh) would accept.
    pub fn store<A: Artifact>(
        &self,
        artifact: &A,
        meta: Value,
        started: Instant,
    ) -> Result<(), CacheError> {
        let dir = self.path.parent().unwrap_or(Utf8Path::new("."));
        fs::create_dir_all(dir).map_err(|e| CacheError::Io(dir.to_path_buf(), e))?;

        let scratch = scratch_in(dir).map_err(|e| CacheError::Io(self.path.clone(), e))?;
        let scratch_path = utf8(&scratch).map_err(|e| CacheError::Io(self.path.clone(), e))?;
        artifact
            .write(scratch_path)
            .map_err(|e| CacheError::Artifact(self.path.clone(), e))?;

        let content_hash =
            Hash32::hash_file(scratch_path).map_err(|e| CacheError::Io(self.path.clone(), e))?;

        let mut sidecar = match meta {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => Map::from_iter([("meta".to_string(), other)]),
        };

        if !self.parameters.is_empty() {
            sidecar.insert("Parameters".into(), Value::Object(self.parameters.clone()));
        }
        if let Some(fingerprint) = self.fingerprint {
            sidecar.insert("Fingerprint".into(), json!(fingerprint.to_hex()));
        }
        sidecar.insert("ContentHash".into(), json!(content_hash.to_hex()));
        sidecar.entry("Timing").or_insert(json!(started.elapsed().as_secs_f64()));

        let sidecar_path = self.sidecar();
        let bytes = serde_json::to_vec_pretty(&Value::Object(sidecar))
            .map_err(|e| CacheError::Sidecar(sidecar_path.clone(), e))?;
        let mut sidecar_scratch =
            scratch_in(dir).map_err(|e| CacheError::Io(sidecar_path.clone(), e))?;
        sidecar_scratch
            .write_all(&bytes)
            .map_err(|e| CacheError::Io(sidecar_path.clone(), e))?;

        scratch
            .persist(&self.path)
            .map_err(|e| CacheError::Io(self.path.clone(), e.error))?;
        sidecar_scratch
            .persist(&sidecar_path)
            .map_err(|e| CacheError::Io(sidecar_path.clone(), e.error))?;

        tracing::info!("Saved {} {}", self.path, as_overhead(started));

        Ok(())
    }
}

/// Scratch file in `dir`, deleted on drop unless persisted.
fn scratch_in(dir: &Utf8Path) -> io::Result<NamedTempFile> {
    tempfile::Builder::new().prefix(".scratch-").tempfile_in(dir)
}

fn utf8(file: &NamedTempFile) -> io::Result<&Utf8Path> {
    Utf8Path::from_path(file.path())
        .ok_or_else(|| io::Error::other(format!("non UTF-8 path {}", file.path().display())))
}

/// Reads the JSON sidecar at `path` as an object.
pub fn read_sidecar(path: &Utf8Path) -> Result<Map<String, Value>, CacheError> {
    let bytes = fs::read(path).map_err(|e| CacheError::Io(path.to_path_buf(), e))?;
    let value: Value =
        serde_json::from_slice(&bytes).map_err(|e| CacheError::Sidecar(path.to_path_buf(), e))?;

    match value {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

/// The memoizing wrapper: composes a computation with a [`CachePolicy`].
pub(crate) struct Cached<A, F> {
    policy: CachePolicy,
    callback: F,
    _phantom: PhantomData<fn() -> A>,
}

impl<A, F> Cached<A, F> {
    pub(crate) fn new(policy: CachePolicy, callback: F) -> Self {
        Self {
            policy,
            callback,
            _phantom: PhantomData,
        }
    }
}

impl<A, F> Compute for Cached<A, F>
where
    A: Artifact,
    F: Fn(&Inputs<'_>) -> anyhow::Result<(A, Value)> + Send + Sync,
{
    fn call(&self, inputs: &Inputs<'_>, outputs: &[ArcStr]) -> anyhow::Result<Outputs> {
        let target = self.policy.target(inputs, A::EXTENSION)?;

        if target.is_fresh() {
            tracing::debug!("Reusing {}", target.path);
            return Ok(Outputs::single(
                outputs[0].clone(),
                Arc::new(target.path),
                TaskStatus::Cached,
            ));
        }

        let started = Instant::now();
        let (artifact, meta) = (self.callback)(inputs)?;
        target.store(&artifact, meta, started)?;

        Ok(Outputs::single(
            outputs[0].clone(),
            Arc::new(target.path),
            TaskStatus::Computed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::core::Dynamic;

    struct Text(&'static str);

    impl Artifact for Text {
        const EXTENSION: &'static str = "txt";

        fn write(&self, path: &Utf8Path) -> anyhow::Result<()> {
            fs::write(path, self.0)?;
            Ok(())
        }
    }

    struct Broken;

    impl Artifact for Broken {
        const EXTENSION: &'static str = "txt";

        fn write(&self, path: &Utf8Path) -> anyhow::Result<()> {
            fs::write(path, "half")?;
            anyhow::bail!("disk full")
        }
    }

    struct Fill(u8);

    impl Artifact for Fill {
        const EXTENSION: &'static str = "bin";

        fn write(&self, path: &Utf8Path) -> anyhow::Result<()> {
            fs::write(path, vec![self.0; 1 << 20])?;
            Ok(())
        }
    }

    fn subses(root: &Utf8Path) -> Subses {
        Subses::new("01", Some("01"), "sub-01_ses-01_dwi.nii.gz", root)
    }

    fn inputs(subses: Subses, extra: Vec<(&str, Dynamic)>) -> Inputs<'static> {
        let mut values: HashMap<ArcStr, Dynamic> = HashMap::new();
        values.insert(SUBSES.into(), Arc::new(subses));
        for (k, v) in extra {
            values.insert(k.into(), v);
        }
        Inputs::new("test_task", values)
    }

    #[test]
    fn test_target_without_params() {
        let root = Utf8Path::new("/out");
        let policy = CachePolicy::new("_b0_in_MNI");
        let target = policy.target(&inputs(subses(root), vec![]), "cbor").unwrap();

        assert_eq!(
            target.path,
            Utf8Path::new("/out/sub-01/ses-01/sub-01_ses-01_dwi_b0_in_MNI.cbor")
        );
        assert!(target.fingerprint.is_none());
    }

    #[test]
    fn test_target_fingerprint_changes_name() {
        let root = Utf8Path::new("/out");
        let policy = CachePolicy::new("_tractography").fingerprint::<u32>("n_seeds");

        let a = policy
            .target(&inputs(subses(root), vec![("n_seeds", Arc::new(1u32))]), "cbor")
            .unwrap();
        let b = policy
            .target(&inputs(subses(root), vec![("n_seeds", Arc::new(2u32))]), "cbor")
            .unwrap();

        assert_ne!(a.path, b.path);
        assert!(a.path.as_str().contains("_fp-"));
        assert!(a.path.as_str().ends_with("_tractography.cbor"));
    }

    #[test]
    fn test_target_constant_param() {
        let root = Utf8Path::new("/out");
        let syn = CachePolicy::new("_mapping")
            .constant("reg_subject", json!("power_map"))
            .target(&inputs(subses(root), vec![]), "cbor")
            .unwrap();
        let b0 = CachePolicy::new("_mapping")
            .constant("reg_subject", json!("b0"))
            .target(&inputs(subses(root), vec![]), "cbor")
            .unwrap();

        assert_ne!(syn.path, b0.path);
        assert_eq!(syn.parameters["reg_subject"], "power_map");
    }

    #[test]
    fn test_target_descriptor_and_subdir() {
        let root = Utf8Path::new("/out");
        let policy = CachePolicy::new("_desc-ROI-CST_L-1-include")
            .subdir("ROIs")
            .describe(|_| Ok("_space-RASMM".into()));

        let target = policy.target(&inputs(subses(root), vec![]), "cbor").unwrap();
        assert_eq!(
            target.path,
            Utf8Path::new(
                "/out/sub-01/ses-01/ROIs/sub-01_ses-01_dwi_space-RASMM_desc-ROI-CST_L-1-include.cbor"
            )
        );
    }

    #[test]
    fn test_store_writes_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let policy = CachePolicy::new("_note").fingerprint::<u32>("n_seeds");
        let target = policy
            .target(&inputs(subses(root), vec![("n_seeds", Arc::new(7u32))]), "txt")
            .unwrap();

        assert!(!target.is_fresh());
        target
            .store(&Text("hello"), json!({"source": "dwi"}), Instant::now())
            .unwrap();
        assert!(target.is_fresh());

        let meta = read_sidecar(&target.sidecar()).unwrap();
        assert_eq!(meta["source"], "dwi");
        assert_eq!(meta["Parameters"]["n_seeds"], 7);
        assert!(meta.contains_key("ContentHash"));
        assert!(meta.contains_key("Timing"));
    }

    #[test]
    fn test_failed_write_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let target = CachePolicy::new("_broken")
            .target(&inputs(subses(root), vec![]), "txt")
            .unwrap();

        assert!(target.store(&Broken, Value::Null, Instant::now()).is_err());
        assert!(!target.path.exists());
        assert!(!target.sidecar().exists());
        assert!(!target.is_fresh());

        let leftovers: Vec<_> = fs::read_dir(target.path.parent().unwrap())
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_concurrent_stores_of_one_target() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let target = Target::at(root.join("shared.bin"));

        std::thread::scope(|scope| {
            for i in 0..4u8 {
                let target = &target;
                scope.spawn(move || {
                    for _ in 0..25 {
                        target.store(&Fill(i), Value::Null, Instant::now()).unwrap();
                    }
                });
            }
        });

        let bytes = fs::read(&target.path).unwrap();
        assert_eq!(bytes.len(), 1 << 20);
        assert!(bytes.iter().all(|&b| b == bytes[0]));
        assert!(target.is_fresh());

        let mut names: Vec<_> = fs::read_dir(root)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, ["shared.bin", "shared.json"]);
    }

    #[test]
    fn test_artifact_without_sidecar_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let target = Target::at(root.join("orphan.txt"));
        fs::write(&target.path, "x").unwrap();
        assert!(!target.is_fresh());
    }

    #[test]
    fn test_verify_detects_edit() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let target = CachePolicy::new("_note")
            .verify(true)
            .target(&inputs(subses(root), vec![]), "txt")
            .unwrap();

        target.store(&Text("original"), Value::Null, Instant::now()).unwrap();
        assert!(target.is_fresh());

        fs::write(&target.path, "edited").unwrap();
        assert!(!target.is_fresh());
    }
}
