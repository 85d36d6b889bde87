//! Pipeline configuration.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration. Selector values are matched case-insensitively and
//! rejected with a [`ConfigError::Selector`] listing the recognised values.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::engine::check_selector;
use crate::error::ConfigError;

macro_rules! selector {
    (
        $(#[$meta:meta])*
        $name:ident, $flag:literal, default = $default:ident,
        { $($variant:ident => $value:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const FLAG: &'static str = $flag;
            pub const VALUES: &'static [&'static str] = &[$($value),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $value),+
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$default
            }
        }

        impl FromStr for $name {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let canonical = check_selector($flag, s, Self::VALUES)?;
                $(
                    if canonical == $value {
                        return Ok(Self::$variant);
                    }
                )+
                Err(ConfigError::Selector {
                    flag: $flag,
                    value: s.to_string(),
                    allowed: Self::VALUES.to_vec(),
                })
            }
        }

        impl TryFrom<String> for $name {
            type Error = ConfigError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

selector!(
    /// How subject space is mapped onto template space.
    Mapping, "mapping", default = Syn,
    { Syn => "syn", Sls => "sls" }
);

selector!(
    /// Bundle segmentation algorithm. The RecoBundles variants work in
    /// subject space and don't need a mapping.
    SegAlgo, "seg_algo", default = Afq,
    { Afq => "afq", Reco => "reco", Reco16 => "reco16", Reco80 => "reco80" }
);

selector!(
    /// How streamlines are weighted when computing tract profiles.
    ProfileWeights, "profile_weights", default = Gauss,
    { Gauss => "gauss", Median => "median", Unweighted => "none" }
);

selector!(
    /// Which subject image is registered to the template.
    RegSubject, "reg_subject", default = PowerMap,
    { PowerMap => "power_map", B0 => "b0", DtiFaSubject => "dti_fa_subject", SubjectSls => "subject_sls" }
);

selector!(
    OdfModel, "odf_model", default = Dti,
    { Dti => "dti", Csd => "csd", Dki => "dki", Msmt => "msmt" }
);

selector!(
    Directions, "directions", default = Prob,
    { Det => "det", Prob => "prob" }
);

impl SegAlgo {
    pub fn needs_mapping(self) -> bool {
        matches!(self, SegAlgo::Afq)
    }
}

impl RegSubject {
    /// The subject image this choice reads.
    pub fn input(self) -> &'static str {
        match self {
            RegSubject::PowerMap => "pmap_file",
            RegSubject::B0 | RegSubject::SubjectSls => "b0_file",
            RegSubject::DtiFaSubject => "dti_fa_file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingParams {
    pub odf_model: OdfModel,
    pub directions: Directions,
    pub n_seeds: u32,
    pub random_seeds: bool,
    pub rng_seed: Option<u64>,
    pub seed_threshold: f64,
    pub stop_threshold: f64,
    pub max_angle: f64,
    pub step_size: f64,
    pub min_length: f64,
    pub max_length: f64,
}

impl Default for TrackingParams {
    fn default() -> Self {
        Self {
            odf_model: OdfModel::Dti,
            directions: Directions::Prob,
            n_seeds: 1,
            random_seeds: false,
            rng_seed: None,
            seed_threshold: 0.0,
            stop_threshold: 0.2,
            max_angle: 30.0,
            step_size: 0.5,
            min_length: 50.0,
            max_length: 250.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationParams {
    pub seg_algo: SegAlgo,
    pub nb_points: Option<usize>,
    pub prob_threshold: f64,
    pub dist_to_waypoint: Option<f64>,
    pub dist_to_atlas: f64,
    pub filter_by_endpoints: bool,
    pub clip_edges: bool,
    pub progressive: bool,
    pub greater_than: usize,
    pub rm_small_clusters: usize,
    pub model_clust_thr: f64,
    pub reduction_thr: f64,
    pub refine: bool,
    pub pruning_thr: f64,
    pub rng_seed: Option<u64>,
    /// Record which whole-brain streamlines ended up in each bundle.
    pub return_idx: bool,
}

impl Default for SegmentationParams {
    fn default() -> Self {
        Self {
            seg_algo: SegAlgo::Afq,
            nb_points: None,
            prob_threshold: 0.0,
            dist_to_waypoint: None,
            dist_to_atlas: 4.0,
            filter_by_endpoints: true,
            clip_edges: false,
            progressive: true,
            greater_than: 50,
            rm_small_clusters: 50,
            model_clust_thr: 1.25,
            reduction_thr: 25.0,
            refine: false,
            pruning_thr: 12.0,
            rng_seed: None,
            return_idx: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningParams {
    pub n_points: usize,
    pub clean_rounds: usize,
    pub distance_threshold: f64,
    pub length_threshold: f64,
    pub min_sl: usize,
    pub stat: String,
    pub return_idx: bool,
}

impl Default for CleaningParams {
    fn default() -> Self {
        Self {
            n_points: 100,
            clean_rounds: 5,
            distance_threshold: 5.0,
            length_threshold: 4.0,
            min_sl: 20,
            stat: "mean".into(),
            return_idx: false,
        }
    }
}

/// Where per-subject inputs are found in a BIDS dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BidsSettings {
    /// Derivatives pipeline holding the preprocessed data, searched under
    /// `<root>/derivatives/<scope>`. The raw dataset when absent.
    pub scope: Option<String>,
    pub dwi_suffix: String,
    pub dwi_extension: String,
    /// Input name to BIDS suffix, for every file supplied per subject.
    pub files: BTreeMap<String, String>,
    pub extension: String,
}

impl Default for BidsSettings {
    fn default() -> Self {
        let files = [
            ("b0_file", "b0"),
            ("brain_mask_file", "mask"),
            ("pmap_file", "pmap"),
            ("dti_fa_file", "fa"),
            ("dti_md_file", "md"),
        ];

        Self {
            scope: None,
            dwi_suffix: "dwi".into(),
            dwi_extension: "nii.gz".into(),
            files: files
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            extension: "cbor".into(),
        }
    }
}

/// A scalar defined by an image in template space. It is warped into each
/// subject through the mapping and profiled like the other scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomScalar {
    pub name: String,
    pub template_image: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracking_params: TrackingParams,
    pub segmentation_params: SegmentationParams,
    pub clean_params: CleaningParams,
    pub profile_weights: ProfileWeights,
    /// Number of nodes along each tract profile.
    pub n_points: usize,
    /// Scalars to profile, each read from the `<scalar>_file` input.
    pub scalars: Vec<String>,
    /// Scalars computed by the pipeline, profiled after [`Config::scalars`].
    pub custom_scalars: Vec<CustomScalar>,
    pub reg_subject: RegSubject,
    pub mapping: Mapping,
    /// Shorthand for `"mapping": "sls"`.
    pub use_sls: bool,
    /// Check content hashes of cached artifacts before reusing them.
    pub verify_cache: bool,
    pub reg_template: Option<Utf8PathBuf>,
    pub template_sls: Option<Utf8PathBuf>,
    pub bundle_info: Option<Utf8PathBuf>,
    pub bids: BidsSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracking_params: TrackingParams::default(),
            segmentation_params: SegmentationParams::default(),
            clean_params: CleaningParams::default(),
            profile_weights: ProfileWeights::default(),
            n_points: 100,
            scalars: vec!["dti_fa".into(), "dti_md".into()],
            custom_scalars: Vec::new(),
            reg_subject: RegSubject::default(),
            mapping: Mapping::default(),
            use_sls: false,
            verify_cache: false,
            reg_template: None,
            template_sls: None,
            bundle_info: None,
            bids: BidsSettings::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_json::from_str(text)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        for scalar in &mut self.scalars {
            *scalar = scalar.to_lowercase();
        }
        for custom in &mut self.custom_scalars {
            custom.name = custom.name.to_lowercase();
        }
    }

    /// Every scalar to profile, configured ones first, without repeats.
    pub fn all_scalars(&self) -> Vec<String> {
        let mut all = self.scalars.clone();
        for custom in &self.custom_scalars {
            if !all.contains(&custom.name) {
                all.push(custom.name.clone());
            }
        }
        all
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scalars.is_empty() && self.custom_scalars.is_empty() {
            return Err(ConfigError::Invalid("at least one scalar is required".into()));
        }
        let mut names = self
            .scalars
            .iter()
            .chain(self.custom_scalars.iter().map(|c| &c.name));
        if let Some(scalar) = names.find(|s| !is_scalar_name(s)) {
            return Err(ConfigError::Invalid(format!("bad scalar name '{scalar}'")));
        }
        for (n, custom) in self.custom_scalars.iter().enumerate() {
            if self.custom_scalars[..n].iter().any(|c| c.name == custom.name) {
                return Err(ConfigError::Invalid(format!(
                    "custom scalar '{}' is defined twice",
                    custom.name
                )));
            }
        }
        if self.n_points == 0 {
            return Err(ConfigError::Invalid("n_points must be positive".into()));
        }
        if self.tracking_params.n_seeds == 0 {
            return Err(ConfigError::Invalid("n_seeds must be positive".into()));
        }
        if self.tracking_params.min_length > self.tracking_params.max_length {
            return Err(ConfigError::Invalid(format!(
                "min_length {} exceeds max_length {}",
                self.tracking_params.min_length, self.tracking_params.max_length
            )));
        }
        Ok(())
    }

    /// The mapping strategy in effect, with `use_sls` taken into account.
    pub fn mapping(&self) -> Mapping {
        if self.use_sls { Mapping::Sls } else { self.mapping }
    }

    pub fn seg_algo(&self) -> SegAlgo {
        self.segmentation_params.seg_algo
    }
}

/// Scalar names end up in input and file names.
fn is_scalar_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
