//! The tractometry plan: which tasks produce which outputs.
//!
//! [`plan`] assembles the tasks for one configuration. Inputs not produced
//! by any task have to be supplied to each [`Session`](crate::Session):
//!
//! | input                | type                 |
//! |----------------------|----------------------|
//! | [`SUBSES`]           | [`Subses`](crate::Subses) |
//! | [`BUNDLE_DICT`]      | [`BundleDict`]       |
//! | [`REG_TEMPLATE`]     | path to an [`Image`](crate::data::Image) |
//! | [`TEMPLATE_SLS`]     | path to a [`Tractogram`](crate::data::Tractogram), `sls` mapping only |
//! | `b0_file`, `brain_mask_file`, `pmap_file`, `dti_fa_file`, `<scalar>_file` | paths to images |
//!
//! Custom scalars from [`Config::custom_scalars`] get their `<name>_file`
//! from a task warping the template image into subject space.
//!
//! Configuration values are registered as defaults of the tasks that read
//! them, so a session can still override them by supplying a value under
//! the same name.

mod mapping;
mod segmentation;
mod tractography;

use std::collections::BTreeMap;

use camino::Utf8PathBuf;

use crate::config::{Config, Mapping, ProfileWeights, SegAlgo, SegmentationParams, TrackingParams};
use crate::engine::{CachePolicy, Inputs, Plan, Variants};
use crate::error::ConfigError;
use crate::external::Toolkit;

pub use crate::engine::SUBSES;

pub const BUNDLE_DICT: &str = "bundle_dict";
pub const REG_TEMPLATE: &str = "reg_template";
pub const TEMPLATE_SLS: &str = "template_sls";
pub const B0_FILE: &str = "b0_file";
pub const BRAIN_MASK_FILE: &str = "brain_mask_file";
pub const DTI_FA_FILE: &str = "dti_fa_file";

pub const TRACKING_PARAMS: &str = "tracking_params";
pub const SEGMENTATION_PARAMS: &str = "segmentation_params";
pub const CLEAN_PARAMS: &str = "clean_params";
pub const PROFILE_WEIGHTS: &str = "profile_weights";
pub const N_POINTS: &str = "n_points";

pub const REG_SUBJECT: &str = "reg_subject";
pub const MAPPING: &str = "mapping";
pub const B0_WARPED_FILE: &str = "b0_warped_file";
pub const TEMPLATE_XFORM_FILE: &str = "template_xform_file";
pub const ROIS_FILE: &str = "rois_file";
pub const STREAMLINES_FILE: &str = "streamlines_file";
pub const BUNDLES_FILE: &str = "bundles_file";
pub const CLEAN_BUNDLES_FILE: &str = "clean_bundles_file";
pub const INDIV_BUNDLES: &str = "indiv_bundles";
pub const SL_COUNTS_FILE: &str = "sl_counts_file";
pub const SCALAR_DICT: &str = "scalar_dict";
pub const PROFILES_FILE: &str = "profiles_file";

/// Warped ROI files per bundle, in the order of the bundle definition.
pub type RoiFiles = BTreeMap<String, Vec<Utf8PathBuf>>;

/// Scalar name to the file holding it.
pub type ScalarDict = BTreeMap<String, Utf8PathBuf>;

/// One tractogram file per bundle, cleaned and not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndivBundles {
    pub bundles: BTreeMap<String, Utf8PathBuf>,
    pub clean_bundles: BTreeMap<String, Utf8PathBuf>,
}

/// Name of the input holding the file of `scalar`.
pub fn scalar_input(scalar: &str) -> String {
    format!("{scalar}_file")
}

/// Builds the plan for `config`, running its tasks with `toolkit`.
///
/// The base plan maps with SyN, segments with AFQ and weights profiles
/// with Gaussian weights; the selectors in `config` swap in the
/// alternatives.
pub fn plan(config: &Config, toolkit: &Toolkit) -> Result<Plan, ConfigError> {
    config.validate()?;

    let mut plan = Plan::new();
    mapping::register(&mut plan, config, toolkit);
    tractography::register(&mut plan, config, toolkit);
    segmentation::register(&mut plan, config, toolkit);

    let plan = mapping_variants(config, toolkit).apply(plan, config.mapping().as_str())?;
    let plan = segmentation_variants(config, toolkit).apply(plan, config.seg_algo().as_str())?;
    let plan = weight_variants(config, toolkit).apply(plan, config.profile_weights.as_str())?;

    Ok(plan)
}

fn mapping_variants(config: &Config, toolkit: &Toolkit) -> Variants {
    let (config, toolkit) = (config.clone(), toolkit.clone());

    Variants::new(Mapping::FLAG)
        .option(Mapping::Syn.as_str(), |_| {})
        .option(Mapping::Sls.as_str(), move |plan| {
            mapping::sls_mapping(plan, &config, &toolkit)
        })
}

fn segmentation_variants(config: &Config, toolkit: &Toolkit) -> Variants {
    let mut variants = Variants::new(SegAlgo::FLAG).option(SegAlgo::Afq.as_str(), |_| {});

    for algo in [SegAlgo::Reco, SegAlgo::Reco16, SegAlgo::Reco80] {
        let (config, toolkit) = (config.clone(), toolkit.clone());
        variants = variants.option(algo.as_str(), move |plan| {
            segmentation::segment(plan, &config, &toolkit, false)
        });
    }

    variants
}

fn weight_variants(config: &Config, toolkit: &Toolkit) -> Variants {
    let mut variants = Variants::new(ProfileWeights::FLAG);

    for weights in [
        ProfileWeights::Gauss,
        ProfileWeights::Median,
        ProfileWeights::Unweighted,
    ] {
        let (config, toolkit) = (config.clone(), toolkit.clone());
        variants = variants.option(weights.as_str(), move |plan| {
            segmentation::profiles(plan, &config, &toolkit, weights)
        });
    }

    variants
}

/// A cache policy honouring the configured verification mode.
fn policy(config: &Config, suffix: impl Into<std::borrow::Cow<'static, str>>) -> CachePolicy {
    CachePolicy::new(suffix).verify(config.verify_cache)
}

/// `_space-RASMM_model-<ODF>_desc-<directions>`
fn describe_track(inputs: &Inputs<'_>) -> anyhow::Result<String> {
    let params = inputs.get::<TrackingParams>(TRACKING_PARAMS)?;
    Ok(format!(
        "_space-RASMM_model-{}_desc-{}",
        params.odf_model.as_str().to_uppercase(),
        params.directions
    ))
}

/// `-<ALGO>`
fn describe_seg(inputs: &Inputs<'_>) -> anyhow::Result<String> {
    let params = inputs.get::<SegmentationParams>(SEGMENTATION_PARAMS)?;
    Ok(format!("-{}", params.seg_algo.as_str().to_uppercase()))
}

#[cfg(test)]
pub(crate) mod fixture;

#[cfg(test)]
mod tests;
