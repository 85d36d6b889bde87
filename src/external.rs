//! Boundaries to the numerical backends: registration, tractography,
//! bundle segmentation, cleaning and profiling.
//!
//! The pipeline only orchestrates these; it never inspects how they work.
//! Every backend is a trait object so a [`Toolkit`] can be assembled from
//! whichever implementations are available.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8Path;

use crate::config::{CleaningParams, ProfileWeights, SegmentationParams, TrackingParams};
use crate::data::{BundleDict, Image, Streamline, Tractogram, Transform};

pub trait Registration: Send + Sync {
    /// Computes the warp taking `moving` (subject space) onto `fixed`
    /// (template space).
    fn register(&self, moving: &Image, fixed: &Image) -> anyhow::Result<Transform>;

    /// Streamline-based linear registration.
    fn register_streamlines(
        &self,
        moving: &[Streamline],
        fixed: &[Streamline],
    ) -> anyhow::Result<Transform>;

    /// Warps a subject-space image into template space, on the grid of
    /// `reference`.
    fn apply(&self, transform: &Transform, image: &Image, reference: &Image)
    -> anyhow::Result<Image>;

    /// Warps a template-space image into subject space, on the grid of
    /// `reference`.
    fn apply_inverse(
        &self,
        transform: &Transform,
        image: &Image,
        reference: &Image,
    ) -> anyhow::Result<Image>;
}

pub trait Tractography: Send + Sync {
    fn generate_streamlines(
        &self,
        dwi: &Utf8Path,
        seeds: &Image,
        stopping: &Image,
        params: &TrackingParams,
    ) -> anyhow::Result<Tractogram>;
}

/// Indices into the whole-brain tractogram, per bundle name.
pub type Segments = BTreeMap<String, Vec<usize>>;

pub trait Segmentation: Send + Sync {
    /// `mapping` is absent for algorithms that work in subject space only.
    fn segment(
        &self,
        streamlines: &Tractogram,
        bundles: &BundleDict,
        mapping: Option<&Transform>,
        params: &SegmentationParams,
    ) -> anyhow::Result<Segments>;
}

pub trait Cleaning: Send + Sync {
    /// Indices of the streamlines of `bundle` to keep.
    fn clean(&self, bundle: &Tractogram, params: &CleaningParams) -> anyhow::Result<Vec<usize>>;
}

pub trait Profiling: Send + Sync {
    /// Samples `scalar` along `bundle`, one value per node.
    fn profile(
        &self,
        scalar: &Image,
        bundle: &Tractogram,
        weights: ProfileWeights,
        n_points: usize,
    ) -> anyhow::Result<Vec<f64>>;
}

/// The set of backends a pipeline runs with.
#[derive(Clone)]
pub struct Toolkit {
    pub registration: Arc<dyn Registration>,
    pub tractography: Arc<dyn Tractography>,
    pub segmentation: Arc<dyn Segmentation>,
    pub cleaning: Arc<dyn Cleaning>,
    pub profiling: Arc<dyn Profiling>,
}

impl std::fmt::Debug for Toolkit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolkit").finish_non_exhaustive()
    }
}
