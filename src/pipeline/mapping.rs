//! Registration of the subject to the template, and the images that
//! depend on it.

use std::time::Instant;

use anyhow::Context;
use camino::Utf8PathBuf;
use serde_json::json;

use crate::config::Config;
use crate::data::{BundleDict, Image, Tractogram, Transform};
use crate::engine::{Artifact, CachePolicy, Outputs, Plan, TaskStatus};
use crate::external::Toolkit;
use crate::pipeline::{
    B0_FILE, B0_WARPED_FILE, BRAIN_MASK_FILE, BUNDLE_DICT, MAPPING, REG_SUBJECT, REG_TEMPLATE,
    ROIS_FILE, RoiFiles, STREAMLINES_FILE, SUBSES, TEMPLATE_SLS, TEMPLATE_XFORM_FILE, policy,
    scalar_input,
};

pub(super) fn register(plan: &mut Plan, config: &Config, toolkit: &Toolkit) {
    reg_subject(plan, config);
    syn_mapping(plan, config, toolkit);
    b0_warped(plan, config, toolkit);
    template_xform(plan, config, toolkit);
    custom_scalars(plan, config, toolkit);
    rois(plan, config, toolkit);
}

/// The subject image used for registration, zeroed outside the brain.
fn reg_subject(plan: &mut Plan, config: &Config) {
    let source = config.reg_subject.input();

    plan.task(REG_SUBJECT)
        .label("get_reg_subject")
        .inputs([source, BRAIN_MASK_FILE])
        .run(move |inputs| {
            let image = Image::read(inputs.get::<Utf8PathBuf>(source)?)?;
            let mask = Image::read(inputs.get::<Utf8PathBuf>(BRAIN_MASK_FILE)?)?;
            image.masked(&mask)
        });
}

fn syn_mapping(plan: &mut Plan, config: &Config, toolkit: &Toolkit) {
    let registration = toolkit.registration.clone();

    let policy = policy(config, "_mapping_from-DWI_to-MNI_xform")
        .constant("reg_subject", json!(config.reg_subject))
        .fingerprint::<Utf8PathBuf>(REG_TEMPLATE);

    plan.task(MAPPING)
        .label("mapping")
        .inputs([REG_SUBJECT, REG_TEMPLATE])
        .cached(policy)
        .run(move |inputs| {
            let subject = inputs.get::<Image>(REG_SUBJECT)?;
            let template_file = inputs.get::<Utf8PathBuf>(REG_TEMPLATE)?;
            let template = Image::read(template_file)?;

            let transform = registration.register(subject, &template)?;
            let meta = json!({
                "RegistrationMethod": "syn",
                "Template": template_file,
            });

            Ok((transform, meta))
        });
}

/// Streamline-based registration: the subject's whole-brain tractogram is
/// registered to a template tractogram.
pub(super) fn sls_mapping(plan: &mut Plan, config: &Config, toolkit: &Toolkit) {
    let registration = toolkit.registration.clone();

    let policy = policy(config, "_mapping_from-DWI_to-MNI_desc-SLR_xform")
        .upstream(STREAMLINES_FILE)
        .fingerprint::<Utf8PathBuf>(TEMPLATE_SLS);

    plan.task(MAPPING)
        .label("sls_mapping")
        .inputs([REG_SUBJECT, STREAMLINES_FILE, TEMPLATE_SLS])
        .cached(policy)
        .run(move |inputs| {
            let subject = inputs.get::<Image>(REG_SUBJECT)?;
            let streamlines_file = inputs.get::<Utf8PathBuf>(STREAMLINES_FILE)?;
            let template_file = inputs.get::<Utf8PathBuf>(TEMPLATE_SLS)?;

            let moving = Tractogram::read(streamlines_file)?;
            let fixed = Tractogram::read(template_file)?;
            if moving.affine != subject.affine {
                tracing::warn!("{streamlines_file} is not on the grid of the registration image");
            }

            let transform =
                registration.register_streamlines(&moving.streamlines, &fixed.streamlines)?;
            let meta = json!({
                "RegistrationMethod": "slr",
                "source": streamlines_file,
                "Template": template_file,
            });

            Ok((transform, meta))
        });
}

/// The b0 image warped into template space.
fn b0_warped(plan: &mut Plan, config: &Config, toolkit: &Toolkit) {
    let registration = toolkit.registration.clone();

    plan.task(B0_WARPED_FILE)
        .label("export_registered_b0")
        .inputs([B0_FILE, MAPPING, REG_TEMPLATE])
        .cached(policy(config, "_b0_in_MNI").upstream(MAPPING))
        .run(move |inputs| {
            let b0_file = inputs.get::<Utf8PathBuf>(B0_FILE)?;
            let b0 = Image::read(b0_file)?;
            let template = Image::read(inputs.get::<Utf8PathBuf>(REG_TEMPLATE)?)?;
            let transform = Transform::read(inputs.get::<Utf8PathBuf>(MAPPING)?)?;

            let warped = registration.apply(&transform, &b0, &template)?;
            Ok((warped, json!({ "b0InSubject": b0_file })))
        });
}

/// The template warped into subject space.
fn template_xform(plan: &mut Plan, config: &Config, toolkit: &Toolkit) {
    let registration = toolkit.registration.clone();

    plan.task(TEMPLATE_XFORM_FILE)
        .label("template_xform")
        .inputs([MAPPING, REG_TEMPLATE, B0_FILE])
        .cached(policy(config, "_template_xform").upstream(MAPPING))
        .run(move |inputs| {
            let template_file = inputs.get::<Utf8PathBuf>(REG_TEMPLATE)?;
            let template = Image::read(template_file)?;
            let reference = Image::read(inputs.get::<Utf8PathBuf>(B0_FILE)?)?;
            let transform = Transform::read(inputs.get::<Utf8PathBuf>(MAPPING)?)?;

            let warped = registration.apply_inverse(&transform, &template, &reference)?;
            Ok((warped, json!({ "source": template_file })))
        });
}

/// One `<name>_file` per custom scalar: its template image in subject space.
fn custom_scalars(plan: &mut Plan, config: &Config, toolkit: &Toolkit) {
    for custom in &config.custom_scalars {
        let registration = toolkit.registration.clone();
        let template_file = custom.template_image.clone();

        let policy = policy(config, format!("_desc-{}", custom.name))
            .upstream(MAPPING)
            .constant("template_image", json!(template_file));

        plan.task(scalar_input(&custom.name))
            .label(format!("custom_scalar_{}", custom.name))
            .inputs([MAPPING, B0_FILE])
            .cached(policy)
            .run(move |inputs| {
                let template = Image::read(&template_file)
                    .with_context(|| format!("Couldn't read custom scalar image {template_file}"))?;
                let reference = Image::read(inputs.get::<Utf8PathBuf>(B0_FILE)?)?;
                let transform = Transform::read(inputs.get::<Utf8PathBuf>(MAPPING)?)?;

                let warped = registration.apply_inverse(&transform, &template, &reference)?;
                Ok((warped, json!({ "source": template_file })))
            });
    }
}

/// Every ROI of every bundle, warped into subject space. Each ROI is its
/// own cached artifact under `ROIs/`, skipped when already present.
fn rois(plan: &mut Plan, config: &Config, toolkit: &Toolkit) {
    let registration = toolkit.registration.clone();
    let verify = config.verify_cache;

    plan.task(ROIS_FILE)
        .label("export_rois")
        .inputs([SUBSES, MAPPING, BUNDLE_DICT, B0_FILE])
        .run_many([ROIS_FILE], move |inputs| {
            let bundle_dict = inputs.get::<BundleDict>(BUNDLE_DICT)?;

            let mut pending = Vec::new();
            let mut files = RoiFiles::new();

            for (bundle, def) in bundle_dict.tracts() {
                let paths = files.entry(bundle.to_string()).or_default();

                for (n, roi) in def.rois.iter().enumerate() {
                    let inclusion = if roi.include { "include" } else { "exclude" };
                    let suffix = format!("_desc-ROI-{bundle}-{}-{inclusion}", n + 1);
                    let target = CachePolicy::new(suffix)
                        .subdir("ROIs")
                        .upstream(MAPPING)
                        .constant("roi", json!(roi.image))
                        .verify(verify)
                        .target(inputs, Image::EXTENSION)?;

                    paths.push(target.path.clone());
                    if !target.is_fresh() {
                        pending.push((roi, target));
                    }
                }
            }

            if pending.is_empty() {
                return Ok(Outputs::new()
                    .with(ROIS_FILE, files)
                    .with_status(TaskStatus::Cached));
            }

            let transform = Transform::read(inputs.get::<Utf8PathBuf>(MAPPING)?)?;
            let reference = Image::read(inputs.get::<Utf8PathBuf>(B0_FILE)?)?;

            for (roi, target) in pending {
                let started = Instant::now();
                let image = Image::read(&roi.image)
                    .with_context(|| format!("Couldn't load ROI {}", roi.image))?;
                let warped = registration.apply_inverse(&transform, &image, &reference)?;
                target.store(&warped, json!({ "source": roi.image }), started)?;
            }

            Ok(Outputs::new().with(ROIS_FILE, files))
        });
}
