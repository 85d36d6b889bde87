//! Bundle segmentation, cleaning, and everything derived from the
//! segmented bundles.

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::Context;
use camino::Utf8PathBuf;
use serde_json::{Map, Value, json};

use crate::config::{CleaningParams, Config, ProfileWeights, SegmentationParams};
use crate::data::{
    BundleDict, CountRow, CountTable, Image, ProfileTable, Tractogram, Transform, WHOLE_BRAIN,
};
use crate::engine::{Artifact, CachePolicy, Outputs, Plan, TaskStatus, read_sidecar};
use crate::external::Toolkit;
use crate::pipeline::{
    BUNDLE_DICT, BUNDLES_FILE, CLEAN_BUNDLES_FILE, CLEAN_PARAMS, INDIV_BUNDLES, IndivBundles,
    MAPPING, N_POINTS, PROFILE_WEIGHTS, PROFILES_FILE, SCALAR_DICT, SEGMENTATION_PARAMS,
    SL_COUNTS_FILE, STREAMLINES_FILE, SUBSES, ScalarDict, TRACKING_PARAMS, describe_seg,
    describe_track, policy, scalar_input,
};
use crate::utils::sidecar_path;

pub(super) fn register(plan: &mut Plan, config: &Config, toolkit: &Toolkit) {
    segment(plan, config, toolkit, true);
    clean_bundles(plan, config, toolkit);
    export_bundles(plan, config);
    sl_counts(plan, config);
    scalar_dict(plan, config);
}

/// Segments the whole-brain tractogram into bundles, labeling each kept
/// streamline with the uid of its bundle. With `with_mapping` the
/// segmentation also receives the subject to template mapping.
pub(super) fn segment(plan: &mut Plan, config: &Config, toolkit: &Toolkit, with_mapping: bool) {
    let segmentation = toolkit.segmentation.clone();

    let mut policy = policy(config, "_tractography")
        .describe(describe_track)
        .describe(describe_seg)
        .upstream(STREAMLINES_FILE)
        .fingerprint::<SegmentationParams>(SEGMENTATION_PARAMS)
        .fingerprint::<BundleDict>(BUNDLE_DICT);

    let mut task = plan
        .task(BUNDLES_FILE)
        .label(if with_mapping { "segment" } else { "segment_reco" })
        .inputs([STREAMLINES_FILE, BUNDLE_DICT])
        .optional(TRACKING_PARAMS, config.tracking_params.clone())
        .optional(SEGMENTATION_PARAMS, config.segmentation_params.clone());

    if with_mapping {
        task = task.input(MAPPING);
        policy = policy.upstream(MAPPING);
    }

    task.cached(policy).run(move |inputs| {
        let streamlines_file = inputs.get::<Utf8PathBuf>(STREAMLINES_FILE)?;
        let bundle_dict = inputs.get::<BundleDict>(BUNDLE_DICT)?;
        let params = inputs.get::<SegmentationParams>(SEGMENTATION_PARAMS)?;

        let mapping = if with_mapping {
            Some(Transform::read(inputs.get::<Utf8PathBuf>(MAPPING)?)?)
        } else {
            None
        };

        let tractogram = Tractogram::read(streamlines_file)?;
        let segments = segmentation.segment(&tractogram, bundle_dict, mapping.as_ref(), params)?;

        let mut bundles = Tractogram::empty(tractogram.affine);
        for (name, indices) in &segments {
            let def = bundle_dict
                .get(name)
                .with_context(|| format!("Segmentation returned unknown bundle '{name}'"))?;
            bundles.push_bundle(tractogram.select(indices)?.streamlines, def.uid);
        }

        let mut meta = json!({ "source": streamlines_file });
        if params.return_idx {
            meta["idx"] = json!(segments);
        }

        Ok((bundles, meta))
    });
}

/// Removes outlier streamlines from every bundle.
fn clean_bundles(plan: &mut Plan, config: &Config, toolkit: &Toolkit) {
    let cleaning = toolkit.cleaning.clone();

    let policy = policy(config, "-clean_tractography")
        .describe(describe_track)
        .describe(describe_seg)
        .upstream(BUNDLES_FILE)
        .fingerprint::<CleaningParams>(CLEAN_PARAMS);

    plan.task(CLEAN_BUNDLES_FILE)
        .label("clean_bundles")
        .inputs([BUNDLES_FILE, BUNDLE_DICT])
        .optional(TRACKING_PARAMS, config.tracking_params.clone())
        .optional(SEGMENTATION_PARAMS, config.segmentation_params.clone())
        .optional(CLEAN_PARAMS, config.clean_params.clone())
        .cached(policy)
        .run(move |inputs| {
            let bundles_file = inputs.get::<Utf8PathBuf>(BUNDLES_FILE)?;
            let bundle_dict = inputs.get::<BundleDict>(BUNDLE_DICT)?;
            let params = inputs.get::<CleaningParams>(CLEAN_PARAMS)?;

            let tractogram = Tractogram::read(bundles_file)?;

            // Whole-brain indices recorded by the segmentation, if any.
            let recorded = if params.return_idx {
                match read_sidecar(&sidecar_path(bundles_file)) {
                    Ok(mut meta) => meta.remove("idx"),
                    Err(err) => {
                        tracing::warn!("Whole-brain indices unavailable for {bundles_file}: {err}");
                        None
                    }
                }
            } else {
                None
            };

            let mut cleaned = Tractogram::empty(tractogram.affine);
            let mut kept_idx = Map::new();

            for (name, def) in bundle_dict.tracts() {
                let indices = tractogram.indices_of(def.uid);
                if indices.is_empty() {
                    continue;
                }

                let bundle = tractogram.select(&indices)?;
                let kept = cleaning.clean(&bundle, params)?;
                cleaned.push_bundle(bundle.select(&kept)?.streamlines, def.uid);

                if params.return_idx {
                    let origin = recorded
                        .as_ref()
                        .and_then(|idx| idx.get(name))
                        .and_then(|v| serde_json::from_value::<Vec<usize>>(v.clone()).ok())
                        .unwrap_or(indices);
                    let kept: Vec<usize> =
                        kept.iter().filter_map(|&k| origin.get(k).copied()).collect();
                    kept_idx.insert(name.to_string(), json!(kept));
                }
            }

            let mut meta = json!({ "source": bundles_file });
            if params.return_idx {
                meta["idx"] = Value::Object(kept_idx);
            }

            Ok((cleaned, meta))
        });
}

/// Writes one tractogram per bundle, under `bundles/` and
/// `clean_bundles/`.
fn export_bundles(plan: &mut Plan, config: &Config) {
    let verify = config.verify_cache;

    plan.task(INDIV_BUNDLES)
        .label("export_bundles")
        .inputs([SUBSES, CLEAN_BUNDLES_FILE, BUNDLES_FILE, BUNDLE_DICT])
        .optional(TRACKING_PARAMS, config.tracking_params.clone())
        .optional(SEGMENTATION_PARAMS, config.segmentation_params.clone())
        .run_many([INDIV_BUNDLES], move |inputs| {
            let bundle_dict = inputs.get::<BundleDict>(BUNDLE_DICT)?;
            let mut out = IndivBundles::default();
            let mut cached = true;

            for (source, folder) in [
                (CLEAN_BUNDLES_FILE, "clean_bundles"),
                (BUNDLES_FILE, "bundles"),
            ] {
                let source_file = inputs.get::<Utf8PathBuf>(source)?;
                let mut tractogram = None;
                let mut files = BTreeMap::new();

                for (name, def) in bundle_dict.tracts() {
                    let target = CachePolicy::new(format!("-{name}_tractography"))
                        .subdir(folder)
                        .describe(describe_track)
                        .describe(describe_seg)
                        .upstream(source)
                        .verify(verify)
                        .target(inputs, Tractogram::EXTENSION)?;

                    if !target.is_fresh() {
                        cached = false;
                        let started = Instant::now();
                        if tractogram.is_none() {
                            tractogram = Some(Tractogram::read(source_file)?);
                        }
                        if let Some(whole) = &tractogram {
                            let meta = json!({ "source": source_file });
                            target.store(&whole.bundle(def.uid), meta, started)?;
                        }
                    }

                    files.insert(name.to_string(), target.path);
                }

                if source == CLEAN_BUNDLES_FILE {
                    out.clean_bundles = files;
                } else {
                    out.bundles = files;
                }
            }

            let status = if cached { TaskStatus::Cached } else { TaskStatus::Computed };
            Ok(Outputs::new().with(INDIV_BUNDLES, out).with_status(status))
        });
}

/// Streamline counts per bundle, before and after cleaning.
fn sl_counts(plan: &mut Plan, config: &Config) {
    let policy = policy(config, "_sl_count")
        .describe(describe_track)
        .describe(describe_seg)
        .upstream(BUNDLES_FILE)
        .upstream(CLEAN_BUNDLES_FILE);

    plan.task(SL_COUNTS_FILE)
        .label("export_sl_counts")
        .inputs([CLEAN_BUNDLES_FILE, BUNDLES_FILE, BUNDLE_DICT])
        .optional(TRACKING_PARAMS, config.tracking_params.clone())
        .optional(SEGMENTATION_PARAMS, config.segmentation_params.clone())
        .cached(policy)
        .run(|inputs| {
            let clean_file = inputs.get::<Utf8PathBuf>(CLEAN_BUNDLES_FILE)?;
            let bundles_file = inputs.get::<Utf8PathBuf>(BUNDLES_FILE)?;
            let bundle_dict = inputs.get::<BundleDict>(BUNDLE_DICT)?;

            let clean = Tractogram::read(clean_file)?;
            let raw = Tractogram::read(bundles_file)?;

            let mut table = CountTable::default();
            for (name, def) in bundle_dict.tracts() {
                table.rows.push(CountRow {
                    bundle: name.to_string(),
                    n_streamlines: raw.indices_of(def.uid).len(),
                    n_streamlines_clean: clean.indices_of(def.uid).len(),
                });
            }
            table.rows.push(CountRow {
                bundle: WHOLE_BRAIN.to_string(),
                n_streamlines: raw.len(),
                n_streamlines_clean: clean.len(),
            });

            Ok((table, json!({ "sources": [clean_file, bundles_file] })))
        });
}

/// Collects the file of every configured and custom scalar.
fn scalar_dict(plan: &mut Plan, config: &Config) {
    let scalars = config.all_scalars();
    let names: Vec<String> = scalars.iter().map(|s| scalar_input(s)).collect();

    plan.task(SCALAR_DICT)
        .label("get_scalar_dict")
        .inputs(names.clone())
        .run(move |inputs| {
            let mut dict = ScalarDict::new();
            for (scalar, name) in scalars.iter().zip(&names) {
                dict.insert(scalar.clone(), inputs.get::<Utf8PathBuf>(name)?.clone());
            }
            Ok(dict)
        });
}

/// Along-tract profiles of every scalar, for every cleaned bundle.
pub(super) fn profiles(
    plan: &mut Plan,
    config: &Config,
    toolkit: &Toolkit,
    weights: ProfileWeights,
) {
    let profiling = toolkit.profiling.clone();

    let policy = policy(config, "_profiles")
        .describe(describe_track)
        .describe(describe_seg)
        .upstream(CLEAN_BUNDLES_FILE)
        .fingerprint::<ScalarDict>(SCALAR_DICT)
        .fingerprint::<ProfileWeights>(PROFILE_WEIGHTS)
        .fingerprint::<usize>(N_POINTS);

    plan.task(PROFILES_FILE)
        .label("tract_profiles")
        .inputs([CLEAN_BUNDLES_FILE, SCALAR_DICT, BUNDLE_DICT])
        .optional(TRACKING_PARAMS, config.tracking_params.clone())
        .optional(SEGMENTATION_PARAMS, config.segmentation_params.clone())
        .optional(PROFILE_WEIGHTS, weights)
        .optional(N_POINTS, config.n_points)
        .cached(policy)
        .run(move |inputs| {
            let clean_file = inputs.get::<Utf8PathBuf>(CLEAN_BUNDLES_FILE)?;
            let scalars = inputs.get::<ScalarDict>(SCALAR_DICT)?;
            let bundle_dict = inputs.get::<BundleDict>(BUNDLE_DICT)?;
            let weights = *inputs.get::<ProfileWeights>(PROFILE_WEIGHTS)?;
            let n_points = *inputs.get::<usize>(N_POINTS)?;

            let tractogram = Tractogram::read(clean_file)?;
            let images = scalars
                .values()
                .map(|path| Image::read(path))
                .collect::<anyhow::Result<Vec<_>>>()?;

            let mut uids = tractogram.bundle.clone();
            uids.sort_unstable();
            uids.dedup();

            let mut table = ProfileTable::new(scalars.keys().cloned().collect());
            for uid in uids.into_iter().filter(|&uid| uid != 0) {
                let name = bundle_dict
                    .name_of(uid)
                    .with_context(|| format!("No bundle with uid {uid}"))?;
                let bundle = tractogram.bundle(uid);

                let series = images
                    .iter()
                    .map(|image| profiling.profile(image, &bundle, weights, n_points))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                table.push_tract(name, &series)?;
            }

            let meta = json!({
                "source": clean_file,
                "ProfileWeights": weights,
                "NodeCount": n_points,
            });

            Ok((table, meta))
        });
}
