use camino::Utf8PathBuf;
use serde_json::json;

use crate::config::{Config, TrackingParams};
use crate::data::Image;
use crate::engine::Plan;
use crate::external::Toolkit;
use crate::pipeline::{
    BRAIN_MASK_FILE, DTI_FA_FILE, STREAMLINES_FILE, SUBSES, TRACKING_PARAMS, describe_track,
    policy,
};
use crate::subject::Subses;

/// Whole-brain tractography, seeded in the brain mask and stopped on FA.
pub(super) fn register(plan: &mut Plan, config: &Config, toolkit: &Toolkit) {
    let tractography = toolkit.tractography.clone();

    let policy = policy(config, "_tractography")
        .describe(describe_track)
        .fingerprint::<TrackingParams>(TRACKING_PARAMS);

    plan.task(STREAMLINES_FILE)
        .label("streamlines")
        .inputs([SUBSES, BRAIN_MASK_FILE, DTI_FA_FILE])
        .optional(TRACKING_PARAMS, config.tracking_params.clone())
        .cached(policy)
        .run(move |inputs| {
            let subses = inputs.get::<Subses>(SUBSES)?;
            let params = inputs.get::<TrackingParams>(TRACKING_PARAMS)?;
            let seed_file = inputs.get::<Utf8PathBuf>(BRAIN_MASK_FILE)?;
            let stop_file = inputs.get::<Utf8PathBuf>(DTI_FA_FILE)?;

            let seeds = Image::read(seed_file)?;
            let stopping = Image::read(stop_file)?;

            let tractogram =
                tractography.generate_streamlines(&subses.dwi_file, &seeds, &stopping, params)?;
            tracing::info!("Generated {} streamlines for {subses}", tractogram.len());

            let meta = json!({
                "dwi": subses.dwi_file,
                "seeds": seed_file,
                "stop": stop_file,
                "count": tractogram.len(),
            });

            Ok((tractogram, meta))
        });
}
