use std::fs;

use camino::Utf8PathBuf;

use super::fixture::Fixture;
use super::*;
use crate::config::{CleaningParams, CustomScalar, SegmentationParams};
use crate::data::ProfileTable;
use crate::engine::{Session, read_sidecar};
use crate::error::{PlanError, TractometryError};
use crate::external::mock;
use crate::utils::sidecar_path;

fn small_config() -> Config {
    Config {
        n_points: 5,
        ..Config::default()
    }
}

#[test]
fn test_plan_outputs() {
    let (_, toolkit) = mock::toolkit();
    let plan = plan(&Config::default(), &toolkit).unwrap();

    assert_eq!(
        plan.outputs(),
        [
            B0_WARPED_FILE,
            BUNDLES_FILE,
            CLEAN_BUNDLES_FILE,
            INDIV_BUNDLES,
            MAPPING,
            PROFILES_FILE,
            REG_SUBJECT,
            ROIS_FILE,
            SCALAR_DICT,
            SL_COUNTS_FILE,
            STREAMLINES_FILE,
            TEMPLATE_XFORM_FILE,
        ]
    );
}

#[test]
fn test_rois_after_registration() {
    let fixture = Fixture::new();
    let (mock, toolkit) = mock::toolkit();
    let plan = plan(&Config::default(), &toolkit).unwrap();

    let mut session = fixture.session(&plan);
    let rois = session.get::<RoiFiles>(ROIS_FILE).unwrap().clone();

    assert_eq!(
        session.diagnostics().order(),
        ["get_reg_subject", "mapping", "export_rois"]
    );
    assert_eq!(rois["CST_L"].len(), 2);
    assert_eq!(rois["ARC_R"].len(), 1);
    assert!(rois["CST_L"][1].as_str().contains("_desc-ROI-CST_L-2-exclude"));
    for path in rois.values().flatten() {
        assert!(path.exists());
        assert!(sidecar_path(path).exists());
        assert_eq!(path.parent(), Some(fixture.results_dir().join("ROIs").as_path()));
    }
    assert_eq!(mock.calls("register"), 1);
    assert_eq!(mock.calls("apply_inverse"), 3);

    let calls = mock.total();
    let mut session = fixture.session(&plan);
    assert_eq!(session.get::<RoiFiles>(ROIS_FILE).unwrap(), &rois);
    assert_eq!(session.diagnostics().cached("mapping"), 1);
    assert_eq!(session.diagnostics().cached("export_rois"), 1);
    assert_eq!(mock.total(), calls);
}

#[test]
fn test_full_pipeline_is_idempotent() {
    let fixture = Fixture::new();
    let (mock, toolkit) = mock::toolkit();
    let plan = plan(&small_config(), &toolkit).unwrap();

    let mut session = fixture.session(&plan);
    let profiles = session.get::<Utf8PathBuf>(PROFILES_FILE).unwrap().clone();

    let name = profiles.file_name().unwrap();
    assert!(name.starts_with("sub-01_ses-01_dwi_space-RASMM_model-DTI_desc-prob-AFQ_fp-"));
    assert!(name.ends_with("_profiles.csv"));

    let table = ProfileTable::read(&profiles).unwrap();
    assert_eq!(table.scalars, ["dti_fa", "dti_md"]);
    assert_eq!(table.rows.len(), 2 * 5);
    assert_eq!(table.rows[0].tract, "CST_L");
    assert_eq!(table.rows[0].values, [0.5, 0.25]);
    assert_eq!(table.rows[5].tract, "ARC_R");

    let calls = mock.total();
    assert!(calls > 0);

    let mut session = fixture.session(&plan);
    assert_eq!(session.get::<Utf8PathBuf>(PROFILES_FILE).unwrap(), &profiles);
    assert_eq!(session.diagnostics().cached("tract_profiles"), 1);
    assert_eq!(mock.total(), calls);
}

#[test]
fn test_sl_counts() {
    let fixture = Fixture::new();
    let (_, toolkit) = mock::toolkit();
    let plan = plan(&Config::default(), &toolkit).unwrap();

    let mut session = fixture.session(&plan);
    let counts = session.get::<Utf8PathBuf>(SL_COUNTS_FILE).unwrap();
    let text = fs::read_to_string(counts).unwrap();

    assert_eq!(
        text,
        "bundle,n_streamlines,n_streamlines_clean\nARC_R,2,1\nCST_L,2,1\nwhole_brain,4,2\n"
    );
}

#[test]
fn test_indiv_bundles() {
    let fixture = Fixture::new();
    let (_, toolkit) = mock::toolkit();
    let plan = plan(&Config::default(), &toolkit).unwrap();

    let mut session = fixture.session(&plan);
    let indiv = session.get::<IndivBundles>(INDIV_BUNDLES).unwrap().clone();

    assert_eq!(indiv.bundles.len(), 2);
    assert_eq!(indiv.clean_bundles.len(), 2);

    let clean = crate::data::Tractogram::read(&indiv.clean_bundles["CST_L"]).unwrap();
    assert_eq!(clean.len(), 1);
    assert!(clean.bundle.iter().all(|&uid| uid == 1));
    assert!(indiv.bundles["CST_L"].as_str().contains("/bundles/"));

    let mut session = fixture.session(&plan);
    session.resolve(INDIV_BUNDLES).unwrap();
    assert_eq!(session.diagnostics().cached("export_bundles"), 1);
}

#[test]
fn test_use_sls_swaps_mapping() {
    let (mock, toolkit) = mock::toolkit();
    let syn = plan(&Config::default(), &toolkit).unwrap();
    let config = Config {
        use_sls: true,
        ..Config::default()
    };
    let sls = plan(&config, &toolkit).unwrap();

    assert_eq!(sls.outputs(), syn.outputs());
    assert_eq!(sls.producer(MAPPING).unwrap().label(), "sls_mapping");
    assert_eq!(syn.producer(MAPPING).unwrap().label(), "mapping");
    assert_eq!(
        sls.producer(ROIS_FILE).unwrap().label(),
        syn.producer(ROIS_FILE).unwrap().label()
    );

    let fixture = Fixture::new();
    let mut session = fixture.session(&sls);
    session.resolve(ROIS_FILE).unwrap();

    assert_eq!(mock.calls("register"), 0);
    assert_eq!(mock.calls("register_streamlines"), 1);
    assert_eq!(mock.calls("generate_streamlines"), 1);
}

#[test]
fn test_reco_needs_no_mapping() {
    let fixture = Fixture::new();
    let (mock, toolkit) = mock::toolkit();
    let mut config = Config::default();
    config.segmentation_params.seg_algo = crate::config::SegAlgo::Reco80;
    let plan = plan(&config, &toolkit).unwrap();

    let task = plan.producer(BUNDLES_FILE).unwrap();
    assert!(!task.inputs().any(|input| input == MAPPING));

    let mut session = fixture.session(&plan);
    let bundles = session.get::<Utf8PathBuf>(BUNDLES_FILE).unwrap();
    assert!(bundles.as_str().contains("-RECO80_fp-"));
    assert_eq!(mock.calls("register"), 0);
    assert_eq!(mock.calls("segment"), 1);
}

#[test]
fn test_tracking_parameters_change_names() {
    let fixture = Fixture::new();
    let (mock, toolkit) = mock::toolkit();
    let plan = plan(&Config::default(), &toolkit).unwrap();

    let mut session = fixture.session(&plan);
    let default_streamlines = session.get::<Utf8PathBuf>(STREAMLINES_FILE).unwrap().clone();

    let mut session = fixture.session(&plan);
    let params = TrackingParams {
        n_seeds: 2,
        ..TrackingParams::default()
    };
    session.supply(TRACKING_PARAMS, params);
    let seeded = session.get::<Utf8PathBuf>(STREAMLINES_FILE).unwrap().clone();

    assert_ne!(default_streamlines, seeded);
    assert_eq!(mock.calls("generate_streamlines"), 2);
    assert_eq!(crate::data::Tractogram::read(&seeded).unwrap().len(), 12);

    let meta = read_sidecar(&sidecar_path(&seeded)).unwrap();
    assert_eq!(meta["Parameters"]["tracking_params"]["n_seeds"], 2);
}

#[test]
fn test_profile_weights_variant() {
    let fixture = Fixture::new();
    let (_, toolkit) = mock::toolkit();
    let config = Config {
        profile_weights: ProfileWeights::Median,
        ..small_config()
    };
    let median = plan(&config, &toolkit).unwrap();
    let gauss = plan(&small_config(), &toolkit).unwrap();

    let median_file = fixture
        .session(&median)
        .get::<Utf8PathBuf>(PROFILES_FILE)
        .unwrap()
        .clone();
    let gauss_file = fixture
        .session(&gauss)
        .get::<Utf8PathBuf>(PROFILES_FILE)
        .unwrap()
        .clone();

    assert_ne!(median_file, gauss_file);
    let meta = read_sidecar(&sidecar_path(&median_file)).unwrap();
    assert_eq!(meta["ProfileWeights"], "median");
}

#[test]
fn test_missing_template_is_unresolvable() {
    let fixture = Fixture::new();
    let (mock, toolkit) = mock::toolkit();
    let plan = plan(&Config::default(), &toolkit).unwrap();

    let mut session = Session::new(&plan);
    session
        .supply(SUBSES, fixture.subses())
        .supply(BUNDLE_DICT, fixture.bundle_dict.clone());
    for (name, path) in &fixture.files {
        if *name != REG_TEMPLATE {
            session.supply(*name, path.clone());
        }
    }

    let err = session.resolve(B0_WARPED_FILE).unwrap_err();
    assert!(matches!(
        err,
        TractometryError::Plan(PlanError::Unresolvable { ref input, .. }) if input == REG_TEMPLATE
    ));
    assert_eq!(mock.total(), 0);
}

#[test]
fn test_return_idx_follows_whole_brain() {
    let fixture = Fixture::new();
    let (_, toolkit) = mock::toolkit();
    let config = Config {
        segmentation_params: SegmentationParams {
            return_idx: true,
            ..SegmentationParams::default()
        },
        clean_params: CleaningParams {
            return_idx: true,
            ..CleaningParams::default()
        },
        ..Config::default()
    };
    let plan = plan(&config, &toolkit).unwrap();

    let mut session = fixture.session(&plan);
    let clean = session.get::<Utf8PathBuf>(CLEAN_BUNDLES_FILE).unwrap().clone();
    let bundles = session.value::<Utf8PathBuf>(BUNDLES_FILE).unwrap();

    let segmented = read_sidecar(&sidecar_path(bundles)).unwrap();
    assert_eq!(segmented["idx"]["CST_L"], serde_json::json!([1, 4]));

    let cleaned = read_sidecar(&sidecar_path(&clean)).unwrap();
    assert_eq!(cleaned["idx"]["CST_L"], serde_json::json!([1]));
    assert_eq!(cleaned["idx"]["ARC_R"], serde_json::json!([0]));
}

#[cfg(feature = "logging")]
#[test]
fn test_unreadable_segmentation_sidecar_warns() {
    use std::io;
    use std::sync::{Arc, Mutex};

    use crate::data::Tractogram;

    #[derive(Clone, Default)]
    struct Logs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Logs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let fixture = Fixture::new();
    let (_, toolkit) = mock::toolkit();
    let config = Config {
        segmentation_params: SegmentationParams {
            return_idx: true,
            ..SegmentationParams::default()
        },
        clean_params: CleaningParams {
            return_idx: true,
            ..CleaningParams::default()
        },
        ..Config::default()
    };
    let plan = plan(&config, &toolkit).unwrap();

    let bundles = fixture.session(&plan).get::<Utf8PathBuf>(BUNDLES_FILE).unwrap().clone();
    fs::write(sidecar_path(&bundles), "{ truncated").unwrap();

    let logs = Logs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer({
            let logs = logs.clone();
            move || logs.clone()
        })
        .finish();

    let clean = tracing::subscriber::with_default(subscriber, || {
        let mut session = fixture.session(&plan);
        session.get::<Utf8PathBuf>(CLEAN_BUNDLES_FILE).unwrap().clone()
    });

    let logs = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    assert!(logs.contains("WARN"));
    assert!(logs.contains("Whole-brain indices unavailable"));

    let positions = Tractogram::read(&bundles).unwrap().indices_of(1);
    let cleaned = read_sidecar(&sidecar_path(&clean)).unwrap();
    assert_eq!(cleaned["idx"]["CST_L"], serde_json::json!([positions[0]]));
}

#[test]
fn test_scalar_dict() {
    let fixture = Fixture::new();
    let (_, toolkit) = mock::toolkit();
    let plan = plan(&Config::default(), &toolkit).unwrap();

    let mut session = fixture.session(&plan);
    let scalars = session.get::<ScalarDict>(SCALAR_DICT).unwrap();

    assert_eq!(scalars.keys().collect::<Vec<_>>(), ["dti_fa", "dti_md"]);
    assert_eq!(scalars["dti_fa"], fixture.files["dti_fa_file"]);
}

#[test]
fn test_custom_scalar_is_profiled() {
    let fixture = Fixture::new();
    let (mock, toolkit) = mock::toolkit();
    let template_image = fixture.files[REG_TEMPLATE].clone();
    let config = Config {
        custom_scalars: vec![CustomScalar {
            name: "t1_atlas".into(),
            template_image: template_image.clone(),
        }],
        ..small_config()
    };
    let plan = plan(&config, &toolkit).unwrap();
    assert!(plan.outputs().contains(&"t1_atlas_file"));

    let mut session = fixture.session(&plan);
    let warped = session.get::<Utf8PathBuf>("t1_atlas_file").unwrap().clone();
    assert!(warped.as_str().ends_with("_desc-t1_atlas.cbor"));
    assert_eq!(mock.calls("apply_inverse"), 1);

    let meta = read_sidecar(&sidecar_path(&warped)).unwrap();
    assert_eq!(meta["Parameters"]["template_image"], template_image.as_str());

    let profiles = session.get::<Utf8PathBuf>(PROFILES_FILE).unwrap().clone();
    let table = ProfileTable::read(&profiles).unwrap();
    assert_eq!(table.scalars, ["dti_fa", "dti_md", "t1_atlas"]);
    assert_eq!(table.rows[0].values, [0.5, 0.25, 3.0]);

    let scalars = session.value::<ScalarDict>(SCALAR_DICT).unwrap();
    assert_eq!(scalars["t1_atlas"], warped);
}
