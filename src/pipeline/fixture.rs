//! A tiny on-disk dataset for exercising the pipeline end to end.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::data::{BundleDef, BundleDict, IDENTITY, Image, Roi, Tractogram};
use crate::engine::{Artifact, Plan, Session};
use crate::pipeline::{BUNDLE_DICT, REG_TEMPLATE, SUBSES, TEMPLATE_SLS};
use crate::subject::Subses;

pub(crate) struct Fixture {
    _dir: TempDir,
    pub root: Utf8PathBuf,
    pub bundle_dict: BundleDict,
    pub files: BTreeMap<&'static str, Utf8PathBuf>,
}

fn image(values: [f32; 8]) -> Image {
    Image {
        shape: [2, 2, 2],
        affine: IDENTITY,
        data: values.to_vec(),
    }
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_path_buf();
        let data = root.join("data");
        std::fs::create_dir_all(&data).unwrap();

        let write = |name: &str, image: Image| {
            let path = data.join(name);
            image.write(&path).unwrap();
            path
        };

        let mut files = BTreeMap::new();
        files.insert("b0_file", write("b0.cbor", image([1.0; 8])));
        files.insert(
            "brain_mask_file",
            write("mask.cbor", image([1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0])),
        );
        files.insert("pmap_file", write("pmap.cbor", image([2.0; 8])));
        files.insert("dti_fa_file", write("fa.cbor", image([0.5; 8])));
        files.insert("dti_md_file", write("md.cbor", image([0.25; 8])));
        files.insert(REG_TEMPLATE, write("template.cbor", image([3.0; 8])));

        let template_sls = data.join("template_sls.cbor");
        Tractogram::new(IDENTITY, vec![vec![[0.0; 3], [1.0; 3]]])
            .write(&template_sls)
            .unwrap();
        files.insert(TEMPLATE_SLS, template_sls);

        let roi = |name: &str, include: bool| Roi {
            image: write(name, image([1.0; 8])),
            include,
        };

        let mut bundle_dict = BundleDict::new();
        bundle_dict
            .insert(
                "CST_L",
                BundleDef {
                    uid: 1,
                    rois: vec![roi("cst_l_1.cbor", true), roi("cst_l_2.cbor", false)],
                },
            )
            .insert(
                "ARC_R",
                BundleDef {
                    uid: 2,
                    rois: vec![roi("arc_r_1.cbor", true)],
                },
            );

        Self {
            _dir: dir,
            root,
            bundle_dict,
            files,
        }
    }

    pub(crate) fn output(&self) -> Utf8PathBuf {
        self.root.join("out")
    }

    pub(crate) fn subses(&self) -> Subses {
        Subses::new(
            "01",
            Some("01"),
            self.root.join("data/sub-01_ses-01_dwi.nii.gz"),
            &self.output(),
        )
    }

    pub(crate) fn results_dir(&self) -> Utf8PathBuf {
        self.subses().results_dir
    }

    /// A session with every external input supplied.
    pub(crate) fn session<'p>(&self, plan: &'p Plan) -> Session<'p> {
        let mut session = Session::new(plan);
        session
            .supply(SUBSES, self.subses())
            .supply(BUNDLE_DICT, self.bundle_dict.clone());
        for (name, path) in &self.files {
            session.supply(*name, path.clone());
        }
        session
    }
}
