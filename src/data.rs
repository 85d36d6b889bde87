//! In-memory forms of the data passed between tasks, and the reference
//! on-disk format used to cache them.
//!
//! Volumes, tractograms and transforms are stored as CBOR. Tables are
//! plain CSV so they can be opened by anything downstream.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write as _};

use anyhow::{Context, bail, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::engine::Artifact;

/// Voxel to world (RAS+ mm) mapping.
pub type Affine = [[f64; 4]; 4];

pub const IDENTITY: Affine = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Name of the pseudo bundle that stands for the whole tractogram.
pub const WHOLE_BRAIN: &str = "whole_brain";

/// Reads any value stored in the reference format.
pub fn load<T: DeserializeOwned>(path: &Utf8Path) -> anyhow::Result<T> {
    let file = File::open(path).with_context(|| format!("Couldn't open {path}"))?;
    ciborium::from_reader(BufReader::new(file)).with_context(|| format!("Couldn't decode {path}"))
}

fn save<T: Serialize>(value: &T, path: &Utf8Path) -> anyhow::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    ciborium::into_writer(value, &mut writer)?;
    writer.flush()?;
    Ok(())
}

macro_rules! cbor_artifact {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Artifact for $ty {
                const EXTENSION: &'static str = "cbor";

                fn write(&self, path: &Utf8Path) -> anyhow::Result<()> {
                    save(self, path)
                }
            }
        )+
    };
}

cbor_artifact!(Image, Tractogram, Transform);

/// A scalar volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub shape: [usize; 3],
    pub affine: Affine,
    pub data: Vec<f32>,
}

impl Image {
    pub fn new(shape: [usize; 3], affine: Affine, data: Vec<f32>) -> anyhow::Result<Self> {
        let voxels = shape.iter().product::<usize>();
        ensure!(
            data.len() == voxels,
            "Volume of shape {shape:?} needs {voxels} voxels, got {}",
            data.len()
        );
        Ok(Self { shape, affine, data })
    }

    pub fn zeros(shape: [usize; 3], affine: Affine) -> Self {
        let voxels = shape.iter().product();
        Self {
            shape,
            affine,
            data: vec![0.0; voxels],
        }
    }

    pub fn read(path: &Utf8Path) -> anyhow::Result<Self> {
        load(path)
    }

    /// Zeroes every voxel outside `mask`.
    pub fn masked(mut self, mask: &Image) -> anyhow::Result<Self> {
        if self.shape != mask.shape {
            bail!(
                "Mask of shape {:?} doesn't match volume of shape {:?}",
                mask.shape,
                self.shape
            );
        }

        for (value, &inside) in self.data.iter_mut().zip(&mask.data) {
            if inside == 0.0 {
                *value = 0.0;
            }
        }

        Ok(self)
    }
}

pub type Streamline = Vec<[f32; 3]>;

/// A set of streamlines in RAS+ mm, each labeled with the uid of the bundle
/// it belongs to. Unlabeled streamlines carry uid `0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tractogram {
    pub affine: Affine,
    pub streamlines: Vec<Streamline>,
    pub bundle: Vec<u32>,
}

impl Tractogram {
    pub fn new(affine: Affine, streamlines: Vec<Streamline>) -> Self {
        let bundle = vec![0; streamlines.len()];
        Self {
            affine,
            streamlines,
            bundle,
        }
    }

    pub fn empty(affine: Affine) -> Self {
        Self::new(affine, Vec::new())
    }

    pub fn read(path: &Utf8Path) -> anyhow::Result<Self> {
        let tractogram: Self = load(path)?;
        ensure!(
            tractogram.streamlines.len() == tractogram.bundle.len(),
            "{path}: {} streamlines but {} bundle labels",
            tractogram.streamlines.len(),
            tractogram.bundle.len()
        );
        Ok(tractogram)
    }

    pub fn len(&self) -> usize {
        self.streamlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streamlines.is_empty()
    }

    /// The streamlines at `indices`, with their labels.
    pub fn select(&self, indices: &[usize]) -> anyhow::Result<Self> {
        let mut out = Self::empty(self.affine);
        for &i in indices {
            let Some(streamline) = self.streamlines.get(i) else {
                bail!("Streamline index {i} out of range ({})", self.len());
            };
            out.streamlines.push(streamline.clone());
            out.bundle.push(self.bundle[i]);
        }
        Ok(out)
    }

    /// Indices of the streamlines labeled `uid`.
    pub fn indices_of(&self, uid: u32) -> Vec<usize> {
        self.bundle
            .iter()
            .enumerate()
            .filter_map(|(i, &b)| (b == uid).then_some(i))
            .collect()
    }

    /// The streamlines labeled `uid`.
    pub fn bundle(&self, uid: u32) -> Self {
        let mut out = Self::empty(self.affine);
        for (streamline, &b) in self.streamlines.iter().zip(&self.bundle) {
            if b == uid {
                out.streamlines.push(streamline.clone());
                out.bundle.push(b);
            }
        }
        out
    }

    /// Appends `streamlines`, labeling all of them `uid`.
    pub fn push_bundle(&mut self, streamlines: impl IntoIterator<Item = Streamline>, uid: u32) {
        for streamline in streamlines {
            self.streamlines.push(streamline);
            self.bundle.push(uid);
        }
    }
}

/// A registration result. Its content is only meaningful to the
/// registration backend that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    pub method: String,
    pub data: Vec<u8>,
}

impl Transform {
    pub fn read(path: &Utf8Path) -> anyhow::Result<Self> {
        load(path)
    }
}

/// One ROI of a bundle definition, in template space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    pub image: Utf8PathBuf,
    /// Streamlines must pass through inclusion ROIs and avoid exclusion ROIs.
    #[serde(default = "default_include")]
    pub include: bool,
}

fn default_include() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleDef {
    pub uid: u32,
    #[serde(default)]
    pub rois: Vec<Roi>,
}

/// Named bundle definitions, keyed and iterated by bundle name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleDict {
    bundles: BTreeMap<String, BundleDef>,
}

impl BundleDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Utf8Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("Couldn't read {path}"))?;
        let mut dict: Self =
            serde_json::from_str(&text).with_context(|| format!("Couldn't parse {path}"))?;
        dict.check()?;

        // ROI paths are relative to the definition file
        if let Some(dir) = path.parent() {
            for def in dict.bundles.values_mut() {
                for roi in &mut def.rois {
                    if roi.image.is_relative() {
                        roi.image = dir.join(&roi.image);
                    }
                }
            }
        }

        Ok(dict)
    }

    pub fn insert(&mut self, name: impl Into<String>, def: BundleDef) -> &mut Self {
        self.bundles.insert(name.into(), def);
        self
    }

    pub fn get(&self, name: &str) -> Option<&BundleDef> {
        self.bundles.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BundleDef)> {
        self.bundles.iter().map(|(name, def)| (name.as_str(), def))
    }

    /// Every bundle except the whole-brain pseudo bundle.
    pub fn tracts(&self) -> impl Iterator<Item = (&str, &BundleDef)> {
        self.iter().filter(|(name, _)| *name != WHOLE_BRAIN)
    }

    pub fn name_of(&self, uid: u32) -> Option<&str> {
        self.iter().find(|(_, def)| def.uid == uid).map(|(name, _)| name)
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    fn check(&self) -> anyhow::Result<()> {
        let mut seen = BTreeMap::new();
        for (name, def) in self.tracts() {
            ensure!(def.uid != 0, "Bundle '{name}' uses the reserved uid 0");
            if let Some(other) = seen.insert(def.uid, name) {
                bail!("Bundles '{other}' and '{name}' share uid {}", def.uid);
            }
        }
        Ok(())
    }
}

/// Quotes `field` when it holds a separator, a quote or a line break.
pub(crate) fn csv_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

/// Splits CSV text into records of unquoted fields. Blank lines are skipped.
fn csv_records(text: &str) -> anyhow::Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut blank = true;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => quoted = false,
                c => field.push(c),
            }
            continue;
        }

        match c {
            '"' => {
                quoted = true;
                blank = false;
            }
            ',' => {
                record.push(std::mem::take(&mut field));
                blank = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                if !blank {
                    record.push(std::mem::take(&mut field));
                    records.push(std::mem::take(&mut record));
                }
                blank = true;
            }
            c => {
                field.push(c);
                blank = false;
            }
        }
    }

    ensure!(!quoted, "Unterminated quoted field");
    if !blank {
        record.push(field);
        records.push(record);
    }

    Ok(records)
}

/// Streamline counts per bundle, before and after cleaning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountTable {
    pub rows: Vec<CountRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CountRow {
    pub bundle: String,
    pub n_streamlines: usize,
    pub n_streamlines_clean: usize,
}

impl CountTable {
    pub fn to_csv(&self) -> String {
        let mut out = String::from("bundle,n_streamlines,n_streamlines_clean\n");
        for row in &self.rows {
            let _ = writeln!(
                out,
                "{},{},{}",
                csv_field(&row.bundle),
                row.n_streamlines,
                row.n_streamlines_clean
            );
        }
        out
    }
}

impl Artifact for CountTable {
    const EXTENSION: &'static str = "csv";

    fn write(&self, path: &Utf8Path) -> anyhow::Result<()> {
        fs::write(path, self.to_csv())?;
        Ok(())
    }
}

/// Along-tract profiles: one row per bundle and node, one column per scalar.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileTable {
    pub scalars: Vec<String>,
    pub rows: Vec<ProfileRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRow {
    pub tract: String,
    pub node: usize,
    pub values: Vec<f64>,
}

impl ProfileTable {
    pub fn new(scalars: Vec<String>) -> Self {
        Self {
            scalars,
            rows: Vec::new(),
        }
    }

    /// Appends the profile of `tract`, given as one series of node values
    /// per scalar, in the order of [`ProfileTable::scalars`].
    pub fn push_tract(&mut self, tract: &str, series: &[Vec<f64>]) -> anyhow::Result<()> {
        ensure!(
            series.len() == self.scalars.len(),
            "Tract '{tract}' has {} profiles for {} scalars",
            series.len(),
            self.scalars.len()
        );

        let nodes = series.first().map_or(0, Vec::len);
        ensure!(
            series.iter().all(|s| s.len() == nodes),
            "Profiles of tract '{tract}' have different lengths"
        );

        for node in 0..nodes {
            self.rows.push(ProfileRow {
                tract: tract.to_string(),
                node,
                values: series.iter().map(|s| s[node]).collect(),
            });
        }

        Ok(())
    }

    pub fn header(&self) -> String {
        let mut header = String::from("tractID,nodeID");
        for scalar in &self.scalars {
            header.push(',');
            header.push_str(&csv_field(scalar));
        }
        header
    }

    pub fn to_csv(&self) -> String {
        let mut out = self.header();
        out.push('\n');
        for row in &self.rows {
            let _ = write!(out, "{},{}", csv_field(&row.tract), row.node);
            for value in &row.values {
                let _ = write!(out, ",{value}");
            }
            out.push('\n');
        }
        out
    }

    pub fn read(path: &Utf8Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("Couldn't read {path}"))?;
        Self::parse(&text).with_context(|| format!("Couldn't parse {path}"))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut records = csv_records(text)?.into_iter();

        let Some(header) = records.next() else {
            bail!("Empty profile table");
        };
        ensure!(
            header.len() >= 2 && header[0] == "tractID" && header[1] == "nodeID",
            "Profile table must start with 'tractID,nodeID'"
        );

        let mut table = Self::new(header[2..].to_vec());

        for (n, cells) in records.enumerate() {
            let mut cells = cells.into_iter();
            let tract = cells.next().unwrap_or_default();
            let node = cells
                .next()
                .unwrap_or_default()
                .parse()
                .with_context(|| format!("Row {}: bad nodeID", n + 1))?;
            let values = cells
                .map(|cell| cell.parse())
                .collect::<Result<Vec<f64>, _>>()
                .with_context(|| format!("Row {}: bad value", n + 1))?;
            ensure!(
                values.len() == table.scalars.len(),
                "Row {}: expected {} values, got {}",
                n + 1,
                table.scalars.len(),
                values.len()
            );

            table.rows.push(ProfileRow {
                tract,
                node,
                values,
            });
        }

        Ok(table)
    }
}

impl Artifact for ProfileTable {
    const EXTENSION: &'static str = "csv";

    fn write(&self, path: &Utf8Path) -> anyhow::Result<()> {
        fs::write(path, self.to_csv())?;
        Ok(())
    }
}
