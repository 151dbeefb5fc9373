//! Hierarchical containers (zarr stores and HDF5 files) behind one small trait.
//!
//! Nodes are addressed by `/`-separated paths relative to the container root, the root itself
//! being `/`. Attributes come back decoded (see [`crate::attrs`]).

#[cfg(feature = "hdf5")]
pub mod h5;
pub mod zarr;

use crate::annotation::CellmapAttrs;
use crate::attrs::{self, Attributes};
use crate::error::{Error, Result};
use crate::ome::OmeAttrs;
use ndarray::ArrayD;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

const HDF5_SIGNATURE: [u8; 8] = [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1a, b'\n'];
const ZARR_MARKERS: [&str; 3] = ["zarr.json", ".zgroup", ".zarray"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Zarr,
    Hdf5,
}
impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Zarr => write!(f, "zarr"),
            Format::Hdf5 => write!(f, "hdf5"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Group,
    Array,
}

/// A node inside a container on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub format: Format,
    pub root: PathBuf,
    pub node: String,
}

impl Location {
    /// Finds the container holding `path` by looking at the file system, not by trying readers.
    ///
    /// An HDF5 file is recognized by its signature on the nearest existing file along the path
    /// (`crop.h5/labels/mito` lives in `crop.h5`). A zarr root is the top-most directory of the
    /// chain of directories carrying zarr metadata.
    pub fn probe(path: &Path) -> Result<Location> {
        for ancestor in path.ancestors().filter(|a| !a.as_os_str().is_empty()) {
            if ancestor.is_file() {
                if !has_hdf5_signature(ancestor)? {
                    return Err(Error::Storage(format!("{} is not a zarr or hdf5 container", ancestor.display())));
                }
                return Ok(Location {
                    format: Format::Hdf5,
                    root: ancestor.to_path_buf(),
                    node: relative_node(path, ancestor),
                });
            }
            if ancestor.is_dir() {
                break;
            }
        }
        if !path.is_dir() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        let mut root = path;
        while let Some(parent) = root.parent() {
            if parent.as_os_str().is_empty() || !is_zarr_node(parent) {
                break;
            }
            root = parent;
        }
        Ok(Location {
            format: Format::Zarr,
            root: root.to_path_buf(),
            node: relative_node(path, root),
        })
    }
}

fn has_hdf5_signature(file: &Path) -> Result<bool> {
    let mut buf = [0u8; 8];
    let mut f = std::fs::File::open(file)?;
    match f.read_exact(&mut buf) {
        Ok(()) => Ok(buf == HDF5_SIGNATURE),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn is_zarr_node(dir: &Path) -> bool { ZARR_MARKERS.iter().any(|m| dir.join(m).is_file()) }

fn relative_node(path: &Path, root: &Path) -> String {
    let parts = path
        .strip_prefix(root)
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    format!("/{}", parts.join("/"))
}

pub fn join_node(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let name = name.trim_matches('/');
    format!("{}/{}", parent, name)
}

pub fn parent_node(node: &str) -> Option<String> {
    let trimmed = node.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let idx = trimmed.rfind('/')?;
    Some(if idx == 0 { "/".to_string() } else { trimmed[..idx].to_string() })
}

pub fn node_name(node: &str) -> &str { node.trim_end_matches('/').rsplit('/').next().unwrap_or("") }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl DataType {
    /// Zarr v3 `data_type` names.
    pub fn from_v3_name(name: &str) -> Option<Self> {
        Some(match name {
            "uint8" => DataType::U8,
            "uint16" => DataType::U16,
            "uint32" => DataType::U32,
            "uint64" => DataType::U64,
            "int8" => DataType::I8,
            "int16" => DataType::I16,
            "int32" => DataType::I32,
            "int64" => DataType::I64,
            "float32" => DataType::F32,
            "float64" => DataType::F64,
            _ => return None,
        })
    }
    /// Little-endian numpy type string, as written to `.zarray`.
    pub fn v2_dtype(&self) -> &'static str {
        match self {
            DataType::U8 => "|u1",
            DataType::U16 => "<u2",
            DataType::U32 => "<u4",
            DataType::U64 => "<u8",
            DataType::I8 => "|i1",
            DataType::I16 => "<i2",
            DataType::I32 => "<i4",
            DataType::I64 => "<i8",
            DataType::F32 => "<f4",
            DataType::F64 => "<f8",
        }
    }

    pub fn is_float(&self) -> bool { matches!(self, DataType::F32 | DataType::F64) }

    /// Zarr v2 / numpy type strings like `|u1` or `<f4`.
    pub fn from_v2_dtype(dtype: &str) -> Option<Self> {
        Some(match dtype.trim_start_matches(['<', '>', '|', '=']) {
            "u1" => DataType::U8,
            "u2" => DataType::U16,
            "u4" => DataType::U32,
            "u8" => DataType::U64,
            "i1" => DataType::I8,
            "i2" => DataType::I16,
            "i4" => DataType::I32,
            "i8" => DataType::I64,
            "f4" => DataType::F32,
            "f8" => DataType::F64,
            _ => return None,
        })
    }
}

/// An in-memory array of any of the supported element types.
#[derive(Debug, Clone, PartialEq)]
pub enum Volume {
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    U32(ArrayD<u32>),
    U64(ArrayD<u64>),
    I8(ArrayD<i8>),
    I16(ArrayD<i16>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

/// Runs `$body` with `$a` bound to the typed array inside a [`Volume`].
#[macro_export]
macro_rules! with_volume {
    ($volume:expr, $a:ident => $body:expr) => {
        match $volume {
            $crate::storage::Volume::U8($a) => $body,
            $crate::storage::Volume::U16($a) => $body,
            $crate::storage::Volume::U32($a) => $body,
            $crate::storage::Volume::U64($a) => $body,
            $crate::storage::Volume::I8($a) => $body,
            $crate::storage::Volume::I16($a) => $body,
            $crate::storage::Volume::I32($a) => $body,
            $crate::storage::Volume::I64($a) => $body,
            $crate::storage::Volume::F32($a) => $body,
            $crate::storage::Volume::F64($a) => $body,
        }
    };
}

impl Volume {
    pub fn shape(&self) -> &[usize] { with_volume!(self, a => a.shape()) }

    pub fn data_type(&self) -> DataType {
        match self {
            Volume::U8(_) => DataType::U8,
            Volume::U16(_) => DataType::U16,
            Volume::U32(_) => DataType::U32,
            Volume::U64(_) => DataType::U64,
            Volume::I8(_) => DataType::I8,
            Volume::I16(_) => DataType::I16,
            Volume::I32(_) => DataType::I32,
            Volume::I64(_) => DataType::I64,
            Volume::F32(_) => DataType::F32,
            Volume::F64(_) => DataType::F64,
        }
    }

    pub fn to_f32(&self) -> ArrayD<f32> { with_volume!(self, a => a.mapv(|v| v as f32)) }

    /// Sub-block `start..start + shape`, keeping the element type.
    pub fn slice_block(&self, start: &[usize], shape: &[usize]) -> Volume {
        use ndarray::{Slice, SliceInfoElem};
        let info: Vec<SliceInfoElem> = start
            .iter()
            .zip(shape)
            .map(|(&s, &n)| Slice::from(s as isize..(s + n) as isize).into())
            .collect();
        with_volume!(self, a => {
            let block = a.slice(info.as_slice()).to_owned();
            Volume::from(block)
        })
    }
}

macro_rules! volume_from {
    ($($t:ty => $variant:ident),*) => {
        $(impl From<ArrayD<$t>> for Volume {
            fn from(a: ArrayD<$t>) -> Self { Volume::$variant(a) }
        })*
    };
}
volume_from!(u8 => U8, u16 => U16, u32 => U32, u64 => U64, i8 => I8, i16 => I16, i32 => I32, i64 => I64, f32 => F32, f64 => F64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayInfo {
    pub shape: Vec<usize>,
    pub chunks: Option<Vec<usize>>,
    pub data_type: DataType,
}

/// The operations the toolkit needs from a hierarchical container.
pub trait Backend {
    fn format(&self) -> Format;
    fn root(&self) -> &Path;
    fn kind(&self, node: &str) -> Result<Option<NodeKind>>;
    /// Names of the direct children of a group, sorted.
    fn children(&self, node: &str) -> Result<Vec<String>>;
    fn attributes(&self, node: &str) -> Result<Attributes>;
    /// Replaces all attributes of the node.
    fn set_attributes(&self, node: &str, attrs: &Attributes) -> Result<()>;
    /// Creates a group (and missing parents). With `overwrite` an existing node is removed first.
    fn create_group(&self, node: &str, overwrite: bool) -> Result<()>;
    fn array_info(&self, node: &str) -> Result<ArrayInfo>;
    fn read(&self, node: &str) -> Result<Volume>;
    /// The block `start..start + shape` of the array at `node`.
    fn read_region(&self, node: &str, start: &[usize], shape: &[usize]) -> Result<Volume> {
        Ok(self.read(node)?.slice_block(start, shape))
    }
    /// Writes a compressed chunked array, replacing whatever was stored under `node`.
    fn write(&self, node: &str, data: &Volume, chunks: &[usize]) -> Result<()>;

    fn exists(&self, node: &str) -> Result<bool> { Ok(self.kind(node)?.is_some()) }

    fn update_attributes(&self, node: &str, update: &mut dyn FnMut(&mut Attributes) -> Result<()>) -> Result<()> {
        let mut attrs = self.attributes(node)?;
        update(&mut attrs)?;
        self.set_attributes(node, &attrs)
    }

    fn multiscales(&self, node: &str) -> Result<OmeAttrs> { attrs::multiscales(&self.attributes(node)?) }

    fn cellmap(&self, node: &str) -> Result<CellmapAttrs> { attrs::cellmap(&self.attributes(node)?) }
}

/// Opens the container holding `path` with the backend matching its format.
pub fn open(path: &Path) -> Result<(Box<dyn Backend>, String)> {
    let location = Location::probe(path)?;
    let backend = open_location(&location)?;
    Ok((backend, location.node))
}

pub fn open_location(location: &Location) -> Result<Box<dyn Backend>> {
    match location.format {
        Format::Zarr => Ok(Box::new(zarr::ZarrBackend::open(&location.root)?)),
        #[cfg(feature = "hdf5")]
        Format::Hdf5 => Ok(Box::new(h5::Hdf5Backend::open(&location.root)?)),
        #[cfg(not(feature = "hdf5"))]
        Format::Hdf5 => Err(Error::BackendUnavailable(Format::Hdf5)),
    }
}

/// Creates (or opens for writing) a container of the given format at `path`.
pub fn create(path: &Path, format: Format) -> Result<Box<dyn Backend>> {
    match format {
        Format::Zarr => Ok(Box::new(zarr::ZarrBackend::create(path)?)),
        #[cfg(feature = "hdf5")]
        Format::Hdf5 => Ok(Box::new(h5::Hdf5Backend::create(path)?)),
        #[cfg(not(feature = "hdf5"))]
        Format::Hdf5 => Err(Error::BackendUnavailable(Format::Hdf5)),
    }
}

/// Copies the node `src_node` with everything below it, attributes included. `chunking` maps an
/// array shape to the chunk shape used in `dst`.
pub fn copy_tree(
    src: &dyn Backend,
    src_node: &str,
    dst: &dyn Backend,
    dst_node: &str,
    chunking: &dyn Fn(&[usize]) -> Vec<usize>,
) -> Result<()> {
    match src.kind(src_node)? {
        Some(NodeKind::Array) => {
            log::debug!("copying array {} to {}", src_node, dst_node);
            let data = src.read(src_node)?;
            dst.write(dst_node, &data, &chunking(data.shape()))?;
        }
        Some(NodeKind::Group) => {
            log::debug!("copying group {} to {}", src_node, dst_node);
            dst.create_group(dst_node, false)?;
            for child in src.children(src_node)? {
                copy_tree(src, &join_node(src_node, &child), dst, &join_node(dst_node, &child), chunking)?;
            }
        }
        None => return Err(Error::NotFound(src.root().join(src_node.trim_start_matches('/')))),
    }
    dst.set_attributes(dst_node, &src.attributes(src_node)?)
}

/// Chunks of one z-slab: `(1, full, full)`.
pub fn slab_chunks(shape: &[usize]) -> Vec<usize> {
    shape
        .iter()
        .enumerate()
        .map(|(i, &n)| if i == 0 { 1 } else { n.max(1) })
        .collect()
}
