use super::{is_zarr_node, parent_node, ArrayInfo, Backend, DataType, Format, NodeKind, Volume};
use crate::attrs::{decode_attributes, Attributes};
use crate::error::{storage_err, Error, Result};
use ndarray::{ArrayD, IxDyn};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zarrs::array::codec::GzipCodec;
use zarrs::array::{data_type, Array, ArrayBuilder};
use zarrs::array::ArraySubset;
use zarrs::filesystem::FilesystemStore;
use zarrs::group::{Group, GroupBuilder};

const GZIP_LEVEL: u32 = 5;
const ZARRAY: &str = ".zarray";
const ZGROUP: &str = ".zgroup";
const ZATTRS: &str = ".zattrs";
const ZARR_JSON: &str = "zarr.json";

pub type Store = Arc<FilesystemStore>;

/// Metadata flavour of a node. New nodes take the flavour of their nearest existing ancestor,
/// so levels added to an OME-NGFF 0.4 crop stay v2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZarrVersion {
    V2,
    V3,
}

#[derive(Serialize)]
struct ZarrayMeta {
    zarr_format: u32,
    shape: Vec<usize>,
    chunks: Vec<usize>,
    dtype: &'static str,
    compressor: Value,
    fill_value: Value,
    order: &'static str,
    filters: Option<Vec<Value>>,
    dimension_separator: &'static str,
}

impl ZarrayMeta {
    fn new(shape: &[usize], chunks: &[usize], data_type: DataType) -> Self {
        Self {
            zarr_format: 2,
            shape: shape.to_vec(),
            chunks: chunks.iter().map(|&c| c.max(1)).collect(),
            dtype: data_type.v2_dtype(),
            compressor: json!({"id": "gzip", "level": GZIP_LEVEL}),
            fill_value: if data_type.is_float() { json!(0.0) } else { json!(0) },
            order: "C",
            filters: None,
            dimension_separator: "/",
        }
    }
}

pub struct ZarrBackend {
    root: PathBuf,
    store: Store,
}

impl ZarrBackend {
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::NotFound(root.to_path_buf()));
        }
        let store = Arc::new(FilesystemStore::new(root).map_err(storage_err)?);
        Ok(Self { root: root.to_path_buf(), store })
    }

    /// Opens the store at `root`, creating the directory and a root group if needed. A new root
    /// group is zarr v2.
    pub fn create(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let backend = Self::open(root)?;
        backend.create_group("/", false)?;
        Ok(backend)
    }

    fn dir(&self, node: &str) -> PathBuf { self.root.join(node.trim_start_matches('/')) }

    /// Version of `node` or, if it does not exist, of its nearest existing ancestor.
    pub fn version_of(&self, node: &str) -> ZarrVersion {
        let mut current = Some(node.to_string());
        while let Some(n) = current {
            let dir = self.dir(&n);
            if dir.join(ZARR_JSON).is_file() {
                return ZarrVersion::V3;
            }
            if dir.join(ZGROUP).is_file() || dir.join(ZARRAY).is_file() {
                return ZarrVersion::V2;
            }
            current = parent_node(&n);
        }
        ZarrVersion::V2
    }

    fn write_json(&self, node: &str, file: &str, value: &impl Serialize) -> Result<()> {
        let dir = self.dir(node);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(file), serde_json::to_vec_pretty(value)?)?;
        Ok(())
    }

    fn metadata(&self, node: &str) -> Result<Option<(NodeKind, Value)>> {
        let dir = self.dir(node);
        let v3 = dir.join(ZARR_JSON);
        if v3.is_file() {
            let meta: Value = serde_json::from_slice(&std::fs::read(&v3)?)?;
            let kind = match meta.get("node_type").and_then(Value::as_str) {
                Some("array") => NodeKind::Array,
                _ => NodeKind::Group,
            };
            return Ok(Some((kind, meta)));
        }
        for (file, kind) in [(ZARRAY, NodeKind::Array), (ZGROUP, NodeKind::Group)] {
            let path = dir.join(file);
            if path.is_file() {
                let meta: Value = serde_json::from_slice(&std::fs::read(&path)?)?;
                return Ok(Some((kind, meta)));
            }
        }
        Ok(None)
    }

    fn open_array(&self, node: &str) -> Result<Array<FilesystemStore>> {
        Array::open(self.store.clone(), node).map_err(storage_err)
    }

    fn open_group(&self, node: &str) -> Result<Group<FilesystemStore>> {
        Group::open(self.store.clone(), node).map_err(storage_err)
    }

    fn remove(&self, node: &str) -> Result<()> {
        let dir = self.dir(node);
        if node.trim_matches('/').is_empty() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    std::fs::remove_dir_all(&path)?;
                } else {
                    std::fs::remove_file(&path)?;
                }
            }
        } else if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn ensure_parents(&self, node: &str) -> Result<()> {
        match parent_node(node) {
            Some(parent) => self.create_group(&parent, false),
            None => Ok(()),
        }
    }
}

fn parse_shape(value: Option<&Value>) -> Option<Vec<usize>> {
    value?.as_array()?.iter().map(|v| v.as_u64().map(|n| n as usize)).collect()
}

macro_rules! store_volume {
    ($self:ident, $node:ident, $version:ident, $chunks:ident, $a:ident, $dtype:expr, $fill:expr) => {{
        let array = match $version {
            // `.zarray` is already in place
            ZarrVersion::V2 => $self.open_array($node)?,
            ZarrVersion::V3 => {
                let shape: Vec<u64> = $a.shape().iter().map(|&n| n as u64).collect();
                let chunk_shape: Vec<u64> = $chunks.iter().map(|&n| n.max(1) as u64).collect();
                let gzip = GzipCodec::new(GZIP_LEVEL).map_err(storage_err)?;
                let array = ArrayBuilder::new(shape, chunk_shape, $dtype, $fill)
                    .bytes_to_bytes_codecs(vec![Arc::new(gzip)])
                    .build($self.store.clone(), $node)
                    .map_err(storage_err)?;
                array.store_metadata().map_err(storage_err)?;
                array
            }
        };
        let elements: Vec<_> = $a.iter().copied().collect();
        array
            .store_array_subset_elements(&array.subset_all(), &elements)
            .map_err(storage_err)?;
    }};
}

macro_rules! retrieve_volume {
    ($array:ident, $subset:ident, $shape:ident, $t:ty, $variant:ident) => {{
        let elements = $array
            .retrieve_array_subset_elements::<$t>(&$subset)
            .map_err(storage_err)?;
        Volume::$variant(ArrayD::from_shape_vec(IxDyn(&$shape), elements).map_err(storage_err)?)
    }};
}

impl Backend for ZarrBackend {
    fn format(&self) -> Format { Format::Zarr }

    fn root(&self) -> &Path { &self.root }

    fn kind(&self, node: &str) -> Result<Option<NodeKind>> { Ok(self.metadata(node)?.map(|(kind, _)| kind)) }

    fn children(&self, node: &str) -> Result<Vec<String>> {
        let dir = self.dir(node);
        if !dir.is_dir() {
            return Err(Error::NotFound(dir));
        }
        let mut names = vec![];
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() && is_zarr_node(&path) {
                if let Some(name) = path.file_name() {
                    names.push(name.to_string_lossy().into_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn attributes(&self, node: &str) -> Result<Attributes> {
        let attrs = match self.kind(node)? {
            Some(NodeKind::Group) => self.open_group(node)?.attributes().clone(),
            Some(NodeKind::Array) => self.open_array(node)?.attributes().clone(),
            None => return Err(Error::NotFound(self.dir(node))),
        };
        Ok(decode_attributes(attrs))
    }

    fn set_attributes(&self, node: &str, attrs: &Attributes) -> Result<()> {
        let kind = self.kind(node)?.ok_or_else(|| Error::NotFound(self.dir(node)))?;
        match (self.version_of(node), kind) {
            (ZarrVersion::V2, _) => self.write_json(node, ZATTRS, attrs),
            (ZarrVersion::V3, NodeKind::Group) => {
                let mut group = self.open_group(node)?;
                *group.attributes_mut() = attrs.clone();
                group.store_metadata().map_err(storage_err)
            }
            (ZarrVersion::V3, NodeKind::Array) => {
                let mut array = self.open_array(node)?;
                *array.attributes_mut() = attrs.clone();
                array.store_metadata().map_err(storage_err)
            }
        }
    }

    fn create_group(&self, node: &str, overwrite: bool) -> Result<()> {
        let version = self.version_of(node);
        match self.kind(node)? {
            Some(_) if overwrite => self.remove(node)?,
            Some(NodeKind::Group) => return Ok(()),
            Some(NodeKind::Array) => {
                return Err(Error::Storage(format!("{} is an array, expected a group", self.dir(node).display())))
            }
            None => {}
        }
        self.ensure_parents(node)?;
        match version {
            ZarrVersion::V2 => self.write_json(node, ZGROUP, &json!({"zarr_format": 2})),
            ZarrVersion::V3 => GroupBuilder::new()
                .build(self.store.clone(), node)
                .map_err(storage_err)?
                .store_metadata()
                .map_err(storage_err),
        }
    }

    fn array_info(&self, node: &str) -> Result<ArrayInfo> {
        let (kind, meta) = self
            .metadata(node)?
            .ok_or_else(|| Error::NotFound(self.dir(node)))?;
        if kind != NodeKind::Array {
            return Err(Error::Storage(format!("{} is a group, expected an array", self.dir(node).display())));
        }
        let shape = parse_shape(meta.get("shape"));
        let (chunks, data_type) = if meta.get("zarr_format").and_then(Value::as_u64) == Some(3) {
            (
                parse_shape(meta.pointer("/chunk_grid/configuration/chunk_shape")),
                meta.get("data_type").and_then(Value::as_str).and_then(DataType::from_v3_name),
            )
        } else {
            (
                parse_shape(meta.get("chunks")),
                meta.get("dtype").and_then(Value::as_str).and_then(DataType::from_v2_dtype),
            )
        };
        let shape = shape.ok_or_else(|| Error::Storage(format!("no shape in metadata of {}", node)))?;
        let data_type = data_type.ok_or_else(|| Error::Storage(format!("unsupported data type in {}", node)))?;
        Ok(ArrayInfo { shape, chunks, data_type })
    }

    fn read(&self, node: &str) -> Result<Volume> {
        let shape = self.array_info(node)?.shape;
        self.read_region(node, &vec![0; shape.len()], &shape)
    }

    fn read_region(&self, node: &str, start: &[usize], shape: &[usize]) -> Result<Volume> {
        let info = self.array_info(node)?;
        let in_bounds = start.len() == info.shape.len()
            && shape.len() == info.shape.len()
            && start.iter().zip(shape).zip(&info.shape).all(|((&s, &n), &len)| s + n <= len);
        if !in_bounds {
            return Err(Error::Storage(format!(
                "region {:?}+{:?} is outside of {} with shape {:?}",
                start, shape, node, info.shape
            )));
        }
        let array = self.open_array(node)?;
        let ranges: Vec<_> = start.iter().zip(shape).map(|(&s, &n)| s as u64..(s + n) as u64).collect();
        let subset = ArraySubset::new_with_ranges(&ranges);
        let shape = shape.to_vec();
        Ok(match info.data_type {
            DataType::U8 => retrieve_volume!(array, subset, shape, u8, U8),
            DataType::U16 => retrieve_volume!(array, subset, shape, u16, U16),
            DataType::U32 => retrieve_volume!(array, subset, shape, u32, U32),
            DataType::U64 => retrieve_volume!(array, subset, shape, u64, U64),
            DataType::I8 => retrieve_volume!(array, subset, shape, i8, I8),
            DataType::I16 => retrieve_volume!(array, subset, shape, i16, I16),
            DataType::I32 => retrieve_volume!(array, subset, shape, i32, I32),
            DataType::I64 => retrieve_volume!(array, subset, shape, i64, I64),
            DataType::F32 => retrieve_volume!(array, subset, shape, f32, F32),
            DataType::F64 => retrieve_volume!(array, subset, shape, f64, F64),
        })
    }

    fn write(&self, node: &str, data: &Volume, chunks: &[usize]) -> Result<()> {
        let version = self.version_of(node);
        if self.kind(node)?.is_some() {
            self.remove(node)?;
        }
        self.ensure_parents(node)?;
        if version == ZarrVersion::V2 {
            self.write_json(node, ZARRAY, &ZarrayMeta::new(data.shape(), chunks, data.data_type()))?;
        }
        match data {
            Volume::U8(a) => store_volume!(self, node, version, chunks, a, data_type::uint8(), 0u8),
            Volume::U16(a) => store_volume!(self, node, version, chunks, a, data_type::uint16(), 0u16),
            Volume::U32(a) => store_volume!(self, node, version, chunks, a, data_type::uint32(), 0u32),
            Volume::U64(a) => store_volume!(self, node, version, chunks, a, data_type::uint64(), 0u64),
            Volume::I8(a) => store_volume!(self, node, version, chunks, a, data_type::int8(), 0i8),
            Volume::I16(a) => store_volume!(self, node, version, chunks, a, data_type::int16(), 0i16),
            Volume::I32(a) => store_volume!(self, node, version, chunks, a, data_type::int32(), 0i32),
            Volume::I64(a) => store_volume!(self, node, version, chunks, a, data_type::int64(), 0i64),
            Volume::F32(a) => store_volume!(self, node, version, chunks, a, data_type::float32(), 0f32),
            Volume::F64(a) => store_volume!(self, node, version, chunks, a, data_type::float64(), 0f64),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_then_read_keeps_type_shape_and_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ZarrBackend::create(&dir.path().join("crop.zarr")).unwrap();
        let data = ArrayD::from_shape_vec(IxDyn(&[2, 3, 4]), (0u16..24).collect()).unwrap();

        backend.write("/labels/mito/s0", &Volume::U16(data.clone()), &[1, 3, 4]).unwrap();
        let mut attrs = Attributes::new();
        attrs.insert("cellmap".into(), json!({"annotation": {"class_names": ["mito"]}}));
        backend.set_attributes("/labels/mito/s0", &attrs).unwrap();

        assert_eq!(backend.kind("/labels").unwrap(), Some(NodeKind::Group));
        assert_eq!(backend.kind("/labels/mito/s0").unwrap(), Some(NodeKind::Array));
        assert_eq!(backend.kind("/labels/er").unwrap(), None);
        assert_eq!(backend.children("/labels/mito").unwrap(), vec!["s0".to_string()]);

        let info = backend.array_info("/labels/mito/s0").unwrap();
        assert_eq!(info.shape, vec![2, 3, 4]);
        assert_eq!(info.chunks, Some(vec![1, 3, 4]));
        assert_eq!(info.data_type, DataType::U16);

        assert_eq!(backend.read("/labels/mito/s0").unwrap(), Volume::U16(data));
        assert_eq!(backend.attributes("/labels/mito/s0").unwrap(), attrs);
    }

    #[test]
    fn regions_are_read_without_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ZarrBackend::create(dir.path()).unwrap();
        let data = ArrayD::from_shape_vec(IxDyn(&[2, 3, 4]), (0i32..24).collect()).unwrap();
        backend.write("/raw/s0", &Volume::I32(data.clone()), &[1, 3, 4]).unwrap();
        let region = backend.read_region("/raw/s0", &[1, 1, 2], &[1, 2, 2]).unwrap();
        assert_eq!(region, Volume::I32(data).slice_block(&[1, 1, 2], &[1, 2, 2]));
        assert!(backend.read_region("/raw/s0", &[1, 2, 2], &[1, 2, 2]).is_err());
    }

    #[test]
    fn writing_replaces_existing_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ZarrBackend::create(dir.path()).unwrap();
        let big = ArrayD::<f32>::zeros(IxDyn(&[4, 4, 4]));
        let small = ArrayD::<u8>::ones(IxDyn(&[2, 2, 2]));
        backend.write("/raw/s0", &Volume::F32(big), &[1, 4, 4]).unwrap();
        backend.write("/raw/s0", &Volume::U8(small.clone()), &[1, 2, 2]).unwrap();
        assert_eq!(backend.read("/raw/s0").unwrap(), Volume::U8(small));
    }

    #[test]
    fn string_encoded_attributes_are_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ZarrBackend::create(dir.path()).unwrap();
        backend.create_group("/labels", false).unwrap();
        let mut attrs = Attributes::new();
        attrs.insert("multiscales".into(), Value::String(r#"[{"axes": [], "datasets": []}]"#.into()));
        backend.set_attributes("/labels", &attrs).unwrap();
        assert!(backend.attributes("/labels").unwrap()["multiscales"].is_array());
    }

    fn read_json(path: &Path) -> Value { serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap() }

    #[test]
    fn new_stores_are_zarr_v2() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ZarrBackend::create(dir.path()).unwrap();
        let data = ArrayD::<u8>::ones(IxDyn(&[2, 2, 2]));
        backend.write("/labels/mito/s0", &Volume::U8(data.clone()), &[1, 2, 2]).unwrap();
        let mut attrs = Attributes::new();
        attrs.insert("cellmap".into(), json!({"annotation": {"class_names": ["mito"]}}));
        backend.set_attributes("/labels", &attrs).unwrap();

        assert_eq!(read_json(&dir.path().join(".zgroup")), json!({"zarr_format": 2}));
        assert!(dir.path().join("labels/mito/.zgroup").is_file());
        let zarray = read_json(&dir.path().join("labels/mito/s0/.zarray"));
        assert_eq!(zarray["zarr_format"], 2);
        assert_eq!(zarray["dtype"], "|u1");
        assert_eq!(zarray["chunks"], json!([1, 2, 2]));
        assert_eq!(zarray["dimension_separator"], "/");
        assert_eq!(zarray["compressor"]["id"], "gzip");
        assert_eq!(read_json(&dir.path().join("labels/.zattrs")), Value::Object(attrs.clone()));
        assert!(!dir.path().join("zarr.json").exists());
        assert!(!dir.path().join("labels/mito/s0/zarr.json").exists());

        assert_eq!(backend.version_of("/labels/mito/s1"), ZarrVersion::V2);
        assert_eq!(backend.read("/labels/mito/s0").unwrap(), Volume::U8(data));
        assert_eq!(backend.attributes("/labels").unwrap(), attrs);
    }

    #[test]
    fn nodes_follow_the_version_of_their_parent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("zarr.json"),
            r#"{"zarr_format": 3, "node_type": "group", "attributes": {}}"#,
        )
        .unwrap();
        let backend = ZarrBackend::open(dir.path()).unwrap();
        let data = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![0.5f32, 1.5, 2.5, 3.5]).unwrap();
        backend.write("/raw/s0", &Volume::F32(data.clone()), &[2, 2]).unwrap();
        let mut attrs = Attributes::new();
        attrs.insert("name".into(), json!("raw"));
        backend.set_attributes("/raw", &attrs).unwrap();

        assert_eq!(backend.version_of("/raw/s0"), ZarrVersion::V3);
        assert!(dir.path().join("raw/zarr.json").is_file());
        assert!(dir.path().join("raw/s0/zarr.json").is_file());
        assert!(!dir.path().join("raw/s0/.zarray").exists());
        assert_eq!(backend.read("/raw/s0").unwrap(), Volume::F32(data));
        assert_eq!(backend.attributes("/raw").unwrap(), attrs);
    }
}
