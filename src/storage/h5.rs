use super::{ArrayInfo, Backend, DataType, Format, NodeKind, Volume};
use crate::attrs::{decode_json_strings, encode_attributes, Attributes};
use crate::error::{storage_err, Error, Result};
use hdf5::types::{FloatSize, IntSize, TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{Dataset, File, Group, H5Type};
use ndarray::{ArrayD, IxDyn};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFLATE_LEVEL: u8 = 4;

/// An HDF5 file. Attributes are stored as JSON strings.
pub struct Hdf5Backend {
    root: PathBuf,
    file: File,
}

impl Hdf5Backend {
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_file() {
            return Err(Error::NotFound(root.to_path_buf()));
        }
        let file = File::open_rw(root).or_else(|_| File::open(root)).map_err(storage_err)?;
        Ok(Self { root: root.to_path_buf(), file })
    }

    /// Opens `root` for writing, creating the file if needed.
    pub fn create(root: &Path) -> Result<Self> {
        if let Some(parent) = root.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::append(root).map_err(storage_err)?;
        Ok(Self { root: root.to_path_buf(), file })
    }

    fn rel(node: &str) -> &str { node.trim_matches('/') }

    fn group(&self, node: &str) -> Result<Group> {
        let rel = Self::rel(node);
        if rel.is_empty() {
            return self.file.as_group().map_err(storage_err);
        }
        self.file.group(rel).map_err(storage_err)
    }

    fn dataset(&self, node: &str) -> Result<Dataset> { self.file.dataset(Self::rel(node)).map_err(storage_err) }

    fn with_location<R>(&self, node: &str, f: impl FnOnce(&hdf5::Location) -> Result<R>) -> Result<R> {
        match self.kind(node)? {
            Some(NodeKind::Group) => f(&self.group(node)?),
            Some(NodeKind::Array) => f(&self.dataset(node)?),
            None => Err(Error::NotFound(self.root.join(Self::rel(node)))),
        }
    }

    fn unlink(&self, node: &str) -> Result<()> {
        let rel = Self::rel(node);
        if rel.is_empty() {
            for name in self.file.member_names().map_err(storage_err)? {
                self.file.unlink(&name).map_err(storage_err)?;
            }
            return Ok(());
        }
        self.file.unlink(rel).map_err(storage_err)
    }

    fn ensure_parents(&self, node: &str) -> Result<()> {
        match super::parent_node(node) {
            Some(parent) => self.create_group(&parent, false),
            None => Ok(()),
        }
    }

    fn write_typed<T: H5Type + Copy>(&self, node: &str, data: &ArrayD<T>, chunks: &[usize]) -> Result<()> {
        let parent = self.group(&super::parent_node(node).unwrap_or_else(|| "/".to_string()))?;
        let chunks: Vec<usize> = chunks.iter().map(|&c| c.max(1)).collect();
        let mut builder = parent.new_dataset::<T>().shape(data.shape().to_vec());
        if data.len() > 0 {
            builder = builder.chunk(chunks).deflate(DEFLATE_LEVEL);
        }
        let dataset = builder.create(super::node_name(node)).map_err(storage_err)?;
        let elements: Vec<T> = data.iter().copied().collect();
        dataset.write_raw(&elements).map_err(storage_err)
    }

    fn read_typed<T: H5Type>(dataset: &Dataset) -> Result<ArrayD<T>> {
        let elements = dataset.read_raw::<T>().map_err(storage_err)?;
        ArrayD::from_shape_vec(IxDyn(&dataset.shape()), elements).map_err(storage_err)
    }
}

fn read_attribute(location: &hdf5::Location, name: &str) -> Result<Option<Value>> {
    let attr = location.attr(name).map_err(storage_err)?;
    if let Ok(s) = attr.read_scalar::<VarLenUnicode>() {
        return Ok(Some(Value::String(s.to_string())));
    }
    if let Ok(s) = attr.read_scalar::<VarLenAscii>() {
        return Ok(Some(Value::String(s.to_string())));
    }
    if let Ok(n) = attr.read_scalar::<i64>() {
        return Ok(Some(Value::from(n)));
    }
    if let Ok(x) = attr.read_scalar::<f64>() {
        return Ok(Some(Value::from(x)));
    }
    log::debug!("skipping attribute {} of unsupported type", name);
    Ok(None)
}

fn data_type(descriptor: &TypeDescriptor) -> Option<DataType> {
    Some(match descriptor {
        TypeDescriptor::Unsigned(IntSize::U1) => DataType::U8,
        TypeDescriptor::Unsigned(IntSize::U2) => DataType::U16,
        TypeDescriptor::Unsigned(IntSize::U4) => DataType::U32,
        TypeDescriptor::Unsigned(IntSize::U8) => DataType::U64,
        TypeDescriptor::Integer(IntSize::U1) => DataType::I8,
        TypeDescriptor::Integer(IntSize::U2) => DataType::I16,
        TypeDescriptor::Integer(IntSize::U4) => DataType::I32,
        TypeDescriptor::Integer(IntSize::U8) => DataType::I64,
        TypeDescriptor::Float(FloatSize::U4) => DataType::F32,
        TypeDescriptor::Float(FloatSize::U8) => DataType::F64,
        _ => return None,
    })
}

impl Backend for Hdf5Backend {
    fn format(&self) -> Format { Format::Hdf5 }

    fn root(&self) -> &Path { &self.root }

    fn kind(&self, node: &str) -> Result<Option<NodeKind>> {
        let rel = Self::rel(node);
        if rel.is_empty() {
            return Ok(Some(NodeKind::Group));
        }
        let mut prefix = String::new();
        for part in rel.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            if !self.file.link_exists(&prefix) {
                return Ok(None);
            }
        }
        if self.file.group(rel).is_ok() {
            Ok(Some(NodeKind::Group))
        } else if self.file.dataset(rel).is_ok() {
            Ok(Some(NodeKind::Array))
        } else {
            Ok(None)
        }
    }

    fn children(&self, node: &str) -> Result<Vec<String>> {
        let mut names = self.group(node)?.member_names().map_err(storage_err)?;
        names.sort();
        Ok(names)
    }

    fn attributes(&self, node: &str) -> Result<Attributes> {
        let attrs = self.with_location(node, |location| {
            let mut attrs = Attributes::new();
            for name in location.attr_names().map_err(storage_err)? {
                if let Some(value) = read_attribute(location, &name)? {
                    attrs.insert(name, value);
                }
            }
            Ok(attrs)
        })?;
        Ok(decode_json_strings(attrs))
    }

    fn set_attributes(&self, node: &str, attrs: &Attributes) -> Result<()> {
        let encoded = encode_attributes(attrs)?;
        self.with_location(node, |location| {
            for name in location.attr_names().map_err(storage_err)? {
                location.delete_attr(&name).map_err(storage_err)?;
            }
            for (name, json) in &encoded {
                let value = VarLenUnicode::from_str(json).map_err(storage_err)?;
                location
                    .new_attr::<VarLenUnicode>()
                    .create(name.as_str())
                    .map_err(storage_err)?
                    .write_scalar(&value)
                    .map_err(storage_err)?;
            }
            Ok(())
        })
    }

    fn create_group(&self, node: &str, overwrite: bool) -> Result<()> {
        match self.kind(node)? {
            Some(_) if overwrite => self.unlink(node)?,
            Some(NodeKind::Group) => return Ok(()),
            Some(NodeKind::Array) => {
                return Err(Error::Storage(format!("{} is a dataset, expected a group", node)))
            }
            None => {}
        }
        if Self::rel(node).is_empty() {
            return Ok(());
        }
        self.ensure_parents(node)?;
        let parent = self.group(&super::parent_node(node).unwrap_or_else(|| "/".to_string()))?;
        parent.create_group(super::node_name(node)).map_err(storage_err)?;
        Ok(())
    }

    fn array_info(&self, node: &str) -> Result<ArrayInfo> {
        let dataset = self.dataset(node)?;
        let descriptor = dataset.dtype().and_then(|t| t.to_descriptor()).map_err(storage_err)?;
        let data_type = data_type(&descriptor)
            .ok_or_else(|| Error::Storage(format!("unsupported data type {:?} in {}", descriptor, node)))?;
        Ok(ArrayInfo { shape: dataset.shape(), chunks: dataset.chunk(), data_type })
    }

    fn read(&self, node: &str) -> Result<Volume> {
        let info = self.array_info(node)?;
        let dataset = self.dataset(node)?;
        Ok(match info.data_type {
            DataType::U8 => Volume::U8(Self::read_typed(&dataset)?),
            DataType::U16 => Volume::U16(Self::read_typed(&dataset)?),
            DataType::U32 => Volume::U32(Self::read_typed(&dataset)?),
            DataType::U64 => Volume::U64(Self::read_typed(&dataset)?),
            DataType::I8 => Volume::I8(Self::read_typed(&dataset)?),
            DataType::I16 => Volume::I16(Self::read_typed(&dataset)?),
            DataType::I32 => Volume::I32(Self::read_typed(&dataset)?),
            DataType::I64 => Volume::I64(Self::read_typed(&dataset)?),
            DataType::F32 => Volume::F32(Self::read_typed(&dataset)?),
            DataType::F64 => Volume::F64(Self::read_typed(&dataset)?),
        })
    }

    fn write(&self, node: &str, data: &Volume, chunks: &[usize]) -> Result<()> {
        if self.kind(node)?.is_some() {
            self.unlink(node)?;
        }
        self.ensure_parents(node)?;
        crate::with_volume!(data, a => self.write_typed(node, a, chunks))
    }
}
