//! Coordinate-aware reading of multiscale data from zarr stores and HDF5 files.
//!
//! An array gets its physical coordinates from the multiscale metadata of the nearest ancestor
//! group that lists it as a level. Groups are read as [`DataTree`]s; array data is only read on
//! [`CoordArray::load`].

use crate::attrs::{self, Attributes};
use crate::error::{Error, Result};
use crate::ome::{self, OmeAttrs};
use crate::storage::{self, node_name, parent_node, Backend, Format, Location, NodeKind, Volume};
use itertools::Itertools;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct CoordArray {
    pub name: String,
    pub location: Location,
    pub shape: Vec<usize>,
    /// Chunk shape on disk, if the store has one.
    pub chunks: Option<Vec<usize>>,
    pub dims: Vec<String>,
    pub scale: Vec<f64>,
    pub translation: Vec<f64>,
    pub coords: Vec<Vec<f64>>,
    pub attrs: Attributes,
}

impl CoordArray {
    pub fn load(&self) -> Result<Volume> { storage::open_location(&self.location)?.read(&self.location.node) }

    /// Reads the block of `shape` voxels starting at `start`, leaving the rest on disk.
    pub fn load_region(&self, start: &[usize], shape: &[usize]) -> Result<Volume> {
        storage::open_location(&self.location)?.read_region(&self.location.node, start, shape)
    }

    /// `(start, shape)` of every chunk in C order, clipped to the array. Unchunked arrays are a
    /// single region.
    pub fn chunk_regions(&self) -> Vec<(Vec<usize>, Vec<usize>)> {
        let chunks = match &self.chunks {
            Some(chunks) if chunks.len() == self.shape.len() => chunks.clone(),
            _ => self.shape.clone(),
        };
        if self.shape.iter().any(|&n| n == 0) {
            return vec![];
        }
        self.shape
            .iter()
            .zip(&chunks)
            .map(|(&len, &chunk)| {
                let chunk = chunk.max(1);
                (0..len).step_by(chunk).map(move |s| (s, chunk.min(len - s))).collect::<Vec<_>>()
            })
            .multi_cartesian_product()
            .map(|blocks| blocks.into_iter().unzip())
            .collect()
    }

    /// Spacing of the voxel grid along each axis.
    pub fn resolution(&self) -> &[f64] { &self.scale }

    pub fn coord(&self, dim: &str) -> Option<&[f64]> {
        self.dims.iter().position(|d| d == dim).map(|i| self.coords[i].as_slice())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataNode {
    Tree(DataTree),
    Array(CoordArray),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataTree {
    pub name: String,
    pub attrs: Attributes,
    pub children: BTreeMap<String, DataNode>,
}

impl DataTree {
    pub fn get(&self, path: &str) -> Option<&DataNode> {
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        let mut node = self.children.get(parts.next()?)?;
        for part in parts {
            match node {
                DataNode::Tree(tree) => node = tree.children.get(part)?,
                DataNode::Array(_) => return None,
            }
        }
        Some(node)
    }
}

impl DataNode {
    pub fn as_array(&self) -> Option<&CoordArray> {
        match self {
            DataNode::Array(a) => Some(a),
            DataNode::Tree(_) => None,
        }
    }

    pub fn as_tree(&self) -> Option<&DataTree> {
        match self {
            DataNode::Tree(t) => Some(t),
            DataNode::Array(_) => None,
        }
    }
}

/// `coord[i] = i * scale + translation` for every axis.
pub fn coordinates(shape: &[usize], scale: &[f64], translation: &[f64]) -> Vec<Vec<f64>> {
    shape
        .iter()
        .zip(scale.iter().zip(translation))
        .map(|(&n, (&s, &t))| (0..n).map(|i| i as f64 * s + t).collect())
        .collect()
}

fn match_level(doc: &OmeAttrs, name: &str) -> Result<Option<(Vec<String>, Vec<f64>, Vec<f64>)>> {
    for ms in &doc.multiscales {
        if let Some(level) = ms.datasets.iter().find(|d| node_name(&d.path) == name) {
            let (scale, translation) = ome::compose_transforms(ms, level)?;
            let dims = ms.axes.iter().map(|a| a.name.clone()).collect();
            return Ok(Some((dims, scale, translation)));
        }
    }
    Ok(None)
}

/// Wraps the array at `node`, looking for its multiscale metadata in its ancestors.
pub fn read_array(backend: &dyn Backend, node: &str) -> Result<CoordArray> {
    let name = node_name(node).to_string();
    let info = backend.array_info(node)?;
    let mut group = parent_node(node);
    while let Some(current) = group {
        if backend.kind(&current)?.is_none() {
            group = parent_node(&current);
            continue;
        }
        let group_attrs = backend.attributes(&current)?;
        if group_attrs.contains_key(attrs::MULTISCALES) {
            let doc = attrs::multiscales(&group_attrs)?;
            if let Some((dims, scale, translation)) = match_level(&doc, &name)? {
                if dims.len() != info.shape.len() {
                    return Err(Error::Config(format!(
                        "{} has {} dimensions but its metadata names {} axes",
                        node,
                        info.shape.len(),
                        dims.len()
                    )));
                }
                let coords = coordinates(&info.shape, &scale, &translation);
                return Ok(CoordArray {
                    name,
                    location: Location {
                        format: backend.format(),
                        root: backend.root().to_path_buf(),
                        node: node.to_string(),
                    },
                    shape: info.shape,
                    chunks: info.chunks,
                    dims,
                    scale,
                    translation,
                    coords,
                    attrs: backend.attributes(node)?,
                });
            }
        }
        group = parent_node(&current);
    }
    Err(Error::MetadataNotFound(node.to_string()))
}

/// A group as a tree: sub-groups become sub-trees, arrays become leaves.
pub fn read_tree(backend: &dyn Backend, node: &str) -> Result<DataTree> {
    let mut children = BTreeMap::new();
    for child in backend.children(node)? {
        let child_node = storage::join_node(node, &child);
        children.insert(child, read_node(backend, &child_node)?);
    }
    Ok(DataTree {
        name: node_name(node).to_string(),
        attrs: backend.attributes(node)?,
        children,
    })
}

pub fn read_node(backend: &dyn Backend, node: &str) -> Result<DataNode> {
    match backend.kind(node)? {
        Some(NodeKind::Array) => Ok(DataNode::Array(read_array(backend, node)?)),
        Some(NodeKind::Group) => Ok(DataNode::Tree(read_tree(backend, node)?)),
        None => Err(Error::NotFound(backend.root().join(node.trim_start_matches('/')))),
    }
}

fn read_as(path: &Path, format: Format) -> Result<DataNode> {
    let location = Location::probe(path)?;
    if location.format != format {
        return Err(Error::ForeignFormat { path: path.to_path_buf(), format: location.format });
    }
    let backend = storage::open_location(&location)?;
    read_node(backend.as_ref(), &location.node)
}

pub fn read_zarr(path: &Path) -> Result<DataNode> { read_as(path, Format::Zarr) }

pub fn read_hdf5(path: &Path) -> Result<DataNode> { read_as(path, Format::Hdf5) }

/// Reads `path` as zarr, falling back to HDF5 when the data turns out to live in an HDF5 file.
pub fn read_any(path: &Path) -> Result<DataNode> {
    match read_zarr(path) {
        Err(Error::ForeignFormat { format: Format::Hdf5, .. }) => read_hdf5(path),
        other => other,
    }
}

/// Like [`read_any`] but the path has to point to an array.
pub fn read_any_array(path: &Path) -> Result<CoordArray> {
    match read_any(path)? {
        DataNode::Array(a) => Ok(a),
        DataNode::Tree(_) => Err(Error::Storage(format!("{} is a group, expected an array", path.display()))),
    }
}

/// Name of the level of the group at `node` that has exactly `scale`.
pub fn scale_level_of(backend: &dyn Backend, node: &str, scale: &[f64]) -> Result<String> {
    ome::find_level_by_scale(&backend.multiscales(node)?, scale)
}
