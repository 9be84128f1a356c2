//! Union layer composition.
//!
//! A union layer stacks a private writable upper area over one or more
//! read-only lower sources. Lower sources are described by the [`Lower`]
//! variant type and resolved recursively into the `lowerdir` search
//! string passed to the overlay mount.

use std::fs;
use std::path::{Path, PathBuf};

use isoforge_common::IsoforgeResult;

use super::mounts::MountHandle;

/// One lower source of a union layer.
///
/// A union layer may stack on top of plain paths, live mounts, other
/// union layers, or nested groups of any of these. Nesting another
/// union layer folds its own upper area in as an additional lower, so
/// editing a sub-filesystem inside the image and editing the top-level
/// image share one composition mechanism.
#[derive(Debug, Clone)]
pub enum Lower {
    /// A plain filesystem path.
    Path(PathBuf),
    /// A live mount; its mountpoint is used as the lower directory.
    Mount(MountHandle),
    /// Another union layer; expands to its lowers plus its upper area.
    Union(UnionLayer),
    /// An ordered group of lower sources, flattened recursively.
    Stack(Vec<Lower>),
}

impl Lower {
    /// Normalize into an ordered list of lowers.
    pub(crate) fn into_stack(self) -> Vec<Lower> {
        match self {
            Lower::Stack(lowers) => lowers,
            other => vec![other],
        }
    }
}

impl From<PathBuf> for Lower {
    fn from(path: PathBuf) -> Self {
        Lower::Path(path)
    }
}

impl From<&Path> for Lower {
    fn from(path: &Path) -> Self {
        Lower::Path(path.to_path_buf())
    }
}

impl From<MountHandle> for Lower {
    fn from(handle: MountHandle) -> Self {
        Lower::Mount(handle)
    }
}

impl From<UnionLayer> for Lower {
    fn from(layer: UnionLayer) -> Self {
        Lower::Union(layer)
    }
}

impl From<Vec<Lower>> for Lower {
    fn from(lowers: Vec<Lower>) -> Self {
        Lower::Stack(lowers)
    }
}

/// A live overlay mount: the original lower sources, the private
/// writable upper area, and the merged mountpoint.
///
/// `lowers` retains the caller-supplied values for traceability, not
/// the resolved `lowerdir` string.
#[derive(Debug, Clone)]
pub struct UnionLayer {
    /// Lower sources in layering order (first is the top-most lower).
    pub lowers: Vec<Lower>,
    /// Writable upper area; all edits land here.
    pub upper: PathBuf,
    /// Merged mountpoint presented to editors.
    pub mountpoint: PathBuf,
}

impl UnionLayer {
    /// True iff the upper area contains no entries.
    ///
    /// Recomputed on every call: editing actions mutate the upper area
    /// long after the layer is constructed, so the answer is never
    /// cached.
    pub fn unchanged(&self) -> IsoforgeResult<bool> {
        Ok(fs::read_dir(&self.upper)?.next().is_none())
    }
}

/// Resolve a lower source into the overlay `lowerdir` search string.
///
/// The effective search order is the reverse of the user-facing list,
/// so that layers added later take precedence over earlier ones. A
/// nested union layer contributes its own lowers plus its upper area.
pub(crate) fn lowerdir_for(lower: &Lower) -> String {
    match lower {
        Lower::Path(path) => path.display().to_string(),
        Lower::Mount(handle) => handle.mountpoint().display().to_string(),
        Lower::Union(layer) => {
            let mut expanded = layer.lowers.clone();
            expanded.push(Lower::Path(layer.upper.clone()));
            lowerdir_for(&Lower::Stack(expanded))
        }
        Lower::Stack(lowers) => lowers
            .iter()
            .map(lowerdir_for)
            .rev()
            .collect::<Vec<_>>()
            .join(":"),
    }
}
