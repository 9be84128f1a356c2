//! The editing workspace.
//!
//! This module owns the whole edit session for one image: a private
//! scratch directory tree, a LIFO stack of live mounts, lazily created
//! squashfs edit sessions, the pre-repack hook sequencer, and the
//! top-level union layer over the source image.
//!
//! Control flow is [`Workspace::mount_source`], any number of
//! [`Workspace::edit_subfilesystem`] calls (driven by editing actions),
//! [`Workspace::finalize`], and an unconditional
//! [`Workspace::teardown`] that must run on every exit path.

mod hooks;
mod mounts;
mod overlay;
mod repack;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use isoforge_common::{IsoforgeError, IsoforgeResult};

pub use hooks::{Hook, HookSequencer};
pub use mounts::MountHandle;
pub use overlay::{Lower, UnionLayer};

/// Directory inside the image that holds squashfs modules.
const SQUASH_DIR: &str = "casper";

/// Pseudo-filesystems bind-mounted into a module tree for chroot-like
/// operations, in dependency order: device nodes come before the
/// pseudo-terminal subtree nested under them.
const SYSTEM_MOUNTS: &[(&str, &str)] = &[
    ("devtmpfs", "dev"),
    ("devpts", "dev/pts"),
    ("proc", "proc"),
    ("sysfs", "sys"),
    ("securityfs", "sys/kernel/security"),
];

/// Where the final artifact goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Author a packed image at this path.
    Image(PathBuf),
    /// Materialize the merged tree into this existing directory.
    Directory(PathBuf),
    /// Exercise the edits but produce no output.
    Discard,
}

/// What finalize decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing was modified; no output was produced.
    Unchanged,
    /// A packed image was written to the destination.
    Repacked,
    /// A directory copy was recorded, to be performed during teardown
    /// once every mount has been released.
    DeferredCopy,
    /// Output was discarded on request.
    Discarded,
}

/// The top-level orchestrator for one image edit session.
pub struct Workspace {
    source: PathBuf,
    scratch: PathBuf,
    mount_stack: Vec<PathBuf>,
    squash_mounts: HashMap<String, MountHandle>,
    module_cache: HashMap<String, PathBuf>,
    hooks: HookSequencer,
    image_overlay: Option<UnionLayer>,
    copy_on_teardown: Option<PathBuf>,
    torn_down: bool,
}

impl Workspace {
    /// Create a workspace for editing `source`, allocating a private
    /// scratch directory tree.
    pub fn new(source: impl Into<PathBuf>) -> IsoforgeResult<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("isoforge-")
            .tempdir()?
            .into_path();
        fs::create_dir(scratch.join(".tmp"))?;

        tracing::debug!(scratch = %scratch.display(), "Workspace created");

        Ok(Self {
            source: source.into(),
            scratch,
            mount_stack: Vec::new(),
            squash_mounts: HashMap::new(),
            module_cache: HashMap::new(),
            hooks: HookSequencer::default(),
            image_overlay: None,
            copy_on_teardown: None,
            torn_down: false,
        })
    }

    /// The source image (or directory) this workspace edits.
    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Allocate a fresh directory under scratch space, world-readable
    /// so it can serve as a mountpoint or overlay upper area.
    pub fn tmpdir(&self) -> IsoforgeResult<PathBuf> {
        let dir = tempfile::Builder::new()
            .tempdir_in(self.scratch.join(".tmp"))?
            .into_path();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
        Ok(dir)
    }

    /// Allocate a fresh file under scratch space, for use by actions.
    pub fn tmpfile(&self) -> IsoforgeResult<PathBuf> {
        let (_, path) = tempfile::Builder::new()
            .tempfile_in(self.scratch.join(".tmp"))?
            .keep()
            .map_err(|e| e.error)?;
        Ok(path)
    }

    /// Mount a filesystem and append it to the mount stack.
    ///
    /// If `target` is omitted, a fresh scratch directory is allocated
    /// as the mountpoint.
    pub fn mount(
        &mut self,
        fstype: Option<&str>,
        source: &Path,
        target: Option<PathBuf>,
        options: Option<&str>,
    ) -> IsoforgeResult<MountHandle> {
        let target = match target {
            Some(target) => target,
            None => self.tmpdir()?,
        };
        if !target.is_dir() {
            fs::create_dir_all(&target)?;
        }

        mounts::mount_cmd(fstype, source, options, &target)?;
        self.mount_stack.push(target.clone());

        Ok(MountHandle::new(source, target))
    }

    /// Unmount `mountpoint` and remove it from the mount stack.
    ///
    /// Unmounting something that is not on the stack is a programming
    /// error.
    pub fn unmount(&mut self, mountpoint: &Path) -> IsoforgeResult<()> {
        let index = self
            .mount_stack
            .iter()
            .position(|entry| entry == mountpoint)
            .ok_or_else(|| IsoforgeError::Invariant {
                message: format!(
                    "unmount of {} which is not on the mount stack",
                    mountpoint.display()
                ),
            })?;
        self.mount_stack.remove(index);

        mounts::unmount_cmd(mountpoint)
    }

    /// Build a union layer over `lowers`, mounted at `mountpoint` (or a
    /// fresh scratch directory if omitted).
    ///
    /// Fresh private upper and work areas are allocated in scratch
    /// space; the lower search string is the recursively flattened,
    /// reversed expansion of `lowers`.
    pub fn add_overlay(
        &mut self,
        lowers: impl Into<Lower>,
        mountpoint: Option<PathBuf>,
    ) -> IsoforgeResult<UnionLayer> {
        let lowers = lowers.into().into_stack();
        let upper = self.tmpdir()?;
        let work = self.tmpdir()?;

        let lowerdir = overlay::lowerdir_for(&Lower::Stack(lowers.clone()));
        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lowerdir,
            upper.display(),
            work.display()
        );

        let handle = self.mount(Some("overlay"), Path::new("overlay"), mountpoint, Some(&options))?;

        Ok(UnionLayer {
            lowers,
            upper,
            mountpoint: handle.mountpoint().to_path_buf(),
        })
    }

    /// Register a hook to run at finalize time, after all previously
    /// registered hooks in reverse order.
    pub fn add_pre_repack_hook(&mut self, hook: Hook) {
        self.hooks.push(hook);
    }

    /// Establish the pseudo-filesystem bundle under `mountpoint` so
    /// that chroot-like operations (package installation and the like)
    /// work against the tree, and swap in the host's DNS resolver
    /// configuration so they can resolve names.
    ///
    /// Registers a single hook that unmounts the bundle in reverse
    /// order and restores the original resolver configuration. The
    /// hook runs before the repack hook of the filesystem containing
    /// `mountpoint`, so no transient device or proc entries are
    /// captured in packed output.
    pub fn add_system_mounts(&mut self, mountpoint: &Path) -> IsoforgeResult<()> {
        let mut mounted = Vec::new();
        for (fstype, relpath) in SYSTEM_MOUNTS {
            let handle = self.mount(
                Some(fstype),
                Path::new(fstype),
                Some(mountpoint.join(relpath)),
                None,
            )?;
            mounted.push(handle.mountpoint().to_path_buf());
        }

        let resolv = mountpoint.join("etc/resolv.conf");
        let saved = mountpoint.join("etc/resolv.conf.orig");
        fs::rename(&resolv, &saved)?;
        fs::copy("/etc/resolv.conf", &resolv)?;

        self.add_pre_repack_hook(Box::new(move |ws| {
            for mountpoint in mounted.iter().rev() {
                ws.unmount(mountpoint)?;
            }
            fs::rename(&saved, &resolv)?;
            Ok(())
        }));

        Ok(())
    }

    /// Mount the source image read-only and build the top-level union
    /// layer over it.
    ///
    /// With `already_mounted`, the source is an existing directory: it
    /// is linked into scratch space instead of loop-mounted, and no
    /// entry is pushed onto the mount stack for it.
    pub fn mount_source(&mut self, already_mounted: bool) -> IsoforgeResult<()> {
        if self.image_overlay.is_some() {
            return Err(IsoforgeError::Invariant {
                message: "source image mounted twice".to_string(),
            });
        }

        let iso_dir = self.scratch.join("old/iso");
        let handle = if already_mounted {
            fs::create_dir_all(self.scratch.join("old"))?;
            std::os::unix::fs::symlink(&self.source, &iso_dir)?;
            MountHandle::new(&self.source, &iso_dir)
        } else {
            let source = self.source.clone();
            self.mount(Some("iso9660"), &source, Some(iso_dir), Some("loop,ro"))?
        };

        let merged = self.scratch.join("new/iso");
        let layer = self.add_overlay(handle, Some(merged))?;
        tracing::info!(tree = %layer.mountpoint.display(), "source image mounted for editing");
        self.image_overlay = Some(layer);

        Ok(())
    }

    /// The merged, writable view of the whole image.
    pub fn image_tree(&self) -> IsoforgeResult<&Path> {
        self.image_overlay
            .as_ref()
            .map(|layer| layer.mountpoint.as_path())
            .ok_or_else(|| IsoforgeError::Invariant {
                message: "image tree requested before mount_source".to_string(),
            })
    }

    /// Mount the named squashfs module read-only, memoized per name:
    /// the same underlying image may back more than one edit session.
    pub fn mount_squash(&mut self, name: &str) -> IsoforgeResult<MountHandle> {
        if let Some(handle) = self.squash_mounts.get(name) {
            return Ok(handle.clone());
        }

        let squash = self
            .scratch
            .join(format!("old/iso/{}/{}.squashfs", SQUASH_DIR, name));
        let target = self.scratch.join("old").join(name);
        let handle = self.mount(Some("squashfs"), &squash, Some(target), Some("ro"))?;
        self.squash_mounts.insert(name.to_string(), handle.clone());

        Ok(handle)
    }

    /// Expose the named squashfs module as a writable tree.
    ///
    /// Idempotent: repeated calls for the same name return the same
    /// path with no new mount activity. The first call mounts the
    /// module read-only, builds a union layer over it, and registers a
    /// hook that repacks the module at finalize time only if its upper
    /// area saw changes. With `add_system_mounts`, the
    /// pseudo-filesystem bundle is established on the merged tree; its
    /// teardown hook is registered after the repack hook and therefore
    /// runs first.
    pub fn edit_subfilesystem(
        &mut self,
        name: &str,
        add_system_mounts: bool,
    ) -> IsoforgeResult<PathBuf> {
        if let Some(path) = self.module_cache.get(name) {
            return Ok(path.clone());
        }

        let lower = self.mount_squash(name)?;
        let target = self.scratch.join("new").join(name);
        let layer = self.add_overlay(lower, Some(target.clone()))?;
        tracing::info!(name, target = %target.display(), "squashfs module mounted for editing");

        let new_squash = self
            .scratch
            .join(format!("new/iso/{}/{}.squashfs", SQUASH_DIR, name));
        let module = name.to_string();
        let tree = target.clone();
        self.add_pre_repack_hook(Box::new(move |_ws| {
            remove_resolver_artifacts(&layer.upper)?;
            if layer.unchanged()? {
                tracing::info!(module = %module, "no changes found in squashfs module");
                return Ok(());
            }
            tracing::info!(module = %module, "repacking squashfs module");
            fs::remove_file(&new_squash)?;
            repack::mksquashfs(&tree, &new_squash)
        }));

        if add_system_mounts {
            self.add_system_mounts(&target)?;
        }

        self.module_cache.insert(name.to_string(), target.clone());
        Ok(target)
    }

    /// Target CPU architecture of the image, read from the disk info
    /// metadata file in the merged tree.
    pub fn architecture(&self) -> IsoforgeResult<String> {
        let info = self.scratch.join("new/iso/.disk/info");
        let content = fs::read_to_string(&info)?;
        parse_architecture(&content)
            .map(str::to_string)
            .ok_or_else(|| IsoforgeError::Config {
                message: format!("malformed disk info file: {}", info.display()),
            })
    }

    /// Run every registered hook in reverse registration order.
    fn run_hooks(&mut self) -> IsoforgeResult<()> {
        tracing::info!(count = self.hooks.len(), "running pre-repack hooks");
        for hook in self.hooks.take().into_iter().rev() {
            hook(self)?;
        }
        Ok(())
    }

    /// Run the pre-repack hooks and produce output for `destination`.
    ///
    /// If the top-level union layer saw no changes, no external tool
    /// is invoked and the destination is left untouched. Directory
    /// destinations defer the actual copy until teardown, when every
    /// mount has been released and the tree is stable. A discard
    /// destination skips the hooks entirely; the edits were only
    /// exercised for validation.
    pub fn finalize(&mut self, destination: &Destination) -> IsoforgeResult<Outcome> {
        match destination {
            Destination::Discard => {
                tracing::info!("discarding output");
                Ok(Outcome::Discarded)
            }
            Destination::Image(dest) => {
                self.run_hooks()?;
                if self.image_layer()?.unchanged()? {
                    tracing::info!("no changes, skipping repack");
                    return Ok(Outcome::Unchanged);
                }
                let options = repack::boot_catalog_options(&self.source)?;
                let tree = self.image_tree()?.to_path_buf();
                tracing::info!(dest = %dest.display(), "recreating image");
                repack::write_image(&options, &tree, dest)?;
                Ok(Outcome::Repacked)
            }
            Destination::Directory(dest) => {
                self.run_hooks()?;
                if self.image_layer()?.unchanged()? {
                    tracing::info!("no changes, skipping copy");
                    return Ok(Outcome::Unchanged);
                }
                tracing::info!(dest = %dest.display(), "deferring copy until mounts are released");
                self.copy_on_teardown = Some(dest.clone());
                Ok(Outcome::DeferredCopy)
            }
        }
    }

    /// Unwind every remaining mount in reverse order, perform the
    /// deferred directory copy if one was recorded, and delete the
    /// scratch tree.
    ///
    /// Must run exactly once per workspace, on every exit path
    /// including failures earlier in the edit sequence. Calling it
    /// twice is a programming error.
    pub fn teardown(&mut self) -> IsoforgeResult<()> {
        if self.torn_down {
            return Err(IsoforgeError::Invariant {
                message: "teardown called twice".to_string(),
            });
        }
        self.torn_down = true;

        let mounts: Vec<PathBuf> = self.mount_stack.drain(..).collect();
        for mountpoint in mounts.iter().rev() {
            mounts::unmount_recursive(mountpoint)?;
        }

        if let Some(dest) = self.copy_on_teardown.take() {
            tracing::info!(dest = %dest.display(), "copying merged tree to destination");
            repack::copy_tree(&self.scratch.join("new/iso"), &dest)?;
        }

        fs::remove_dir_all(&self.scratch)?;
        tracing::debug!("Workspace torn down");

        Ok(())
    }

    fn image_layer(&self) -> IsoforgeResult<&UnionLayer> {
        self.image_overlay
            .as_ref()
            .ok_or_else(|| IsoforgeError::Invariant {
                message: "finalize called before mount_source".to_string(),
            })
    }
}

/// Remove the resolver configuration the system-mounts bundle may have
/// left in a module's upper area, so it is not counted as a change.
///
/// Only a missing file is ignored; other removal failures (permission
/// denied and the like) propagate.
fn remove_resolver_artifacts(upper: &Path) -> IsoforgeResult<()> {
    match fs::remove_file(upper.join("etc/resolv.conf")) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    match fs::remove_dir(upper.join("etc")) {
        Ok(()) => Ok(()),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::DirectoryNotEmpty
            ) =>
        {
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Second-to-last whitespace-separated token of the disk info file.
fn parse_architecture(info: &str) -> Option<&str> {
    let tokens: Vec<&str> = info.split_whitespace().collect();
    if tokens.len() < 2 {
        return None;
    }
    Some(tokens[tokens.len() - 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn hooks_run_in_reverse_registration_order() {
        let mut ws = Workspace::new("/tmp/does-not-matter.iso").unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        for label in ["a", "b", "c"] {
            let order = Rc::clone(&order);
            ws.add_pre_repack_hook(Box::new(move |_| {
                order.borrow_mut().push(label);
                Ok(())
            }));
        }

        ws.run_hooks().unwrap();
        assert_eq!(*order.borrow(), vec!["c", "b", "a"]);
        assert!(ws.hooks.is_empty());

        ws.teardown().unwrap();
    }

    #[test]
    fn edit_subfilesystem_is_idempotent_per_name() {
        let mut ws = Workspace::new("/tmp/does-not-matter.iso").unwrap();
        let cached = PathBuf::from("/somewhere/new/rootfs");
        ws.module_cache.insert("rootfs".to_string(), cached.clone());

        // A cache hit must not attempt any mount.
        let path = ws.edit_subfilesystem("rootfs", true).unwrap();
        assert_eq!(path, cached);
        assert!(ws.mount_stack.is_empty());
        assert!(ws.hooks.is_empty());

        ws.teardown().unwrap();
    }

    #[test]
    fn teardown_removes_scratch_and_rejects_reentry() {
        let mut ws = Workspace::new("/tmp/does-not-matter.iso").unwrap();
        let scratch = ws.scratch.clone();
        assert!(scratch.is_dir());

        ws.teardown().unwrap();
        assert!(ws.mount_stack.is_empty());
        assert!(!scratch.exists());

        let err = ws.teardown().unwrap_err();
        assert!(matches!(err, IsoforgeError::Invariant { .. }));
    }

    #[test]
    fn teardown_performs_deferred_copy() {
        let mut ws = Workspace::new("/tmp/does-not-matter.iso").unwrap();
        let tree = ws.scratch.join("new/iso");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("marker.txt"), "edited").unwrap();

        let dest = tempfile::tempdir().unwrap();
        ws.copy_on_teardown = Some(dest.path().to_path_buf());
        ws.teardown().unwrap();

        assert_eq!(
            fs::read_to_string(dest.path().join("marker.txt")).unwrap(),
            "edited"
        );
    }

    #[test]
    fn unmount_off_stack_is_an_invariant_violation() {
        let mut ws = Workspace::new("/tmp/does-not-matter.iso").unwrap();
        let err = ws.unmount(Path::new("/not/mounted")).unwrap_err();
        assert!(matches!(err, IsoforgeError::Invariant { .. }));
        ws.teardown().unwrap();
    }

    #[test]
    fn image_tree_requires_mounted_source() {
        let mut ws = Workspace::new("/tmp/does-not-matter.iso").unwrap();
        assert!(matches!(
            ws.image_tree(),
            Err(IsoforgeError::Invariant { .. })
        ));
        ws.teardown().unwrap();
    }

    #[test]
    fn tmpdir_lives_under_scratch_and_is_world_readable() {
        let mut ws = Workspace::new("/tmp/does-not-matter.iso").unwrap();
        let dir = ws.tmpdir().unwrap();
        assert!(dir.starts_with(ws.scratch.join(".tmp")));
        let mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        ws.teardown().unwrap();
    }

    #[test]
    fn architecture_reads_disk_info() {
        let mut ws = Workspace::new("/tmp/does-not-matter.iso").unwrap();
        let disk = ws.scratch.join("new/iso/.disk");
        fs::create_dir_all(&disk).unwrap();
        fs::write(
            disk.join("info"),
            "Ubuntu-Server 22.04.1 LTS \"Jammy Jellyfish\" - Release amd64 (20220809)\n",
        )
        .unwrap();

        assert_eq!(ws.architecture().unwrap(), "amd64");
        ws.teardown().unwrap();
    }

    #[test]
    fn parse_architecture_picks_second_to_last_token() {
        assert_eq!(parse_architecture("Release amd64 (20220809)"), Some("amd64"));
        assert_eq!(parse_architecture("one two"), Some("one"));
        assert_eq!(parse_architecture("single"), None);
        assert_eq!(parse_architecture(""), None);
    }

    #[test]
    fn resolver_artifact_removal_ignores_missing_entries() {
        let upper = tempfile::tempdir().unwrap();
        remove_resolver_artifacts(upper.path()).unwrap();

        // A populated etc must survive apart from the resolver file.
        let etc = upper.path().join("etc");
        fs::create_dir(&etc).unwrap();
        fs::write(etc.join("resolv.conf"), "nameserver 1.1.1.1").unwrap();
        fs::write(etc.join("hostname"), "edited").unwrap();
        remove_resolver_artifacts(upper.path()).unwrap();
        assert!(!etc.join("resolv.conf").exists());
        assert!(etc.join("hostname").exists());

        // An etc left holding only the resolver file goes away whole.
        let upper = tempfile::tempdir().unwrap();
        let etc = upper.path().join("etc");
        fs::create_dir(&etc).unwrap();
        fs::write(etc.join("resolv.conf"), "nameserver 1.1.1.1").unwrap();
        remove_resolver_artifacts(upper.path()).unwrap();
        assert!(!etc.exists());
    }

    #[test]
    fn finalize_before_mount_source_is_an_invariant_violation() {
        let mut ws = Workspace::new("/tmp/does-not-matter.iso").unwrap();
        let err = ws
            .finalize(&Destination::Image(PathBuf::from("/tmp/out.iso")))
            .unwrap_err();
        assert!(matches!(err, IsoforgeError::Invariant { .. }));
        ws.teardown().unwrap();
    }

    #[test]
    fn discard_destination_skips_hooks() {
        let mut ws = Workspace::new("/tmp/does-not-matter.iso").unwrap();
        let ran = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&ran);
        ws.add_pre_repack_hook(Box::new(move |_| {
            *flag.borrow_mut() = true;
            Ok(())
        }));

        let outcome = ws.finalize(&Destination::Discard).unwrap();
        assert_eq!(outcome, Outcome::Discarded);
        assert!(!*ran.borrow());

        ws.teardown().unwrap();
    }
}
