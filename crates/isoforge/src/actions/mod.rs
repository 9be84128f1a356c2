//! Editing actions applied against a workspace.
//!
//! Actions are the pluggable edit operations the CLI sequences over a
//! mounted image. Each one calls back into the public [`Workspace`]
//! operations; the orchestration core never interprets what an action
//! does.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use isoforge_common::{IsoforgeError, IsoforgeResult};

use crate::workspace::Workspace;

/// One editing action, as parsed from the command line or loaded from
/// a YAML action list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum ActionCall {
    /// Copy a host file into the image tree.
    Cp {
        /// Host path to copy from.
        source: PathBuf,
        /// Path inside the image, relative to the image root.
        dest: PathBuf,
    },
    /// Remove a path from the image tree.
    Rm {
        /// Path inside the image, relative to the image root.
        path: PathBuf,
    },
    /// Mount the root filesystem module for editing.
    SetupRootfs {
        /// Skip the pseudo-filesystem bundle on the mounted tree.
        #[serde(default)]
        no_system_mounts: bool,
    },
}

impl ActionCall {
    /// Apply this action to the workspace.
    pub fn apply(&self, ws: &mut Workspace) -> IsoforgeResult<()> {
        match self {
            Self::Cp { source, dest } => {
                let target = ws.image_tree()?.join(image_relative(dest)?);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(source, &target)?;
                tracing::info!(
                    source = %source.display(),
                    dest = %dest.display(),
                    "copied file into image"
                );
                Ok(())
            }
            Self::Rm { path } => {
                let target = ws.image_tree()?.join(image_relative(path)?);
                if target.is_dir() {
                    fs::remove_dir_all(&target)?;
                } else {
                    fs::remove_file(&target)?;
                }
                tracing::info!(path = %path.display(), "removed path from image");
                Ok(())
            }
            Self::SetupRootfs { no_system_mounts } => {
                let tree = ws.edit_subfilesystem("rootfs", !no_system_mounts)?;
                tracing::info!(tree = %tree.display(), "rootfs ready for editing");
                Ok(())
            }
        }
    }
}

/// Load an action list from a YAML file.
pub fn load_yaml(path: &Path) -> IsoforgeResult<Vec<ActionCall>> {
    let content = fs::read_to_string(path)?;
    serde_yaml::from_str(&content).map_err(|e| IsoforgeError::Config {
        message: format!("invalid action list {}: {}", path.display(), e),
    })
}

/// Parse actions from trailing command-line arguments.
///
/// Each action starts with a `--name` flag followed by its positional
/// arguments, e.g. `--cp grub.cfg boot/grub/grub.cfg --setup-rootfs`.
pub fn parse_args(args: &[String]) -> IsoforgeResult<Vec<ActionCall>> {
    let mut calls = Vec::new();
    let mut iter = args.iter().peekable();

    while let Some(flag) = iter.next() {
        let Some(name) = flag.strip_prefix("--") else {
            return Err(IsoforgeError::Action {
                message: format!("expected an --action flag, got {:?}", flag),
            });
        };

        let mut positional = Vec::new();
        while let Some(next) = iter.peek() {
            if next.starts_with("--") {
                break;
            }
            positional.push(iter.next().cloned().unwrap_or_default());
        }

        calls.push(from_parts(name, &positional)?);
    }

    Ok(calls)
}

fn from_parts(name: &str, args: &[String]) -> IsoforgeResult<ActionCall> {
    match (name, args) {
        ("cp", [source, dest]) => Ok(ActionCall::Cp {
            source: source.into(),
            dest: dest.into(),
        }),
        ("rm", [path]) => Ok(ActionCall::Rm { path: path.into() }),
        ("setup-rootfs", []) => Ok(ActionCall::SetupRootfs {
            no_system_mounts: false,
        }),
        ("cp" | "rm" | "setup-rootfs", _) => Err(IsoforgeError::Action {
            message: format!("wrong number of arguments for --{}", name),
        }),
        _ => Err(IsoforgeError::Action {
            message: format!("unknown action --{}", name),
        }),
    }
}

/// Reject absolute paths: actions address the image tree relative to
/// its root.
fn image_relative(path: &Path) -> IsoforgeResult<&Path> {
    if path.is_absolute() {
        return Err(IsoforgeError::Action {
            message: format!("image paths must be relative: {}", path.display()),
        });
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn parse_inline_actions() {
        let args = strings(&[
            "--cp",
            "grub.cfg",
            "boot/grub/grub.cfg",
            "--setup-rootfs",
            "--rm",
            "casper/filesystem.manifest",
        ]);
        let calls = parse_args(&args).unwrap();
        assert_eq!(
            calls,
            vec![
                ActionCall::Cp {
                    source: "grub.cfg".into(),
                    dest: "boot/grub/grub.cfg".into(),
                },
                ActionCall::SetupRootfs {
                    no_system_mounts: false,
                },
                ActionCall::Rm {
                    path: "casper/filesystem.manifest".into(),
                },
            ]
        );
    }

    #[test]
    fn parse_rejects_unknown_and_malformed_actions() {
        assert!(matches!(
            parse_args(&strings(&["--frobnicate"])),
            Err(IsoforgeError::Action { .. })
        ));
        assert!(matches!(
            parse_args(&strings(&["--cp", "only-one-arg"])),
            Err(IsoforgeError::Action { .. })
        ));
        assert!(matches!(
            parse_args(&strings(&["not-a-flag"])),
            Err(IsoforgeError::Action { .. })
        ));
        assert!(parse_args(&[]).unwrap().is_empty());
    }

    #[test]
    fn yaml_action_list_deserializes() {
        let yaml = r#"
- name: cp
  source: ./grub.cfg
  dest: boot/grub/grub.cfg
- name: setup-rootfs
  no_system_mounts: true
- name: rm
  path: casper/extras
"#;
        let calls: Vec<ActionCall> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(
            calls[1],
            ActionCall::SetupRootfs {
                no_system_mounts: true,
            }
        );
    }

    #[test]
    fn absolute_image_paths_are_rejected() {
        assert!(image_relative(Path::new("boot/grub.cfg")).is_ok());
        assert!(matches!(
            image_relative(Path::new("/boot/grub.cfg")),
            Err(IsoforgeError::Action { .. })
        ));
    }
}
