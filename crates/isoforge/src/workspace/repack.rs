//! External packing and image-authoring tool invocations.

use std::path::Path;
use std::process::Command;

use isoforge_common::{IsoforgeError, IsoforgeResult};

/// Volume label written into re-authored images.
const VOLUME_LABEL: &str = "Ubuntu custom";

/// Pack a directory tree into a squashfs image at `dest`.
pub(crate) fn mksquashfs(tree: &Path, dest: &Path) -> IsoforgeResult<()> {
    tracing::debug!(tree = %tree.display(), dest = %dest.display(), "Running mksquashfs");

    let status = Command::new("mksquashfs")
        .arg(tree)
        .arg(dest)
        .status()
        .map_err(|e| IsoforgeError::Repack {
            message: format!("failed to execute mksquashfs: {}", e),
        })?;

    if !status.success() {
        return Err(IsoforgeError::Repack {
            message: format!(
                "mksquashfs of {} failed with status: {}",
                tree.display(),
                status
            ),
        });
    }

    Ok(())
}

/// Query the source image for its boot-catalog parameters.
///
/// Asks `xorriso` to report the El Torito configuration of the source
/// image as `mkisofs` options, so the re-authored image boots the same
/// way the original did.
pub(crate) fn boot_catalog_options(source: &Path) -> IsoforgeResult<Vec<String>> {
    tracing::debug!(source = %source.display(), "Querying boot catalog parameters");

    let output = Command::new("xorriso")
        .arg("-indev")
        .arg(source)
        .args(["-report_el_torito", "as_mkisofs"])
        .output()
        .map_err(|e| IsoforgeError::Repack {
            message: format!("failed to execute xorriso: {}", e),
        })?;

    if !output.status.success() {
        return Err(IsoforgeError::Repack {
            message: format!(
                "xorriso -report_el_torito on {} failed with status: {}",
                source.display(),
                output.status
            ),
        });
    }

    Ok(split_options(&String::from_utf8_lossy(&output.stdout)))
}

/// Author a new image from the merged tree, reusing the boot-catalog
/// options reported for the original image.
pub(crate) fn write_image(options: &[String], tree: &Path, dest: &Path) -> IsoforgeResult<()> {
    tracing::debug!(dest = %dest.display(), "Running xorriso -as mkisofs");

    let status = Command::new("xorriso")
        .args(["-as", "mkisofs"])
        .args(options)
        .arg("-o")
        .arg(dest)
        .args(["-V", VOLUME_LABEL])
        .arg(tree)
        .status()
        .map_err(|e| IsoforgeError::Repack {
            message: format!("failed to execute xorriso: {}", e),
        })?;

    if !status.success() {
        return Err(IsoforgeError::Repack {
            message: format!(
                "xorriso -as mkisofs to {} failed with status: {}",
                dest.display(),
                status
            ),
        });
    }

    Ok(())
}

/// Recursive attribute-preserving copy of `tree` into `dest`.
pub(crate) fn copy_tree(tree: &Path, dest: &Path) -> IsoforgeResult<()> {
    tracing::debug!(tree = %tree.display(), dest = %dest.display(), "Copying tree");

    let status = Command::new("cp")
        .arg("-aT")
        .arg(tree)
        .arg(dest)
        .status()
        .map_err(|e| IsoforgeError::Repack {
            message: format!("failed to execute cp: {}", e),
        })?;

    if !status.success() {
        return Err(IsoforgeError::Repack {
            message: format!(
                "copy of {} to {} failed with status: {}",
                tree.display(),
                dest.display(),
                status
            ),
        });
    }

    Ok(())
}

/// Split a tool report into arguments, honoring shell-style single and
/// double quotes and backslash escapes. `xorriso` quotes values such
/// as volume IDs in its `as_mkisofs` report.
pub(crate) fn split_options(report: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    let mut chars = report.chars();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                        in_word = true;
                    }
                }
                c if c.is_whitespace() => {
                    if in_word {
                        args.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if in_word {
        args.push(current);
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_plain_options() {
        let report = "-b boot/grub/i386-pc/eltorito.img\n-no-emul-boot -boot-load-size 4\n";
        assert_eq!(
            split_options(report),
            vec![
                "-b",
                "boot/grub/i386-pc/eltorito.img",
                "-no-emul-boot",
                "-boot-load-size",
                "4"
            ]
        );
    }

    #[test]
    fn split_quoted_options() {
        let report = "-V 'Ubuntu-Server 22.04 LTS amd64'\n--grub2-mbr \"--interval:local_fs:0s-15s:zero_mbrpt:'image.iso'\"";
        assert_eq!(
            split_options(report),
            vec![
                "-V",
                "Ubuntu-Server 22.04 LTS amd64",
                "--grub2-mbr",
                "--interval:local_fs:0s-15s:zero_mbrpt:'image.iso'"
            ]
        );
    }

    #[test]
    fn split_handles_escapes_and_empty_input() {
        assert_eq!(split_options("a\\ b c"), vec!["a b", "c"]);
        assert!(split_options("").is_empty());
        assert!(split_options("   \n  ").is_empty());
    }

    #[test]
    fn split_adjacent_quotes_join_into_one_word() {
        assert_eq!(split_options("-V 'a'\"b\""), vec!["-V", "ab"]);
    }
}
