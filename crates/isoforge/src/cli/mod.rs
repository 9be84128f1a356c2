//! CLI definitions and the top-level edit-and-finalize driver.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use color_eyre::eyre::{Result, bail};

use isoforge_common::IsoforgeResult;

use crate::actions::{self, ActionCall};
use crate::workspace::{Destination, Outcome, Workspace};

/// Isoforge - Live ISO Editor
#[derive(Parser)]
#[command(name = "isoforge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Source image (.iso) or an already mounted directory
    pub source: PathBuf,

    /// Destination image path, an existing directory, or /dev/null to
    /// discard the output
    pub dest: PathBuf,

    /// Load the action list from a YAML file
    #[arg(long, env = "ISOFORGE_ACTION_YAML")]
    pub action_yaml: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Inline actions, e.g. `--cp grub.cfg boot/grub/grub.cfg --setup-rootfs`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub actions: Vec<String>,
}

impl Cli {
    /// Execute the whole edit sequence with guaranteed teardown.
    pub fn execute(self) -> Result<()> {
        let already_mounted = self.source.is_dir();

        let calls = if let Some(yaml) = &self.action_yaml {
            if !self.actions.is_empty() {
                bail!("--action-yaml cannot be combined with inline actions");
            }
            actions::load_yaml(yaml)?
        } else {
            actions::parse_args(&self.actions)?
        };

        let (destination, replaces) =
            classify_destination(&self.source, &self.dest, already_mounted);

        let mut ws = Workspace::new(&self.source)?;
        let result = edit(&mut ws, already_mounted, &calls, &destination);

        // Teardown runs on every exit path; an edit failure is the one
        // reported, but a teardown failure is never silent.
        let teardown = ws.teardown();
        if let (Err(e), Err(_)) = (&teardown, &result) {
            tracing::error!(error = %e, "teardown failed after an earlier error");
        }
        let outcome = result?;
        teardown?;

        match outcome {
            Outcome::Unchanged => println!("No changes, destination untouched"),
            Outcome::Discarded => println!("Edits validated, output discarded"),
            Outcome::DeferredCopy => println!("Wrote {}", self.dest.display()),
            Outcome::Repacked => {
                if let (Destination::Image(staged), Some(original)) = (&destination, &replaces) {
                    fs::rename(staged, original)?;
                }
                println!("Wrote {}", self.dest.display());
            }
        }

        Ok(())
    }
}

/// Mount the source, apply every action in order, and finalize.
fn edit(
    ws: &mut Workspace,
    already_mounted: bool,
    calls: &[ActionCall],
    destination: &Destination,
) -> IsoforgeResult<Outcome> {
    ws.mount_source(already_mounted)?;
    for call in calls {
        call.apply(ws)?;
    }
    ws.finalize(destination)
}

/// Decide the output mode from the raw destination path.
///
/// Editing an image in place goes through a staged `.new` path that
/// replaces the source only after a successful repack, so a failure
/// never leaves a half-written image where the source was.
fn classify_destination(
    source: &Path,
    dest: &Path,
    already_mounted: bool,
) -> (Destination, Option<PathBuf>) {
    if dest == Path::new("/dev/null") {
        (Destination::Discard, None)
    } else if dest.is_dir() {
        (Destination::Directory(dest.to_path_buf()), None)
    } else if dest == source && !already_mounted {
        let staged = PathBuf::from(format!("{}.new", dest.display()));
        (Destination::Image(staged), Some(dest.to_path_buf()))
    } else {
        (Destination::Image(dest.to_path_buf()), None)
    }
}
