//! Pre-repack hook sequencing.

use isoforge_common::IsoforgeResult;

use super::Workspace;

/// A deferred teardown or repack action, run with exclusive access to
/// the workspace at finalize time.
pub type Hook = Box<dyn FnOnce(&mut Workspace) -> IsoforgeResult<()>>;

/// Ordered list of deferred actions registered incrementally during
/// setup.
///
/// Execution order is the exact reverse of registration order: the
/// last thing set up must be the first thing torn down. There is no
/// ordering key; position is the contract.
#[derive(Default)]
pub struct HookSequencer {
    entries: Vec<Hook>,
}

impl HookSequencer {
    /// Register a hook after all previously registered hooks.
    pub fn push(&mut self, hook: Hook) {
        self.entries.push(hook);
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no hooks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all hooks, in registration order. The caller is
    /// responsible for running them reversed.
    pub(crate) fn take(&mut self) -> Vec<Hook> {
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_empties_the_sequencer() {
        let mut hooks = HookSequencer::default();
        assert!(hooks.is_empty());

        hooks.push(Box::new(|_| Ok(())));
        hooks.push(Box::new(|_| Ok(())));
        assert_eq!(hooks.len(), 2);

        let taken = hooks.take();
        assert_eq!(taken.len(), 2);
        assert!(hooks.is_empty());
    }
}
