//! The currently loaded model, if any.
//!
//! Lives inside the run loop's worker and is only mutated by the load/unload
//! transitions, so it needs no lock of its own.

use std::path::{Path, PathBuf};

use llama_engine::{ContextHandle, ModelHandle};

/// Model and context handles created by one successful `load`.
#[derive(Debug)]
pub(crate) struct LoadedModel {
    pub model: ModelHandle,
    pub context: ContextHandle,
    pub path: PathBuf,
    /// Distinguishes this load from any earlier or later one.
    pub epoch: u64,
}

#[derive(Debug, Default)]
pub(crate) enum ResourceState {
    #[default]
    Empty,
    Loaded(LoadedModel),
}

impl ResourceState {
    pub fn loaded(&self) -> Option<&LoadedModel> {
        match self {
            ResourceState::Loaded(loaded) => Some(loaded),
            ResourceState::Empty => None,
        }
    }

    /// The loaded model if it is still the one with `epoch`.
    pub fn loaded_at(&self, epoch: u64) -> Option<&LoadedModel> {
        self.loaded().filter(|l| l.epoch == epoch)
    }

    pub fn path(&self) -> Option<&Path> {
        self.loaded().map(|l| l.path.as_path())
    }

    /// Move out the loaded handles, leaving `Empty`.
    pub fn take(&mut self) -> Option<LoadedModel> {
        match std::mem::take(self) {
            ResourceState::Loaded(loaded) => Some(loaded),
            ResourceState::Empty => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(epoch: u64) -> ResourceState {
        ResourceState::Loaded(LoadedModel {
            model: ModelHandle::from_raw(1).unwrap(),
            context: ContextHandle::from_raw(2).unwrap(),
            path: PathBuf::from("/models/a.gguf"),
            epoch,
        })
    }

    #[test]
    fn empty_has_nothing() {
        let state = ResourceState::default();
        assert!(state.loaded().is_none());
        assert!(state.path().is_none());
    }

    #[test]
    fn epoch_must_match() {
        let state = loaded(3);
        assert!(state.loaded_at(3).is_some());
        assert!(state.loaded_at(2).is_none());
        assert_eq!(state.path(), Some(Path::new("/models/a.gguf")));
    }

    #[test]
    fn take_leaves_empty() {
        let mut state = loaded(1);
        let taken = state.take().unwrap();
        assert_eq!(taken.context.as_raw(), 2);
        assert!(state.loaded().is_none());
        assert!(state.take().is_none());
    }
}
