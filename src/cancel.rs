use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::AtlasError;

/// Shared abort flag. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self, what: &str) -> Result<(), AtlasError> {
        if self.is_cancelled() {
            return Err(AtlasError::Cancelled(what.to_string()));
        }
        Ok(())
    }
}
