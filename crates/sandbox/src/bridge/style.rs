//! Computed-style collaborator consumed by `Style(...)`

use crate::error::BridgeError;

/// Answers computed-style lookups for the page
pub trait StyleProvider: Send + Sync {
    /// Value of `property` for the single element matching `selector`
    fn query(&self, selector: &str, property: &str) -> Result<String, BridgeError>;
}

/// Provider without any styles; every lookup is empty
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStyles;

impl StyleProvider for NoStyles {
    fn query(&self, _selector: &str, _property: &str) -> Result<String, BridgeError> {
        Ok(String::new())
    }
}
