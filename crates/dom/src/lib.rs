//! Synthetic DOM for the script sandbox
//!
//! A mutable HTML document that page scripts drive through the shim.
//!
//! ## Design
//!
//! - **Indices, not pointers**: the shim hands `NodeId`s to scripts and back
//! - **One node type**: fragments, text and elements share `DomNode`
//! - **Detached is normal**: scripts build subtrees before inserting them
//!
//! ## Data flow
//!
//! ```text
//! HTML → scraper (html5ever) → DomArena (owned) → Selector / Serializer
//!                                   ↓
//!                             NodeId (u32)
//! ```

pub mod arena;
pub mod error;
pub mod scripts;
pub mod selector;
pub mod serializer;
pub mod service;
pub mod types;
pub mod utils;

pub use arena::DomArena;
pub use error::{DomError, Result};
pub use scripts::PageScript;
pub use selector::Selector;
pub use serializer::DomSerializer;
pub use service::{DomService, DomServiceConfig};
pub use types::*;
