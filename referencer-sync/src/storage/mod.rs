//! Persistent storage for workspaces.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐   mutations    ┌────────────────┐
//! │ ActionDispatcher │ ─────────────► │ WorkspaceStore │
//! └──────────────────┘                │ (RocksDB)      │
//! ┌──────────────────┐   snapshot     └───────┬────────┘
//! │ Session (sync)   │ ◄───────────────────── │
//! └──────────────────┘                        │ column families
//!                                             ▼
//!                    ┌─────────────────────────────────────────┐
//!                    │ workspaces / layers / layer_owners      │
//!                    │ highlights / arrows / underlines        │
//!                    │ editors (LZ4 content) / meta            │
//!                    └─────────────────────────────────────────┘
//! ```

pub mod model;
pub mod rocks;

pub use model::{
    AnnotationCounts, Arrow, ArrowEndpoint, Editor, Highlight, Layer, Underline, WorkspaceState,
    DEFAULT_ARROW_STYLE, DEFAULT_EDITOR_NAME, DEFAULT_HIGHLIGHT_TYPE,
};
pub use rocks::{StoreConfig, StoreError, WorkspaceStore};
