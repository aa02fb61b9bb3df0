//! Phonebook directory
//!
//! A folder tree populated one folder at a time from endpoint search
//! replies, plus ad hoc searches keyed by correlation id.

pub mod config;
pub mod node;
pub mod tree;

pub use config::{DirectoryConfig, SearchCommandFn, SearchRequest};
pub use node::{Contact, ContactMethod, DirectoryNode, Folder, FolderRef, Partition, SearchResult};
pub use tree::{DirectoryEvent, DirectoryTree, SearchResults};
