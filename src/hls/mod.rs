pub mod resolver;
pub mod rewriter;

pub use resolver::{ManifestKind, ManifestResolution, ManifestResolver, Variant};
