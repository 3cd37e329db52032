pub mod checksum;
pub mod net;
pub mod size;
pub mod template;
pub mod vm_metadata;

pub use template::TemplateEngine;
pub use vm_metadata::VmMetadata;
