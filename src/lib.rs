//! Backend-agnostic virtual machine lifecycle management over libvirt,
//! raw QEMU and VirtualBox tooling.

pub mod config;
pub mod handlers;
pub mod mcp;
pub mod utils;
pub mod vm;
