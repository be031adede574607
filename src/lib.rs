//! vdepot - a virtualized Perforce workspace service in Rust.
//!
//! Files in a developer's checkout start as lightweight placeholders:
//! sparse, reparse-tagged files whose payload records which depot content
//! they stand for. A kernel filter reports the first open of a
//! placeholder to the [`service::ServiceHost`], which hydrates the file
//! from the depot through a pooled [`depot::session::DepotSession`] and
//! strips the placeholder markers. The [`vsync`] engine installs
//! placeholders for whole filesets by consulting the server's sync
//! protocol. The kernel side is reached only through the
//! [`driver::DriverChannel`] seam; [`driver::loopback::LoopbackDriver`]
//! emulates it in process.

pub mod context;
pub mod depot;
pub mod driver;
pub mod fs;
pub mod logging;
pub mod placeholder;
pub mod resolver;
pub mod service;
pub mod settings;
pub mod tasks;
pub mod text;
pub mod vsync;
pub mod walker;
