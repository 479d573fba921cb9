//! Step implementations for the resources deckhand manages
//!
//! Each module wraps one manifest section as a [`converge::Step`]. Steps
//! detect state locally where possible (dpkg-query, stat, systemctl show)
//! and route mutations through the privilege provider when the executor
//! hands them one.

pub mod app_tree;
pub mod apt_package;
pub mod directory;
pub mod file;
pub mod nginx_site;
pub mod python_venv;
pub mod service;
pub mod symlink;
pub mod systemd_unit;

pub use app_tree::AppTree;
pub use apt_package::{AptCacheRefresh, AptPackage};
pub use directory::Directory;
pub use file::ManagedFile;
pub use nginx_site::NginxSite;
pub use python_venv::PythonVenv;
pub use service::Service;
pub use symlink::Symlink;
pub use systemd_unit::SystemdUnit;
