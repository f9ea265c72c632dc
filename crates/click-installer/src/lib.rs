//! Installing click packages into the overlay layer of a [`click_db::ClickDb`].

mod frameworks;
mod install;
mod unpack;

pub use frameworks::{list_frameworks, validate_framework, Framework};
pub use install::{ClickInstaller, InstallOutcome, RegistrationTarget};
pub use unpack::{seed_admin_dir, DpkgUnpacker, UnpackRequest, Unpacker};
