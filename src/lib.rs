//! Installs and upgrades modpacks into a game directory, tracking what each
//! install wrote so the next one can tell pack files from local edits.

pub mod archive;
pub mod cancel;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod digest;
pub mod fetch;
pub mod ledger;
pub mod loader;
pub mod manifest;
pub mod native;
pub mod reconcile;
