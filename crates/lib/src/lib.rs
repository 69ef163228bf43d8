//! # Boot slot management
//!
//! This crate installs an operating system into one of two boot slots on a
//! disk, switches the bootloader to it, and reverts to the previous slot
//! when an upgraded system fails to confirm that it booted.

mod board;
mod bootloader;
pub mod cli;
mod constants;
mod disk;
mod install;
mod kernel_cmdline;
mod parsers;
mod platform;
mod revert;
mod tagstore;
