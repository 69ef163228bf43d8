//! Parsers for bootloader configuration files.

pub(crate) mod grub_menuconfig;
