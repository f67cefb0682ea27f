pub mod backend;
pub mod catalog;
pub mod commands;
pub mod compact;
pub mod compress;
pub mod config;
pub mod restore;
pub mod storage;
pub mod util;
pub mod volume;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
