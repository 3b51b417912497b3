//! Incremental build execution core.
//!
//! Given a dependency graph of files and the commands that produce them
//! (constructed through [`graph::Graph`]), this crate computes which
//! commands must run to bring a set of targets up to date, schedules them
//! under parallelism and pool constraints, runs them as subprocesses, and
//! records timing and discovered-dependency metadata in append-only
//! journals.  [`work::Builder`] is the entry point.

pub mod canon;
pub mod clparser;
pub mod db;
pub mod densemap;
pub mod depfile;
pub mod dyndep;
pub mod fs;
pub mod graph;
pub mod plan;
pub mod process;
pub mod runner;
pub mod scan;
pub mod scanner;
pub mod signal;
pub mod smallmap;
pub mod status;
pub mod subprocess;
pub mod terminal;
#[cfg(test)]
mod testing;
pub mod trace;
pub mod work;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
