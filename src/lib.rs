pub mod dep;
pub mod dynlist;
pub mod error;
pub mod name;
pub mod parse;
pub mod progress;
pub mod rule;
mod scanner;
mod signal;
mod task;
mod terminal;
pub mod tokenize;
pub mod run;
pub mod work;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
