mod densemap;
pub mod deps;
pub mod envstore;
pub mod graph;
pub mod progress;
pub mod run;
pub mod task;
pub mod version;
pub mod work;

#[cfg(not(any(windows, target_arch = "wasm32")))]
use jemallocator::Jemalloc;

#[cfg(not(any(windows, target_arch = "wasm32")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
