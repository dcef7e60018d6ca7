//! `scantask version` command.

pub fn execute() {
    println!("scantask {}", env!("CARGO_PKG_VERSION"));
    println!("  core     {}", scantask_core::VERSION);
    println!("  runtime  {}", scantask_runtime::VERSION);
}
