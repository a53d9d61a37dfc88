//! Version subcommand implementation

pub fn run() {
    println!("porthole v{}", env!("CARGO_PKG_VERSION"));
}
