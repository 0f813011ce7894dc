use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;

/// Initialize the process logger. Base filter can be overridden through
/// the RUST_LOG environment variable.
pub fn init_logger() {
    let env = Env::default().filter_or("RUST_LOG", "warn,narravox=info");

    let mut builder = Builder::from_env(env);

    builder
        .filter_module("hyper", LevelFilter::Error)
        .filter_module("reqwest", LevelFilter::Warn)
        .filter_module("mio", LevelFilter::Error)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Stderr)
        .init();
}
