use env_logger::{Builder, Env, Target};
use log::LevelFilter;
use std::io::Write;

/// Logs to stderr so JSON printed on stdout stays parseable.
pub fn init_logger() {
    let mut builder = Builder::from_env(Env::default().default_filter_or("sketch_loop=info"));
    builder.target(Target::Stderr);
    builder.filter_module("tokio", LevelFilter::Warn);
    builder.format(|buf, record| {
        let module_path = record.module_path().unwrap_or("<unknown>");
        writeln!(
            buf,
            "[{}][{}][{}] {}",
            buf.timestamp_seconds(),
            record.level(),
            module_path,
            record.args()
        )
    });
    let _ = builder.try_init();
}
