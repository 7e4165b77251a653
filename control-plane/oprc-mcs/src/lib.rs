pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;
pub mod endpoints;
pub mod runtime;
pub mod selector;
pub mod source;

use tracing_subscriber::{
    EnvFilter, filter::LevelFilter, layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub fn init_tracing(default_env: &str) {
    let filter = EnvFilter::builder()
        .with_env_var("RUST_LOG")
        .from_env_lossy()
        .add_directive(
            default_env
                .parse()
                .unwrap_or_else(|_| LevelFilter::INFO.into()),
        );

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init();
}
