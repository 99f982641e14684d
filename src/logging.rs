use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber. Logs go to stderr so stdout carries only
/// machine renderings. `RUST_LOG` wins over `verbose` when set.
pub fn init(verbose: bool) {
    let default = if verbose {
        "vbox_provision_lib=debug,vbox_provision=debug"
    } else {
        "vbox_provision_lib=info,vbox_provision=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
