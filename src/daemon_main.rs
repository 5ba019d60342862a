use anyhow::Result;
use clap::Parser;
use workwatch::{
    daemon::{
        args::DaemonArgs,
        start_daemon, DaemonConfig,
    },
    probe::platform_probe,
    utils::{
        dir::create_application_default_path,
        logging::{enable_logging, DAEMON_PREFIX},
        runtime::single_thread_runtime,
    },
};

fn main() -> Result<()> {
    let args = DaemonArgs::parse();

    let app_dir = match &args.dir {
        Some(dir) => dir.clone(),
        None => create_application_default_path()?,
    };
    enable_logging(DAEMON_PREFIX, &app_dir, args.log, args.log_console)?;

    let probe = platform_probe()?;
    let config = DaemonConfig::from(&args);

    single_thread_runtime()?.block_on(start_daemon(app_dir, probe, config))
}
