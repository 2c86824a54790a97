//! gridview binary entry: parse flags, bring the context up, run, tear down.

mod signal;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use gridview::app::AppContext;
use gridview::config::AppConfig;
use gridview::error::LifecycleError;
use gridview::frontend::HeadlessFrontend;
use gridview::voice::NullVoiceClient;

fn main() -> ExitCode {
    let config = AppConfig::parse();
    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(lifecycle) = err.downcast_ref::<LifecycleError>() {
                match lifecycle {
                    LifecycleError::SecondInstance { pid } => {
                        eprintln!(
                            "gridview is already running (pid {pid}); \
                             pass --allow-multiple-instances to start anyway"
                        );
                        return ExitCode::from(2);
                    }
                    LifecycleError::PreviousCrashDeclined => {
                        return ExitCode::from(3);
                    }
                    _ => {}
                }
            }
            eprintln!("gridview: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: AppConfig) -> anyhow::Result<()> {
    signal::install();

    // No display layer or voice backend is wired into this build; the
    // context runs headless against the transport channels.
    let (mut context, _channels) = AppContext::new(
        config,
        Box::new(HeadlessFrontend::new()),
        Box::new(NullVoiceClient),
    )
    .context("construct application context")?;

    context.init().context("viewer startup failed")?;
    context.set_quit_signal(Box::new(signal::exit_requested));
    context.notify_startup_complete();
    context.main_loop().context("main loop failed")?;
    context.cleanup();
    Ok(())
}
