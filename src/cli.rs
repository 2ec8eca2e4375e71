use std::{process::ExitCode, sync::Arc};
use tracing::{debug, info, warn};

use crate::{
    bootstrap::{Backend, BootstrapOptions, RunMode, ServiceBootstrap},
    config::{self, Action, EndpointPolicy},
    dispatcher::StopSignal,
    engine::NetBackend,
    log_sink,
};

pub fn execute() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let backend = NetBackend::new();
    let stop = backend.stop_signal();

    execute_with(&args, backend, BootstrapOptions::from_env(), |run_mode| {
        let Some(handler) = signal_handler(run_mode, stop) else {
            debug!("Parked run, SIGINT/SIGTERM keep their default action");
            return;
        };
        if let Err(e) = ctrlc::set_handler(handler) {
            warn!("Failed to install signal handler: {}", e);
        }
    })
}

/// Ctrl-C and SIGTERM end a blocking run through the dispatcher's stop
/// signal. A parked run never looks at that signal, so it gets no handler
/// and the default action terminates the process.
fn signal_handler(
    run_mode: RunMode,
    stop: Arc<StopSignal>,
) -> Option<impl Fn() + Send + 'static> {
    match run_mode {
        RunMode::Blocking => Some(move || stop.raise()),
        RunMode::Park => None,
    }
}

/// Everything `execute` does past collecting the process environment.
/// `install_signals` runs once logging is up, right before the service starts.
fn execute_with<B: Backend>(
    args: &[String],
    backend: B,
    options: BootstrapOptions,
    install_signals: impl FnOnce(RunMode),
) -> ExitCode {
    let cfg = match config::parse(args, EndpointPolicy::Multi) {
        Ok(Action::Help) => {
            print!("{}", config::help_text());
            return ExitCode::SUCCESS;
        }
        Ok(Action::Version) => {
            print!("{}", config::version_text());
            return ExitCode::SUCCESS;
        }
        Ok(Action::Run(cfg)) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("Run with --help to list the accepted options.");
            return ExitCode::FAILURE;
        }
    };

    let sink = log_sink::select(&cfg);
    // only the first call in a process installs the global subscriber
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_ansi(sink.is_terminal())
        .with_writer(sink.clone())
        .try_init();
    for reason in sink.fallbacks() {
        warn!("Log destination skipped: {}", reason);
    }
    info!("Logging to {}", sink.kind());

    install_signals(options.run_mode);

    let mut bootstrap = ServiceBootstrap::new(backend, options);
    let code = match bootstrap.run(&cfg) {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        // already logged by the bootstrap
        Err(_) => ExitCode::FAILURE,
    };
    debug!("Bootstrap finished in state {:?}", bootstrap.state());
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::Cell, thread, time::Duration};

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn run(raw: &[&str], backend: NetBackend) -> (ExitCode, Option<RunMode>) {
        let installed = Cell::new(None);
        let code = execute_with(&args(raw), backend, BootstrapOptions::default(), |mode| {
            installed.set(Some(mode))
        });
        (code, installed.get())
    }

    #[test]
    fn test_help_version_and_bad_options_exit_before_starting() {
        assert_eq!(run(&["--help"], NetBackend::new()), (ExitCode::SUCCESS, None));
        assert_eq!(run(&["--version"], NetBackend::new()), (ExitCode::SUCCESS, None));
        assert_eq!(
            run(&["--uri=unix:x", "--msg-buf-size=lots"], NetBackend::new()),
            (ExitCode::FAILURE, None)
        );
        assert_eq!(run(&[], NetBackend::new()), (ExitCode::FAILURE, None));
    }

    #[test]
    fn test_bind_failure_exits_with_failure() {
        let (code, installed) = run(&["--uri=bogus:endpoint"], NetBackend::new());
        assert_eq!(code, ExitCode::FAILURE);
        assert_eq!(installed, Some(RunMode::Blocking));
    }

    #[test]
    fn test_clean_stop_exits_with_success() {
        let backend = NetBackend::new();
        let stop = backend.stop_signal();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop.raise();
        });

        let (code, _) = run(&["--uri=tcp://127.0.0.1:0"], backend);
        stopper.join().unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
    }

    #[test]
    fn test_signals_stop_blocking_runs_only() {
        let stop = Arc::new(StopSignal::default());
        assert!(signal_handler(RunMode::Park, Arc::clone(&stop)).is_none());

        let handler = signal_handler(RunMode::Blocking, Arc::clone(&stop)).unwrap();
        handler();
        // returns immediately once raised
        stop.wait();
    }
}
