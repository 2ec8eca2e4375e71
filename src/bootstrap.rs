use std::{env, io, mem, sync::Arc, thread};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::Configuration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherFlags {
    /// Trace every delivered message and report counters on shutdown.
    pub monitor: bool,
}

/// The shared routing engine every endpoint feeds into.
pub trait Dispatch: Send + Sync + 'static {
    /// With `blocking` set this only returns once the engine is told to stop.
    fn run(&self, blocking: bool);
}

/// One transport endpoint bound against a dispatcher.
pub trait Listen<D> {
    fn start(&mut self, dispatcher: &Arc<D>) -> io::Result<()>;
    fn stop(&mut self);
}

/// Factory for the engine and its listeners.
pub trait Backend {
    type Dispatcher: Dispatch;
    type Listener: Listen<Self::Dispatcher>;

    fn new_dispatcher(
        &self,
        flags: DispatcherFlags,
        msg_buf_size: u32,
    ) -> io::Result<Arc<Self::Dispatcher>>;

    /// `None` when the address is not understood.
    fn new_listener(&self, address: &str) -> Option<Self::Listener>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    DispatcherCreated,
    EndpointsBinding,
    Running,
    Stopping,
    Stopped,
    Aborted,
}

/// What happens to already started endpoints when a later one fails to bind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Stop them, in the order they were started.
    #[default]
    Symmetric,
    /// Leave them running until the process exits, even once the
    /// bootstrap itself is dropped.
    LeaveRunning,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Hand the thread to the dispatcher's blocking run call.
    #[default]
    Blocking,
    /// Park the thread forever; endpoints are never stopped.
    Park,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapOptions {
    pub monitor: bool,
    pub cleanup: CleanupPolicy,
    pub run_mode: RunMode,
}

impl BootstrapOptions {
    /// Reads `DISPATCHD_MONITOR`, `DISPATCHD_CLEANUP` (`symmetric` or
    /// `leave-running`) and `DISPATCHD_RUN_MODE` (`blocking` or `park`).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let mut options = Self::default();
        if let Some(monitor) = lookup("DISPATCHD_MONITOR") {
            options.monitor = matches!(monitor.as_str(), "1" | "true" | "yes");
        }
        match lookup("DISPATCHD_CLEANUP").as_deref() {
            None | Some("symmetric") => {}
            Some("leave-running") => options.cleanup = CleanupPolicy::LeaveRunning,
            Some(other) => warn!("Ignoring unknown DISPATCHD_CLEANUP={}", other),
        }
        match lookup("DISPATCHD_RUN_MODE").as_deref() {
            None | Some("blocking") => {}
            Some("park") => options.run_mode = RunMode::Park,
            Some(other) => warn!("Ignoring unknown DISPATCHD_RUN_MODE={}", other),
        }
        options
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to create dispatcher: {0}")]
    Dispatcher(#[source] io::Error),
    #[error("failed to bind endpoint {address}: {source}")]
    EndpointBind { address: String, source: io::Error },
}

pub struct ServiceBootstrap<B: Backend> {
    backend: B,
    options: BootstrapOptions,
    state: State,
    endpoints: Vec<(String, B::Listener)>,
}

impl<B: Backend> ServiceBootstrap<B> {
    pub fn new(backend: B, options: BootstrapOptions) -> Self {
        Self {
            backend,
            options,
            state: State::Init,
            endpoints: Vec::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Creates the dispatcher, binds every endpoint in order and blocks in
    /// the dispatcher until it returns.
    pub fn run(&mut self, config: &Configuration) -> Result<(), BootstrapError> {
        info!("msg buf size = {}", config.msg_buf_size);
        let flags = DispatcherFlags {
            monitor: self.options.monitor,
        };
        let dispatcher = match self.backend.new_dispatcher(flags, config.msg_buf_size) {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                error!("Failed to create dispatcher: {}", e);
                self.transition(State::Aborted);
                return Err(BootstrapError::Dispatcher(e));
            }
        };
        self.transition(State::DispatcherCreated);

        self.transition(State::EndpointsBinding);
        for address in &config.endpoints {
            info!("uri = {}", address);
            if let Err(e) = self.bind(address, &dispatcher) {
                error!("{}", e);
                self.abort();
                return Err(e);
            }
        }

        self.transition(State::Running);
        match self.options.run_mode {
            RunMode::Blocking => dispatcher.run(true),
            RunMode::Park => loop {
                thread::park();
            },
        }

        self.transition(State::Stopping);
        self.stop_endpoints();
        self.transition(State::Stopped);
        Ok(())
    }

    fn bind(
        &mut self,
        address: &str,
        dispatcher: &Arc<B::Dispatcher>,
    ) -> Result<(), BootstrapError> {
        let failed = |source| BootstrapError::EndpointBind {
            address: address.to_string(),
            source,
        };

        let mut listener = self.backend.new_listener(address).ok_or_else(|| {
            failed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unrecognized endpoint address",
            ))
        })?;
        listener.start(dispatcher).map_err(failed)?;

        debug!("Endpoint {} started", address);
        self.endpoints.push((address.to_string(), listener));
        Ok(())
    }

    fn abort(&mut self) {
        match self.options.cleanup {
            CleanupPolicy::Symmetric => self.stop_endpoints(),
            CleanupPolicy::LeaveRunning => {
                if !self.endpoints.is_empty() {
                    warn!(
                        "Leaving {} endpoint(s) running after bind failure",
                        self.endpoints.len()
                    );
                }
                // dropping a listener may stop it
                for (_, listener) in self.endpoints.drain(..) {
                    mem::forget(listener);
                }
            }
        }
        self.transition(State::Aborted);
    }

    fn stop_endpoints(&mut self) {
        for (address, listener) in self.endpoints.iter_mut() {
            listener.stop();
            debug!("Endpoint {} stopped", address);
        }
        self.endpoints.clear();
    }

    fn transition(&mut self, next: State) {
        debug!("Bootstrap {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}
