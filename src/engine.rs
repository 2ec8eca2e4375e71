use std::{io, sync::Arc};

use crate::{
    bootstrap::{Backend, DispatcherFlags},
    dispatcher::{Dispatcher, StopSignal},
    poll::Poll,
};

/// Builds the in-process dispatcher and socket listeners. Every dispatcher
/// it creates returns from `run` once the shared stop signal is raised.
#[derive(Default)]
pub struct NetBackend {
    stop: Arc<StopSignal>,
}

impl NetBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_signal(&self) -> Arc<StopSignal> {
        Arc::clone(&self.stop)
    }
}

impl Backend for NetBackend {
    type Dispatcher = Dispatcher;
    type Listener = Poll;

    fn new_dispatcher(
        &self,
        flags: DispatcherFlags,
        msg_buf_size: u32,
    ) -> io::Result<Arc<Dispatcher>> {
        Dispatcher::new(flags, msg_buf_size, Arc::clone(&self.stop)).map(Arc::new)
    }

    fn new_listener(&self, address: &str) -> Option<Poll> {
        Poll::new(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bootstrap::{BootstrapError, BootstrapOptions, CleanupPolicy, ServiceBootstrap, State},
        config::Configuration,
    };
    use std::{
        net::{TcpListener, TcpStream},
        thread,
    };

    fn config(endpoints: &[&str]) -> Configuration {
        Configuration {
            msg_buf_size: 4096,
            endpoints: endpoints.iter().map(|s| s.to_string()).collect(),
            ..Configuration::default()
        }
    }

    #[test]
    fn test_serves_until_stop_signal() {
        let backend = NetBackend::new();
        let stop = backend.stop_signal();
        let mut bootstrap = ServiceBootstrap::new(backend, BootstrapOptions::default());

        let runner = thread::spawn(move || {
            let res = bootstrap.run(&config(&["tcp://127.0.0.1:0", "tcp://127.0.0.1:0/"]));
            (res, bootstrap.state())
        });
        stop.raise();

        let (res, state) = runner.join().unwrap();
        assert!(res.is_ok());
        assert_eq!(state, State::Stopped);
    }

    #[test]
    fn test_malformed_uri_aborts() {
        let mut bootstrap = ServiceBootstrap::new(NetBackend::new(), BootstrapOptions::default());
        let err = bootstrap
            .run(&config(&["tcp://127.0.0.1:0", "bogus:endpoint"]))
            .unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::EndpointBind { ref address, .. } if address == "bogus:endpoint"
        ));
        assert_eq!(bootstrap.state(), State::Aborted);
    }

    #[test]
    fn test_leave_running_survives_bootstrap_drop() {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let options = BootstrapOptions {
            cleanup: CleanupPolicy::LeaveRunning,
            ..BootstrapOptions::default()
        };
        let mut bootstrap = ServiceBootstrap::new(NetBackend::new(), options);
        let first = format!("tcp://127.0.0.1:{}", port);

        assert!(bootstrap.run(&config(&[first.as_str(), "bogus:endpoint"])).is_err());
        drop(bootstrap);

        assert!(TcpStream::connect(("127.0.0.1", port)).is_ok());
    }
}
