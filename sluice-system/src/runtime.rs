use std::future::Future;
use std::time::Duration;

/// A Sluice async runtime.
///
/// This is a thin wrapper around a Tokio [`tokio::runtime::Runtime`], configured for Sluice.
/// Every pipeline runs on its own runtime, so slow stores of one granularity cannot starve the
/// others.
#[derive(Debug)]
pub struct Runtime {
    name: &'static str,
    rt: tokio::runtime::Runtime,
}

impl Runtime {
    /// Creates a [`Builder`] to create and configure a new runtime.
    pub fn builder(name: &'static str) -> Builder {
        Builder::new(name)
    }

    /// The name of this runtime, which is also the name of its threads.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns a handle to this runtime.
    ///
    /// The handle can be freely cloned and used to spawn tasks.
    pub fn handle(&self) -> &tokio::runtime::Handle {
        self.rt.handle()
    }

    /// Runs a future to completion on this runtime.
    ///
    /// See also: [`tokio::runtime::Runtime::block_on`].
    #[track_caller]
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.rt.block_on(future)
    }

    /// Shuts the runtime down, waiting at most `timeout` for blocking tasks.
    ///
    /// See also: [`tokio::runtime::Runtime::shutdown_timeout`].
    pub fn shutdown_timeout(self, timeout: Duration) {
        sluice_log::debug!(runtime = self.name, "shutting down runtime");
        self.rt.shutdown_timeout(timeout);
    }
}

/// Configures a Sluice [`Runtime`].
#[derive(Debug)]
pub struct Builder {
    name: &'static str,
    builder: tokio::runtime::Builder,
}

impl Builder {
    fn new(name: &'static str) -> Self {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.thread_name(name).enable_all();

        Self { name, builder }
    }

    /// Configures the amount of worker threads available to the runtime.
    ///
    /// The default value is the number of cores available to the system.
    ///
    /// See also: [`tokio::runtime::Builder::worker_threads`].
    pub fn worker_threads(&mut self, num: usize) -> &mut Self {
        self.builder.worker_threads(num);
        self
    }

    /// Configures the amount of threads in the dynamic thread pool of the runtime.
    ///
    /// See also: [`tokio::runtime::Builder::max_blocking_threads`].
    pub fn max_blocking_threads(&mut self, num: usize) -> &mut Self {
        self.builder.max_blocking_threads(num);
        self
    }

    /// Creates the configured [`Runtime`].
    pub fn build(&mut self) -> Runtime {
        let rt = self
            .builder
            .build()
            .expect("creating the Tokio runtime should never fail");

        Runtime {
            name: self.name,
            rt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_threads_are_named() {
        let rt = Runtime::builder("sluice-test").worker_threads(1).build();
        assert_eq!(rt.name(), "sluice-test");

        let name = rt.block_on(async {
            tokio::spawn(async { std::thread::current().name().map(str::to_owned) })
                .await
                .unwrap()
        });

        assert_eq!(name.as_deref(), Some("sluice-test"));
        rt.shutdown_timeout(Duration::from_secs(1));
    }

    #[test]
    fn test_handle_spawns_onto_runtime() {
        let rt = Runtime::builder("sluice-spawn")
            .worker_threads(1)
            .max_blocking_threads(1)
            .build();

        let handle = rt.handle().clone();
        let value = rt.block_on(async move { handle.spawn(async { 42 }).await.unwrap() });
        assert_eq!(value, 42);
    }
}
