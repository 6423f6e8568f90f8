use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sluice_statsd::Metrics;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::accumulator::{Accumulator, AccumulatorConfig};
use crate::clock::Clock;
use crate::config::{InvalidPipelineConfig, PipelineConfig};
use crate::decoder::PointDecoder;
use crate::dispatch::{Dispatcher, ReportSink};
use crate::granularity::Granularity;
use crate::ingest::{BlockedSink, IngestConfig, IngestionTask};
use crate::store::{LoadError, StoreLoader, StoreSettings};
use crate::tape::{FileTape, MemoryTape, Tape, TapeError};

/// Interval of the accumulator health check.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Collaborators shared by all tasks of a [`Pipeline`].
#[derive(Clone)]
pub struct PipelineServices {
    /// Decodes raw lines taken from the tapes.
    pub decoder: Arc<dyn PointDecoder>,
    /// Receives ripe histograms.
    pub sink: Arc<dyn ReportSink>,
    /// Receives lines that could not be accumulated.
    pub blocked: Arc<dyn BlockedSink>,
    /// Source of the current time for bins and ripeness.
    pub clock: Arc<dyn Clock>,
    /// Handle for internal metrics.
    pub metrics: Metrics,
}

impl fmt::Debug for PipelineServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineServices")
            .field("decoder", &self.decoder)
            .field("sink", &self.sink)
            .field("blocked", &self.blocked)
            .finish_non_exhaustive()
    }
}

/// An error that prevents a [`Pipeline`] from starting.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The configuration is out of range.
    #[error("invalid {0} pipeline configuration")]
    Config(Granularity, #[source] InvalidPipelineConfig),
    /// Digests should be persisted, but there is nowhere to put them.
    #[error("no state directory for persisted {0} pipeline")]
    MissingStateDir(Granularity),
    /// The accumulator store could not be loaded.
    #[error(transparent)]
    Load(#[from] LoadError),
    /// An input tape could not be opened.
    #[error("failed to open tape {}", path.display())]
    Tape {
        /// The path of the tape.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: TapeError,
    },
}

/// All tasks accumulating and dispatching histograms of one granularity.
///
/// A pipeline owns one store and one [`Accumulator`] in front of it. For every configured port,
/// it runs `fanout` ingestion shards, each draining its own tape. A dispatch task ships ripe
/// digests, a resolve task writes the local cache back into the store, and a health check warns
/// when the store outgrows its capacity.
///
/// Listeners feed the pipeline by pushing lines onto the [`tapes`](Self::tapes) of their port.
pub struct Pipeline {
    granularity: Granularity,
    accumulator: Arc<Accumulator>,
    tapes: BTreeMap<u16, Vec<Arc<dyn Tape>>>,
    tasks: Vec<JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

impl Pipeline {
    /// Loads the store and spawns all tasks of the pipeline onto `runtime`.
    ///
    /// Persisted pipelines keep their store at `histogram.<granularity>.0` and their tapes at
    /// `tape.<granularity>.<port>.<shard>` in `state_dir`.
    pub fn start(
        granularity: Granularity,
        config: &PipelineConfig,
        state_dir: Option<&Path>,
        services: PipelineServices,
        runtime: &Handle,
    ) -> Result<Self, PipelineError> {
        config
            .validate(granularity)
            .map_err(|e| PipelineError::Config(granularity, e))?;

        let state_dir = match (config.persisted, state_dir) {
            (true, Some(dir)) => Some(dir),
            (true, None) => return Err(PipelineError::MissingStateDir(granularity)),
            (false, _) => None,
        };

        let settings = StoreSettings::new(
            config.capacity,
            config.avg_key_size,
            config.avg_value_size(),
        );
        let loader = StoreLoader::new(settings, config.persisted);
        let store_path = match state_dir {
            Some(dir) => dir.join(format!("histogram.{granularity}.0")),
            None => PathBuf::from(format!("histogram.{granularity}.0")),
        };
        let store = loader.get(&store_path)?;

        let accumulator = Arc::new(Accumulator::new(
            store,
            AccumulatorConfig {
                granularity,
                memory_cache: config.memory_cache(granularity),
                cache_bound: config.cache_bound,
            },
            services.clock.clone(),
            services.metrics.clone(),
        ));

        let (stop, _) = watch::channel(false);
        let mut tasks = Vec::new();
        let mut tapes = BTreeMap::new();

        let ingest_config = IngestConfig {
            granularity,
            compression: config.compression,
            flush_delay: config.flush_delay(granularity),
            batch_size: config.batch_size,
        };

        for &port in &config.ports {
            let mut port_tapes = Vec::new();
            for shard in 0..config.fanout(granularity) {
                let tape = open_tape(state_dir, granularity, port, shard)?;
                let task = Arc::new(IngestionTask::new(
                    ingest_config.clone(),
                    tape.clone(),
                    services.decoder.clone(),
                    accumulator.clone(),
                    services.blocked.clone(),
                    services.clock.clone(),
                    services.metrics.clone(),
                ));

                tasks.push(spawn_periodic(
                    runtime,
                    "ingest",
                    config.scan_interval(),
                    stop.subscribe(),
                    move || {
                        if let Err(error) = task.drain() {
                            sluice_log::error!(
                                error = &error as &dyn Error,
                                granularity = granularity.name(),
                                port,
                                shard,
                                "failed to read from tape"
                            );
                        }
                    },
                ));

                port_tapes.push(tape);
            }
            tapes.insert(port, port_tapes);
        }

        let dispatcher = Dispatcher::new(
            accumulator.clone(),
            services.sink.clone(),
            services.clock.clone(),
            config.dispatch_limit,
            services.metrics.clone(),
        );
        tasks.push(spawn_periodic(
            runtime,
            "dispatch",
            config.dispatch_interval(),
            stop.subscribe(),
            move || {
                dispatcher.run_once();
            },
        ));

        let resolver = accumulator.clone();
        tasks.push(spawn_periodic(
            runtime,
            "resolve",
            config.resolve_interval(),
            stop.subscribe(),
            move || {
                if let Err(error) = resolver.flush() {
                    sluice_log::error!(
                        error = &error as &dyn Error,
                        granularity = granularity.name(),
                        "failed to write accumulator cache back to store"
                    );
                }
            },
        ));

        let checked = accumulator.clone();
        tasks.push(spawn_periodic(
            runtime,
            "health_check",
            HEALTH_CHECK_INTERVAL,
            stop.subscribe(),
            move || check_health(&checked),
        ));

        sluice_log::info!(
            granularity = granularity.name(),
            ports = ?config.ports,
            size = accumulator.size(),
            "started {granularity} histogram pipeline"
        );

        Ok(Self {
            granularity,
            accumulator,
            tapes,
            tasks,
            stop,
        })
    }

    /// The granularity of this pipeline.
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// The accumulator shared by all tasks.
    pub fn accumulator(&self) -> &Arc<Accumulator> {
        &self.accumulator
    }

    /// The ports this pipeline accepts lines on.
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.tapes.keys().copied()
    }

    /// The input tapes of `port`, one per ingestion shard.
    ///
    /// Returns an empty slice for ports the pipeline does not listen on.
    pub fn tapes(&self, port: u16) -> &[Arc<dyn Tape>] {
        self.tapes.get(&port).map(Vec::as_slice).unwrap_or_default()
    }

    /// Stops all tasks, writes the cache back, and closes the store.
    ///
    /// Lines still waiting on persisted tapes are picked up after the next start. Errors are
    /// logged and do not prevent the store from closing.
    pub async fn stop(self) {
        let granularity = self.granularity;
        sluice_log::info!(granularity = granularity.name(), "stopping {granularity} pipeline");

        self.stop.send_replace(true);
        for task in self.tasks {
            if let Err(error) = task.await {
                sluice_log::error!(
                    error = &error as &dyn Error,
                    granularity = granularity.name(),
                    "pipeline task failed"
                );
            }
        }

        let accumulator = self.accumulator;
        let closed = tokio::task::spawn_blocking(move || {
            if let Err(error) = accumulator.flush() {
                sluice_log::error!(
                    error = &error as &dyn Error,
                    granularity = granularity.name(),
                    "failed to write accumulator cache back to store"
                );
            }
            accumulator.store().close()
        })
        .await;

        match closed {
            Ok(Ok(())) => {
                sluice_log::info!(granularity = granularity.name(), "{granularity} pipeline stopped")
            }
            Ok(Err(error)) => sluice_log::error!(
                error = &error as &dyn Error,
                granularity = granularity.name(),
                "failed to close accumulator store"
            ),
            Err(error) => sluice_log::error!(
                error = &error as &dyn Error,
                granularity = granularity.name(),
                "failed to close accumulator store"
            ),
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("granularity", &self.granularity)
            .field("accumulator", &self.accumulator)
            .field("tapes", &self.tapes)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

fn open_tape(
    state_dir: Option<&Path>,
    granularity: Granularity,
    port: u16,
    shard: usize,
) -> Result<Arc<dyn Tape>, PipelineError> {
    let Some(dir) = state_dir else {
        return Ok(Arc::new(MemoryTape::new()));
    };

    let path = dir.join(format!("tape.{granularity}.{port}.{shard}"));
    match FileTape::open(&path) {
        Ok(tape) => Ok(Arc::new(tape)),
        Err(source) => Err(PipelineError::Tape { path, source }),
    }
}

fn check_health(accumulator: &Accumulator) {
    let store = accumulator.store();
    if store.is_oversized() {
        sluice_log::warn!(
            granularity = accumulator.granularity().name(),
            size = store.len(),
            capacity = store.capacity(),
            "accumulator store holds more than 1.5 times its configured capacity, consider \
             raising the capacity"
        );
    }
}

/// Runs `f` on the blocking pool every `period` until `stop` changes.
///
/// A run that takes longer than `period` delays the next one instead of causing a burst.
fn spawn_periodic<F>(
    runtime: &Handle,
    name: &'static str,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    f: F,
) -> JoinHandle<()>
where
    F: Fn() + Send + Sync + 'static,
{
    let f = Arc::new(f);

    runtime.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = interval.tick() => (),
            }

            let f = Arc::clone(&f);
            if let Err(error) = tokio::task::spawn_blocking(move || (*f)()).await {
                sluice_log::error!(
                    error = &error as &dyn Error,
                    task = name,
                    "periodic pipeline task panicked"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::decoder::WavefrontDecoder;
    use crate::dispatch::{HistogramPoint, ReportError};
    use crate::ingest::LogBlockedSink;
    use crate::key::HistogramKey;

    #[derive(Debug, Default)]
    struct CollectingSink(Mutex<Vec<HistogramPoint>>);

    impl ReportSink for CollectingSink {
        fn report(&self, point: HistogramPoint) -> Result<(), ReportError> {
            self.0.lock().push(point);
            Ok(())
        }
    }

    fn services(clock: &ManualClock, sink: Arc<CollectingSink>) -> PipelineServices {
        PipelineServices {
            decoder: Arc::new(WavefrontDecoder::new("localhost")),
            sink,
            blocked: Arc::new(LogBlockedSink),
            clock: Arc::new(clock.clone()),
            metrics: Metrics::noop(),
        }
    }

    fn config(persisted: bool) -> PipelineConfig {
        PipelineConfig {
            ports: vec![2878],
            fanout: Some(2),
            persisted,
            resolve_interval: 3600,
            dispatch_interval_ms: 10,
            scan_interval_ms: 10,
            ..Default::default()
        }
    }

    fn push(pipeline: &Pipeline, lines: &[&str]) {
        let lines: Vec<String> = lines.iter().map(|s| (*s).to_owned()).collect();
        pipeline.tapes(2878)[0].push(&lines).unwrap();
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    fn count(accumulator: &Accumulator, key: &HistogramKey) -> u64 {
        let mut count = 0;
        accumulator
            .compute(key, |_, digest| {
                count = digest.as_ref().map_or(0, |d| d.count());
                digest
            })
            .unwrap();
        count
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ingest_and_dispatch() {
        sluice_log::init_test!();

        let clock = ManualClock::new(0);
        let sink = Arc::new(CollectingSink::default());
        let pipeline = Pipeline::start(
            Granularity::Minute,
            &config(false),
            None,
            services(&clock, sink.clone()),
            &Handle::current(),
        )
        .unwrap();

        assert_eq!(pipeline.ports().collect::<Vec<_>>(), vec![2878]);
        assert_eq!(pipeline.tapes(2878).len(), 2);
        assert!(pipeline.tapes(2879).is_empty());

        push(&pipeline, &["m 1 0 source=a", "m 2 10 source=a", "m 3 65 source=a"]);

        let key = HistogramKey::new(Granularity::Minute, 0, "m", "a", Default::default());
        wait_until(|| count(pipeline.accumulator(), &key) == 2).await;
        assert!(sink.0.lock().is_empty());

        clock.set(70_000);
        wait_until(|| sink.0.lock().len() == 2).await;

        let mut points = sink.0.lock().clone();
        points.sort_by_key(|p| p.timestamp_ms);
        assert_eq!(points[0].timestamp_ms, 0);
        assert_eq!(points[0].count(), 2);
        assert_eq!(points[1].timestamp_ms, 60_000);
        assert_eq!(points[1].count(), 1);

        pipeline.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_persists_cache() {
        sluice_log::init_test!();

        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(0);
        let sink = Arc::new(CollectingSink::default());
        let config = config(true);

        let pipeline = Pipeline::start(
            Granularity::Minute,
            &config,
            Some(dir.path()),
            services(&clock, sink.clone()),
            &Handle::current(),
        )
        .unwrap();

        push(&pipeline, &["m 1 0 source=a"]);
        wait_until(|| pipeline.accumulator().cache_len() == 1).await;
        pipeline.stop().await;

        assert!(dir.path().join("histogram.minute.0").exists());
        assert!(dir.path().join("histogram.minute.0.settings").exists());
        assert!(dir.path().join("tape.minute.2878.1").exists());

        let pipeline = Pipeline::start(
            Granularity::Minute,
            &config,
            Some(dir.path()),
            services(&clock, sink),
            &Handle::current(),
        )
        .unwrap();

        let key = HistogramKey::new(Granularity::Minute, 0, "m", "a", Default::default());
        assert_eq!(pipeline.accumulator().size(), 1);
        assert_eq!(count(pipeline.accumulator(), &key), 1);

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_start_requires_state_dir() {
        let clock = ManualClock::new(0);
        let result = Pipeline::start(
            Granularity::Hour,
            &config(true),
            None,
            services(&clock, Default::default()),
            &Handle::current(),
        );

        assert!(matches!(
            result,
            Err(PipelineError::MissingStateDir(Granularity::Hour))
        ));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let clock = ManualClock::new(0);
        let config = PipelineConfig {
            compression: 10,
            ..config(false)
        };

        let error = Pipeline::start(
            Granularity::Minute,
            &config,
            None,
            services(&clock, Default::default()),
            &Handle::current(),
        )
        .unwrap_err();

        insta::assert_snapshot!(
            sluice_log::LogError(&error).to_string(),
            @r"
        invalid minute pipeline configuration
          caused by: compression 10 is not between 20 and 1000
        "
        );
    }
}
