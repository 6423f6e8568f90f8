use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sluice_config::Config;
use sluice_histogram::{
    Granularity, LogBlockedSink, Pipeline, PipelineServices, ReportSink, SystemClock,
    WavefrontDecoder,
};
use sluice_statsd::Metrics;
use sluice_system::{Controller, Runtime, Shutdown};
use tokio::net::TcpListener;

use crate::listener::LineListener;
use crate::sink::JsonLinesSink;

/// Source assigned to points that do not name one.
const DEFAULT_SOURCE: &str = "sluice";

/// Time granted to blocking tasks of a runtime after the pipelines have stopped.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

fn runtime_name(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Minute => "pipeline-minute",
        Granularity::Hour => "pipeline-hour",
        Granularity::Day => "pipeline-day",
        Granularity::Dist => "pipeline-dist",
    }
}

/// Runs all configured pipelines until shutdown is requested.
///
/// Every pipeline runs on a runtime of its own. Listeners, signal handling and the final shutdown
/// of the pipelines run on the main runtime.
pub fn run(config: Config, metrics: Metrics) -> Result<()> {
    let sink: Arc<dyn ReportSink> = match config.report_path() {
        Some(path) => Arc::new(
            JsonLinesSink::open(path)
                .with_context(|| format!("failed to open report file {}", path.display()))?,
        ),
        None => Arc::new(JsonLinesSink::stdout()),
    };

    let services = PipelineServices {
        decoder: Arc::new(WavefrontDecoder::new(DEFAULT_SOURCE)),
        sink,
        blocked: Arc::new(LogBlockedSink),
        clock: Arc::new(SystemClock),
        metrics,
    };

    let main_runtime = Runtime::builder("main").worker_threads(2).build();

    let mut runtimes = Vec::new();
    let mut pipelines = Vec::new();
    for granularity in config.active_pipelines() {
        let runtime = Runtime::builder(runtime_name(granularity))
            .worker_threads(config.pipeline_threads())
            .build();

        let pipeline = Pipeline::start(
            granularity,
            config.pipeline(granularity),
            config.state_dir(),
            services.clone(),
            runtime.handle(),
        )
        .with_context(|| format!("failed to start {granularity} pipeline"))?;

        runtimes.push(runtime);
        pipelines.push(pipeline);
    }

    let result = main_runtime.block_on(serve(&config, pipelines));

    for runtime in runtimes {
        runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    }
    main_runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

    sluice_log::info!("sluice shutdown complete");
    result
}

async fn serve(config: &Config, pipelines: Vec<Pipeline>) -> Result<()> {
    let controller = Controller::start(config.shutdown_timeout());

    let bound = bind_listeners(config, &pipelines, &controller).await;
    let shutdown = match bound {
        Ok(()) => controller.handle().notified().await,
        Err(_) => {
            // Listeners that did bind stop with the controller.
            controller.shutdown(None);
            Shutdown { timeout: None }
        }
    };

    let stop_all = futures::future::join_all(pipelines.into_iter().map(Pipeline::stop));
    match shutdown.timeout {
        Some(timeout) => {
            if tokio::time::timeout(timeout, stop_all).await.is_err() {
                sluice_log::error!("pipelines did not stop within {}s", timeout.as_secs());
            }
        }
        None => {
            stop_all.await;
        }
    }

    bound
}

async fn bind_listeners(
    config: &Config,
    pipelines: &[Pipeline],
    controller: &Controller,
) -> Result<()> {
    for pipeline in pipelines {
        for port in pipeline.ports() {
            let addr = format!("{}:{}", config.listen_host(), port);
            let socket = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;

            let listener = Arc::new(LineListener::new(
                pipeline.granularity(),
                port,
                pipeline.tapes(port).to_vec(),
                config.max_line_length(),
            ));
            tokio::spawn(listener.serve(socket, controller.handle()));
        }
    }

    Ok(())
}
