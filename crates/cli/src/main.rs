#![forbid(unsafe_code)]

use agent::{AgentEngine, ControlEvent, Services};
use clap::Parser;
use flume::bounded;
use jvm_agent::{
    cli::Cli,
    signals::{SignalEvent, wait_for_signal},
};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // NOTE: The verbosity flag takes precedence over the environment variable
    // for log control. `JVM_AGENT_LOG` can still set levels per crate, e.g.
    // `JVM_AGENT_LOG=agent::dispatch=debug jvm-agent -v` logs everything at
    // info and the dispatch module at debug.
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var("JVM_AGENT_LOG")
        .from_env()?
        .add_directive(cli.verbosity.log_level_filter().as_str().parse()?);

    let layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();

    let config = cli.load_config()?;
    debug!(?config, ?cli);
    let grace = config.agent.shutdown_grace;

    // install signal handlers
    let (signals_tx, signals_rx) = bounded(8);
    let mut signal_handle = tokio::spawn(async move { wait_for_signal(signals_tx).await });

    let services = Services::system(&config);
    let mut engine = AgentEngine::new(config, services)?;
    info!(writer_id = %engine.writer_id(), "jvm-agent starting");

    let cancel = CancellationToken::new();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let mut engine_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { engine.run_until(cancel, control_rx).await }
    });

    loop {
        tokio::select! {
            // bubble up any errors from the signal handlers
            res = &mut signal_handle => {
                let res = res?;
                if let Err(err) = &res {
                    error!("error happened during handling signals: {}", err);
                }
                res?;
                break;
            }

            // the engine only returns on its own when it failed
            res = &mut engine_handle => {
                let res = res?;
                if let Err(err) = &res {
                    error!("error happened in engine: {}", err);
                }
                res?;
                return Ok(());
            }

            event_res = signals_rx.recv_async() => {
                let event = event_res?;
                debug!(?event, "received signal event");

                let control = match event {
                    SignalEvent::DumpStatus => ControlEvent::DumpStatus,
                    SignalEvent::ReloadConfig => match cli.load_config() {
                        Ok(config) => ControlEvent::Reload(Box::new(config)),
                        Err(err) => {
                            warn!(%err, "failed to reload config; keeping previous");
                            continue;
                        }
                    },
                    SignalEvent::Shutdown => break,
                };
                if control_tx.send(control).is_err() {
                    break;
                }
            }
        }
    }

    cancel.cancel();
    match time::timeout(grace, engine_handle).await {
        Ok(res) => res??,
        Err(_) => warn!(?grace, "engine did not stop within the shutdown grace period"),
    }
    info!("jvm-agent stopped");
    Ok(())
}
