use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{ChannelMessenger, Code, JobStore, Message, PeerId, Slot};
use pmr_worker::map::perform_map;
use pmr_worker::reduce::perform_reduce;
use pmr_worker::sandbox::{PythonProcess, Sandbox};
use pmr_worker::{event_channel, RoomSession, Worker};

mod args;
use args::Args;

type LocalWorker = Worker<PythonProcess, ChannelMessenger>;

async fn run_job(
    worker: &LocalWorker,
    session: &watch::Sender<RoomSession>,
    code: &Code,
    inputs: &[PathBuf],
    args: &Args,
) -> Result<()> {
    if !worker.validate(code).await? {
        let errors = worker.store().snapshot().stderr;
        for slot in Slot::ALL {
            let error = errors.slot(slot);
            if !error.is_empty() {
                error!("{slot} code: {error}");
            }
        }
        bail!("submitted code is not valid");
    }

    if args.validate_only {
        info!("code is valid");
        return Ok(());
    }

    perform_map(worker, session, code, inputs).await?;

    // Stands in for the coordinator's key assignment.
    worker
        .store()
        .dispatch(Message::SetReduceKeys(args.reduce_keys.clone()));

    if let Some(output) = perform_reduce(worker, code).await? {
        info!("reduce output: {output}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let code = args.load_code()?;
    let inputs = args.input_files()?;
    if inputs.is_empty() {
        warn!("{} matches no input files", args.input);
    }

    let (sink, events) = event_channel();
    let sandbox = PythonProcess::start(&args.python, sink.clone()).await?;
    if !sandbox.is_ready() {
        bail!("{} is not usable as a sandbox", args.python.display());
    }

    let (messenger, mut outbox) = ChannelMessenger::new();
    let (session, session_rx) = watch::channel(RoomSession::new(
        PeerId::new(args.coordinator.as_str()),
        inputs.len(),
    ));
    let (worker, processing) =
        Worker::new(sandbox, messenger, JobStore::new(), session_rx, sink, events)?;
    let processing = tokio::spawn(processing.run());

    // Outbound messages go to stdout, one `<peer> <json>` line each.
    let transport = tokio::spawn(async move {
        while let Some((peer, message)) = outbox.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => println!("{peer} {json}"),
                Err(e) => error!("failed to encode {}: {e}", message.kind()),
            }
        }
    });

    let result = tokio::select! {
        result = run_job(&worker, &session, &code, &inputs, &args) => result,
        _ = signal::ctrl_c() => {
            info!("Interrupted, stopping the sandbox...");
            worker
                .interrupt()
                .await
                .and_then(|()| Err(anyhow!("job interrupted")))
        }
    };

    worker.shutdown();
    processing.await?;
    info!("job finished in phase {:?}", worker.store().snapshot().phase);

    drop(worker);
    transport.await?;

    result
}
