pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;
pub mod view;

use anyhow::Context;
use commands::Reply;
use config::Config;
use engine::Engine;
use identity::IdentityTracker;
use logger::Notifier;
use peer::{RtcTransportFactory, SampleTrackCapture};
use signaling::websocket::WsSignaling;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use view::CallView;

/// Connects to the signaling server and runs the console client until `quit`,
/// end of input, or the server going away.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let ice_servers = config.ice_servers()?;
    let name = config.display_name();
    let identity = IdentityTracker::new(name.clone(), utils::provisional_client_id());

    let (signaling, inbound) = WsSignaling::connect(&config.signaling_url)
        .await
        .with_context(|| format!("connecting to {}", config.signaling_url))?;

    let (notifier, mut notes) = Notifier::channel();
    let (engine, handle) = Engine::new(
        identity,
        Arc::new(RtcTransportFactory::new(ice_servers)),
        Arc::new(SampleTrackCapture::audio_video()),
        Arc::new(signaling),
        notifier,
        config.engine_config(),
    );
    let engine_task = tokio::spawn(engine.run());
    let mut reader = inbound.forward_to(handle.clone());

    let mut view = CallView::new(name.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("signed in as {name}");
    println!("{}", commands::util_api::HELP);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading console input")? else {
                    break;
                };
                match commands::execute(&line, &handle, &view).await {
                    Ok(Reply::Text(text)) => println!("{text}"),
                    Ok(Reply::Silent) => {}
                    Ok(Reply::Quit) => break,
                    Err(e) => println!("{e}"),
                }
            }
            Some(note) = notes.recv() => {
                view.apply(&note);
                println!("{}", view::describe(&note));
            }
            _ = &mut reader => {
                println!("disconnected from the signaling server");
                break;
            }
        }
    }

    if handle.shutdown().is_ok() {
        engine_task.await.context("engine task")?;
    }
    reader.abort();
    Ok(())
}
