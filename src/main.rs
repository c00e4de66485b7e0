use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;

mod app;
mod chat;
mod config;
mod handler;
mod logging;
mod persona;
mod stream;
mod tui;
mod ui;

use app::App;
use config::Config;
use persona::Persona;
use stream::StreamEvent;

#[derive(Parser)]
#[command(name = "sugya")]
#[command(about = "Chat companion for Talmudic study")]
struct Cli {
    /// Backend base URL (overrides SUGYA_BASE_URL and the config file)
    #[arg(long)]
    base_url: Option<String>,

    /// Persona to start with: chavruta, hillel, or shammai
    #[arg(long)]
    persona: Option<String>,

    /// Fetch whole replies instead of streaming them
    #[arg(long)]
    no_stream: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init()?;

    let mut config = Config::load().unwrap_or_else(|_| Config::new());
    if cli.no_stream {
        config.streaming = Some(false);
    }

    let base_url = cli
        .base_url
        .unwrap_or_else(|| config.resolve_base_url());
    let persona = cli
        .persona
        .as_deref()
        .and_then(Persona::from_str)
        .unwrap_or_else(|| config.resolve_persona());

    let (mut app, mut stream_rx) = App::new(&config, &base_url, persona)?;

    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let mut events = tui::EventHandler::new();

    let result = run(&mut terminal, &mut app, &mut events, &mut stream_rx).await;
    tui::restore()?;
    result
}

/// Single event loop: all conversation state is mutated here and only here,
/// whether the trigger is a key press or a decoded stream event.
async fn run(
    terminal: &mut tui::Tui,
    app: &mut App,
    events: &mut tui::EventHandler,
    stream_rx: &mut mpsc::UnboundedReceiver<(StreamEvent, u64)>,
) -> Result<()> {
    while !app.should_quit {
        terminal.draw(|frame| ui::render(app, frame))?;

        tokio::select! {
            maybe_event = events.next() => match maybe_event {
                Some(event) => handler::handle_event(app, event)?,
                None => break,
            },
            Some((event, stream_id)) = stream_rx.recv() => {
                app.handle_stream_event(event, stream_id);
            }
        }
    }
    Ok(())
}
