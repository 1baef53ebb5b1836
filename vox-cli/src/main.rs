mod cli;
mod config;
mod console;
mod launcher;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use config::Settings;
use launcher::Live;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; real environment variables still apply.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if cli.json_logs {
        vox_telemetry::init_json_telemetry("vox")?;
    } else {
        vox_telemetry::init_telemetry("vox")?;
    }

    let settings = Settings::from_args(cli.settings)?;
    match cli.command.unwrap_or(Commands::Talk) {
        Commands::Talk => talk(settings).await,
        Commands::Chat => console::run_console(settings).await,
        Commands::Token => token(settings).await,
    }
}

async fn talk(settings: Settings) -> Result<()> {
    let Live { client, mut events } = launcher::build(&settings, true)?;
    client.connect().await?;
    client.start_microphone().await?;
    println!("Listening, model {}. Press Ctrl+C to stop.", settings.model);

    let reason = tokio::select! {
        reason = launcher::render_events(&mut events) => reason,
        _ = tokio::signal::ctrl_c() => None,
    };

    client.stop_microphone().await;
    client.disconnect().await;
    launcher::check_close(reason)
}

async fn token(settings: Settings) -> Result<()> {
    let credential = launcher::credential_cache(&settings).get_valid_token().await?;
    println!("model:      {}", credential.model);
    println!("expires at: {}", credential.expires_at.to_rfc3339());
    Ok(())
}
