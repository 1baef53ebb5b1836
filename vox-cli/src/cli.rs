use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "vox")]
#[command(about = "Talk to a live voice model", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub settings: SettingsArgs,

    /// Log as JSON lines instead of human-readable text
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Speak through the microphone and hear replies (default)
    Talk,
    /// Type messages and hear replies
    Chat,
    /// Fetch one credential and print its expiry
    Token,
}

#[derive(Args, Clone, Debug)]
pub struct SettingsArgs {
    /// Credential endpoint URL
    #[arg(long, env = "VOX_CREDENTIAL_URL")]
    pub credential_url: Option<String>,

    /// Bearer token for the credential endpoint
    #[arg(long, env = "VOX_CREDENTIAL_TOKEN", hide_env_values = true)]
    pub credential_token: Option<String>,

    /// Model to request credentials for
    #[arg(long, env = "VOX_MODEL", default_value = "gemini-live-2.5-flash")]
    pub model: String,

    /// Region of the live endpoint
    #[arg(long, env = "VOX_LOCATION", default_value = "us-central1")]
    pub location: String,

    /// Prebuilt voice name
    #[arg(long, env = "VOX_VOICE")]
    pub voice: Option<String>,

    /// System instruction
    #[arg(long, env = "VOX_INSTRUCTION")]
    pub instruction: Option<String>,

    /// Override the live WebSocket URL (ws:// or wss://)
    #[arg(long, env = "VOX_LIVE_URL")]
    pub live_url: Option<String>,
}
