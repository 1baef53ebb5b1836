use crate::cli::SettingsArgs;
use anyhow::{Result, bail};
use vox_realtime::{LiveEndpoint, SessionConfig};

/// Resolved settings for one run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub credential_url: String,
    pub credential_token: Option<String>,
    pub model: String,
    pub location: String,
    pub voice: Option<String>,
    pub instruction: Option<String>,
    pub live_url: Option<String>,
}

impl Settings {
    pub fn from_args(args: SettingsArgs) -> Result<Self> {
        let Some(credential_url) = args.credential_url.filter(|u| !u.trim().is_empty()) else {
            bail!("credential endpoint not set: pass --credential-url or set VOX_CREDENTIAL_URL");
        };
        if args.model.trim().is_empty() {
            bail!("model must not be empty");
        }

        Ok(Self {
            credential_url,
            credential_token: args.credential_token.filter(|t| !t.is_empty()),
            model: args.model,
            location: args.location,
            voice: args.voice,
            instruction: args.instruction,
            live_url: args.live_url,
        })
    }

    pub fn endpoint(&self) -> LiveEndpoint {
        match &self.live_url {
            Some(url) => LiveEndpoint::new(url.clone()),
            None => LiveEndpoint::vertex(&self.location),
        }
    }

    /// Session configuration; the model is filled in from the credential.
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(self.model.clone());
        if let Some(voice) = &self.voice {
            config = config.with_voice(voice.clone());
        }
        if let Some(instruction) = &self.instruction {
            config = config.with_instruction(instruction.clone());
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> SettingsArgs {
        SettingsArgs {
            credential_url: Some("https://tokens.example.com/live".into()),
            credential_token: Some(String::new()),
            model: "gemini-live-2.5-flash".into(),
            location: "europe-west4".into(),
            voice: Some("Puck".into()),
            instruction: None,
            live_url: None,
        }
    }

    #[test]
    fn test_requires_credential_url() {
        let err = Settings::from_args(SettingsArgs { credential_url: None, ..args() }).unwrap_err();
        assert!(err.to_string().contains("VOX_CREDENTIAL_URL"));
    }

    #[test]
    fn test_defaults_to_regional_endpoint() {
        let settings = Settings::from_args(args()).unwrap();
        assert_eq!(settings.credential_token, None);
        assert!(settings.endpoint().url().starts_with("wss://europe-west4-aiplatform.googleapis.com/"));
        assert_eq!(settings.session_config().voice.as_deref(), Some("Puck"));
    }

    #[test]
    fn test_live_url_override() {
        let settings =
            Settings::from_args(SettingsArgs { live_url: Some("ws://127.0.0.1:9000/live".into()), ..args() }).unwrap();
        assert_eq!(settings.endpoint().url(), "ws://127.0.0.1:9000/live");
    }
}
