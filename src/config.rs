use std::fs;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use dotenvy::dotenv;
use keyring::Entry;
use serde::Deserialize;
use url::Url;

use ytup::client::{DEFAULT_API_BASE_URL, DEFAULT_UPLOAD_BASE_URL};
use ytup::error::UploadError;
use ytup::metadata::DEFAULT_CHUNK_SIZE;
use ytup::poller::{DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT};

pub const KEYRING_SERVICE: &str = "ytup-access-token";
pub const KEYRING_USER: &str = "YouTube";
const ENV_PREFIX: &str = "YTUP_";

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    api_base_url: Option<Url>,
    upload_base_url: Option<Url>,
    poll_interval: Option<String>,
    poll_timeout: Option<String>,
    chunk_size: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ConfigEnv {
    api_base_url: Option<Url>,
    upload_base_url: Option<Url>,
    poll_interval: Option<String>,
    poll_timeout: Option<String>,
    chunk_size: Option<u64>,
    access_token: Option<String>,
}

#[derive(Debug)]
pub struct Config {
    pub api_base_url: Url,
    pub upload_base_url: Url,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub chunk_size: u64,
    /// `None` when neither `YTUP_ACCESS_TOKEN` nor the keyring provide one.
    pub access_token: Option<String>,
}

impl Config {
    pub fn access_token(&self) -> Result<String> {
        self.access_token.clone().ok_or_else(|| {
            UploadError::Authentication(
                "no access token in YTUP_ACCESS_TOKEN nor in the OS keyring (see `ytup set-token`)"
                    .to_string(),
            )
            .into()
        })
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|e| {
        UploadError::configuration(format!("invalid {key} '{value}': {e}")).into()
    })
}

fn merge_config(
    base: ConfigFile,
    override_config: ConfigEnv,
    keyring_token: impl FnOnce() -> Option<String>,
) -> Result<Config> {
    let api_base_url = match override_config.api_base_url.or(base.api_base_url) {
        Some(url) => url,
        None => Url::parse(DEFAULT_API_BASE_URL)?,
    };
    let upload_base_url = match override_config.upload_base_url.or(base.upload_base_url) {
        Some(url) => url,
        None => Url::parse(DEFAULT_UPLOAD_BASE_URL)?,
    };

    let poll_interval = match override_config.poll_interval.or(base.poll_interval) {
        Some(value) => parse_duration("poll_interval", &value)?,
        None => DEFAULT_POLL_INTERVAL,
    };
    let poll_timeout = match override_config.poll_timeout.or(base.poll_timeout) {
        Some(value) => parse_duration("poll_timeout", &value)?,
        None => DEFAULT_POLL_TIMEOUT,
    };

    let chunk_size = override_config
        .chunk_size
        .or(base.chunk_size)
        .unwrap_or(DEFAULT_CHUNK_SIZE);

    let access_token = override_config.access_token.or_else(keyring_token);

    Ok(Config {
        api_base_url,
        upload_base_url,
        poll_interval,
        poll_timeout,
        chunk_size,
        access_token,
    })
}

fn keyring_token() -> Option<String> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER).ok()?;
    let secret = entry.get_secret().ok()?;
    String::from_utf8(secret).ok()
}

pub fn read_config() -> Result<Config> {
    let _ = dotenv();
    let env_config = envy::prefixed(ENV_PREFIX)
        .from_env::<ConfigEnv>()
        .map_err(|e| UploadError::configuration(format!("invalid environment: {e}")))?;

    let project_dirs = directories::ProjectDirs::from("com", "ytup", "ytup")
        .ok_or(anyhow!("Unable to determine home directory"))?;
    let config_file = project_dirs.config_dir().join("config.toml");
    let file_config = if let Ok(config) = fs::read_to_string(&config_file) {
        toml::from_str(&config)
            .with_context(|| format!("Invalid configuration file {}", config_file.display()))?
    } else {
        ConfigFile::default()
    };

    merge_config(file_config, env_config, keyring_token)
}

pub fn set_access_token_keyring(token: String) -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)?;
    entry.set_secret(token.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_keyring() -> Option<String> {
        None
    }

    #[test]
    fn defaults_apply_without_file_or_environment() {
        let config =
            merge_config(ConfigFile::default(), ConfigEnv::default(), no_keyring).unwrap();
        assert_eq!(config.api_base_url.as_str(), DEFAULT_API_BASE_URL);
        assert_eq!(config.upload_base_url.as_str(), DEFAULT_UPLOAD_BASE_URL);
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.poll_timeout, Duration::from_secs(2 * 60 * 60));
        assert_eq!(config.chunk_size, 8 * 1024 * 1024);
        assert!(config.access_token.is_none());
    }

    #[test]
    fn environment_overrides_file() {
        let file: ConfigFile = toml::from_str(
            r#"
            api_base_url = "https://file.example/"
            poll_interval = "10s"
            chunk_size = 1048576
            "#,
        )
        .unwrap();
        let env = ConfigEnv {
            api_base_url: Some(Url::parse("https://env.example/").unwrap()),
            poll_timeout: Some("5m".into()),
            ..Default::default()
        };

        let config = merge_config(file, env, no_keyring).unwrap();
        assert_eq!(config.api_base_url.as_str(), "https://env.example/");
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.poll_timeout, Duration::from_secs(300));
        assert_eq!(config.chunk_size, 1024 * 1024);
    }

    #[test]
    fn environment_token_wins_over_keyring() {
        let env = ConfigEnv {
            access_token: Some("from-env".into()),
            ..Default::default()
        };
        let config = merge_config(ConfigFile::default(), env, || {
            panic!("keyring must not be read")
        })
        .unwrap();
        assert_eq!(config.access_token().unwrap(), "from-env");

        let config = merge_config(ConfigFile::default(), ConfigEnv::default(), || {
            Some("from-keyring".into())
        })
        .unwrap();
        assert_eq!(config.access_token().unwrap(), "from-keyring");
    }

    #[test]
    fn missing_token_is_an_authentication_error() {
        let config =
            merge_config(ConfigFile::default(), ConfigEnv::default(), no_keyring).unwrap();
        let error = config.access_token().unwrap_err();
        let upload_error = error.downcast_ref::<UploadError>().unwrap();
        assert_eq!(upload_error.exit_code(), 4);
    }

    #[test]
    fn malformed_duration_is_a_configuration_error() {
        let env = ConfigEnv {
            poll_interval: Some("soon".into()),
            ..Default::default()
        };
        let error = merge_config(ConfigFile::default(), env, no_keyring).unwrap_err();
        assert_eq!(error.downcast_ref::<UploadError>().unwrap().exit_code(), 2);
    }
}
