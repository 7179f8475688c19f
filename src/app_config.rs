//! Application configuration: config file, environment and CLI layering.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use canvas_dl::api::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use canvas_dl::{
    AccessToken, CollisionPolicy, DEFAULT_API_URL, DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES,
    MergePolicy, MergeScope,
};

use crate::cli::{Cli, Command, DownloadArgs};

const CONFIG_DIR_NAME: &str = "canvas-dl";

/// TOML-style file configuration for canvas-dl defaults.
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    /// Canvas API root.
    pub api_url: Option<String>,
    /// Access token, used when neither the flag nor the environment has one.
    pub access_token: Option<String>,
    /// Default parent directory for course folders.
    pub output_dir: Option<PathBuf>,
    /// Default concurrency (same range as CLI).
    pub concurrency: Option<u8>,
    /// Default attempts per request.
    pub max_retries: Option<u8>,
    /// Merge PDFs after downloading.
    pub merge: Option<bool>,
    pub merge_scope: Option<MergeScope>,
    pub merge_policy: Option<MergePolicy>,
    pub collision: Option<CollisionPolicy>,
    /// Default verbosity mode.
    pub verbosity: Option<VerbositySetting>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
}

impl FileConfig {
    /// Validates config values against runtime and CLI constraints.
    pub fn validate(&self) -> Result<()> {
        if let Some(concurrency) = self.concurrency
            && !(1..=64).contains(&concurrency)
        {
            bail!("Invalid config value for `concurrency`: {concurrency}. Expected range: 1..=64");
        }
        if let Some(max_retries) = self.max_retries
            && !(1..=10).contains(&max_retries)
        {
            bail!("Invalid config value for `max_retries`: {max_retries}. Expected range: 1..=10");
        }
        if let Some(api_url) = self.api_url.as_deref()
            && !(api_url.starts_with("http://") || api_url.starts_with("https://"))
        {
            bail!("Invalid config value for `api_url`: '{api_url}'. Expected an http(s) URL");
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        Ok(())
    }
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// Supported config verbosity labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbositySetting {
    Default,
    Verbose,
    Quiet,
    Debug,
}

impl VerbositySetting {
    /// Returns the stable string label for display output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Verbose => "verbose",
            Self::Quiet => "quiet",
            Self::Debug => "debug",
        }
    }

    fn log_level(self) -> &'static str {
        match self {
            Self::Default => "info",
            Self::Verbose => "debug",
            Self::Quiet => "error",
            Self::Debug => "trace",
        }
    }
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/canvas-dl/config.toml`
/// 2. `$HOME/.config/canvas-dl/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join(CONFIG_DIR_NAME)
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(CONFIG_DIR_NAME)
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from the default path if present.
pub fn load_default_file_config() -> Result<LoadedConfig> {
    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(path_ref) if path_ref.exists() => Some(load_file_config(path_ref)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let context = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "api_url" => {
                let parsed = parse_string_literal(value).with_context(context)?;
                cfg.api_url = Some(parsed.trim_end_matches('/').to_string());
            }
            "access_token" => {
                cfg.access_token = Some(parse_string_literal(value).with_context(context)?);
            }
            "output_dir" => {
                let parsed = parse_string_literal(value).with_context(context)?;
                cfg.output_dir = Some(PathBuf::from(parsed));
            }
            "concurrency" => {
                cfg.concurrency = Some(parse_integer_u8(value).with_context(context)?);
            }
            "max_retries" => {
                cfg.max_retries = Some(parse_integer_u8(value).with_context(context)?);
            }
            "merge" => {
                cfg.merge = Some(parse_boolean(value).with_context(context)?);
            }
            "merge_scope" => {
                let parsed = parse_string_literal(value).with_context(context)?;
                cfg.merge_scope = Some(
                    parsed
                        .parse::<MergeScope>()
                        .map_err(anyhow::Error::msg)
                        .with_context(context)?,
                );
            }
            "merge_policy" => {
                let parsed = parse_string_literal(value).with_context(context)?;
                cfg.merge_policy = Some(
                    parsed
                        .parse::<MergePolicy>()
                        .map_err(anyhow::Error::msg)
                        .with_context(context)?,
                );
            }
            "collision" => {
                let parsed = parse_string_literal(value).with_context(context)?;
                cfg.collision = Some(
                    parsed
                        .parse::<CollisionPolicy>()
                        .map_err(anyhow::Error::msg)
                        .with_context(context)?,
                );
            }
            "verbosity" => {
                let parsed = parse_string_literal(value).with_context(context)?;
                cfg.verbosity = Some(parse_verbosity(&parsed).with_context(|| {
                    format!("Invalid `verbosity` value '{parsed}' on line {line_no}")
                })?);
            }
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u8(raw_value: &str) -> Result<u8> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<u16>()?;
    u8::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u8"))
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_verbosity(value: &str) -> Result<VerbositySetting> {
    match value {
        "default" => Ok(VerbositySetting::Default),
        "verbose" => Ok(VerbositySetting::Verbose),
        "quiet" => Ok(VerbositySetting::Quiet),
        "debug" => Ok(VerbositySetting::Debug),
        _ => bail!("Expected one of: default, verbose, quiet, debug"),
    }
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Effective settings after layering CLI > environment > config file > defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_url: String,
    pub output_dir: PathBuf,
    pub concurrency: usize,
    pub max_retries: u32,
    pub merge: bool,
    pub merge_scope: MergeScope,
    pub merge_policy: MergePolicy,
    pub collision: CollisionPolicy,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub log_level: &'static str,
    token_flag: Option<String>,
    token_config: Option<String>,
}

impl Settings {
    /// Layers the sources. `env` is injected so tests control the lookup.
    pub fn resolve<F>(cli: &Cli, env: F, file: Option<&FileConfig>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let empty = FileConfig::default();
        let file = file.unwrap_or(&empty);
        let download: Option<&DownloadArgs> = match &cli.command {
            Command::Download(args) => Some(args),
            Command::Courses(_) | Command::Config => None,
        };

        let api_url = cli
            .api_url
            .clone()
            .or_else(|| env("API_URL").filter(|v| !v.trim().is_empty()))
            .or_else(|| file.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let env_concurrency = match env("CANVAS_DL_CONCURRENCY").filter(|v| !v.trim().is_empty()) {
            Some(raw) => {
                let value: u8 = raw.trim().parse().with_context(|| {
                    format!("Invalid CANVAS_DL_CONCURRENCY value '{raw}'")
                })?;
                if !(1..=64).contains(&value) {
                    bail!("Invalid CANVAS_DL_CONCURRENCY value {value}. Expected range: 1..=64");
                }
                Some(value)
            }
            None => None,
        };
        let concurrency = download
            .and_then(|d| d.concurrency)
            .or(env_concurrency)
            .or(file.concurrency)
            .map_or(DEFAULT_CONCURRENCY, usize::from);

        let max_retries = download
            .and_then(|d| d.max_retries)
            .or(file.max_retries)
            .map_or(DEFAULT_MAX_RETRIES, u32::from);

        let merge = if download.is_some_and(|d| d.no_merge) {
            false
        } else {
            file.merge.unwrap_or(true)
        };
        let merge_scope = download
            .and_then(|d| d.merge_scope)
            .map(MergeScope::from)
            .or(file.merge_scope)
            .unwrap_or_default();
        let merge_policy = if download.is_some_and(|d| d.replace_originals) {
            MergePolicy::Replace
        } else {
            file.merge_policy.unwrap_or_default()
        };
        let collision = download
            .and_then(|d| d.collision)
            .map(CollisionPolicy::from)
            .or(file.collision)
            .unwrap_or_default();

        let output_dir = download
            .and_then(|d| d.dest.clone())
            .or_else(|| file.output_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."));

        let log_level = if cli.quiet {
            "error"
        } else if cli.verbose > 0 {
            if cli.verbose == 1 { "debug" } else { "trace" }
        } else if env("CANVAS_DL_VERBOSE").is_some_and(|v| is_truthy(&v)) {
            "debug"
        } else {
            file.verbosity.map_or("info", VerbositySetting::log_level)
        };

        Ok(Self {
            api_url,
            output_dir,
            concurrency,
            max_retries,
            merge,
            merge_scope,
            merge_policy,
            collision,
            connect_timeout_secs: file.connect_timeout_secs.unwrap_or(CONNECT_TIMEOUT_SECS),
            read_timeout_secs: file.read_timeout_secs.unwrap_or(READ_TIMEOUT_SECS),
            log_level,
            token_flag: cli.token.clone(),
            token_config: file.access_token.clone(),
        })
    }

    /// Resolves the access token: flag, then environment, then config file.
    pub fn token<F>(&self, env: F) -> Result<AccessToken>
    where
        F: Fn(&str) -> Option<String>,
    {
        AccessToken::resolve(
            self.token_flag.as_deref(),
            env,
            self.token_config.as_deref(),
        )
        .context("No access token configured; pass --token, set ACCESS_TOKEN, or add access_token to the config file")
    }

    /// `key = value` lines describing the effective configuration.
    pub fn render<F>(&self, env: F, config_path: Option<&Path>) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = self
            .token(env)
            .map_or_else(|_| "(not set)".to_string(), |t| t.masked());
        let config = config_path.map_or_else(
            || "(no config directory)".to_string(),
            |p| p.display().to_string(),
        );
        format!(
            "config_file = \"{config}\"\n\
             api_url = \"{}\"\n\
             access_token = \"{token}\"\n\
             output_dir = \"{}\"\n\
             concurrency = {}\n\
             max_retries = {}\n\
             merge = {}\n\
             merge_scope = \"{:?}\"\n\
             merge_policy = \"{:?}\"\n\
             collision = \"{:?}\"\n\
             connect_timeout_secs = {}\n\
             read_timeout_secs = {}\n\
             log_level = \"{}\"\n",
            self.api_url,
            self.output_dir.display(),
            self.concurrency,
            self.max_retries,
            self.merge,
            self.merge_scope,
            self.merge_policy,
            self.collision,
            self.connect_timeout_secs,
            self.read_timeout_secs,
            self.log_level,
        )
    }
}
