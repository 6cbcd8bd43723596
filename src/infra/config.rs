use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    cli::{AppContext, InitArgs},
    core::{apply_engine::ApplyOptions, errors::EngineError},
};

/// Files searched in the working directory when `--config` is not given
const CONFIG_FILES: [&str; 2] = ["tagsafe.toml", ".tagsafe.toml"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config
{
    /// Appended to a file name to form its backup name
    pub backup_suffix: String,

    /// Where reports and state.json live (`~` is expanded)
    pub state_dir: String,

    /// Context lines in unified diffs
    pub diff_context_lines: usize,

    pub apply: ApplyConfig,

    pub generator: GeneratorConfig,

    pub scan: ScanConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig
{
    pub skip_if_already_tagged: bool,
    pub workers: usize,
    /// 0 disables the deadline
    pub generator_timeout_secs: u64,
    pub verify_with_generator: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig
{
    /// External program speaking the JSON generator protocol
    pub command: Option<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig
{
    /// Directory globs pruned from backup scans
    pub ignore: Vec<String>,
}

impl Default for Config
{
    fn default() -> Self
    {
        Self {
            backup_suffix: ".taggingai.bak".to_string(),
            state_dir: ".tagsafe".to_string(),
            diff_context_lines: 3,
            apply: ApplyConfig::default(),
            generator: GeneratorConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl Default for ApplyConfig
{
    fn default() -> Self
    {
        Self {
            skip_if_already_tagged: true,
            workers: 1,
            generator_timeout_secs: 60,
            verify_with_generator: true,
        }
    }
}

impl Default for ScanConfig
{
    fn default() -> Self
    {
        Self {
            ignore: vec!["**/.git".to_string(), "**/node_modules".to_string()],
        }
    }
}

impl Config
{
    /// Reject settings that would make a run unsafe before touching any repo.
    pub fn validate(&self) -> Result<(), EngineError>
    {
        let suffix = &self.backup_suffix;
        if suffix.trim().is_empty()
        {
            return Err(EngineError::Configuration("backup_suffix must not be empty".into()));
        }
        if suffix.contains('/') || suffix.contains('\\')
        {
            return Err(EngineError::Configuration(format!(
                "backup_suffix {suffix:?} must not contain path separators"
            )));
        }
        if self
            .apply
            .workers
            == 0
        {
            return Err(EngineError::Configuration("apply.workers must be at least 1".into()));
        }
        if self.diff_context_lines > 1000
        {
            return Err(EngineError::Configuration(format!(
                "diff_context_lines {} is out of range (0..=1000)",
                self.diff_context_lines
            )));
        }
        for glob in &self
            .scan
            .ignore
        {
            globset::Glob::new(glob)
                .map_err(|e| EngineError::Configuration(format!("scan.ignore {glob:?}: {e}")))?;
        }
        Ok(())
    }

    pub fn state_dir_path(&self) -> PathBuf
    {
        PathBuf::from(shellexpand::tilde(&self.state_dir).as_ref())
    }

    pub fn generator_timeout(&self) -> Option<Duration>
    {
        match self
            .apply
            .generator_timeout_secs
        {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn apply_options(
        &self,
        dry_run: bool,
    ) -> ApplyOptions
    {
        ApplyOptions {
            dry_run,
            skip_if_already_tagged: self
                .apply
                .skip_if_already_tagged,
            workers: self
                .apply
                .workers,
            generator_timeout: self.generator_timeout(),
            verify_with_generator: self
                .apply
                .verify_with_generator,
            context_lines: self.diff_context_lines,
        }
    }
}

/// Load layered configuration: file (explicit or discovered), then
/// `TAGSAFE__SECTION__KEY` environment variables. Validated before return.
pub fn load_config(explicit: Option<&Path>) -> Result<Config>
{
    let mut builder = config::Config::builder();

    match explicit
    {
        Some(path) =>
        {
            if !path.exists()
            {
                return Err(EngineError::Configuration(format!(
                    "config file not found: {}",
                    path.display()
                ))
                .into());
            }
            builder = builder.add_source(config::File::from(path));
        }
        None =>
        {
            if let Some(found) = CONFIG_FILES
                .iter()
                .map(Path::new)
                .find(|p| p.exists())
            {
                builder = builder.add_source(config::File::from(found));
            }
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TAGSAFE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("scan.ignore")
            .with_list_parse_key("generator.args"),
    );

    let cfg = builder
        .build()
        .context("Failed to load configuration")?;
    let parsed: Config = cfg
        .try_deserialize()
        .context("Failed to parse configuration")?;
    parsed.validate()?;

    Ok(parsed)
}

pub fn init(
    args: InitArgs,
    ctx: &AppContext,
) -> Result<()>
{
    let config_path = args
        .path
        .join("tagsafe.toml");

    if config_path.exists() && !args.force
    {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    let config = Config::default();
    let toml_string =
        toml::to_string_pretty(&config).context("Failed to serialize default config")?;

    if ctx.dry_run
    {
        println!("{toml_string}");
        return Ok(());
    }

    std::fs::write(&config_path, toml_string).context("Failed to write config file")?;

    if !ctx.quiet
    {
        println!("Created config file at {}", config_path.display());
    }
    Ok(())
}
