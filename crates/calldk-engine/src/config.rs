use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use calldk_contracts::events::HandoffJournal;

use crate::handoff::{DialogCommand, DialogLauncher};
use crate::optimizer::OptimizerSettings;

/// Key/value lookup over the process environment with a `.env` file beneath
/// it. Values are trimmed and blank values count as unset.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    use_process_env: bool,
    dotenv: HashMap<String, String>,
}

impl ConfigSource {
    /// Process environment plus `<dir>/.env` when present. An `.env` that
    /// exists but cannot be read is an error.
    pub fn load(dir: &Path) -> Result<Self> {
        let env_path = dir.join(".env");
        let dotenv = if env_path.is_file() {
            tracing::debug!(path = %env_path.display(), "loading .env");
            let content = std::fs::read_to_string(&env_path)
                .with_context(|| format!("failed reading {}", env_path.display()))?;
            parse_dotenv(&content)
        } else {
            HashMap::new()
        };
        Ok(Self {
            use_process_env: true,
            dotenv,
        })
    }

    /// Fixed values only; the process environment is ignored.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            use_process_env: false,
            dotenv: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if self.use_process_env {
            if let Ok(value) = env::var(key) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
        self.dotenv
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    pub fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.get(key))
    }

    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64> {
        match self.get(key) {
            Some(raw) => raw
                .parse::<f64>()
                .with_context(|| format!("invalid {key}: {raw:?} is not a number")),
            None => Ok(default),
        }
    }

    pub fn u64_or(&self, key: &str, default: u64) -> Result<u64> {
        match self.get(key) {
            Some(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("invalid {key}: {raw:?} is not a non-negative integer")),
            None => Ok(default),
        }
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get(key)
            .map(|raw| raw.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn seconds(&self, key: &str) -> Result<Option<Duration>> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        let secs = raw
            .parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .with_context(|| format!("invalid {key}: {raw:?} is not a positive number of seconds"))?;
        let duration = Duration::try_from_secs_f64(secs)
            .with_context(|| format!("invalid {key}: {raw:?} seconds is out of range"))?;
        Ok(Some(duration))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DialogSettings {
    pub command: Option<String>,
    pub timeout: Option<Duration>,
    pub temp_dir: Option<PathBuf>,
    pub journal_path: Option<PathBuf>,
}

impl DialogSettings {
    pub fn from_source(source: &ConfigSource) -> Result<Self> {
        Ok(Self {
            command: source.get("CALLDK_DIALOG_COMMAND"),
            timeout: source.seconds("CALLDK_DIALOG_TIMEOUT")?,
            temp_dir: source.get("CALLDK_TEMP_DIR").map(PathBuf::from),
            journal_path: source.get("CALLDK_EVENTS").map(PathBuf::from),
        })
    }

    pub fn launcher(&self) -> Result<DialogLauncher> {
        let command = match self.command.as_deref() {
            Some(raw) => DialogCommand::parse(raw)
                .with_context(|| format!("invalid CALLDK_DIALOG_COMMAND: {raw:?}"))?,
            None => DialogCommand::current_exe()
                .context("cannot locate the running executable for the dialog frontend")?,
        };
        let mut launcher = DialogLauncher::new(command)
            .with_timeout(self.timeout)
            .with_journal(self.journal_path.as_ref().map(HandoffJournal::new));
        if let Some(dir) = &self.temp_dir {
            launcher = launcher.with_temp_dir(dir);
        }
        Ok(launcher)
    }
}

pub fn optimizer_settings(source: &ConfigSource) -> Result<OptimizerSettings> {
    let defaults = OptimizerSettings::default();
    Ok(OptimizerSettings {
        api_key: source.first(&["GEMINI_API_KEY", "GOOGLE_API_KEY"]),
        api_base: source
            .get("GEMINI_API_BASE")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_base),
        model: source.get("GEMINI_MODEL").unwrap_or(defaults.model),
        temperature: source.f64_or("GEMINI_TEMPERATURE", defaults.temperature)?,
        top_p: source.f64_or("GEMINI_TOP_P", defaults.top_p)?,
        max_output_tokens: source.u64_or("GEMINI_MAX_TOKENS", defaults.max_output_tokens)?,
        thinking_budget: source.u64_or("GEMINI_THINKING_BUDGET", defaults.thinking_budget)?,
        include_thoughts: source.flag("GEMINI_INCLUDE_THOUGHTS"),
        system_instruction: source
            .get("GEMINI_SYSTEM_INSTRUCTION")
            .unwrap_or(defaults.system_instruction),
        request_timeout: source
            .seconds("GEMINI_REQUEST_TIMEOUT")?
            .unwrap_or(defaults.request_timeout),
    })
}

/// Everything the binary reads at start-up.
#[derive(Debug, Clone)]
pub struct Settings {
    pub optimizer: OptimizerSettings,
    pub dialog: DialogSettings,
}

impl Settings {
    pub fn from_source(source: &ConfigSource) -> Result<Self> {
        Ok(Self {
            optimizer: optimizer_settings(source)?,
            dialog: DialogSettings::from_source(source)?,
        })
    }

    /// Environment plus `.env` from the working directory.
    pub fn load() -> Result<Self> {
        let cwd = env::current_dir().context("cannot read the working directory")?;
        Self::from_source(&ConfigSource::load(&cwd)?)
    }
}

pub fn parse_dotenv(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for raw_line in content.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(stripped) = line.strip_prefix("export ") {
            line = stripped.trim();
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim().to_string();
        if value.len() >= 2 {
            let bytes = value.as_bytes();
            if (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
                || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
            {
                value = value[1..value.len() - 1].to_string();
            }
        }
        vars.insert(key.to_string(), value);
    }
    vars
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::{optimizer_settings, parse_dotenv, ConfigSource, DialogSettings, Settings};
    use crate::optimizer::OptimizerSettings;

    #[test]
    fn dotenv_handles_comments_exports_and_quotes() {
        let vars = parse_dotenv(
            "# optimizer\nexport GEMINI_API_KEY=\"abc\"\nGEMINI_MODEL='gemini-pro'\n\nnoise\n=skip\nGEMINI_TOP_P = 0.5\n",
        );
        assert_eq!(vars.get("GEMINI_API_KEY").map(String::as_str), Some("abc"));
        assert_eq!(vars.get("GEMINI_MODEL").map(String::as_str), Some("gemini-pro"));
        assert_eq!(vars.get("GEMINI_TOP_P").map(String::as_str), Some("0.5"));
        assert_eq!(vars.len(), 3);
    }

    #[test]
    fn dotenv_file_is_read_from_directory() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        std::fs::write(
            temp.path().join(".env"),
            "CALLDK_TEST_ONLY_DOTENV_KEY=from-file\n",
        )?;
        let source = ConfigSource::load(temp.path())?;
        assert_eq!(
            source.get("CALLDK_TEST_ONLY_DOTENV_KEY").as_deref(),
            Some("from-file")
        );
        Ok(())
    }

    #[test]
    fn optimizer_defaults_apply_when_unset() -> anyhow::Result<()> {
        let settings = optimizer_settings(&ConfigSource::from_pairs(Vec::<(String, String)>::new()))?;
        assert_eq!(settings, OptimizerSettings::default());
        assert_eq!(settings.model, "gemini-2.5-flash");
        assert_eq!(settings.max_output_tokens, 1000);
        assert_eq!(settings.thinking_budget, 512);
        assert!(!settings.include_thoughts);
        Ok(())
    }

    #[test]
    fn optimizer_values_are_read_and_typed() -> anyhow::Result<()> {
        let source = ConfigSource::from_pairs([
            ("GOOGLE_API_KEY", "fallback-key"),
            ("GEMINI_MODEL", "gemini-test"),
            ("GEMINI_TEMPERATURE", "0.7"),
            ("GEMINI_TOP_P", "0.95"),
            ("GEMINI_MAX_TOKENS", "2048"),
            ("GEMINI_THINKING_BUDGET", "0"),
            ("GEMINI_INCLUDE_THOUGHTS", "TRUE"),
            ("GEMINI_SYSTEM_INSTRUCTION", "rewrite tersely"),
            ("GEMINI_API_BASE", "https://proxy.test/v1beta/"),
            ("GEMINI_REQUEST_TIMEOUT", "5"),
        ]);
        let settings = optimizer_settings(&source)?;
        assert_eq!(settings.api_key.as_deref(), Some("fallback-key"));
        assert_eq!(settings.model, "gemini-test");
        assert_eq!(settings.temperature, 0.7);
        assert_eq!(settings.top_p, 0.95);
        assert_eq!(settings.max_output_tokens, 2048);
        assert_eq!(settings.thinking_budget, 0);
        assert!(settings.include_thoughts);
        assert_eq!(settings.system_instruction, "rewrite tersely");
        assert_eq!(settings.api_base, "https://proxy.test/v1beta");
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let source = ConfigSource::from_pairs([("GEMINI_TEMPERATURE", "warm")]);
        let err = optimizer_settings(&source).unwrap_err();
        assert!(format!("{err:#}").contains("GEMINI_TEMPERATURE"));

        let source = ConfigSource::from_pairs([("CALLDK_DIALOG_TIMEOUT", "-3")]);
        assert!(DialogSettings::from_source(&source).is_err());
    }

    #[test]
    fn oversized_durations_are_errors() {
        for key in ["CALLDK_DIALOG_TIMEOUT", "GEMINI_REQUEST_TIMEOUT"] {
            for raw in ["1e20", "inf"] {
                let source = ConfigSource::from_pairs([(key, raw)]);
                let err = Settings::from_source(&source).unwrap_err();
                assert!(format!("{err:#}").contains(key), "{key}={raw}: {err:#}");
            }
        }
    }

    #[test]
    fn unreadable_dotenv_is_an_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        std::fs::write(temp.path().join(".env"), [0xff, 0xfe, b'=', 0x80])?;
        let err = ConfigSource::load(temp.path()).unwrap_err();
        assert!(format!("{err:#}").contains(".env"), "{err:#}");
        Ok(())
    }

    #[test]
    fn dialog_settings_build_launcher() -> anyhow::Result<()> {
        let source = ConfigSource::from_pairs([
            ("CALLDK_DIALOG_COMMAND", "python3 -u dialog.py"),
            ("CALLDK_DIALOG_TIMEOUT", "1.5"),
            ("CALLDK_TEMP_DIR", "/tmp/calldk"),
            ("CALLDK_EVENTS", "/tmp/calldk/handoffs.jsonl"),
        ]);
        let settings = Settings::from_source(&source)?;
        assert_eq!(settings.dialog.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(settings.dialog.temp_dir, Some(PathBuf::from("/tmp/calldk")));

        let launcher = settings.dialog.launcher()?;
        assert_eq!(launcher.command().program().to_string_lossy(), "python3");
        assert_eq!(launcher.command().args().len(), 2);
        Ok(())
    }

    #[test]
    fn blank_values_count_as_unset() {
        let source = ConfigSource::from_pairs([("GEMINI_MODEL", "   ")]);
        assert_eq!(source.get("GEMINI_MODEL"), None);
    }
}
