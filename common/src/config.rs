use std::env;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Process-wide configuration, read once from the environment at startup and
/// handed to the owners that need it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host the browser exposes its debug endpoint on.
    pub debug_host: String,
    /// Remote debugging port used for discovery and launch.
    pub debug_port: u16,
    /// Launch the browser on demand when discovery fails.
    pub auto_launch: bool,
    /// Override path to the browser executable.
    pub chrome_path: Option<String>,
    /// URL opened when we auto-launch the browser.
    pub launch_url: Option<String>,
    /// Connect directly to this DevTools WebSocket URL, bypassing discovery
    /// and auto-launch.
    pub ws_url: Option<String>,
    pub console_buffer: usize,
    pub network_buffer: usize,
    /// Per managed-process log capacity.
    pub server_log_buffer: usize,
    /// Base port for the annotation service; +1..+3 tried on conflict.
    pub annotation_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug_host: "localhost".to_string(),
            debug_port: 9222,
            auto_launch: true,
            chrome_path: None,
            launch_url: None,
            ws_url: None,
            console_buffer: 500,
            network_buffer: 200,
            server_log_buffer: 1000,
            annotation_port: 9223,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();
        Ok(Self {
            debug_host: string_var("PAGEBRIDGE_DEBUG_HOST").unwrap_or(defaults.debug_host),
            debug_port: parsed_var("PAGEBRIDGE_DEBUG_PORT")?.unwrap_or(defaults.debug_port),
            auto_launch: bool_var("PAGEBRIDGE_AUTO_LAUNCH")?.unwrap_or(defaults.auto_launch),
            chrome_path: string_var("PAGEBRIDGE_CHROME_PATH"),
            launch_url: string_var("PAGEBRIDGE_LAUNCH_URL"),
            ws_url: string_var("PAGEBRIDGE_WS_URL"),
            console_buffer: parsed_var("PAGEBRIDGE_CONSOLE_BUFFER")?
                .unwrap_or(defaults.console_buffer),
            network_buffer: parsed_var("PAGEBRIDGE_NETWORK_BUFFER")?
                .unwrap_or(defaults.network_buffer),
            server_log_buffer: parsed_var("PAGEBRIDGE_SERVER_LOG_BUFFER")?
                .unwrap_or(defaults.server_log_buffer),
            annotation_port: parsed_var("PAGEBRIDGE_ANNOTATION_PORT")?
                .unwrap_or(defaults.annotation_port),
        })
    }
}

fn string_var(var: &'static str) -> Option<String> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn parsed_var<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match string_var(var) {
        None => Ok(None),
        Some(value) => value.trim().parse::<T>().map(Some).map_err(|e| {
            ConfigError::InvalidValue {
                var,
                value,
                reason: e.to_string(),
            }
        }),
    }
}

fn bool_var(var: &'static str) -> Result<Option<bool>, ConfigError> {
    match string_var(var) {
        None => Ok(None),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                var,
                value,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.debug_host, "localhost");
        assert_eq!(config.debug_port, 9222);
        assert!(config.auto_launch);
        assert_eq!(config.console_buffer, 500);
        assert_eq!(config.network_buffer, 200);
        assert_eq!(config.server_log_buffer, 1000);
        assert_eq!(config.annotation_port, 9223);
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        for (input, expected) in [
            ("1", true),
            ("true", true),
            ("YES", true),
            ("0", false),
            ("False", false),
            ("no", false),
        ] {
            unsafe { env::set_var("PAGEBRIDGE_TEST_BOOL", input) };
            // bool_var reads through string_var, so drive it via the env.
            let parsed = bool_var("PAGEBRIDGE_TEST_BOOL").unwrap();
            assert_eq!(parsed, Some(expected), "input {input:?}");
        }
        unsafe { env::remove_var("PAGEBRIDGE_TEST_BOOL") };
    }

    #[test]
    fn bad_numeric_value_is_an_error() {
        unsafe { env::set_var("PAGEBRIDGE_TEST_PORT", "not-a-port") };
        let result: Result<Option<u16>, _> = parsed_var("PAGEBRIDGE_TEST_PORT");
        assert!(result.is_err());
        unsafe { env::remove_var("PAGEBRIDGE_TEST_PORT") };
    }
}
