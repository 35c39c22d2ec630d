//! Runtime configuration
//!
//! `MtConfig` is read from a TOML file, from `METATRACE_*` environment
//! variables, or built up in code. Every key is optional:
//!
//! ```toml
//! hot-threshold = 50
//! synchronous-compile = false
//! print-jitstate = false
//! print-ir = ["pre-trace-ir", "pre-optimization-ir"]
//! max-trace-len = 10000
//! ```

use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

pub const DEFAULT_HOT_THRESHOLD: u32 = 50;
pub const DEFAULT_MAX_TRACE_LEN: usize = 10_000;

pub const ENV_HOT_THRESHOLD: &str = "METATRACE_HOT_THRESHOLD";
pub const ENV_SERIALISE_COMPILATION: &str = "METATRACE_SERIALISE_COMPILATION";
pub const ENV_PRINT_JITSTATE: &str = "METATRACE_PRINT_JITSTATE";
pub const ENV_PRINT_IR: &str = "METATRACE_PRINT_IR";
pub const ENV_MAX_TRACE_LEN: &str = "METATRACE_MAX_TRACE_LEN";

/// Points in the pipeline at which IR can be dumped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum IrStage {
    /// The recorded trace, before it is handed to the compiler.
    #[serde(rename = "pre-trace-ir")]
    PreTrace,
    /// Backend IR as generated from the trace, before optimisation.
    #[serde(rename = "pre-optimization-ir")]
    PreOptimization,
}

impl IrStage {
    pub const ALL: [IrStage; 2] = [IrStage::PreTrace, IrStage::PreOptimization];

    pub fn name(&self) -> &'static str {
        match self {
            IrStage::PreTrace => "pre-trace-ir",
            IrStage::PreOptimization => "pre-optimization-ir",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for IrStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IrStage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IrStage::ALL
            .into_iter()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "print-ir",
                value: s.to_string(),
                reason: "expected pre-trace-ir or pre-optimization-ir",
            })
    }
}

/// A set of IR stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrStages(u8);

impl IrStages {
    pub fn none() -> Self {
        IrStages(0)
    }

    pub fn contains(&self, stage: IrStage) -> bool {
        self.0 & stage.bit() != 0
    }

    pub fn insert(&mut self, stage: IrStage) {
        self.0 |= stage.bit();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Parse a comma separated stage list such as `pre-trace-ir,pre-optimization-ir`.
    pub fn parse_list(s: &str) -> Result<Self, ConfigError> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(IrStage::from_str)
            .collect()
    }
}

impl FromIterator<IrStage> for IrStages {
    fn from_iter<I: IntoIterator<Item = IrStage>>(iter: I) -> Self {
        let mut set = IrStages::none();
        for stage in iter {
            set.insert(stage);
        }
        set
    }
}

impl<'de> Deserialize<'de> for IrStages {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let stages = Vec::<IrStage>::deserialize(deserializer)?;
        Ok(stages.into_iter().collect())
    }
}

/// Errors raised while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Toml(toml::de::Error),
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read configuration: {}", e),
            ConfigError::Toml(e) => write!(f, "invalid configuration: {}", e),
            ConfigError::InvalidValue { key, value, reason } => {
                write!(f, "invalid value {:?} for {}: {}", value, key, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Toml(e) => Some(e),
            ConfigError::InvalidValue { .. } => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Toml(e)
    }
}

/// Settings of one meta-tracing coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct MtConfig {
    /// Control-point visits a Location counts before tracing starts.
    pub hot_threshold: u32,
    /// Compile closed traces on the control-point thread instead of the pool.
    pub synchronous_compile: bool,
    /// Emit `jit-state:` lifecycle events.
    pub print_jitstate: bool,
    pub print_ir: IrStages,
    /// Longest trace, in ops, before recording is abandoned.
    pub max_trace_len: usize,
}

impl Default for MtConfig {
    fn default() -> Self {
        MtConfig {
            hot_threshold: DEFAULT_HOT_THRESHOLD,
            synchronous_compile: false,
            print_jitstate: false,
            print_ir: IrStages::none(),
            max_trace_len: DEFAULT_MAX_TRACE_LEN,
        }
    }
}

impl MtConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.merge_env()?;
        Ok(config)
    }

    /// Override fields from the process environment.
    pub fn merge_env(&mut self) -> Result<(), ConfigError> {
        self.merge_vars(|key| std::env::var(key).ok())
    }

    /// Override fields from `lookup`, which maps variable names to values.
    pub fn merge_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_HOT_THRESHOLD) {
            self.hot_threshold = v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_HOT_THRESHOLD,
                value: v.clone(),
                reason: "expected an unsigned 32-bit integer",
            })?;
        }
        if let Some(v) = lookup(ENV_SERIALISE_COMPILATION) {
            self.synchronous_compile = parse_flag(ENV_SERIALISE_COMPILATION, &v)?;
        }
        if let Some(v) = lookup(ENV_PRINT_JITSTATE) {
            self.print_jitstate = parse_flag(ENV_PRINT_JITSTATE, &v)?;
        }
        if let Some(v) = lookup(ENV_PRINT_IR) {
            self.print_ir = IrStages::parse_list(&v)?;
        }
        if let Some(v) = lookup(ENV_MAX_TRACE_LEN) {
            self.max_trace_len = v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_MAX_TRACE_LEN,
                value: v.clone(),
                reason: "expected an unsigned integer",
            })?;
        }
        Ok(())
    }

    pub fn with_hot_threshold(mut self, threshold: u32) -> Self {
        self.hot_threshold = threshold;
        self
    }

    pub fn with_synchronous_compile(mut self, enabled: bool) -> Self {
        self.synchronous_compile = enabled;
        self
    }

    pub fn with_print_jitstate(mut self, enabled: bool) -> Self {
        self.print_jitstate = enabled;
        self
    }

    pub fn with_print_ir(mut self, stages: IrStages) -> Self {
        self.print_ir = stages;
        self
    }

    pub fn with_max_trace_len(mut self, len: usize) -> Self {
        self.max_trace_len = len;
        self
    }
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "expected 0/1 or true/false",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = MtConfig::default();
        assert_eq!(config.hot_threshold, 50);
        assert!(!config.synchronous_compile);
        assert!(!config.print_jitstate);
        assert!(config.print_ir.is_empty());
        assert_eq!(config.max_trace_len, 10_000);
    }

    #[test]
    fn test_parse_full_toml() {
        let config = MtConfig::from_toml_str(
            r#"
            hot-threshold = 3
            synchronous-compile = true
            print-jitstate = true
            print-ir = ["pre-trace-ir", "pre-optimization-ir"]
            max-trace-len = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.hot_threshold, 3);
        assert!(config.synchronous_compile);
        assert!(config.print_jitstate);
        assert!(config.print_ir.contains(IrStage::PreTrace));
        assert!(config.print_ir.contains(IrStage::PreOptimization));
        assert_eq!(config.max_trace_len, 64);
    }

    #[test]
    fn test_parse_partial_toml_keeps_defaults() {
        let config = MtConfig::from_toml_str("print-jitstate = true").unwrap();
        assert!(config.print_jitstate);
        assert_eq!(config.hot_threshold, DEFAULT_HOT_THRESHOLD);
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(matches!(
            MtConfig::from_toml_str("hot-threshold = \"many\""),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            MtConfig::from_toml_str("print-ir = [\"post-everything\"]"),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            MtConfig::from_toml_str("hot_threshold = 1"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let err = MtConfig::load(Path::new("/nonexistent/metatrace.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = MtConfig::default();
        config
            .merge_vars(vars(&[
                (ENV_HOT_THRESHOLD, "0"),
                (ENV_SERIALISE_COMPILATION, "1"),
                (ENV_PRINT_JITSTATE, "true"),
                (ENV_PRINT_IR, "pre-trace-ir, pre-optimization-ir"),
            ]))
            .unwrap();
        assert_eq!(config.hot_threshold, 0);
        assert!(config.synchronous_compile);
        assert!(config.print_jitstate);
        assert!(config.print_ir.contains(IrStage::PreTrace));
        assert!(config.print_ir.contains(IrStage::PreOptimization));
        assert_eq!(config.max_trace_len, DEFAULT_MAX_TRACE_LEN);
    }

    #[test]
    fn test_env_rejects_bad_values() {
        let mut config = MtConfig::default();
        let err = config
            .merge_vars(vars(&[(ENV_HOT_THRESHOLD, "-1")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: ENV_HOT_THRESHOLD, .. }));

        let err = config
            .merge_vars(vars(&[(ENV_PRINT_JITSTATE, "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("maybe"));

        assert!(config.merge_vars(vars(&[(ENV_PRINT_IR, "llvm")])).is_err());
    }

    #[test]
    fn test_stage_names_round_trip() {
        for stage in IrStage::ALL {
            assert_eq!(stage.name().parse::<IrStage>().unwrap(), stage);
        }
        assert_eq!(IrStages::parse_list("").unwrap(), IrStages::none());
    }
}
