//! JIT parameters.
//!
//! The recognised parameters mirror what a host exposes to its users:
//! `threshold`, `trace_eagerness`, `trace_limit`, `inlining`, `optimizer`
//! and `loop_longevity`. They can be set one by one with
//! [`JitConfig::set_param`] or from a comma-separated `name=value` string
//! with [`JitConfig::set_user_param`], which also understands `off` and
//! `default`.

use super::error::ConfigError;
use std::fmt;
use std::str::FromStr;

/// Counter value a call site has to cross before tracing starts.
pub const THRESHOLD_LIMIT: u64 = (i64::MAX / 2) as u64;

/// Largest threshold a fixed increment can count exactly: `t * (t - 1)`
/// must stay below [`THRESHOLD_LIMIT`].
pub const MAX_THRESHOLD: i64 = 1 << 30;

/// Which optimizer pipeline traces go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizerLevel {
    /// Pass-through, no preamble peeling.
    Simple,
    /// Full pipeline without perfect specialization of loops.
    NoPerfectSpecialization,
    #[default]
    Full,
}

impl OptimizerLevel {
    pub fn name(self) -> &'static str {
        match self {
            OptimizerLevel::Simple => "simple",
            OptimizerLevel::NoPerfectSpecialization => "nopspec",
            OptimizerLevel::Full => "full",
        }
    }
}

impl FromStr for OptimizerLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(OptimizerLevel::Simple),
            "nopspec" | "no-perfect-specialization" => Ok(OptimizerLevel::NoPerfectSpecialization),
            "full" => Ok(OptimizerLevel::Full),
            _ => Err(ConfigError::UnknownOptimizer { name: s.to_string() }),
        }
    }
}

impl fmt::Display for OptimizerLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tunable JIT parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct JitConfig {
    /// Number of calls before a call site starts tracing; `<= 0` never traces.
    pub threshold: i64,
    /// Number of failures of a guard before a bridge is compiled from it.
    pub trace_eagerness: u32,
    /// Maximum number of recorded operations in one trace.
    pub trace_limit: usize,
    /// Whether the tracer may inline calls to other portals.
    pub inlining: bool,
    pub optimizer: OptimizerLevel,
    /// Generations a procedure may stay unused before it is freed; `0` keeps everything.
    pub loop_longevity: u64,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            threshold: 1000,
            trace_eagerness: 200,
            trace_limit: 10000,
            inlining: false,
            optimizer: OptimizerLevel::Full,
            loop_longevity: 1000,
        }
    }
}

impl JitConfig {
    /// Per-call counter increment such that exactly `threshold` calls cross
    /// [`THRESHOLD_LIMIT`]. Zero when tracing is off.
    pub fn increment_threshold(&self) -> u64 {
        if self.threshold <= 0 {
            return 0;
        }
        THRESHOLD_LIMIT / self.threshold.min(MAX_THRESHOLD) as u64 + 1
    }

    /// Set a single parameter by name.
    pub fn set_param(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        };
        match name {
            "threshold" => {
                let threshold: i64 = value.parse().map_err(|_| invalid())?;
                if threshold > MAX_THRESHOLD {
                    return Err(ConfigError::ThresholdTooLarge {
                        value: threshold,
                        max: MAX_THRESHOLD,
                    });
                }
                self.threshold = threshold;
            }
            "trace_eagerness" => self.trace_eagerness = value.parse().map_err(|_| invalid())?,
            "trace_limit" => self.trace_limit = value.parse().map_err(|_| invalid())?,
            "inlining" => {
                self.inlining = match value {
                    "1" | "true" | "on" => true,
                    "0" | "false" | "off" => false,
                    _ => return Err(invalid()),
                }
            }
            "optimizer" => self.optimizer = value.parse()?,
            "loop_longevity" => self.loop_longevity = value.parse().map_err(|_| invalid())?,
            _ => {
                return Err(ConfigError::UnknownParameter {
                    name: name.to_string(),
                })
            }
        }
        log::debug!("jit parameter {} = {}", name, value);
        Ok(())
    }

    /// Apply a user parameter string such as `threshold=200,inlining=1`.
    ///
    /// `off` disables tracing and `default` restores every default. The
    /// string is applied atomically: on error the configuration is unchanged.
    pub fn set_user_param(&mut self, text: &str) -> Result<(), ConfigError> {
        let text = text.trim();
        if text == "off" {
            self.threshold = -1;
            return Ok(());
        }
        if text == "default" {
            *self = JitConfig::default();
            return Ok(());
        }
        let mut updated = self.clone();
        for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (name, value) = item.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                name: item.to_string(),
                value: String::new(),
            })?;
            updated.set_param(name.trim(), value.trim())?;
        }
        *self = updated;
        Ok(())
    }
}

impl fmt::Display for JitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "threshold={},trace_eagerness={},trace_limit={},inlining={},optimizer={},loop_longevity={}",
            self.threshold,
            self.trace_eagerness,
            self.trace_limit,
            u8::from(self.inlining),
            self.optimizer,
            self.loop_longevity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_crosses_limit_after_threshold_calls() {
        for threshold in [1i64, 2, 3, 7, 1000, 1039] {
            let config = JitConfig {
                threshold,
                ..JitConfig::default()
            };
            let inc = config.increment_threshold();
            assert!((threshold as u64 - 1) * inc <= THRESHOLD_LIMIT);
            assert!(threshold as u64 * inc > THRESHOLD_LIMIT);
        }
    }

    #[test]
    fn test_largest_threshold_is_exact() {
        let config = JitConfig {
            threshold: MAX_THRESHOLD,
            ..JitConfig::default()
        };
        let inc = config.increment_threshold() as u128;
        let limit = THRESHOLD_LIMIT as u128;
        assert!((MAX_THRESHOLD as u128 - 1) * inc <= limit);
        assert!(MAX_THRESHOLD as u128 * inc > limit);
    }

    #[test]
    fn test_threshold_above_exact_range_is_rejected() {
        let mut config = JitConfig::default();
        assert_eq!(
            config.set_param("threshold", "4000000000"),
            Err(ConfigError::ThresholdTooLarge {
                value: 4_000_000_000,
                max: MAX_THRESHOLD
            })
        );
        assert_eq!(config.threshold, 1000);
        config.set_param("threshold", &MAX_THRESHOLD.to_string()).unwrap();
        assert_eq!(config.threshold, MAX_THRESHOLD);
    }

    #[test]
    fn test_disabled_threshold_never_increments() {
        let mut config = JitConfig::default();
        config.set_user_param("off").unwrap();
        assert_eq!(config.increment_threshold(), 0);
    }

    #[test]
    fn test_user_param_string() {
        let mut config = JitConfig::default();
        config
            .set_user_param("threshold=5, trace_eagerness=3,optimizer=simple,inlining=1")
            .unwrap();
        assert_eq!(config.threshold, 5);
        assert_eq!(config.trace_eagerness, 3);
        assert_eq!(config.optimizer, OptimizerLevel::Simple);
        assert!(config.inlining);

        config.set_user_param("default").unwrap();
        assert_eq!(config, JitConfig::default());
    }

    #[test]
    fn test_bad_params_leave_config_untouched() {
        let mut config = JitConfig::default();
        let err = config.set_user_param("threshold=5,bogus=1").unwrap_err();
        assert_eq!(err, ConfigError::UnknownParameter { name: "bogus".into() });
        assert_eq!(config.threshold, 1000);

        assert!(matches!(
            config.set_param("optimizer", "fancy"),
            Err(ConfigError::UnknownOptimizer { .. })
        ));
        assert!(matches!(
            config.set_param("trace_limit", "-3"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_display_round_trips() {
        let config = JitConfig {
            threshold: 42,
            inlining: true,
            optimizer: OptimizerLevel::NoPerfectSpecialization,
            ..JitConfig::default()
        };
        let mut parsed = JitConfig::default();
        parsed.set_user_param(&config.to_string()).unwrap();
        assert_eq!(parsed, config);
    }
}
