//! Opt-flag configuration.
//!
//! Flags arrive as a comma-separated list of colon-scoped `key=value`
//! pairs, e.g. `jit:max-ops=4,jit:debug=1`. The JIT core recognizes its
//! own keys and warns about anything else rather than failing, so
//! subsystem flags can share one string.

use log::warn;

use crate::CoreError;

/// Compiler tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitTuning {
    /// Longest block in opcodes; also the interrupt latency bound.
    pub max_ops: u32,
    /// Enables the known-value rewrites and dynamic-operand promotion.
    pub optimizing: bool,
    /// Self-modification recompiles before an operand goes dynamic.
    pub dynamic_trigger: u32,
    /// Emit a per-opcode debug hook into every block.
    pub debug: bool,
}

impl Default for JitTuning {
    fn default() -> JitTuning {
        JitTuning {
            max_ops: 1024,
            optimizing: true,
            dynamic_trigger: 1,
            debug: false,
        }
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, CoreError> {
    value
        .parse()
        .map_err(|_| CoreError::OptFlag(format!("{key}={value}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, CoreError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(CoreError::OptFlag(format!("{key}={value}"))),
    }
}

/// Parse the flags the JIT core recognizes out of an opt-flag string.
pub fn parse_opt_flags(flags: &str) -> Result<JitTuning, CoreError> {
    let mut tuning = JitTuning::default();
    for pair in flags.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, "1"));
        match key {
            "jit:max-ops" => tuning.max_ops = parse_u32(key, value)?.clamp(1, 1024),
            "jit:optimizing" => tuning.optimizing = parse_bool(key, value)?,
            "jit:dynamic-trigger" => {
                tuning.dynamic_trigger = parse_u32(key, value)?.max(1)
            }
            "jit:debug" => tuning.debug = parse_bool(key, value)?,
            _ => warn!("ignoring unrecognized opt flag `{pair}`"),
        }
    }
    Ok(tuning)
}
