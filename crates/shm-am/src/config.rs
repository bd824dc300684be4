//! Transport configuration.
//!
//! Every knob has a default and can be overridden through the environment.
//! Variables are read once, when the endpoint is opened.

use std::time::Duration;

use shm_primitives::AcquireMode;

/// Default prefix of shared-memory object names.
pub const DEFAULT_PREFIX: &str = "shm_am";

/// Default depth of the short-packet queues.
pub const DEFAULT_SHORT_Q_DEPTH: u32 = 1024;

/// Default depth of the bulk-packet queues.
pub const DEFAULT_LONG_Q_DEPTH: u32 = 256;

/// Default bulk slot size (header included).
pub const DEFAULT_LONG_ELEM_SIZE: u32 = 8192;

/// Bounds applied to the bulk slot size.
pub const MIN_LONG_ELEM_SIZE: u32 = 1024;
pub const MAX_LONG_ELEM_SIZE: u32 = 1 << 20;

/// Messages above this many bytes use rendezvous.
pub const DEFAULT_RNDV_THRESH: u32 = 16000;

/// Default number of imported IPC handles kept open.
pub const DEFAULT_MEMCACHE_SIZE: usize = 64;

/// Kernel-assisted copy mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KassistMode {
    /// No kernel-assisted copies.
    Off,
    /// The receiver pulls from the sender's address space.
    CmaGet,
    /// The sender pushes into the receiver's address space.
    CmaPut,
}

impl KassistMode {
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            Self::Off => 0,
            Self::CmaGet => 1,
            Self::CmaPut => 2,
        }
    }

    pub(crate) fn from_wire(v: u32) -> Self {
        match v {
            1 => Self::CmaGet,
            2 => Self::CmaPut,
            _ => Self::Off,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "none",
            Self::CmaGet => "cma-get",
            Self::CmaPut => "cma-put",
        }
    }
}

/// Configuration for an [`AmPtl`](crate::AmPtl) endpoint.
#[derive(Debug, Clone)]
pub struct AmConfig {
    /// Prefix of shared-memory object names.
    pub prefix: String,
    /// Slots per short-packet queue.
    pub short_q_depth: u32,
    /// Slots per bulk-packet queue.
    pub long_q_depth: u32,
    /// Bulk slot size in bytes, including the 128-byte packet header.
    pub long_elem_size: u32,
    /// Producer discipline for the queues this endpoint owns.
    pub acquire_mode: AcquireMode,
    /// Kernel-assist mode requested for this endpoint.
    pub kassist_mode: KassistMode,
    /// Messages larger than this use rendezvous.
    pub rndv_thresh: u32,
    /// Yield the CPU periodically while connecting.
    pub polite_attach: bool,
    /// Cache imported device IPC handles.
    pub memcache_enabled: bool,
    /// Maximum number of cached IPC handles.
    pub memcache_size: usize,
    /// Whether a GPU is in use (restricts kernel-assist choices).
    pub gpu_enabled: bool,
    /// How long to wait for a peer's segment to become ready.
    pub init_wait: Duration,
    /// How long `detach` waits for other processes to unmap us.
    pub detach_wait: Duration,
}

impl Default for AmConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            short_q_depth: DEFAULT_SHORT_Q_DEPTH,
            long_q_depth: DEFAULT_LONG_Q_DEPTH,
            long_elem_size: DEFAULT_LONG_ELEM_SIZE,
            acquire_mode: AcquireMode::Cas,
            kassist_mode: KassistMode::CmaGet,
            rndv_thresh: DEFAULT_RNDV_THRESH,
            polite_attach: false,
            memcache_enabled: true,
            memcache_size: DEFAULT_MEMCACHE_SIZE,
            gpu_enabled: false,
            init_wait: Duration::from_secs(5),
            detach_wait: Duration::from_millis(100),
        }
    }
}

impl AmConfig {
    /// Read the configuration for the first endpoint of a process.
    pub fn from_env() -> Self {
        Self::from_env_with(true, false)
    }

    /// Read the configuration from the process environment.
    ///
    /// Only the first endpoint opened in a process defaults to kernel-assisted
    /// copies; later ones default to `none`.
    pub fn from_env_with(first_endpoint: bool, gpu_enabled: bool) -> Self {
        Self::from_lookup(|key| std::env::var(key).ok(), first_endpoint, gpu_enabled)
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        first_endpoint: bool,
        gpu_enabled: bool,
    ) -> Self {
        let mut config = Self {
            gpu_enabled,
            ..Self::default()
        };

        if let Some(prefix) = lookup("SHM_AM_PREFIX").filter(|p| !p.is_empty() && !p.contains('/'))
        {
            config.prefix = prefix;
        }
        if let Some(depth) = parse_num::<u32>(&lookup, "SHM_AM_SHORT_Q_DEPTH").filter(|d| *d > 0) {
            config.short_q_depth = depth;
        }
        if let Some(depth) = parse_num::<u32>(&lookup, "SHM_AM_LONG_Q_DEPTH").filter(|d| *d > 0) {
            config.long_q_depth = depth;
        }
        if let Some(mtu) = parse_num::<u32>(&lookup, "SHM_AM_LONG_MTU") {
            config.long_elem_size = mtu.clamp(MIN_LONG_ELEM_SIZE, MAX_LONG_ELEM_SIZE) & !7;
        }
        if let Some(thresh) = parse_num::<u32>(&lookup, "SHM_AM_RNDV_THRESH") {
            config.rndv_thresh = thresh;
        }
        if let Some(polite) = parse_bool(&lookup, "SHM_AM_POLITE_ATTACH") {
            config.polite_attach = polite;
        }
        if let Some(enabled) = parse_bool(&lookup, "SHM_AM_MEMCACHE_ENABLED") {
            config.memcache_enabled = enabled;
        }
        if let Some(size) = parse_num::<usize>(&lookup, "SHM_AM_MEMCACHE_SIZE").filter(|s| *s > 0)
        {
            config.memcache_size = size;
        }
        config.kassist_mode =
            parse_kassist(lookup("SHM_AM_KASSIST_MODE").as_deref(), first_endpoint, gpu_enabled);
        config
    }
}

fn parse_num<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable value");
            None
        }
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "y" | "yes" | "true" | "on" => Some(true),
        "0" | "n" | "no" | "false" | "off" => Some(false),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring unparsable value");
            None
        }
    }
}

fn parse_kassist(raw: Option<&str>, first_endpoint: bool, gpu_enabled: bool) -> KassistMode {
    let default = if first_endpoint {
        KassistMode::CmaGet
    } else {
        KassistMode::Off
    };
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "cma-put" if !gpu_enabled => KassistMode::CmaPut,
        "cma-get" => KassistMode::CmaGet,
        "none" => KassistMode::Off,
        other => {
            tracing::info!(value = other, "invalid SHM_AM_KASSIST_MODE, using cma-get");
            KassistMode::CmaGet
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AmConfig::from_lookup(lookup(&[]), true, false);
        assert_eq!(config.prefix, DEFAULT_PREFIX);
        assert_eq!(config.short_q_depth, 1024);
        assert_eq!(config.long_q_depth, 256);
        assert_eq!(config.long_elem_size, 8192);
        assert_eq!(config.rndv_thresh, 16000);
        assert_eq!(config.kassist_mode, KassistMode::CmaGet);
        assert!(!config.polite_attach);
    }

    #[test]
    fn test_second_endpoint_defaults_to_no_kassist() {
        let config = AmConfig::from_lookup(lookup(&[]), false, false);
        assert_eq!(config.kassist_mode, KassistMode::Off);
    }

    #[test]
    fn test_long_mtu_is_clamped() {
        let small = AmConfig::from_lookup(lookup(&[("SHM_AM_LONG_MTU", "16")]), true, false);
        assert_eq!(small.long_elem_size, MIN_LONG_ELEM_SIZE);
        let big = AmConfig::from_lookup(lookup(&[("SHM_AM_LONG_MTU", "99999999")]), true, false);
        assert_eq!(big.long_elem_size, MAX_LONG_ELEM_SIZE);
    }

    #[test]
    fn test_kassist_parsing() {
        let put = AmConfig::from_lookup(lookup(&[("SHM_AM_KASSIST_MODE", "CMA-PUT")]), true, false);
        assert_eq!(put.kassist_mode, KassistMode::CmaPut);

        let gpu_put = AmConfig::from_lookup(lookup(&[("SHM_AM_KASSIST_MODE", "cma-put")]), true, true);
        assert_eq!(gpu_put.kassist_mode, KassistMode::CmaGet);

        let bogus = AmConfig::from_lookup(lookup(&[("SHM_AM_KASSIST_MODE", "bogus")]), false, false);
        assert_eq!(bogus.kassist_mode, KassistMode::CmaGet);

        let none = AmConfig::from_lookup(lookup(&[("SHM_AM_KASSIST_MODE", "none")]), true, false);
        assert_eq!(none.kassist_mode, KassistMode::Off);
    }

    #[test]
    fn test_overrides() {
        let config = AmConfig::from_lookup(
            lookup(&[
                ("SHM_AM_PREFIX", "myapp"),
                ("SHM_AM_SHORT_Q_DEPTH", "64"),
                ("SHM_AM_LONG_Q_DEPTH", "garbage"),
                ("SHM_AM_RNDV_THRESH", "100"),
                ("SHM_AM_POLITE_ATTACH", "yes"),
                ("SHM_AM_MEMCACHE_SIZE", "8"),
            ]),
            true,
            false,
        );
        assert_eq!(config.prefix, "myapp");
        assert_eq!(config.short_q_depth, 64);
        assert_eq!(config.long_q_depth, DEFAULT_LONG_Q_DEPTH);
        assert_eq!(config.rndv_thresh, 100);
        assert!(config.polite_attach);
        assert_eq!(config.memcache_size, 8);
    }
}
