//! Adapter registry and opening
//!
//! Front-ends select an adapter with a string of the form `name` or
//! `name:key1=value1,key2=value2` and get back a boxed [`I2cAdapter`],
//! never a concrete bridge type. Real bridge drivers plug in here; the
//! build always carries the simulated adapter.

use std::collections::HashMap;
use std::time::Duration;

use reeprom_core::adapter::I2cAdapter;
use reeprom_sim::{SimAdapter, SimConfig, SimDeviceConfig};

/// Boxed error for open failures, covering both parameter and device
/// problems.
pub type OpenError = Box<dyn std::error::Error>;

/// Parsed adapter selection string.
pub struct AdapterParams {
    /// Canonical adapter name
    pub name: String,
    /// Key-value parameters
    pub params: HashMap<String, String>,
}

/// Names of the adapters this build can open.
pub fn adapter_names() -> &'static [&'static str] {
    &["sim"]
}

/// Parse an adapter string into name and parameters.
///
/// Format: `name` or `name:key1=value1,key2=value2`.
///
/// # Example
/// ```
/// let params = reeprom_session::parse_adapter_params("sim:addr=0x50,size=1024").unwrap();
/// assert_eq!(params.name, "sim");
/// assert_eq!(params.params.get("size"), Some(&"1024".to_string()));
/// ```
pub fn parse_adapter_params(s: &str) -> Result<AdapterParams, OpenError> {
    let (name, opts_str) = s.split_once(':').unwrap_or((s, ""));
    if name.is_empty() {
        return Err("empty adapter name".into());
    }

    let mut params = HashMap::new();
    for opt in opts_str.split(',').filter(|o| !o.is_empty()) {
        let (key, value) = opt
            .split_once('=')
            .ok_or_else(|| format!("malformed adapter parameter `{opt}` (expected key=value)"))?;
        params.insert(key.to_string(), value.to_string());
    }

    Ok(AdapterParams {
        name: name.to_string(),
        params,
    })
}

/// Open an adapter by selection string.
///
/// Returns a type-erased handle; callers never see the concrete bridge.
pub fn open_adapter(spec: &str) -> Result<Box<dyn I2cAdapter + Send>, OpenError> {
    let parsed = parse_adapter_params(spec)?;
    match parsed.name.as_str() {
        "sim" => open_sim(&parsed.params),
        other => Err(format!(
            "unknown adapter `{}` (available: {})",
            other,
            adapter_names().join(", ")
        )
        .into()),
    }
}

fn parse_num(s: &str) -> Result<u32, OpenError> {
    let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse::<u32>()
    };
    value.map_err(|e| format!("invalid number `{s}`: {e}").into())
}

// Without parameters the simulator comes up with its stock bus (a 24C256 at
// 0x50 and a 24C08-sized part at 0x53, both pattern-prefilled). Parameters
// replace the bus with a single blank device:
//   addr=0x50 size=32768 page=64 cycle-ms=5 no-page-write=1
fn open_sim(params: &HashMap<String, String>) -> Result<Box<dyn I2cAdapter + Send>, OpenError> {
    let mut config = SimConfig::default();

    if params.contains_key("addr") || params.contains_key("size") {
        let addr = params.get("addr").map(|s| parse_num(s)).transpose()?.unwrap_or(0x50);
        let size = params.get("size").map(|s| parse_num(s)).transpose()?.unwrap_or(32768);
        let page = params.get("page").map(|s| parse_num(s)).transpose()?.unwrap_or(64);
        let mut device = SimDeviceConfig::new(addr as u8, size, page);
        if let Some(ms) = params.get("cycle-ms") {
            device.write_cycle = Duration::from_millis(parse_num(ms)? as u64);
        }
        config.devices = vec![device];
    }

    if params.contains_key("no-page-write") {
        config.page_write = false;
    }

    for key in params.keys() {
        if !matches!(key.as_str(), "addr" | "size" | "page" | "cycle-ms" | "no-page-write") {
            return Err(format!("unknown sim parameter `{key}`").into());
        }
    }

    log::debug!("opening simulated adapter ({} device(s))", config.devices.len());
    Ok(Box::new(SimAdapter::open(config)?))
}
