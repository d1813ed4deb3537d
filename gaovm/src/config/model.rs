//! The VM configuration model.
//!
//! Configuration crosses the RPC boundary as untyped JSON and is validated
//! field-by-field into the typed model here. Validation is total: any JSON
//! value is either accepted with exactly the six-section shape or rejected
//! with a message naming the first offending field. Unknown keys, at any
//! level, are rejected — additions to the schema are deliberate code
//! changes, not silent passthrough.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Smallest permitted guest memory, in bytes (128 MiB).
pub const MIN_MEMORY_BYTES: u64 = 134_217_728;

/// Smallest permitted disk size, in MiB.
pub const MIN_DISK_MIB: u64 = 64;

/// Smallest permitted display edge, in pixels.
pub const MIN_DISPLAY_EDGE: u32 = 64;

/// A validation failure. The message names the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootLoader {
    Linux,
    Efi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Shared,
    Bridged,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootConfig {
    pub loader: BootLoader,
    pub kernel_path: Option<String>,
    pub initrd_path: Option<String>,
    pub command_line: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    pub path: Option<String>,
    #[serde(rename = "sizeMiB")]
    pub size_mib: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mode: NetworkMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphicsConfig {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
}

/// A complete VM configuration: exactly these six sections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub cpu: u32,
    pub memory: u64,
    pub boot: BootConfig,
    pub disk: DiskConfig,
    pub network: NetworkConfig,
    pub graphics: GraphicsConfig,
}

impl VmConfig {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("config serialize")
    }
}

impl Default for VmConfig {
    /// The configuration used when no `config.json` has been written yet.
    fn default() -> VmConfig {
        VmConfig {
            cpu: 2,
            memory: 2 * 1024 * 1024 * 1024,
            boot: BootConfig {
                loader: BootLoader::Linux,
                kernel_path: None,
                initrd_path: None,
                command_line: None,
            },
            disk: DiskConfig {
                path: None,
                size_mib: Some(8192),
            },
            network: NetworkConfig {
                mode: NetworkMode::Shared,
            },
            graphics: GraphicsConfig {
                enabled: true,
                width: 1280,
                height: 800,
            },
        }
    }
}

const TOP_KEYS: &[&str] = &["cpu", "memory", "boot", "disk", "network", "graphics"];
const BOOT_KEYS: &[&str] = &["loader", "kernelPath", "initrdPath", "commandLine"];
const DISK_KEYS: &[&str] = &["path", "sizeMiB"];
const NETWORK_KEYS: &[&str] = &["mode"];
const GRAPHICS_KEYS: &[&str] = &["enabled", "width", "height"];

fn err(message: impl Into<String>) -> ConfigError {
    ConfigError(message.into())
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, ConfigError> {
    value
        .as_object()
        .ok_or_else(|| err(format!("{what} must be a JSON object")))
}

fn reject_unknown(obj: &Map<String, Value>, known: &[&str], prefix: &str) -> Result<(), ConfigError> {
    for key in obj.keys() {
        if !known.contains(&key.as_str()) {
            return Err(err(format!("unknown field {prefix}{key}")));
        }
    }
    Ok(())
}

fn require<'a>(obj: &'a Map<String, Value>, key: &str, path: &str) -> Result<&'a Value, ConfigError> {
    obj.get(key).ok_or_else(|| err(format!("missing field {path}")))
}

fn cpu_field(value: &Value) -> Result<u32, ConfigError> {
    value
        .as_u64()
        .filter(|v| *v >= 1)
        .map(|v| v as u32)
        .ok_or_else(|| err("cpu must be an integer >= 1"))
}

fn memory_field(value: &Value) -> Result<u64, ConfigError> {
    value
        .as_u64()
        .filter(|v| *v >= MIN_MEMORY_BYTES)
        .ok_or_else(|| err(format!("memory must be an integer >= {MIN_MEMORY_BYTES}")))
}

fn loader_field(value: &Value) -> Result<BootLoader, ConfigError> {
    match value.as_str() {
        Some("linux") => Ok(BootLoader::Linux),
        Some("efi") => Ok(BootLoader::Efi),
        _ => Err(err("boot.loader must be one of linux, efi")),
    }
}

fn nullable_string(value: &Value, path: &str) -> Result<Option<String>, ConfigError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        _ => Err(err(format!("{path} must be a string or null"))),
    }
}

fn size_mib_field(value: &Value) -> Result<Option<u64>, ConfigError> {
    match value {
        Value::Null => Ok(None),
        _ => value
            .as_u64()
            .filter(|v| *v >= MIN_DISK_MIB)
            .map(Some)
            .ok_or_else(|| err(format!("disk.sizeMiB must be an integer >= {MIN_DISK_MIB} or null"))),
    }
}

fn mode_field(value: &Value) -> Result<NetworkMode, ConfigError> {
    match value.as_str() {
        Some("shared") => Ok(NetworkMode::Shared),
        Some("bridged") => Ok(NetworkMode::Bridged),
        Some("none") => Ok(NetworkMode::None),
        _ => Err(err("network.mode must be one of shared, bridged, none")),
    }
}

fn enabled_field(value: &Value) -> Result<bool, ConfigError> {
    value
        .as_bool()
        .ok_or_else(|| err("graphics.enabled must be a boolean"))
}

fn display_edge_field(value: &Value, path: &str) -> Result<u32, ConfigError> {
    value
        .as_u64()
        .filter(|v| *v >= MIN_DISPLAY_EDGE as u64)
        .map(|v| v as u32)
        .ok_or_else(|| err(format!("{path} must be an integer >= {MIN_DISPLAY_EDGE}")))
}

fn boot_section(value: &Value) -> Result<BootConfig, ConfigError> {
    let obj = as_object(value, "boot")?;
    reject_unknown(obj, BOOT_KEYS, "boot.")?;
    Ok(BootConfig {
        loader: loader_field(require(obj, "loader", "boot.loader")?)?,
        kernel_path: nullable_string(require(obj, "kernelPath", "boot.kernelPath")?, "boot.kernelPath")?,
        initrd_path: nullable_string(require(obj, "initrdPath", "boot.initrdPath")?, "boot.initrdPath")?,
        command_line: nullable_string(
            require(obj, "commandLine", "boot.commandLine")?,
            "boot.commandLine",
        )?,
    })
}

fn disk_section(value: &Value) -> Result<DiskConfig, ConfigError> {
    let obj = as_object(value, "disk")?;
    reject_unknown(obj, DISK_KEYS, "disk.")?;
    Ok(DiskConfig {
        path: nullable_string(require(obj, "path", "disk.path")?, "disk.path")?,
        size_mib: size_mib_field(require(obj, "sizeMiB", "disk.sizeMiB")?)?,
    })
}

fn network_section(value: &Value) -> Result<NetworkConfig, ConfigError> {
    let obj = as_object(value, "network")?;
    reject_unknown(obj, NETWORK_KEYS, "network.")?;
    Ok(NetworkConfig {
        mode: mode_field(require(obj, "mode", "network.mode")?)?,
    })
}

fn graphics_section(value: &Value) -> Result<GraphicsConfig, ConfigError> {
    let obj = as_object(value, "graphics")?;
    reject_unknown(obj, GRAPHICS_KEYS, "graphics.")?;
    Ok(GraphicsConfig {
        enabled: enabled_field(require(obj, "enabled", "graphics.enabled")?)?,
        width: display_edge_field(require(obj, "width", "graphics.width")?, "graphics.width")?,
        height: display_edge_field(require(obj, "height", "graphics.height")?, "graphics.height")?,
    })
}

/// Validate a complete configuration document.
pub fn validate_config(value: &Value) -> Result<VmConfig, ConfigError> {
    let obj = as_object(value, "config")?;
    reject_unknown(obj, TOP_KEYS, "")?;
    Ok(VmConfig {
        cpu: cpu_field(require(obj, "cpu", "cpu")?)?,
        memory: memory_field(require(obj, "memory", "memory")?)?,
        boot: boot_section(require(obj, "boot", "boot")?)?,
        disk: disk_section(require(obj, "disk", "disk")?)?,
        network: network_section(require(obj, "network", "network")?)?,
        graphics: graphics_section(require(obj, "graphics", "graphics")?)?,
    })
}

/// Validate a sparse patch: top-level keys a subset of the six sections,
/// nested objects possibly partial, every present leaf within the same
/// bounds as the full schema. Leaves can be changed, never added.
pub fn validate_patch(value: &Value) -> Result<(), ConfigError> {
    let obj = as_object(value, "patch")?;
    reject_unknown(obj, TOP_KEYS, "")?;

    if let Some(cpu) = obj.get("cpu") {
        cpu_field(cpu)?;
    }
    if let Some(memory) = obj.get("memory") {
        memory_field(memory)?;
    }
    if let Some(boot) = obj.get("boot") {
        let boot = as_object(boot, "boot")?;
        reject_unknown(boot, BOOT_KEYS, "boot.")?;
        if let Some(loader) = boot.get("loader") {
            loader_field(loader)?;
        }
        for key in ["kernelPath", "initrdPath", "commandLine"] {
            if let Some(field) = boot.get(key) {
                nullable_string(field, &format!("boot.{key}"))?;
            }
        }
    }
    if let Some(disk) = obj.get("disk") {
        let disk = as_object(disk, "disk")?;
        reject_unknown(disk, DISK_KEYS, "disk.")?;
        if let Some(path) = disk.get("path") {
            nullable_string(path, "disk.path")?;
        }
        if let Some(size) = disk.get("sizeMiB") {
            size_mib_field(size)?;
        }
    }
    if let Some(network) = obj.get("network") {
        let network = as_object(network, "network")?;
        reject_unknown(network, NETWORK_KEYS, "network.")?;
        if let Some(mode) = network.get("mode") {
            mode_field(mode)?;
        }
    }
    if let Some(graphics) = obj.get("graphics") {
        let graphics = as_object(graphics, "graphics")?;
        reject_unknown(graphics, GRAPHICS_KEYS, "graphics.")?;
        if let Some(enabled) = graphics.get("enabled") {
            enabled_field(enabled)?;
        }
        if let Some(width) = graphics.get("width") {
            display_edge_field(width, "graphics.width")?;
        }
        if let Some(height) = graphics.get("height") {
            display_edge_field(height, "graphics.height")?;
        }
    }
    Ok(())
}

/// Deep-merge `patch` onto `base`: objects recurse, everything else (scalars,
/// arrays, null) replaces.
pub fn deep_merge(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            let mut merged = base.clone();
            for (key, patch_value) in patch {
                let entry = match base.get(key) {
                    Some(base_value) => deep_merge(base_value, patch_value),
                    None => patch_value.clone(),
                };
                merged.insert(key.clone(), entry);
            }
            Value::Object(merged)
        }
        (_, patch) => patch.clone(),
    }
}

/// Whether moving from `current` to `next` requires a driver restart.
///
/// Restart-required fields: `cpu`, `memory`, the entire `boot` section,
/// `disk.path`, `network.mode` and the entire `graphics` section. Only
/// `disk.sizeMiB` can change live.
pub fn restart_required(current: &VmConfig, next: &VmConfig) -> bool {
    current.cpu != next.cpu
        || current.memory != next.memory
        || current.boot != next.boot
        || current.disk.path != next.disk.path
        || current.network.mode != next.network.mode
        || current.graphics != next.graphics
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> Value {
        VmConfig::default().to_value()
    }

    #[test]
    fn default_round_trips_through_the_validator() {
        let config = validate_config(&valid()).unwrap();
        assert_eq!(config, VmConfig::default());
    }

    #[test]
    fn serialized_field_names_match_the_wire_schema() {
        let value = valid();
        let boot = value.get("boot").unwrap();
        assert!(boot.get("kernelPath").is_some());
        assert!(boot.get("initrdPath").is_some());
        assert!(boot.get("commandLine").is_some());
        assert!(value["disk"].get("sizeMiB").is_some());
        assert_eq!(value["boot"]["loader"], json!("linux"));
        assert_eq!(value["network"]["mode"], json!("shared"));
    }

    #[test]
    fn rejects_out_of_range_leaves_naming_the_field() {
        let mut bad = valid();
        bad["cpu"] = json!(0);
        assert_eq!(
            validate_config(&bad).unwrap_err().0,
            "cpu must be an integer >= 1"
        );

        let mut bad = valid();
        bad["memory"] = json!(1024);
        assert!(validate_config(&bad).unwrap_err().0.starts_with("memory"));

        let mut bad = valid();
        bad["disk"]["sizeMiB"] = json!(32);
        assert!(validate_config(&bad).unwrap_err().0.starts_with("disk.sizeMiB"));

        let mut bad = valid();
        bad["graphics"]["width"] = json!(10);
        assert!(validate_config(&bad).unwrap_err().0.starts_with("graphics.width"));

        let mut bad = valid();
        bad["cpu"] = json!(1.5);
        assert_eq!(
            validate_config(&bad).unwrap_err().0,
            "cpu must be an integer >= 1"
        );
    }

    #[test]
    fn rejects_unknown_keys_at_any_level() {
        let mut bad = valid();
        bad["extra"] = json!(true);
        assert_eq!(validate_config(&bad).unwrap_err().0, "unknown field extra");

        let mut bad = valid();
        bad["boot"]["cmdline"] = json!("x");
        assert_eq!(
            validate_config(&bad).unwrap_err().0,
            "unknown field boot.cmdline"
        );
    }

    #[test]
    fn rejects_missing_sections_and_leaves() {
        let mut bad = valid();
        bad.as_object_mut().unwrap().remove("network");
        assert_eq!(validate_config(&bad).unwrap_err().0, "missing field network");

        let mut bad = valid();
        bad["boot"].as_object_mut().unwrap().remove("loader");
        assert_eq!(
            validate_config(&bad).unwrap_err().0,
            "missing field boot.loader"
        );
    }

    #[test]
    fn rejects_unknown_enum_strings() {
        let mut bad = valid();
        bad["network"]["mode"] = json!("vpn");
        assert!(validate_config(&bad).unwrap_err().0.starts_with("network.mode"));

        let mut bad = valid();
        bad["boot"]["loader"] = json!("bios");
        assert!(validate_config(&bad).unwrap_err().0.starts_with("boot.loader"));
    }

    #[test]
    fn rejects_non_object_documents() {
        assert!(validate_config(&json!([1, 2])).is_err());
        assert!(validate_config(&json!("config")).is_err());
        assert!(validate_config(&json!(null)).is_err());
    }

    #[test]
    fn patch_accepts_partial_sections() {
        validate_patch(&json!({"cpu": 4})).unwrap();
        validate_patch(&json!({"graphics": {"enabled": false}})).unwrap();
        validate_patch(&json!({"boot": {"kernelPath": "/k", "commandLine": null}})).unwrap();
        validate_patch(&json!({})).unwrap();
    }

    #[test]
    fn patch_rejects_bad_leaves_and_new_keys() {
        assert_eq!(
            validate_patch(&json!({"cpu": 0})).unwrap_err().0,
            "cpu must be an integer >= 1"
        );
        assert_eq!(
            validate_patch(&json!({"disk": {"iops": 1}})).unwrap_err().0,
            "unknown field disk.iops"
        );
        assert!(validate_patch(&json!({"graphics": 4})).is_err());
    }

    #[test]
    fn merge_applies_patch_paths_and_preserves_the_rest() {
        let base = valid();
        let patch = json!({"cpu": 8, "graphics": {"enabled": false}});
        let merged = deep_merge(&base, &patch);
        assert_eq!(merged["cpu"], json!(8));
        assert_eq!(merged["graphics"]["enabled"], json!(false));
        // Untouched leaves keep their base values.
        assert_eq!(merged["graphics"]["width"], base["graphics"]["width"]);
        assert_eq!(merged["memory"], base["memory"]);
        assert_eq!(merged["boot"], base["boot"]);
    }

    #[test]
    fn merge_replaces_scalars_and_nulls() {
        let base = json!({"a": {"b": 1}, "c": 2});
        let patch = json!({"a": {"b": null}, "c": 3});
        let merged = deep_merge(&base, &patch);
        assert_eq!(merged, json!({"a": {"b": null}, "c": 3}));
    }

    #[test]
    fn restart_diff_is_reflexive_and_tracks_the_restart_set() {
        let base = VmConfig::default();
        assert!(!restart_required(&base, &base));

        let mut next = base.clone();
        next.cpu = 4;
        assert!(restart_required(&base, &next));

        let mut next = base.clone();
        next.graphics.enabled = false;
        assert!(restart_required(&base, &next));

        let mut next = base.clone();
        next.boot.command_line = Some("quiet".into());
        assert!(restart_required(&base, &next));

        let mut next = base.clone();
        next.disk.path = Some("/disk.img".into());
        assert!(restart_required(&base, &next));

        // disk.sizeMiB is the one live-applyable leaf.
        let mut next = base.clone();
        next.disk.size_mib = Some(16384);
        assert!(!restart_required(&base, &next));
    }
}
