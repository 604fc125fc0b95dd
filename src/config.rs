//! Driver configuration.
//!
//! The config is one YAML document listing ports. Each port carries its
//! transport address, protocol name, framing and timing knobs, an optional
//! setup script, and an ordered list of protocol-specific parameters. The
//! parameter payloads are decoded by the parser registered for the port's
//! protocol, so each protocol keeps its own spec shape without any reflection
//! at runtime.

use crate::commander::DEFAULT_COMMAND_TIMEOUT;
use crate::error::{Error, Result};
use crate::framer::LineEnding;
use crate::protocol::{ParamValue, ParameterSpec, ProtocolRegistry};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// One boot-time command, optionally with an exact expected response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SetupItem {
    pub command: String,
    #[serde(default)]
    pub response: String,
}

/// Static description of a single user-visible control.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ControlSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub units: String,
    #[serde(default, rename = "type")]
    pub control_type: String,
    #[serde(default)]
    pub writable: bool,
    #[serde(default, rename = "enum")]
    pub enum_map: Option<BTreeMap<i64, String>>,
}

impl ControlSpec {
    /// Pushbuttons are write-only; everything else is polled.
    pub fn should_poll(&self) -> bool {
        self.control_type != "pushbutton"
    }

    /// Renders a device value for publication, mapping integers through the
    /// enum table when one is configured.
    pub fn transform_device_value(&self, value: &ParamValue) -> String {
        let s = value.to_string();
        let Some(enum_map) = &self.enum_map else {
            return s;
        };
        match s.parse::<i64>() {
            Ok(n) => enum_map.get(&n).cloned().unwrap_or(s),
            Err(_) => s,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("got control without name".into()));
        }
        Ok(())
    }

    /// Merges two definitions of the same control. Empty title/units/type
    /// yield to non-empty ones; non-empty ones must agree; writability and
    /// enum tables fold as documented on [`PortConfig::resolve_controls`].
    fn merge(&self, other: &ControlSpec) -> Result<ControlSpec> {
        if self.name.is_empty() || self.name != other.name {
            return Err(Error::Validation(
                "merge: control names must be the same and non-empty".into(),
            ));
        }
        let conflict = |what: &str| Error::Validation(format!("merge: {} conflict for {:?}", what, self.name));
        if !self.title.is_empty() && !other.title.is_empty() && self.title != other.title {
            return Err(conflict("title"));
        }
        if !self.units.is_empty() && !other.units.is_empty() && self.units != other.units {
            return Err(conflict("units"));
        }
        if !self.control_type.is_empty()
            && !other.control_type.is_empty()
            && self.control_type != other.control_type
        {
            return Err(conflict("type"));
        }
        let mut merged = self.clone();
        if merged.title.is_empty() {
            merged.title = other.title.clone();
        }
        if merged.units.is_empty() {
            merged.units = other.units.clone();
        }
        if merged.control_type.is_empty() {
            merged.control_type = other.control_type.clone();
        }
        if other.writable {
            merged.writable = true;
        }
        match (&self.enum_map, &other.enum_map) {
            (None, _) => merged.enum_map = other.enum_map.clone(),
            (Some(_), None) => {}
            (Some(_), Some(_)) => {
                return Err(Error::Validation(format!("enum conflict for {:?}", self.name)))
            }
        }
        Ok(merged)
    }
}

/// Per-port settings shared by the commander and the device.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortSettings {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub port: String,
    #[serde(default, rename = "lineending")]
    pub line_ending: LineEnding,
    #[serde(default, rename = "idsubstring")]
    pub id_substring: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default, rename = "commanddelayms")]
    pub command_delay_ms: u64,
    #[serde(default, rename = "timeoutms")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub setup: Vec<SetupItem>,
    /// Re-issue Identify on every poll cycle instead of once.
    #[serde(default)]
    pub resync: bool,
    /// Bus address for addressed protocols (ERN), 0..=99.
    #[serde(default)]
    pub address: u8,
}

impl PortSettings {
    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT)
    }
}

/// A parsed port: settings plus decoded parameter specs.
#[derive(Debug, Clone)]
pub struct PortConfig {
    pub settings: Arc<PortSettings>,
    pub parameters: Vec<ParameterSpec>,
}

/// Merged control set of a port, plus the binding of each writable control
/// to the parameter that services its writes.
#[derive(Debug, Clone)]
pub struct ResolvedControls {
    /// First-appearance order, merged.
    pub controls: Vec<ControlSpec>,
    /// Control name → index into `PortConfig::parameters` of the first
    /// settable parameter declaring it writable.
    pub settable: HashMap<String, usize>,
}

impl PortConfig {
    /// Resolves the port's controls across all parameters, merging repeated
    /// declarations and recording settable-parameter bindings.
    pub fn resolve_controls(&self) -> Result<ResolvedControls> {
        let mut controls: Vec<ControlSpec> = Vec::new();
        let mut index_by_name: HashMap<String, usize> = HashMap::new();
        let mut settable: HashMap<String, usize> = HashMap::new();

        for (param_index, param) in self.parameters.iter().enumerate() {
            for declared in param.controls() {
                let mut control = declared.clone();
                if control.name.is_empty() {
                    return Err(Error::Validation("got control without name".into()));
                }
                if control.control_type == "pushbutton" {
                    control.writable = true;
                }
                if control.writable
                    && param.settable()
                    && !settable.contains_key(&control.name)
                {
                    settable.insert(control.name.clone(), param_index);
                }
                match index_by_name.get(&control.name) {
                    None => {
                        index_by_name.insert(control.name.clone(), controls.len());
                        controls.push(control);
                    }
                    Some(&at) => {
                        let merged = controls[at].merge(&control)?;
                        controls[at] = merged;
                    }
                }
            }
        }
        Ok(ResolvedControls { controls, settable })
    }
}

/// Whole-daemon configuration: one entry per port.
#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    pub ports: Vec<PortConfig>,
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    ports: Vec<serde_yaml::Value>,
}

impl DriverConfig {
    /// Parses the YAML document, decoding each port's parameters with the
    /// parser registered for its protocol and validating every spec.
    pub fn parse(text: &str, registry: &ProtocolRegistry) -> Result<DriverConfig> {
        let raw: RawConfig =
            serde_yaml::from_str(text).map_err(|err| Error::Validation(err.to_string()))?;
        let mut ports = Vec::new();
        for port_value in raw.ports {
            let settings: PortSettings = serde_yaml::from_value(port_value.clone())
                .map_err(|err| Error::Validation(err.to_string()))?;
            if settings.protocol.is_empty() {
                return Err(Error::Validation("must specify the protocol".into()));
            }
            let raw_params: Vec<serde_yaml::Value> = match port_value.get("parameters") {
                Some(value) => serde_yaml::from_value(value.clone())
                    .map_err(|err| Error::Validation(format!("error unmarshaling parameters: {}", err)))?,
                None => Vec::new(),
            };
            let mut parameters = Vec::new();
            for raw_param in &raw_params {
                let spec = registry.parse_parameter(&settings.protocol, raw_param)?;
                spec.validate()?;
                parameters.push(spec);
            }
            ports.push(PortConfig {
                settings: Arc::new(settings),
                parameters,
            });
        }
        Ok(DriverConfig { ports })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::scpi::ScpiParameterSpec;

    const SAMPLE_CONFIG: &str = r#"
enums:
- &modes
  0: "x"
  1: "y"
  2: "z"
ports:
- name: somedev
  title: Some Device
  port: /dev/ttyS0
  protocol: scpi
  idsubstring: some_dev_id
  commanddelayms: 42
  setup:
  - command: ":SYST:REM"
  - command: WHATEVER
    response: ORLY
  parameters:
  - scpiname: CURR
    control:
      name: current1
      title: Current 1
      units: A
      type: current
      writable: true
  - scpiname: MEAS:CURR
    control:
      name: current1
  - scpiname: VOLT
    control:
      name: voltage1
      title: Voltage 1
      units: V
      type: voltage
      writable: true
  - scpiname: MODE
    control:
      name: mode
      title: Mode
      type: text
      enum: *modes
"#;

    fn parse_sample() -> DriverConfig {
        let registry = ProtocolRegistry::with_builtin();
        DriverConfig::parse(SAMPLE_CONFIG, &registry).expect("config should parse")
    }

    #[test]
    fn test_parse_config() {
        let config = parse_sample();
        assert_eq!(config.ports.len(), 1);
        let port = &config.ports[0];
        assert_eq!(port.settings.name, "somedev");
        assert_eq!(port.settings.title, "Some Device");
        assert_eq!(port.settings.port, "/dev/ttyS0");
        assert_eq!(port.settings.id_substring, "some_dev_id");
        assert_eq!(port.settings.command_delay_ms, 42);
        assert_eq!(port.settings.command_delay(), Duration::from_millis(42));
        assert_eq!(port.settings.command_timeout(), DEFAULT_COMMAND_TIMEOUT);
        assert_eq!(
            port.settings.setup,
            vec![
                SetupItem {
                    command: ":SYST:REM".into(),
                    response: String::new(),
                },
                SetupItem {
                    command: "WHATEVER".into(),
                    response: "ORLY".into(),
                },
            ]
        );
        assert_eq!(port.parameters.len(), 4);
        let ParameterSpec::Scpi(spec) = &port.parameters[3] else {
            panic!("expected a SCPI parameter spec");
        };
        assert_eq!(spec.scpi_name, "MODE");
        let enum_map = spec.control.enum_map.as_ref().expect("enum should resolve via anchor");
        assert_eq!(enum_map.get(&1).map(String::as_str), Some("y"));
    }

    #[test]
    fn test_resolve_controls_merges_and_binds() {
        let config = parse_sample();
        let resolved = config.ports[0].resolve_controls().unwrap();
        let names: Vec<&str> = resolved.controls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["current1", "voltage1", "mode"]);

        let current = &resolved.controls[0];
        assert_eq!(current.title, "Current 1");
        assert_eq!(current.units, "A");
        assert_eq!(current.control_type, "current");
        assert!(current.writable);

        // current1 is writable via the first parameter (CURR), not the
        // read-only MEAS:CURR duplicate
        assert_eq!(resolved.settable.get("current1"), Some(&0));
        assert_eq!(resolved.settable.get("voltage1"), Some(&2));
        assert_eq!(resolved.settable.get("mode"), None);
    }

    #[test]
    fn test_merge_conflicts() {
        let a = ControlSpec {
            name: "c".into(),
            title: "A".into(),
            ..Default::default()
        };
        let b = ControlSpec {
            name: "c".into(),
            title: "B".into(),
            ..Default::default()
        };
        assert!(a.merge(&b).is_err());

        let a = ControlSpec {
            name: "c".into(),
            enum_map: Some(BTreeMap::from([(0, "x".into())])),
            ..Default::default()
        };
        let b = ControlSpec {
            name: "c".into(),
            enum_map: Some(BTreeMap::from([(0, "x".into())])),
            ..Default::default()
        };
        assert!(a.merge(&b).is_err(), "two enum tables conflict even when equal");

        let plain = ControlSpec {
            name: "c".into(),
            ..Default::default()
        };
        let merged = plain.merge(&a).unwrap();
        assert!(merged.enum_map.is_some());
    }

    #[test]
    fn test_merge_folds_writability() {
        let read_only = ControlSpec {
            name: "c".into(),
            ..Default::default()
        };
        let writable = ControlSpec {
            name: "c".into(),
            writable: true,
            ..Default::default()
        };
        assert!(read_only.merge(&writable).unwrap().writable);
        assert!(writable.merge(&read_only).unwrap().writable);
    }

    #[test]
    fn test_timeout_override() {
        let registry = ProtocolRegistry::with_builtin();
        let config = DriverConfig::parse(
            "ports:\n- name: x\n  port: p\n  protocol: scpi\n  timeoutms: 1500\n",
            &registry,
        )
        .unwrap();
        assert_eq!(
            config.ports[0].settings.command_timeout(),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_missing_protocol_is_rejected() {
        let registry = ProtocolRegistry::with_builtin();
        let err = DriverConfig::parse("ports:\n- name: x\n  port: /dev/ttyS0\n", &registry)
            .err()
            .expect("should fail");
        assert!(err.to_string().contains("must specify the protocol"));
    }

    #[test]
    fn test_unknown_protocol_is_rejected() {
        let registry = ProtocolRegistry::with_builtin();
        let err = DriverConfig::parse(
            "ports:\n- name: x\n  port: p\n  protocol: nonesuch\n  parameters:\n  - {}\n",
            &registry,
        )
        .err()
        .expect("should fail");
        assert!(err.to_string().contains("unknown protocol"));
    }

    #[test]
    fn test_nameless_control_is_rejected() {
        let registry = ProtocolRegistry::with_builtin();
        let err = DriverConfig::parse(
            "ports:\n- name: x\n  port: p\n  protocol: scpi\n  parameters:\n  - scpiname: CURR\n    control:\n      title: broken\n",
            &registry,
        )
        .err()
        .expect("should fail");
        assert!(err.to_string().contains("got control without name"));
    }

    #[test]
    fn test_transform_device_value() {
        let control = ControlSpec {
            name: "mode".into(),
            enum_map: Some(BTreeMap::from([(0, "Foo".into()), (1, "Bar".into())])),
            ..Default::default()
        };
        assert_eq!(control.transform_device_value(&ParamValue::Str("1".into())), "Bar");
        assert_eq!(control.transform_device_value(&ParamValue::Str("7".into())), "7");
        assert_eq!(
            control.transform_device_value(&ParamValue::Str("on".into())),
            "on"
        );
        let plain = ControlSpec {
            name: "u".into(),
            ..Default::default()
        };
        assert_eq!(
            plain.transform_device_value(&ParamValue::Float(0.012)),
            "0.012"
        );
        assert_eq!(plain.transform_device_value(&ParamValue::Float(7018.0)), "7018");
    }

    #[test]
    fn test_should_poll() {
        let button = ControlSpec {
            name: "b".into(),
            control_type: "pushbutton".into(),
            ..Default::default()
        };
        assert!(!button.should_poll());
        let value = ControlSpec {
            name: "v".into(),
            control_type: "voltage".into(),
            ..Default::default()
        };
        assert!(value.should_poll());
    }

    #[test]
    fn test_scpi_spec_yaml_shape() {
        let spec: ScpiParameterSpec = serde_yaml::from_str(
            "scpiname: MEAS:VOLT\ncontrol:\n  name: voltage\n  units: V\n  type: voltage\n",
        )
        .unwrap();
        assert_eq!(spec.scpi_name, "MEAS:VOLT");
        assert_eq!(spec.control.name, "voltage");
    }
}
