//! SCPI protocol adapter.
//!
//! One parameter maps to one control. Reads send `MNEMONIC?` and publish the
//! raw response line; writes send `MNEMONIC value; *OPC?` (or bare
//! `MNEMONIC; *OPC?` for pushbuttons) and expect `1` back. Identification
//! uses `*IDN?`.

use super::{
    decode_utf8, FactoryFn, ParamValue, Parameter, ParameterSpec, ParseFn, Protocol,
    ProtocolRegistry, IDENTIFY_ATTEMPTS,
};
use crate::commander::Commander;
use crate::config::{ControlSpec, PortConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use log::error;
use serde::Deserialize;

pub const IDENTIFY_COMMAND: &str = "*IDN?";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScpiParameterSpec {
    #[serde(default)]
    pub control: ControlSpec,
    #[serde(default, rename = "scpiname")]
    pub scpi_name: String,
}

impl ScpiParameterSpec {
    pub fn controls(&self) -> &[ControlSpec] {
        std::slice::from_ref(&self.control)
    }

    pub fn should_poll(&self) -> bool {
        self.control.should_poll()
    }

    pub fn validate(&self) -> Result<()> {
        self.control.validate()?;
        if self.scpi_name.is_empty() {
            return Err(Error::Validation(format!(
                "no SCPI name specified for control {:?}",
                self.control.name
            )));
        }
        Ok(())
    }
}

struct ScpiParameter {
    spec: ScpiParameterSpec,
}

#[async_trait]
impl Parameter for ScpiParameter {
    fn name(&self) -> String {
        self.spec.scpi_name.clone()
    }

    async fn query<'a, 'b>(
        &'a self,
        commander: &dyn Commander,
        handler: &'b mut (dyn for<'r> FnMut(&'r str, ParamValue) + Send),
    ) -> Result<()>
    where
        'a: 'b,
    {
        let resp = commander
            .query(&format!("{}?", self.spec.scpi_name))
            .await?;
        let text = decode_utf8(resp)?;
        handler(&self.spec.control.name, ParamValue::Str(text));
        Ok(())
    }

    async fn set(&self, commander: &dyn Commander, _control: &str, value: &str) -> Result<()> {
        let command = if self.spec.control.control_type == "pushbutton" {
            format!("{}; *OPC?", self.spec.scpi_name)
        } else {
            format!("{} {}; *OPC?", self.spec.scpi_name, value)
        };
        let resp = commander.query(&command).await?;
        if resp != b"1" {
            return Err(Error::Device(format!(
                "unexpected set response {:?}",
                String::from_utf8_lossy(&resp)
            )));
        }
        Ok(())
    }
}

pub struct ScpiProtocol {
    id_substring: String,
}

impl ScpiProtocol {
    pub fn new(config: &PortConfig) -> Self {
        Self {
            id_substring: config.settings.id_substring.clone(),
        }
    }
}

#[async_trait]
impl Protocol for ScpiProtocol {
    async fn identify(&self, commander: &dyn Commander) -> Result<String> {
        let mut last_err = Error::Timeout;
        for _ in 0..IDENTIFY_ATTEMPTS {
            match commander.query(IDENTIFY_COMMAND).await {
                Err(Error::Timeout) => {
                    error!("Identify() timeout");
                    last_err = Error::Timeout;
                }
                Err(err) => {
                    error!("Identify() error: {}", err);
                    return Err(err);
                }
                Ok(resp) => {
                    let id = decode_utf8(resp)?;
                    if !self.id_substring.is_empty() && !id.contains(&self.id_substring) {
                        last_err = Error::Device(format!(
                            "bad id string {:?} (expected it to contain {:?})",
                            id, self.id_substring
                        ));
                        continue;
                    }
                    return Ok(id);
                }
            }
        }
        Err(last_err)
    }

    fn parameter(&self, spec: &ParameterSpec) -> Result<Box<dyn Parameter>> {
        let ParameterSpec::Scpi(spec) = spec else {
            return Err(Error::Validation("SCPI parameter spec expected".into()));
        };
        Ok(Box::new(ScpiParameter { spec: spec.clone() }))
    }
}

pub fn register(registry: &mut ProtocolRegistry) {
    let parse: ParseFn = Box::new(|raw| {
        let spec: ScpiParameterSpec = serde_yaml::from_value(raw.clone())
            .map_err(|err| Error::Validation(format!("bad SCPI parameter: {}", err)))?;
        Ok(ParameterSpec::Scpi(spec))
    });
    let factory: FactoryFn = Box::new(|config| Ok(Box::new(ScpiProtocol::new(config))));
    registry.register("scpi", parse, factory);
}
