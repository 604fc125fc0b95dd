//! ERN protocol adapter.
//!
//! Commands are `Z<addr><cmd>` where `addr` is the two-digit per-port bus
//! address and `cmd` a short command code. Replies start with
//! `!<addr><first-char-of-cmd>`, optionally followed by `>` and `+`-separated
//! data fields encoded in Windows-1251. Numeric fields use `,` as the decimal
//! separator.

use super::{
    FactoryFn, ParamValue, Parameter, ParameterSpec, ParseFn, Protocol, ProtocolRegistry,
    IDENTIFY_ATTEMPTS,
};
use crate::commander::Commander;
use crate::config::{ControlSpec, PortConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use encoding_rs::WINDOWS_1251;
use log::error;
use serde::Deserialize;

/// Parses an ERN reply to `command_str`, expecting `expect_items` data
/// fields (0 means the data portion is ignored).
fn parse_ern_response(resp: &[u8], command_str: &str, expect_items: usize) -> Result<Vec<String>> {
    let prefix = format!("!{}", &command_str[..3]);
    if !resp.starts_with(prefix.as_bytes()) {
        return Err(Error::Protocol(format!(
            "bad ern response {:?}",
            String::from_utf8_lossy(resp)
        )));
    }
    if resp.len() == prefix.len() {
        return Ok(Vec::new());
    }
    if resp[prefix.len()] != b'>' {
        return Err(Error::Protocol(format!(
            "malformed response {:?}",
            String::from_utf8_lossy(resp)
        )));
    }
    if expect_items == 0 {
        return Ok(Vec::new());
    }

    let (decoded, _, had_errors) = WINDOWS_1251.decode(&resp[prefix.len() + 1..]);
    if had_errors {
        return Err(Error::Protocol(format!(
            "error decoding device response {:?}",
            String::from_utf8_lossy(resp)
        )));
    }
    let data = decoded.into_owned();
    if expect_items > 1 {
        let parts: Vec<String> = data.split('+').map(String::from).collect();
        if parts.len() != expect_items {
            return Err(Error::Protocol(format!(
                "insufficient N of response items: {:?}",
                String::from_utf8_lossy(resp)
            )));
        }
        return Ok(parts);
    }
    Ok(vec![data])
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErnParameterSpec {
    #[serde(default)]
    pub command: String,
    /// Expected raw reply length; checked when non-zero.
    #[serde(default, rename = "resplen")]
    pub resp_len: usize,
    /// Leading data fields to discard (e.g. an echo of the request).
    #[serde(default, rename = "respskip")]
    pub resp_skip: usize,
    #[serde(default)]
    pub controls: Vec<ControlSpec>,
}

impl ErnParameterSpec {
    pub fn should_poll(&self) -> bool {
        self.controls.iter().any(|c| c.should_poll())
    }

    pub fn settable(&self) -> bool {
        self.controls.iter().any(|c| c.writable)
    }

    pub fn validate(&self) -> Result<()> {
        for control in &self.controls {
            control.validate()?;
        }
        if self.command.is_empty() {
            return Err(Error::Validation("ern: no command specified".into()));
        }
        Ok(())
    }
}

struct ErnParameter {
    spec: ErnParameterSpec,
    address: u8,
}

impl ErnParameter {
    fn command_str(&self) -> String {
        format!("{:02}{}", self.address, self.spec.command)
    }

    fn parse_response(&self, resp: &[u8], expect_data: bool) -> Result<Vec<String>> {
        let expect_items = if expect_data {
            self.spec.controls.len() + self.spec.resp_skip
        } else {
            0
        };
        let parts =
            parse_ern_response(resp, &self.command_str(), expect_items).map_err(|err| match err {
                Error::Protocol(msg) => {
                    Error::Protocol(format!("parameter {}: {}", self.name(), msg))
                }
                other => other,
            })?;
        Ok(parts
            .get(self.spec.resp_skip..)
            .unwrap_or_default()
            .to_vec())
    }
}

#[async_trait]
impl Parameter for ErnParameter {
    fn name(&self) -> String {
        self.command_str()
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
            .query(&format!("Z{}", self.command_str()))
            .await?;
        if self.spec.resp_len != 0 && resp.len() != self.spec.resp_len {
            return Err(Error::Protocol(format!(
                "parameter {}: unexpected response length {} (expected {})",
                self.name(),
                resp.len(),
                self.spec.resp_len
            )));
        }
        let values = self.parse_response(&resp, true)?;
        if values.len() != self.spec.controls.len() {
            return Err(Error::Protocol(format!(
                "parameter {}: mismatched number of values",
                self.name()
            )));
        }
        for (control, value) in self.spec.controls.iter().zip(values) {
            if control.control_type == "text" {
                handler(&control.name, ParamValue::Str(value));
            } else {
                let normalized = value.replace(',', ".");
                let number: f64 = normalized.parse().map_err(|err| {
                    Error::Protocol(format!("can't parse number {:?}: {}", normalized, err))
                })?;
                handler(&control.name, ParamValue::Float(number));
            }
        }
        Ok(())
    }

    async fn set(&self, commander: &dyn Commander, _control: &str, _value: &str) -> Result<()> {
        // TODO: support writing value controls, not just pushbuttons
        let resp = commander
            .query(&format!("Z{}", self.command_str()))
            .await?;
        self.parse_response(&resp, false)?;
        Ok(())
    }
}

pub struct ErnProtocol {
    id_substring: String,
    address: u8,
}

impl ErnProtocol {
    pub fn new(config: &PortConfig) -> Result<Self> {
        if config.settings.address >= 100 {
            return Err(Error::Validation(format!(
                "ern: bad address {}",
                config.settings.address
            )));
        }
        Ok(Self {
            id_substring: config.settings.id_substring.clone(),
            address: config.settings.address,
        })
    }
}

#[async_trait]
impl Protocol for ErnProtocol {
    async fn identify(&self, commander: &dyn Commander) -> Result<String> {
        let command_str = format!("{:02}NN", self.address);
        let mut last_err = Error::Timeout;
        for _ in 0..IDENTIFY_ATTEMPTS {
            match commander.query(&format!("Z{}", command_str)).await {
                Err(Error::Timeout) => {
                    error!("Identify() timeout");
                    last_err = Error::Timeout;
                }
                Err(err) => {
                    error!("Identify() error: {}", err);
                    return Err(err);
                }
                Ok(resp) => {
                    let parts = parse_ern_response(&resp, &command_str, 1)?;
                    let id = parts.into_iter().next().ok_or_else(|| {
                        Error::Protocol("empty identification response".into())
                    })?;
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
        let ParameterSpec::Ern(spec) = spec else {
            return Err(Error::Validation("ERN parameter spec expected".into()));
        };
        Ok(Box::new(ErnParameter {
            spec: spec.clone(),
            address: self.address,
        }))
    }
}

pub fn register(registry: &mut ProtocolRegistry) {
    let parse: ParseFn = Box::new(|raw| {
        let spec: ErnParameterSpec = serde_yaml::from_value(raw.clone())
            .map_err(|err| Error::Validation(format!("bad ERN parameter: {}", err)))?;
        Ok(ParameterSpec::Ern(spec))
    });
    let factory: FactoryFn =
        Box::new(|config| Ok(Box::new(ErnProtocol::new(config)?) as Box<dyn Protocol>));
    registry.register("ern", parse, factory);
}
