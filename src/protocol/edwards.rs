//! Edwards TIC protocol adapter.
//!
//! Parameters address a numeric object ID with an optional sub-index. Reads
//! use `?V<oid>` or `?S<oid>`, writes `!C<oid>` or `!S<oid>`. Successful
//! responses echo the verb with a leading `=` and carry `;`-separated values
//! mapped positionally onto the parameter's controls; error responses lead
//! with `*` and carry a numeric code into a fixed message table. Writing one
//! slot of a multi-valued `!S` parameter reads the current tuple first and
//! writes it back with the slot substituted.

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

const ID_COMMAND: &str = "?S902";
const ID_RESPONSE_PREFIX: &str = "=S902 ";
const GENERAL_COMMAND: &str = "!C";
const SETUP_COMMAND: &str = "!S";
const QUERY_SETUP_COMMAND: &str = "?S";
const QUERY_VALUE_COMMAND: &str = "?V";

const ERROR_MESSAGES: [&str; 10] = [
    "no error",                         // 0
    "Invalid command for object ID",    // 1
    "Invalid query/command",            // 2
    "Missing parameter",                // 3
    "Parameter out of range",           // 4
    "Invalid command in current state", // 5
    "Data checksum error",              // 6
    "EEPROM read or write error",       // 7
    "Operation took too long",          // 8
    "Invalid config ID",                // 9
];

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EdwardsParameterSpec {
    #[serde(default)]
    pub oid: i64,
    #[serde(default)]
    pub sub: Option<i64>,
    #[serde(default)]
    pub controls: Vec<ControlSpec>,
    #[serde(default)]
    pub read: String,
    #[serde(default)]
    pub write: String,
}

impl EdwardsParameterSpec {
    pub fn should_poll(&self) -> bool {
        self.controls.iter().any(|c| c.should_poll())
    }

    pub fn settable(&self) -> bool {
        !self.write.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        for control in &self.controls {
            control.validate()?;
        }
        if self.oid <= 0 {
            return Err(Error::Validation(format!("invalid OID {}", self.oid)));
        }
        if let Some(sub) = self.sub {
            if sub < 0 {
                return Err(Error::Validation(format!(
                    "negative sub {}, OID={}",
                    sub, self.oid
                )));
            }
        }
        if self.read.is_empty() && self.write.is_empty() {
            return Err(Error::Validation(format!(
                "OID {}: must specify read and/or write command",
                self.oid
            )));
        }
        if !self.read.is_empty()
            && self.read != QUERY_SETUP_COMMAND
            && self.read != QUERY_VALUE_COMMAND
        {
            return Err(Error::Validation(format!(
                "OID {}: 'read' must be either empty, {:?} or {:?}, but is {:?}",
                self.oid, QUERY_SETUP_COMMAND, QUERY_VALUE_COMMAND, self.read
            )));
        }
        if !self.write.is_empty()
            && self.write != GENERAL_COMMAND
            && self.write != SETUP_COMMAND
        {
            return Err(Error::Validation(format!(
                "OID {}: 'write' must be either empty, {:?} or {:?}, but is {:?}",
                self.oid, GENERAL_COMMAND, SETUP_COMMAND, self.write
            )));
        }
        Ok(())
    }
}

struct EdwardsParameter {
    spec: EdwardsParameterSpec,
}

impl EdwardsParameter {
    /// Parses `=<verb><oid> [sub;]v1;v2;…` success frames and `*<verb><oid>
    /// code` error frames. Returns the positional values (sub echo removed).
    fn parse_response(&self, resp: &str, cmd_prefix: &str) -> Result<Vec<String>> {
        let bytes = resp.as_bytes();
        let prefix_bytes = cmd_prefix.as_bytes();
        let body_len = cmd_prefix.len() + 1;
        let invalid = || Error::Protocol(format!("invalid device response {:?}", resp));
        if bytes.len() <= body_len
            || &bytes[1..cmd_prefix.len()] != &prefix_bytes[1..]
            || bytes[cmd_prefix.len()] != b' '
        {
            return Err(invalid());
        }
        let tail = &resp[body_len..];
        match bytes[0] {
            b'*' => {
                let code: usize = tail
                    .parse()
                    .map_err(|_| Error::Protocol(format!("invalid error response {:?}", resp)))?;
                if code == 0 {
                    return Ok(Vec::new());
                }
                match ERROR_MESSAGES.get(code) {
                    Some(message) => Err(Error::Device((*message).to_string())),
                    None => Err(Error::Protocol(format!("invalid error code {}", code))),
                }
            }
            b'=' => {
                let mut values: Vec<String> = tail.split(';').map(String::from).collect();
                if let Some(sub) = self.spec.sub {
                    if values[0] != sub.to_string() {
                        return Err(Error::Protocol(format!(
                            "invalid sub in response: {}",
                            values[0]
                        )));
                    }
                    values.remove(0);
                }
                Ok(values)
            }
            _ => Err(invalid()),
        }
    }

    async fn command(
        &self,
        commander: &dyn Commander,
        verb: &str,
        data: &str,
    ) -> Result<Vec<String>> {
        let cmd_prefix = format!("{}{}", verb, self.spec.oid);
        let mut cmd = cmd_prefix.clone();
        if let Some(sub) = self.spec.sub {
            cmd.push_str(&format!(" {}", sub));
            if !data.is_empty() {
                cmd.push(';');
                cmd.push_str(data);
            }
        } else if !data.is_empty() {
            cmd.push(' ');
            cmd.push_str(data);
        }
        let resp = commander.query(&cmd).await?;
        self.parse_response(&decode_utf8(resp)?, &cmd_prefix)
    }

    async fn read_values(&self, commander: &dyn Commander) -> Result<Vec<String>> {
        let values = self.command(commander, &self.spec.read, "").await?;
        if values.len() != self.spec.controls.len() {
            return Err(Error::Protocol(
                "mismatched number of params in response".into(),
            ));
        }
        Ok(values)
    }
}

#[async_trait]
impl Parameter for EdwardsParameter {
    fn name(&self) -> String {
        match self.spec.sub {
            Some(sub) => format!("{}/{}", self.spec.oid, sub),
            None => self.spec.oid.to_string(),
        }
    }

    async fn query<'a, 'b>(
        &'a self,
        commander: &dyn Commander,
        handler: &'b mut (dyn for<'r> FnMut(&'r str, ParamValue) + Send),
    ) -> Result<()>
    where
        'a: 'b,
    {
        if self.spec.read.is_empty() {
            return Err(Error::Validation(format!(
                "no read command for {:?}",
                self.name()
            )));
        }
        let values = self.read_values(commander).await?;
        for (control, value) in self.spec.controls.iter().zip(values) {
            handler(&control.name, ParamValue::Str(value));
        }
        Ok(())
    }

    async fn set(&self, commander: &dyn Commander, control: &str, value: &str) -> Result<()> {
        let control_index = self
            .spec
            .controls
            .iter()
            .position(|c| c.name == control)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "bad control {:?} for param {:?}",
                    control,
                    self.name()
                ))
            })?;
        if self.spec.write.is_empty() {
            return Err(Error::Validation(format!(
                "no write command for {:?}",
                self.name()
            )));
        }

        let mut data = String::new();
        if self.spec.write == SETUP_COMMAND
            || (self.spec.write == GENERAL_COMMAND && self.spec.sub.is_none())
        {
            data = value.to_string();
        }
        if self.spec.write == SETUP_COMMAND && self.spec.controls.len() > 1 {
            // writing one slot of a multi-valued parameter requires the full
            // tuple, so read the current values first
            if self.spec.read.is_empty() {
                return Err(Error::Validation(format!(
                    "trying to write multi-valued param {:?} without read command",
                    self.name()
                )));
            }
            let mut values = self.read_values(commander).await?;
            values[control_index] = data;
            data = values.join(";");
        }

        let values = self.command(commander, &self.spec.write, &data).await?;
        if !values.is_empty() {
            return Err(Error::Protocol(
                "didn't expect values from set command".into(),
            ));
        }
        Ok(())
    }
}

pub struct EdwardsProtocol {
    id_substring: String,
}

impl EdwardsProtocol {
    pub fn new(config: &PortConfig) -> Self {
        Self {
            id_substring: config.settings.id_substring.clone(),
        }
    }
}

#[async_trait]
impl Protocol for EdwardsProtocol {
    async fn identify(&self, commander: &dyn Commander) -> Result<String> {
        let mut last_err = Error::Timeout;
        for _ in 0..IDENTIFY_ATTEMPTS {
            match commander.query(ID_COMMAND).await {
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
                    if !id.starts_with(ID_RESPONSE_PREFIX)
                        || (!self.id_substring.is_empty() && !id.contains(&self.id_substring))
                    {
                        last_err = Error::Device(format!(
                            "bad id string {:?} (expected it to contain {:?})",
                            id, self.id_substring
                        ));
                        continue;
                    }
                    let id = &id[ID_RESPONSE_PREFIX.len()..];
                    return Ok(id.replace('\0', "").replace(';', "/"));
                }
            }
        }
        Err(last_err)
    }

    fn parameter(&self, spec: &ParameterSpec) -> Result<Box<dyn Parameter>> {
        let ParameterSpec::Edwards(spec) = spec else {
            return Err(Error::Validation("EDWARDS parameter spec expected".into()));
        };
        Ok(Box::new(EdwardsParameter { spec: spec.clone() }))
    }
}

pub fn register(registry: &mut ProtocolRegistry) {
    let parse: ParseFn = Box::new(|raw| {
        let spec: EdwardsParameterSpec = serde_yaml::from_value(raw.clone())
            .map_err(|err| Error::Validation(format!("bad Edwards parameter: {}", err)))?;
        Ok(ParameterSpec::Edwards(spec))
    });
    let factory: FactoryFn = Box::new(|config| Ok(Box::new(EdwardsProtocol::new(config))));
    registry.register("edwards", parse, factory);
}
