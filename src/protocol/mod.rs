//! Protocol adapters.
//!
//! A protocol translates between the abstract parameter/control model and the
//! wire commands a particular instrument family understands. Protocols are
//! registered by name in a [`ProtocolRegistry`]; the registry also owns the
//! per-protocol parser that decodes raw YAML parameter payloads into typed
//! [`ParameterSpec`] variants, so each protocol keeps its own spec shape.

pub mod edwards;
pub mod ern;
pub mod scpi;

use crate::commander::Commander;
use crate::config::{ControlSpec, PortConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

/// How many times Identify retries transient failures (timeouts, ID
/// mismatches) before giving up.
pub(crate) const IDENTIFY_ATTEMPTS: usize = 10;

/// A value read from an instrument, before control-level transformation.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Float(f64),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Str(s) => write!(f, "{}", s),
            ParamValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Decodes a response that must be UTF-8 (SCPI, Edwards).
pub(crate) fn decode_utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|err| Error::Protocol(format!("invalid UTF-8 in device response: {}", err)))
}

/// Runtime counterpart of a [`ParameterSpec`]: knows how to read and write
/// its controls through a commander.
#[async_trait]
pub trait Parameter: Send + Sync {
    fn name(&self) -> String;

    /// Reads the parameter and reports each control's value through
    /// `handler`.
    async fn query<'a, 'b>(
        &'a self,
        commander: &dyn Commander,
        handler: &'b mut (dyn for<'r> FnMut(&'r str, ParamValue) + Send),
    ) -> Result<()>
    where
        'a: 'b;

    /// Writes `value` to the named control.
    async fn set(&self, commander: &dyn Commander, control: &str, value: &str) -> Result<()>;
}

#[async_trait]
pub trait Protocol: Send + Sync {
    /// Reads the instrument identification string, retrying transient
    /// failures and validating the configured ID substring.
    async fn identify(&self, commander: &dyn Commander) -> Result<String>;

    /// Builds the runtime parameter for a spec of this protocol.
    fn parameter(&self, spec: &ParameterSpec) -> Result<Box<dyn Parameter>>;
}

/// Typed parameter payload, one variant per protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterSpec {
    Scpi(scpi::ScpiParameterSpec),
    Edwards(edwards::EdwardsParameterSpec),
    Ern(ern::ErnParameterSpec),
}

impl ParameterSpec {
    pub fn controls(&self) -> &[ControlSpec] {
        match self {
            ParameterSpec::Scpi(spec) => spec.controls(),
            ParameterSpec::Edwards(spec) => &spec.controls,
            ParameterSpec::Ern(spec) => &spec.controls,
        }
    }

    /// True when the parameter participates in the poll loop.
    pub fn should_poll(&self) -> bool {
        match self {
            ParameterSpec::Scpi(spec) => spec.should_poll(),
            ParameterSpec::Edwards(spec) => spec.should_poll(),
            ParameterSpec::Ern(spec) => spec.should_poll(),
        }
    }

    /// True when the parameter can service writes for its writable controls.
    pub fn settable(&self) -> bool {
        match self {
            ParameterSpec::Scpi(_) => true,
            ParameterSpec::Edwards(spec) => spec.settable(),
            ParameterSpec::Ern(spec) => spec.settable(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ParameterSpec::Scpi(spec) => spec.validate(),
            ParameterSpec::Edwards(spec) => spec.validate(),
            ParameterSpec::Ern(spec) => spec.validate(),
        }
    }
}

pub type ParseFn = Box<dyn Fn(&serde_yaml::Value) -> Result<ParameterSpec> + Send + Sync>;
pub type FactoryFn = Box<dyn Fn(&PortConfig) -> Result<Box<dyn Protocol>> + Send + Sync>;

struct ProtocolEntry {
    parse: ParseFn,
    factory: FactoryFn,
}

/// Name → protocol mapping. Built explicitly at startup; tests can register
/// their own protocols or start from an empty registry.
pub struct ProtocolRegistry {
    entries: HashMap<String, ProtocolEntry>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registry with the three built-in protocols.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        scpi::register(&mut registry);
        edwards::register(&mut registry);
        ern::register(&mut registry);
        registry
    }

    pub fn register(&mut self, name: &str, parse: ParseFn, factory: FactoryFn) {
        self.entries
            .insert(name.to_string(), ProtocolEntry { parse, factory });
    }

    fn entry(&self, name: &str) -> Result<&ProtocolEntry> {
        self.entries
            .get(name)
            .ok_or_else(|| Error::Validation(format!("unknown protocol {:?}", name)))
    }

    pub fn create(&self, config: &PortConfig) -> Result<Box<dyn Protocol>> {
        (self.entry(&config.settings.protocol)?.factory)(config)
    }

    pub fn parse_parameter(
        &self,
        protocol: &str,
        raw: &serde_yaml::Value,
    ) -> Result<ParameterSpec> {
        (self.entry(protocol)?.parse)(raw)
    }
}
