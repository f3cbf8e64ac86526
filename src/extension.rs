//! Per-frame extension transforms and the stack that applies them.
//!
//! Extensions (RFC 6455 Section 9) rewrite data frames between the
//! application and the wire. The only widely deployed one is
//! permessage-deflate, implemented in [`crate::deflate`], but the stack is
//! generic: any number of transforms, applied in negotiation order on the way
//! out and in reverse on the way in. Control frames bypass every transform.
//!
//! Negotiation itself (the HTTP header exchange) happens upstream; this
//! module receives the already-agreed extension list as a
//! `Sec-WebSocket-Extensions`-style string and instantiates the transforms
//! through an [`ExtensionRegistry`].

use std::collections::HashMap;

use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::space0,
    combinator::opt,
    sequence::{pair, preceded},
    IResult, Parser,
};

use crate::{Frame, Result, WebSocketError};

/// A negotiated per-frame transform.
///
/// `encode` rewrites an outbound data frame, `decode` an inbound one. The
/// stack guarantees both are only called with data frames, in order, one
/// frame at a time, so implementations may keep streaming state across calls
/// (permessage-deflate keeps its LZ77 window between messages).
pub trait Extension: Send {
    /// The negotiated extension token, e.g. `permessage-deflate`.
    fn name(&self) -> &str;

    /// Whether this extension claims the RSV1 bit on data frames.
    fn rsv1(&self) -> bool {
        false
    }

    /// Transforms an outbound data frame. Errors are fatal to the session.
    fn encode(&mut self, frame: Frame) -> Result<Frame>;

    /// Transforms an inbound data frame. Errors are fatal to the session.
    fn decode(&mut self, frame: Frame) -> Result<Frame>;
}

/// One entry of a parsed extension offer list: the extension token plus its
/// parameters in written order. A parameter without `=` carries `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionConfig {
    pub name: String,
    pub params: Vec<(String, Option<String>)>,
}

impl ExtensionConfig {
    /// Looks up a parameter by name.
    ///
    /// # Returns
    /// - `Some(Some(value))` for `name=value`
    /// - `Some(None)` for a bare flag
    /// - `None` if the parameter is absent
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_deref())
    }

    /// Whether a bare or valued parameter with this name is present.
    pub fn has_param(&self, name: &str) -> bool {
        self.param(name).is_some()
    }

    /// Parses a `Sec-WebSocket-Extensions`-style list:
    /// comma-separated extensions, each a token followed by
    /// `; param` or `; param=value` entries.
    ///
    /// # Returns
    /// The configurations in list order, or
    /// [`WebSocketError::Extension`] on malformed input.
    pub fn parse_list(input: &str) -> Result<Vec<Self>> {
        let mut configs = Vec::new();
        let mut remaining = input.trim();

        if remaining.is_empty() {
            return Ok(configs);
        }

        loop {
            let (rest, config) =
                parse_extension(remaining).map_err(|err| WebSocketError::Extension(format!(
                    "malformed extension list {input:?}: {err}"
                )))?;
            configs.push(config);

            let rest = rest.trim_start();
            if rest.is_empty() {
                break Ok(configs);
            }
            let (rest, _) = tag::<_, _, nom::error::Error<&str>>(",")(rest).map_err(|_| {
                WebSocketError::Extension(format!("malformed extension list {input:?}"))
            })?;
            remaining = rest.trim_start();
        }
    }
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '-')(input)
}

/// Parses one extension entry: `name` followed by `; key[=value]` params,
/// stopping before the next `,` or the end of input.
fn parse_extension(input: &str) -> IResult<&str, ExtensionConfig> {
    let (mut input, name) = token(input)?;

    let mut params = Vec::new();
    loop {
        let trimmed = input.trim_start();
        if !trimmed.starts_with(';') {
            break Ok((
                input,
                ExtensionConfig {
                    name: name.to_owned(),
                    params,
                },
            ));
        }

        let (rest, (key, value)) = preceded(
            space0,
            preceded(
                tag(";"),
                preceded(space0, pair(token, opt(preceded(tag("="), token)))),
            ),
        )
        .parse(input)?;

        params.push((key.to_owned(), value.map(str::to_owned)));
        input = rest;
    }
}

/// Builds extension instances from negotiated configurations.
///
/// Factories are registered per extension token. Negotiation happened
/// upstream, so a configuration naming an unregistered extension is an
/// error, not something to skip.
#[derive(Default)]
pub struct ExtensionRegistry {
    factories: HashMap<String, ExtensionFactory>,
}

type ExtensionFactory = Box<dyn Fn(&ExtensionConfig) -> Result<Box<dyn Extension>> + Send + Sync>;

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for the given extension token, replacing any
    /// previous registration.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ExtensionConfig) -> Result<Box<dyn Extension>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Instantiates the stack for a negotiated extension list, preserving
    /// list order.
    pub fn build(&self, negotiated: &str) -> Result<ExtensionStack> {
        let configs = ExtensionConfig::parse_list(negotiated)?;
        let mut extensions = Vec::with_capacity(configs.len());

        for config in &configs {
            let factory = self.factories.get(&config.name).ok_or_else(|| {
                WebSocketError::Extension(format!("unknown extension {:?}", config.name))
            })?;
            extensions.push(factory(config)?);
        }

        Ok(ExtensionStack::new(extensions))
    }
}

/// The ordered list of negotiated transforms.
///
/// Outbound frames pass through the extensions in registration order,
/// inbound frames in reverse, so the stack behaves like nested wrapping.
/// Frames are never reordered, dropped or duplicated; control frames pass
/// through untouched.
pub struct ExtensionStack {
    extensions: Vec<Box<dyn Extension>>,
}

impl ExtensionStack {
    pub fn new(extensions: Vec<Box<dyn Extension>>) -> Self {
        Self { extensions }
    }

    /// A stack with no transforms; frames pass through unchanged.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Whether any negotiated extension claims the RSV1 bit.
    pub fn rsv1(&self) -> bool {
        self.extensions.iter().any(|ext| ext.rsv1())
    }

    /// Applies the outbound transforms in order.
    pub fn encode(&mut self, frame: Frame) -> Result<Frame> {
        if frame.opcode.is_control() {
            return Ok(frame);
        }
        self.extensions
            .iter_mut()
            .try_fold(frame, |frame, ext| ext.encode(frame))
    }

    /// Applies the inbound transforms in reverse order.
    pub fn decode(&mut self, frame: Frame) -> Result<Frame> {
        if frame.opcode.is_control() {
            return Ok(frame);
        }
        self.extensions
            .iter_mut()
            .rev()
            .try_fold(frame, |frame, ext| ext.decode(frame))
    }
}
