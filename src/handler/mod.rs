//! Method invocation handlers.
//!
//! The interpreter delegates every call expression to a [`MethodInvocationHandler`]. Three
//! strategies are provided:
//!
//! - [`BasicHandler`]: a fully unknown result depending on every non-constant argument bit;
//! - [`CallStringHandler`]: inlines callee bodies up to a recursion bound per method;
//! - [`SummaryHandler`]: precomputes a [`BitGraph`] summary per method and instantiates it at
//!   every call site.
//!
//! Handlers are built from a textual [`HandlerConfig`] through a [`HandlerRegistry`].

mod bit_graph;
mod call_string;
mod config;
mod summary;

use std::collections::BTreeMap;
use std::fmt;

use log::{debug, info};

pub use self::bit_graph::{BitGraph, ParamBit, Reduction, SummaryNode};
pub use self::call_string::CallStringHandler;
pub use self::config::HandlerConfig;
pub use self::summary::{Mode, SummaryHandler};

use crate::ast::{MethodId, NodeId, Program};
use crate::context::Context;
use crate::error::Result;
use crate::operator::unknown_over;
use crate::value::Value;

pub trait MethodInvocationHandler {
    fn name(&self) -> &'static str;

    /// Prepares the handler for a run over `program`.
    fn setup(&mut self, _ctx: &mut Context, _program: &Program) -> Result<()> {
        Ok(())
    }

    /// Computes the value of the call expression `call` invoking `method` with `args`.
    fn analyze(
        &mut self,
        ctx: &mut Context,
        program: &Program,
        call: NodeId,
        method: MethodId,
        args: &[Value],
    ) -> Result<Value>;
}

impl fmt::Debug for dyn MethodInvocationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodInvocationHandler({})", self.name())
    }
}

/// Fully unknown result of the widest argument's width, depending on every non-constant
/// argument bit.
#[derive(Debug, Default, Copy, Clone)]
pub struct BasicHandler;

impl MethodInvocationHandler for BasicHandler {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn analyze(
        &mut self,
        ctx: &mut Context,
        program: &Program,
        call: NodeId,
        method: MethodId,
        args: &[Value],
    ) -> Result<Value> {
        let width = args.iter().map(Value::width).max().unwrap_or_else(|| ctx.bit_width());
        debug!("basic result for call #{} of {}", call, program.method(method).name);
        unknown_over(ctx, width, args)
    }
}

pub type HandlerFactory = fn(&HandlerConfig, &HandlerRegistry) -> Result<Box<dyn MethodInvocationHandler>>;

/// Maps handler names to constructors.
#[derive(Clone)]
pub struct HandlerRegistry {
    factories: BTreeMap<&'static str, HandlerFactory>,
}

impl Default for HandlerRegistry {
    /// Registry with the `basic`, `call_string` and `summary` handlers.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("basic", |config, _| {
            config.check_keys(&[])?;
            Ok(Box::new(BasicHandler))
        });
        registry.register("call_string", |config, registry| {
            Ok(Box::new(CallStringHandler::from_config(config, registry)?))
        });
        registry.register("summary", |config, registry| {
            Ok(Box::new(SummaryHandler::from_config(config, registry)?))
        });
        registry
    }
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, factory: HandlerFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    pub fn build(&self, config: &HandlerConfig) -> Result<Box<dyn MethodInvocationHandler>> {
        let name = config.handler()?;
        let factory = self.factories.get(name).ok_or_else(|| {
            let names: Vec<&str> = self.names().collect();
            config.error(format!("unknown handler {:?}, valid handlers are: {}", name, names.join(", ")))
        })?;
        let handler = factory(config, self)?;
        info!("using handler {}", config);
        Ok(handler)
    }

    /// Parses `config` and builds the handler it describes.
    pub fn parse(&self, config: &str) -> Result<Box<dyn MethodInvocationHandler>> {
        self.build(&HandlerConfig::parse(config)?)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}
