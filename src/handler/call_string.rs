use std::collections::BTreeMap;

use log::debug;

use super::{HandlerConfig, HandlerRegistry, MethodInvocationHandler};
use crate::ast::{MethodId, NodeId, Program};
use crate::context::Context;
use crate::error::Result;
use crate::interpreter::run_method;
use crate::value::Value;

/// Bounded inlining.
///
/// A call re-runs the interpreter on the callee body as long as fewer than `maxrec`
/// activations of the callee are active; deeper calls are delegated to `bot`.
pub struct CallStringHandler {
    maxrec: usize,
    bot: Box<dyn MethodInvocationHandler>,
    active: BTreeMap<MethodId, usize>,
}

impl CallStringHandler {
    pub const KEYS: &'static [&'static str] = &["maxrec", "bot"];

    pub fn new(maxrec: usize, bot: Box<dyn MethodInvocationHandler>) -> Self {
        Self {
            maxrec,
            bot,
            active: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &HandlerConfig, registry: &HandlerRegistry) -> Result<Self> {
        config.check_keys(Self::KEYS)?;
        let maxrec = config.parse_or("maxrec", 2usize)?;
        let bot = registry.build(&config.nested_or("bot", "basic")?)?;
        Ok(Self::new(maxrec, bot))
    }

    pub fn maxrec(&self) -> usize {
        self.maxrec
    }
}

impl MethodInvocationHandler for CallStringHandler {
    fn name(&self) -> &'static str {
        "call_string"
    }

    fn setup(&mut self, ctx: &mut Context, program: &Program) -> Result<()> {
        self.active.clear();
        self.bot.setup(ctx, program)
    }

    fn analyze(
        &mut self,
        ctx: &mut Context,
        program: &Program,
        call: NodeId,
        method: MethodId,
        args: &[Value],
    ) -> Result<Value> {
        let depth = self.active.get(&method).copied().unwrap_or(0);
        if depth >= self.maxrec {
            debug!(
                "call #{}: {} is {} deep, using {}",
                call,
                program.method(method).name,
                depth,
                self.bot.name()
            );
            return self.bot.analyze(ctx, program, call, method, args);
        }
        self.active.insert(method, depth + 1);
        let result = run_method(ctx, program, self, method, args);
        self.active.insert(method, depth);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, ProgramBuilder};
    use crate::handler::BasicHandler;
    use crate::interpreter::run_program;
    use crate::lattice::{Sec, B};

    use test_log::test;

    /// `f(a) = a + 1`, `x = f(f(2))`.
    fn program() -> (crate::ast::Program, NodeId) {
        let mut b = ProgramBuilder::new();
        let (f, params) = b.declare_method("f", &["a"]);
        let a = b.var(params[0]);
        let one = b.int(1);
        let sum = b.binary(BinaryOp::Add, a, one);
        let ret = b.ret(Some(sum));
        b.define_method(f, vec![ret]);

        let x = b.declare("x");
        let two = b.int(2);
        let inner = b.call(f, vec![two]);
        let outer = b.call(f, vec![inner]);
        let out = b.output(x, Sec::L, outer);
        (b.finish(vec![out]), outer)
    }

    #[test]
    fn test_inlining_computes_constants() {
        let (program, outer) = program();
        let mut ctx = Context::default();
        let mut handler = CallStringHandler::new(1, Box::new(BasicHandler));
        handler.setup(&mut ctx, &program).unwrap();
        run_program(&mut ctx, &program, &mut handler).unwrap();
        let value = ctx.node_value(outer).unwrap();
        assert_eq!(value.as_constant(ctx.arena()), Some(4.into()));
    }

    #[test]
    fn test_zero_bound_never_inlines() {
        let (program, outer) = program();
        let mut ctx = Context::default();
        let mut handler = CallStringHandler::new(0, Box::new(BasicHandler));
        run_program(&mut ctx, &program, &mut handler).unwrap();
        let value = ctx.node_value(outer).unwrap();
        assert!(value.bits().iter().all(|&b| ctx.arena().value(b) == B::U));
    }

    #[test]
    fn test_recursion_is_bounded() {
        // f(a) = f(a), called once from main.
        let mut b = ProgramBuilder::new();
        let (f, params) = b.declare_method("f", &["a"]);
        let a = b.var(params[0]);
        let rec = b.call(f, vec![a]);
        let ret = b.ret(Some(rec));
        b.define_method(f, vec![ret]);
        let h = b.declare("h");
        let x = b.declare("x");
        let input = b.input(h, Sec::H, "0b0u").unwrap();
        let arg = b.var(h);
        let call = b.call(f, vec![arg]);
        let out = b.output(x, Sec::L, call);
        let program = b.finish(vec![input, out]);

        let mut ctx = Context::default();
        let mut handler = CallStringHandler::new(3, Box::new(BasicHandler));
        run_program(&mut ctx, &program, &mut handler).unwrap();
        let value = ctx.node_value(call).unwrap();
        let input_bit = ctx.node_value(arg).unwrap().bit(1);
        assert!(ctx.arena().reachable([value.bit(1)], |_| false).contains(input_bit));
    }
}
