use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use log::{debug, info, warn};

use super::{BitGraph, CallStringHandler, HandlerConfig, HandlerRegistry, MethodInvocationHandler, Reduction};
use crate::ast::{MethodId, NodeId, Program};
use crate::call_graph::{CallGraph, CallNode};
use crate::context::Context;
use crate::dot::{DotDirSink, GraphSink, NullSink};
use crate::error::{invariant_error, Error, Result};
use crate::interpreter::run_method;
use crate::operator::unknown_over;
use crate::value::Value;

/// Steps after which a method is no longer re-summarized in induction mode.
const INDUCTION_LIMIT: usize = 100;

/// Fixpoint strategy for summary computation.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum Mode {
    /// Start from summaries without dependencies and grow them.
    Induction,
    /// Start from the fallback handler's results and shrink them, at most `maxiter` times
    /// per method.
    Coinduction,
    /// Induction for non-recursive programs, coinduction otherwise.
    #[default]
    Auto,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ind" => Ok(Mode::Induction),
            "coind" => Ok(Mode::Coinduction),
            "auto" => Ok(Mode::Auto),
            _ => Err("expected ind, coind or auto".to_string()),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Induction => write!(f, "ind"),
            Mode::Coinduction => write!(f, "coind"),
            Mode::Auto => write!(f, "auto"),
        }
    }
}

/// Instantiates precomputed summaries, falling back to an unknown result for methods
/// without one.
struct SummaryLookup {
    summaries: BTreeMap<MethodId, BitGraph>,
}

impl SummaryLookup {
    fn from_state(state: &BTreeMap<CallNode, Option<BitGraph>>) -> Self {
        let summaries = state
            .iter()
            .filter_map(|(node, graph)| Some((node.method()?, graph.clone()?)))
            .collect();
        Self { summaries }
    }
}

impl MethodInvocationHandler for SummaryLookup {
    fn name(&self) -> &'static str {
        "summary"
    }

    fn analyze(
        &mut self,
        ctx: &mut Context,
        program: &Program,
        call: NodeId,
        method: MethodId,
        args: &[Value],
    ) -> Result<Value> {
        match self.summaries.get(&method) {
            Some(graph) => graph.apply_to_args(ctx, args),
            None => {
                debug!("call #{}: no summary for {}", call, program.method(method).name);
                let width = args.iter().map(Value::width).max().unwrap_or_else(|| ctx.bit_width());
                unknown_over(ctx, width, args)
            }
        }
    }
}

/// Summary-based handler.
///
/// [`setup`](MethodInvocationHandler::setup) computes a [`BitGraph`] per reachable method by
/// a worklist fixpoint over the call graph: a method is analyzed on fully unknown parameters,
/// with calls in its body resolved through the current summaries, and its callers are
/// revisited whenever its summary changes. Calls are then answered by instantiating the
/// summaries (inlining up to `csmaxrec` levels first, if configured).
pub struct SummaryHandler {
    mode: Mode,
    reduction: Reduction,
    maxiter: usize,
    csmaxrec: usize,
    dot: Option<PathBuf>,
    bot: Box<dyn MethodInvocationHandler>,
    summaries: BTreeMap<MethodId, BitGraph>,
    inner: Option<Box<dyn MethodInvocationHandler>>,
}

impl SummaryHandler {
    pub const KEYS: &'static [&'static str] = &["maxiter", "bot", "mode", "reduction", "csmaxrec", "dot"];

    pub fn new(mode: Mode, reduction: Reduction, bot: Box<dyn MethodInvocationHandler>) -> Self {
        Self {
            mode,
            reduction,
            maxiter: 1,
            csmaxrec: 0,
            dot: None,
            bot,
            summaries: BTreeMap::new(),
            inner: None,
        }
    }

    pub fn from_config(config: &HandlerConfig, registry: &HandlerRegistry) -> Result<Self> {
        config.check_keys(Self::KEYS)?;
        let mode = config.parse_or("mode", Mode::default())?;
        let reduction = config.parse_or("reduction", Reduction::default())?;
        let bot = registry.build(&config.nested_or("bot", "basic")?)?;
        let mut handler = Self::new(mode, reduction, bot)
            .with_maxiter(config.parse_or("maxiter", 1usize)?)
            .with_csmaxrec(config.parse_or("csmaxrec", 0usize)?);
        if let Some(dir) = config.get("dot").filter(|d| !d.is_empty()) {
            handler = handler.with_dot(dir);
        }
        Ok(handler)
    }

    pub fn with_maxiter(mut self, maxiter: usize) -> Self {
        self.maxiter = maxiter;
        self
    }

    /// Inline calls up to `csmaxrec` levels per method before using summaries.
    pub fn with_csmaxrec(mut self, csmaxrec: usize) -> Self {
        self.csmaxrec = csmaxrec;
        self
    }

    /// Write every intermediate summary as a DOT file into `dir`.
    pub fn with_dot(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dot = Some(dir.into());
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    /// The summary of `method` computed by the last setup.
    pub fn summary(&self, method: MethodId) -> Option<&BitGraph> {
        self.summaries.get(&method)
    }

    pub fn summaries(&self) -> impl Iterator<Item = &BitGraph> {
        self.summaries.values()
    }

    fn compute_summaries(&mut self, ctx: &Context, program: &Program) -> Result<BTreeMap<MethodId, BitGraph>> {
        let graph = CallGraph::new(program);
        let recursive = graph.is_recursive();
        let mode = match self.mode {
            Mode::Auto if recursive => Mode::Coinduction,
            Mode::Auto => Mode::Induction,
            mode => mode,
        };
        if mode == Mode::Induction && recursive {
            warn!("induction over a recursive program might not converge");
        }
        info!("computing summaries ({} mode, {} reduction)", mode, self.reduction);

        let depth = graph.loop_depth();
        let mut scratch = Context::new(ctx.lattice(), ctx.bit_width());
        scratch.set_cancellation_token(ctx.cancellation_token().clone());
        let mut sink: Box<dyn GraphSink> = match &self.dot {
            Some(dir) => Box::new(DotDirSink::new(dir)?),
            None => Box::new(NullSink),
        };

        let mut initial = BTreeMap::new();
        initial.insert(CallNode::Main, None);
        for &node in graph.post_order() {
            let Some(method) = node.method() else {
                continue;
            };
            let start = match mode {
                Mode::Coinduction => {
                    let params = abstract_params(&mut scratch, program, method)?;
                    let call = program.method(method).body.unwrap_or_else(|| program.main());
                    let ret = self.bot.analyze(&mut scratch, program, call, method, &params)?;
                    BitGraph::reduce(&scratch, program, method, &params, &ret, self.reduction)
                }
                _ => BitGraph::empty(program, method, ctx.bit_width()),
            };
            initial.insert(node, Some(start));
        }

        let reduction = self.reduction;
        let limit = match mode {
            Mode::Coinduction => self.maxiter,
            _ => INDUCTION_LIMIT,
        };
        let mut iterations: BTreeMap<MethodId, usize> = BTreeMap::new();
        let state = graph.worklist(
            |node, state| {
                let Some(method) = node.method() else {
                    return Ok(None);
                };
                let count = iterations.entry(method).or_insert(0);
                if *count >= limit {
                    warn!("{}: keeping summary after {} iterations", program.method(method).name, limit);
                    return Ok(state.get(&node).cloned().flatten());
                }
                *count += 1;
                let iteration = *count;

                let mut lookup = SummaryLookup::from_state(state);
                let params = abstract_params(&mut scratch, program, method)?;
                let ret = run_method(&mut scratch, program, &mut lookup, method, &params)?;
                if !scratch.io().inputs().is_empty() || !scratch.io().outputs().is_empty() {
                    return Err(Error::Unsupported(format!(
                        "method {} declares inputs or outputs",
                        program.method(method).name
                    )));
                }
                let summary = BitGraph::reduce(&scratch, program, method, &params, &ret, reduction);
                debug!("iteration {}: {}", iteration, summary);
                sink.emit(&format!("{}_{}", summary.name(), iteration), &|| summary.to_dot())?;
                Ok(Some(summary))
            },
            |_| None,
            |node| graph.callers(node).iter().copied().collect(),
            |node| depth.get(&node).copied().unwrap_or(0),
            initial,
        )?;

        let summaries: BTreeMap<MethodId, BitGraph> = state
            .into_iter()
            .filter_map(|(node, graph)| Some((node.method()?, graph?)))
            .collect();
        for summary in summaries.values() {
            sink.emit(summary.name(), &|| summary.to_dot())?;
        }
        info!("computed {} summaries", summaries.len());
        Ok(summaries)
    }
}

/// Fresh unknown values for the parameters of `method`.
fn abstract_params(scratch: &mut Context, program: &Program, method: MethodId) -> Result<Vec<Value>> {
    let width = scratch.bit_width();
    program
        .method(method)
        .params
        .iter()
        .map(|_| scratch.fresh_unknown_value(width))
        .collect()
}

impl MethodInvocationHandler for SummaryHandler {
    fn name(&self) -> &'static str {
        "summary"
    }

    fn setup(&mut self, ctx: &mut Context, program: &Program) -> Result<()> {
        self.bot.setup(ctx, program)?;
        self.summaries = self.compute_summaries(ctx, program)?;
        let lookup: Box<dyn MethodInvocationHandler> = Box::new(SummaryLookup {
            summaries: self.summaries.clone(),
        });
        let inner: Box<dyn MethodInvocationHandler> = if self.csmaxrec > 0 {
            let mut handler = CallStringHandler::new(self.csmaxrec, lookup);
            handler.setup(ctx, program)?;
            Box::new(handler)
        } else {
            lookup
        };
        self.inner = Some(inner);
        Ok(())
    }

    fn analyze(
        &mut self,
        ctx: &mut Context,
        program: &Program,
        call: NodeId,
        method: MethodId,
        args: &[Value],
    ) -> Result<Value> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| invariant_error!("summary handler used before setup"))?;
        inner.analyze(ctx, program, call, method, args)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::ast::{BinaryOp, ProgramBuilder};
    use crate::bit::Bit;
    use crate::handler::BasicHandler;
    use crate::interpreter::run_program;
    use crate::lattice::{Sec, SecurityLattice};

    use test_log::test;

    /// `main: l = f(h1, h2)` with `f` built by `body`.
    fn program(op: BinaryOp) -> (Program, MethodId, NodeId) {
        let mut b = ProgramBuilder::new();
        let (f, params) = b.declare_method("f", &["a", "b"]);
        let a = b.var(params[0]);
        let c = b.var(params[1]);
        let e = b.binary(op, a, c);
        let ret = b.ret(Some(e));
        b.define_method(f, vec![ret]);

        let h1 = b.declare("h1");
        let h2 = b.declare("h2");
        let l = b.declare("l");
        let in1 = b.input(h1, Sec::H, "0buuuu").unwrap();
        let in2 = b.input(h2, Sec::H, "0buuuu").unwrap();
        let x = b.var(h1);
        let y = b.var(h2);
        let call = b.call(f, vec![x, y]);
        let out = b.output(l, Sec::L, call);
        (b.finish(vec![in1, in2, out]), f, call)
    }

    /// For every result bit, the positions of the secret input bits it reaches.
    fn reached_inputs(ctx: &Context, value: &Value) -> Vec<BTreeSet<usize>> {
        let inputs: Vec<Bit> = ctx.io().input_bits(Sec::H).collect();
        value
            .bits()
            .iter()
            .map(|&bit| {
                let reached = ctx.arena().reachable([bit], |_| false);
                inputs
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| reached.contains(**b))
                    .map(|(position, _)| position)
                    .collect()
            })
            .collect()
    }

    fn run(program: &Program, call: NodeId, handler: &mut dyn MethodInvocationHandler) -> Vec<BTreeSet<usize>> {
        let mut ctx = Context::new(SecurityLattice::Basic, 4);
        handler.setup(&mut ctx, program).unwrap();
        run_program(&mut ctx, program, handler).unwrap();
        let value = ctx.node_value(call).unwrap().clone();
        reached_inputs(&ctx, &value)
    }

    #[test]
    fn test_summary_matches_inlining() {
        for op in [BinaryOp::Xor, BinaryOp::Add] {
            for reduction in [Reduction::Basic, Reduction::MinCut] {
                let (program, _, call) = program(op);
                let inlined = run(&program, call, &mut CallStringHandler::new(1, Box::new(BasicHandler)));
                let summarized = run(&program, call, &mut SummaryHandler::new(Mode::Auto, reduction, Box::new(BasicHandler)));
                assert_eq!(inlined, summarized, "{:?} {:?}", op, reduction);
            }
        }
        // Bit 1 of a xor reaches exactly bit 1 of both secrets.
        let (program, _, call) = program(BinaryOp::Xor);
        let summarized = run(&program, call, &mut SummaryHandler::new(Mode::Auto, Reduction::MinCut, Box::new(BasicHandler)));
        assert_eq!(summarized[0], BTreeSet::from([0, 4]));
    }

    #[test]
    fn test_summaries_are_computed() {
        let (program, f, _) = program(BinaryOp::Xor);
        let mut ctx = Context::new(SecurityLattice::Basic, 4);
        let mut handler = SummaryHandler::new(Mode::Induction, Reduction::Basic, Box::new(BasicHandler));
        handler.setup(&mut ctx, &program).unwrap();
        let summary = handler.summary(f).unwrap();
        assert_eq!(summary.width(), 4);
        for i in 1..=4 {
            assert_eq!(summary.dependencies(i).len(), 2);
        }
    }

    #[test]
    fn test_recursive_coinduction_terminates() {
        // f(a) = f(a) ^ a
        let mut b = ProgramBuilder::new();
        let (f, params) = b.declare_method("f", &["a"]);
        let a = b.var(params[0]);
        let rec = b.call(f, vec![a]);
        let a2 = b.var(params[0]);
        let x = b.binary(BinaryOp::Xor, rec, a2);
        let ret = b.ret(Some(x));
        b.define_method(f, vec![ret]);
        let h = b.declare("h");
        let input = b.input(h, Sec::H, "0buu").unwrap();
        let arg = b.var(h);
        let call = b.call(f, vec![arg]);
        let r = b.declare("r");
        let out = b.output(r, Sec::L, call);
        let program = b.finish(vec![input, out]);

        let mut ctx = Context::new(SecurityLattice::Basic, 4);
        let mut handler = SummaryHandler::new(Mode::Auto, Reduction::MinCut, Box::new(BasicHandler)).with_maxiter(3);
        handler.setup(&mut ctx, &program).unwrap();
        assert!(handler.summary(f).is_some());
        run_program(&mut ctx, &program, &mut handler).unwrap();
        let value = ctx.node_value(call).unwrap();
        assert!(value.bits().iter().all(|&b| !ctx.arena().is_constant(b)));
    }

    #[test]
    fn test_io_in_methods_is_rejected() {
        let mut b = ProgramBuilder::new();
        let (f, _) = b.declare_method("f", &[]);
        let v = b.declare("v");
        let input = b.input(v, Sec::H, "0bu").unwrap();
        let read = b.var(v);
        let ret = b.ret(Some(read));
        b.define_method(f, vec![input, ret]);
        let call = b.call(f, vec![]);
        let stmt = b.expr(call);
        let program = b.finish(vec![stmt]);

        let mut ctx = Context::default();
        let mut handler = SummaryHandler::new(Mode::Induction, Reduction::Basic, Box::new(BasicHandler));
        let err = handler.setup(&mut ctx, &program).unwrap_err();
        assert!(matches!(err.root_cause(), Error::Unsupported(_)), "{}", err);
    }

    #[test]
    fn test_analyze_before_setup() {
        let (program, f, call) = program(BinaryOp::Xor);
        let mut ctx = Context::default();
        let mut handler = SummaryHandler::new(Mode::Auto, Reduction::Basic, Box::new(BasicHandler));
        assert!(handler.analyze(&mut ctx, &program, call, f, &[]).is_err());
    }

    #[test]
    fn test_from_config() {
        let registry = HandlerRegistry::default();
        let config = HandlerConfig::parse("handler=summary;mode=coind;reduction=basic;maxiter=4;csmaxrec=1").unwrap();
        let handler = SummaryHandler::from_config(&config, &registry).unwrap();
        assert_eq!(handler.mode(), Mode::Coinduction);
        assert_eq!(handler.reduction(), Reduction::Basic);
        assert_eq!(handler.maxiter, 4);
        assert_eq!(handler.csmaxrec, 1);
        assert!(handler.dot.is_none());

        let config = HandlerConfig::parse("handler=summary;reduction=fast").unwrap();
        assert!(SummaryHandler::from_config(&config, &registry).is_err());
    }
}
