//! Analysis entry point.
//!
//! ```
//! use qif_rs::analysis::{analyze, Options};
//! use qif_rs::ast::ProgramBuilder;
//! use qif_rs::lattice::Sec;
//!
//! // h = input(h, 0b0u); output(l, h)
//! let mut b = ProgramBuilder::new();
//! let h = b.declare("h");
//! let o = b.declare("o");
//! let input = b.input(h, Sec::H, "0b0u").unwrap();
//! let read = b.var(h);
//! let output = b.output(o, Sec::L, read);
//! let program = b.finish(vec![input, output]);
//!
//! let result = analyze(&program, &Options::default()).unwrap();
//! assert_eq!(result.leakage(Sec::L).unwrap().bits, 1);
//! ```

use std::collections::BTreeMap;

use log::info;

use crate::ast::Program;
use crate::context::{CancellationToken, Context, DEFAULT_BIT_WIDTH};
use crate::dot::GraphSink;
use crate::error::{Error, Result};
use crate::handler::HandlerRegistry;
use crate::interpreter::{run_program, Progress};
use crate::lattice::{Sec, SecurityLattice};
use crate::leakage::{self, Leakage, LeakageCalculation};

/// Options of an analysis run.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Options {
    pub lattice: SecurityLattice,
    /// Width of method parameters and of results without a natural width.
    pub bit_width: usize,
    /// Handler configuration, e.g. `handler=call_string;maxrec=2;bot=basic`.
    pub handler: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            lattice: SecurityLattice::Basic,
            bit_width: DEFAULT_BIT_WIDTH,
            handler: "handler=basic".to_string(),
        }
    }
}

impl Options {
    pub fn with_lattice(mut self, lattice: SecurityLattice) -> Self {
        self.lattice = lattice;
        self
    }

    pub fn with_bit_width(mut self, bit_width: usize) -> Self {
        self.bit_width = bit_width;
        self
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = handler.into();
        self
    }
}

/// State after an analysis run.
#[derive(Debug)]
pub struct AnalysisResult {
    context: Context,
    progress: Progress,
}

impl AnalysisResult {
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn into_context(self) -> Context {
        self.context
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    /// Whether the run finished without cancellation.
    pub fn is_complete(&self) -> bool {
        self.progress == Progress::Completed
    }

    pub fn leakage(&self, level: Sec) -> Result<Leakage> {
        leakage::leakage(&self.context, level)
    }

    pub fn leakages(&self) -> Result<BTreeMap<Sec, u64>> {
        leakage::leakages(&self.context)
    }

    /// Computes the leakage to `level` and offers its rule graph to `sink`.
    pub fn leakage_with_graph(&self, level: Sec, sink: &mut dyn GraphSink) -> Result<Leakage> {
        let calculation = LeakageCalculation::new(&self.context, level)?;
        let leakage = calculation.compute();
        sink.emit(&format!("leakage_{}", level), &|| calculation.to_dot(&leakage.witness))?;
        Ok(leakage)
    }
}

/// Analyzes `program` with the default handler registry.
pub fn analyze(program: &Program, options: &Options) -> Result<AnalysisResult> {
    analyze_with(program, options, &HandlerRegistry::default(), CancellationToken::new())
}

/// Analyzes `program`, building the handler from `registry`. The run stops early once
/// `token` is cancelled.
pub fn analyze_with(
    program: &Program,
    options: &Options,
    registry: &HandlerRegistry,
    token: CancellationToken,
) -> Result<AnalysisResult> {
    if options.bit_width < 2 {
        return Err(Error::Unsupported(format!("bit width {} is below 2", options.bit_width)));
    }
    let mut handler = registry.parse(&options.handler)?;
    let mut context = Context::new(options.lattice, options.bit_width);
    context.set_cancellation_token(token);
    let progress = match handler.setup(&mut context, program) {
        Err(e) if e.is_cancelled() => Progress::Cancelled,
        Err(e) => return Err(e),
        Ok(()) => run_program(&mut context, program, handler.as_mut())?,
    };
    info!("analysis {:?}: {} bits created", progress, context.arena().len());
    Ok(AnalysisResult { context, progress })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ProgramBuilder;
    use crate::dot::NullSink;

    use test_log::test;

    fn copy_program(lit: &str) -> Program {
        let mut b = ProgramBuilder::new();
        let h = b.declare("h");
        let o = b.declare("o");
        let input = b.input(h, Sec::H, lit).unwrap();
        let read = b.var(h);
        let output = b.output(o, Sec::L, read);
        b.finish(vec![input, output])
    }

    #[test]
    fn test_options() {
        let options = Options::default()
            .with_lattice(SecurityLattice::Diamond)
            .with_bit_width(8)
            .with_handler("handler=call_string");
        assert_eq!(options.lattice, SecurityLattice::Diamond);
        assert_eq!(options.bit_width, 8);
        assert_eq!(options.handler, "handler=call_string");
        assert_eq!(Options::default().bit_width, 32);
    }

    #[test]
    fn test_analyze() {
        let program = copy_program("0b0uu");
        let result = analyze(&program, &Options::default()).unwrap();
        assert!(result.is_complete());
        assert_eq!(result.leakage(Sec::L).unwrap().bits, 2);
        assert_eq!(result.leakages().unwrap(), BTreeMap::from([(Sec::L, 2), (Sec::H, 0)]));
        let leakage = result.leakage_with_graph(Sec::L, &mut NullSink).unwrap();
        assert_eq!(leakage.witness.len(), 2);
    }

    #[test]
    fn test_bad_handler() {
        let program = copy_program("0b0u");
        let options = Options::default().with_handler("handler=nothing");
        assert!(analyze(&program, &options).is_err());
        let options = Options::default().with_bit_width(1);
        assert!(matches!(analyze(&program, &options), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_cancelled_before_start() {
        let program = copy_program("0b0u");
        let token = CancellationToken::new();
        token.cancel();
        let result = analyze_with(&program, &Options::default(), &HandlerRegistry::default(), token).unwrap();
        assert_eq!(result.progress(), Progress::Cancelled);
        assert!(!result.is_complete());
    }
}
