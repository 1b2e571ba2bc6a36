//! Statement interpreter.
//!
//! Statements are processed from a LIFO worklist, so a nested block completes before the
//! statements following it. Every visited statement schedules the statements it governs
//! (the members of a block, the live branches of an `if`). Expressions are evaluated in
//! post-order and memoized in the [`Context`]; method calls are delegated to a
//! [`MethodInvocationHandler`].
//!
//! An `if` whose condition is a constant schedules only the selected branch. An unknown
//! condition schedules both branches with the condition bit pushed as the active guard, so
//! every unknown value computed in either branch becomes control dependent on it.
//!
//! `while` loops are not interpreted: loops have to be lowered to recursion and phi joins
//! before analysis.

use log::{debug, trace};

use crate::ast::{MethodId, Node, NodeId, Program};
use crate::bit::Bit;
use crate::context::Context;
use crate::error::{Error, Result, ResultExt};
use crate::handler::MethodInvocationHandler;
use crate::lattice::B;
use crate::operator::Operator;
use crate::value::Value;

/// Outcome of a run.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Progress {
    Completed,
    /// The cancellation token was triggered; values memoized so far remain valid.
    Cancelled,
}

#[derive(Debug, Copy, Clone)]
enum Task {
    Visit(NodeId),
    PushGuard(Bit),
    PopGuard,
}

/// Runs the top-level code of `program`.
///
/// Cancellation inside nested method runs is reported as [`Progress::Cancelled`] as well.
pub fn run_program(ctx: &mut Context, program: &Program, handler: &mut dyn MethodInvocationHandler) -> Result<Progress> {
    debug!("running main with handler {}", handler.name());
    let mut interpreter = Interpreter::new(program, handler);
    match interpreter.run(ctx, program.main()) {
        Err(e) if e.is_cancelled() => Ok(Progress::Cancelled),
        other => other,
    }
}

/// Runs the body of `method` in a new activation with `args` bound to its parameters,
/// returning the method's return value.
///
/// A method that never returns a value yields the constant 0. If the last executed return
/// was guarded, the body may fall through, so the returned value is joined with 0 under
/// that guard. Cancellation surfaces as [`Error::Cancelled`].
pub fn run_method(
    ctx: &mut Context,
    program: &Program,
    handler: &mut dyn MethodInvocationHandler,
    method: MethodId,
    args: &[Value],
) -> Result<Value> {
    let declaration = program.method(method);
    let body = declaration
        .body
        .ok_or_else(|| Error::Unsupported(format!("method {} has no body", declaration.name)))?;
    if args.len() != declaration.params.len() {
        return Err(Error::WrongArgumentNumber {
            operator: "call",
            expected: declaration.params.len().to_string(),
            actual: args.len(),
        });
    }
    let bindings = declaration.params.iter().copied().zip(args.iter().cloned()).collect();
    trace!("enter {}", declaration.name);
    ctx.push_activation(Some(method), bindings);
    let mut interpreter = Interpreter::new(program, handler);
    let progress = interpreter.run(ctx, body);
    let fall_through = match interpreter.return_guard {
        None => None,
        Some(guard) => guard,
    };
    let returned = ctx.pop_activation();
    trace!("leave {}", declaration.name);
    if progress? == Progress::Cancelled {
        return Err(Error::Cancelled);
    }
    let zero = ctx.constant(false);
    let default = Value::new(vec![zero, zero]);
    match (returned, fall_through) {
        (None, _) => Ok(default),
        (Some(value), None) => Ok(value),
        (Some(value), Some(guard)) => {
            debug!("{} may fall through past a return guarded by {}", declaration.name, guard);
            let guard = Value::new(vec![guard, zero]);
            Operator::Phi.compute(ctx, &[guard, value, default])
        }
    }
}

/// Interpreter for one activation.
pub struct Interpreter<'a> {
    program: &'a Program,
    handler: &'a mut dyn MethodInvocationHandler,
    /// Guard active at the last return, `None` once an unconditional return happened.
    return_guard: Option<Option<Bit>>,
    guards: usize,
}

impl<'a> Interpreter<'a> {
    pub fn new(program: &'a Program, handler: &'a mut dyn MethodInvocationHandler) -> Self {
        Self {
            program,
            handler,
            return_guard: None,
            guards: 0,
        }
    }

    /// Processes the statement tree rooted at `root`.
    pub fn run(&mut self, ctx: &mut Context, root: NodeId) -> Result<Progress> {
        let mut worklist = vec![Task::Visit(root)];
        while let Some(task) = worklist.pop() {
            if ctx.is_cancelled() {
                debug!("run cancelled with {} pending tasks", worklist.len() + 1);
                for _ in 0..self.guards {
                    ctx.pop_cc();
                }
                self.guards = 0;
                return Ok(Progress::Cancelled);
            }
            match task {
                Task::PushGuard(bit) => {
                    ctx.push_cc(bit);
                    self.guards += 1;
                }
                Task::PopGuard => {
                    ctx.pop_cc();
                    self.guards -= 1;
                }
                Task::Visit(_) if self.return_guard == Some(None) => {
                    // Unreachable after an unconditional return.
                }
                Task::Visit(stmt) => {
                    let program = self.program;
                    let kind = program.node(stmt).kind();
                    let scheduled = self.visit(ctx, stmt).at(stmt, kind)?;
                    // Reversed so that the first scheduled task runs first.
                    worklist.extend(scheduled.into_iter().rev());
                }
            }
        }
        Ok(Progress::Completed)
    }

    /// Visits one statement, returning the tasks it schedules.
    fn visit(&mut self, ctx: &mut Context, stmt: NodeId) -> Result<Vec<Task>> {
        let program = self.program;
        let node = program.node(stmt);
        trace!("visit {} #{}", node.kind(), stmt);
        match node {
            Node::Block(stmts) => Ok(stmts.iter().map(|&s| Task::Visit(s)).collect()),
            Node::Assign { var, expr } => {
                let mut value = self.eval(ctx, *expr)?;
                value.set_description(program.variable(*var).name.clone());
                ctx.set_variable_value(*var, value)?;
                Ok(vec![])
            }
            Node::Input { var, level, lit } => {
                if !ctx.lattice().contains(*level) {
                    return Err(Error::Unsupported(format!(
                        "security level {} is not part of the {} lattice",
                        level,
                        ctx.lattice()
                    )));
                }
                let mut value = Value::from_lit(ctx.arena_mut(), lit)?;
                value.set_description(program.variable(*var).name.clone());
                ctx.add_input_value(*level, value.clone())?;
                if ctx.activation_depth() == 1 {
                    ctx.bind_input_variable(*var, value)?;
                } else {
                    ctx.set_variable_value(*var, value)?;
                }
                Ok(vec![])
            }
            Node::Output { var, level, expr } => {
                if !ctx.lattice().contains(*level) {
                    return Err(Error::Unsupported(format!(
                        "security level {} is not part of the {} lattice",
                        level,
                        ctx.lattice()
                    )));
                }
                let mut value = self.eval(ctx, *expr)?;
                value.set_description(program.variable(*var).name.clone());
                ctx.add_output_value(*level, value.clone())?;
                ctx.set_variable_value(*var, value)?;
                Ok(vec![])
            }
            Node::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let guard = self.eval(ctx, *cond)?.bit(1);
                match ctx.arena().value(guard) {
                    B::One => Ok(vec![Task::Visit(*then_branch)]),
                    B::Zero => Ok(else_branch.iter().map(|&s| Task::Visit(s)).collect()),
                    _ => {
                        debug!("both branches of #{} depend on {}", stmt, ctx.arena().describe(guard));
                        let mut tasks = vec![Task::PushGuard(guard), Task::Visit(*then_branch)];
                        tasks.extend(else_branch.iter().map(|&s| Task::Visit(s)));
                        tasks.push(Task::PopGuard);
                        Ok(tasks)
                    }
                }
            }
            Node::While { .. } => Err(Error::Unsupported(
                "while loops must be lowered to recursion before analysis".to_string(),
            )),
            Node::Return(expr) => {
                if let Some(expr) = expr {
                    let value = self.eval(ctx, *expr)?;
                    self.set_return(ctx, value)?;
                }
                let guard = ctx.current_cc();
                self.return_guard = Some(guard);
                Ok(vec![])
            }
            Node::Expr(expr) => {
                self.eval(ctx, *expr)?;
                Ok(vec![])
            }
            _ => {
                self.eval(ctx, stmt)?;
                Ok(vec![])
            }
        }
    }

    /// Records a returned value, joining it with an earlier conditional return. The earlier
    /// return's guard selects the earlier value.
    fn set_return(&mut self, ctx: &mut Context, value: Value) -> Result<()> {
        let previous = ctx.return_value().cloned();
        let joined = match (previous, self.return_guard) {
            (Some(previous), Some(earlier)) => match earlier.or(ctx.current_cc()) {
                Some(guard) => {
                    let zero = ctx.constant(false);
                    let guard = Value::new(vec![guard, zero]);
                    Operator::Phi.compute(ctx, &[guard, previous, value])?
                }
                None => previous,
            },
            _ => value,
        };
        ctx.set_return_value(joined);
        Ok(())
    }

    /// Evaluates an expression in post-order, memoizing every node.
    pub fn eval(&mut self, ctx: &mut Context, expr: NodeId) -> Result<Value> {
        if let Some(value) = ctx.node_value(expr) {
            return Ok(value.clone());
        }
        let program = self.program;
        let node = program.node(expr);
        self.eval_node(ctx, expr, node).at(expr, node.kind())
    }

    fn eval_node(&mut self, ctx: &mut Context, expr: NodeId, node: &Node) -> Result<Value> {
        match node {
            Node::Literal(lit) => ctx.evaluate(expr, &Operator::Literal(lit.clone()), &[]),
            Node::Var(var) => {
                let value = ctx
                    .get_variable_value(*var)
                    .cloned()
                    .ok_or_else(|| Error::UnboundVariable(self.program.variable(*var).name.clone()))?;
                ctx.memoize(expr, value)
            }
            Node::Unary(op, a) => {
                let a = self.eval(ctx, *a)?;
                ctx.evaluate(expr, &Operator::from(*op), &[a])
            }
            Node::Binary(op, a, b) => {
                let a = self.eval(ctx, *a)?;
                let b = self.eval(ctx, *b)?;
                ctx.evaluate(expr, &Operator::from(*op), &[a, b])
            }
            Node::Select(a, index) => {
                let a = self.eval(ctx, *a)?;
                ctx.evaluate(expr, &Operator::Select(*index), &[a])
            }
            Node::Phi { guard, joined } => {
                let guard = self.eval(ctx, *guard)?;
                if joined.len() < 2 {
                    return Err(Error::WrongArgumentNumber {
                        operator: Operator::Phi.name(),
                        expected: Operator::Phi.arity().to_string(),
                        actual: joined.len() + 1,
                    });
                }
                // A constant guard selects one version; the other branch never ran.
                if let Some(taken) = ctx.arena().value(guard.bit(1)).as_bool() {
                    let selected = if taken { joined[0] } else { joined[1] };
                    let value = self.eval(ctx, selected)?;
                    return ctx.memoize(expr, value);
                }
                let mut args = Vec::with_capacity(joined.len() + 1);
                args.push(guard);
                for &j in joined {
                    args.push(self.eval(ctx, j)?);
                }
                ctx.evaluate(expr, &Operator::Phi, &args)
            }
            Node::Call { method, args } => {
                let args = args.iter().map(|&a| self.eval(ctx, a)).collect::<Result<Vec<_>>>()?;
                let value = self.handler.analyze(ctx, self.program, expr, *method, &args)?;
                ctx.memoize(expr, value)
            }
            other => Err(Error::Unsupported(format!("{} is not an expression", other.kind()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, ProgramBuilder};
    use crate::handler::BasicHandler;
    use crate::lattice::Sec;

    use test_log::test;

    #[test]
    fn test_constant_branch_is_selected() {
        let mut b = ProgramBuilder::new();
        let o = b.declare("o");
        let cond = b.int(1);
        let one = b.int(1);
        let zero = b.int(0);
        let then_out = b.output(o, Sec::L, one);
        let else_out = b.output(o, Sec::H, zero);
        let stmt = b.if_else(cond, vec![then_out], Some(vec![else_out]));
        let program = b.finish(vec![stmt]);

        let mut ctx = Context::default();
        let progress = run_program(&mut ctx, &program, &mut BasicHandler).unwrap();
        assert_eq!(progress, Progress::Completed);
        assert!(ctx.io().outputs().contains_key(&Sec::L));
        assert!(!ctx.io().outputs().contains_key(&Sec::H));
    }

    #[test]
    fn test_unknown_branch_adds_control_dependency() {
        let mut b = ProgramBuilder::new();
        let h = b.declare("h");
        let x = b.declare("x");
        let y = b.declare("y");
        let input = b.input(h, Sec::H, "0b0u").unwrap();
        let cond = b.var(h);
        let read = b.var(x);
        let then_assign = b.assign(y, read);
        let stmt = b.if_else(cond, vec![then_assign], None);
        let x_input = b.input(x, Sec::L, "0b0u").unwrap();
        let program = b.finish(vec![input, x_input, stmt]);

        let mut ctx = Context::default();
        run_program(&mut ctx, &program, &mut BasicHandler).unwrap();
        let guard = ctx.node_value(cond).unwrap().bit(1);
        let conditioned = ctx.node_value(read).unwrap().bit(1);
        assert!(ctx.arena().control(conditioned).contains(guard));
        assert_eq!(ctx.current_cc(), None);
    }

    #[test]
    fn test_while_is_unsupported() {
        let mut b = ProgramBuilder::new();
        let cond = b.int(0);
        let stmt = b.while_loop(cond, vec![]);
        let program = b.finish(vec![stmt]);

        let mut ctx = Context::default();
        let err = run_program(&mut ctx, &program, &mut BasicHandler).unwrap_err();
        assert!(matches!(err.root_cause(), Error::Unsupported(_)));
        assert_eq!(err.path(), vec![stmt]);
    }

    #[test]
    fn test_unbound_variable_reports_path() {
        let mut b = ProgramBuilder::new();
        let x = b.declare("x");
        let y = b.declare("y");
        let read = b.var(x);
        let one = b.int(1);
        let sum = b.binary(BinaryOp::Add, read, one);
        let assign = b.assign(y, sum);
        let program = b.finish(vec![assign]);

        let mut ctx = Context::default();
        let err = run_program(&mut ctx, &program, &mut BasicHandler).unwrap_err();
        assert!(matches!(err.root_cause(), Error::UnboundVariable(name) if name == "x"));
        assert_eq!(err.path(), vec![assign, sum, read]);
    }

    #[test]
    fn test_cancelled_run() {
        let mut b = ProgramBuilder::new();
        let x = b.declare("x");
        let one = b.int(1);
        let assign = b.assign(x, one);
        let program = b.finish(vec![assign]);

        let mut ctx = Context::default();
        ctx.cancellation_token().cancel();
        let progress = run_program(&mut ctx, &program, &mut BasicHandler).unwrap();
        assert_eq!(progress, Progress::Cancelled);
        assert!(ctx.node_value(one).is_none());
    }

    #[test]
    fn test_input_redeclaration_rejected() {
        let mut b = ProgramBuilder::new();
        let h = b.declare("h");
        let first = b.input(h, Sec::H, "0b0u").unwrap();
        let second = b.input(h, Sec::H, "0b0u").unwrap();
        let program = b.finish(vec![first, second]);

        let mut ctx = Context::default();
        let err = run_program(&mut ctx, &program, &mut BasicHandler).unwrap_err();
        assert!(matches!(err.root_cause(), Error::InputRedeclared(_)));
    }

    #[test]
    fn test_conditional_returns_are_joined() {
        let mut b = ProgramBuilder::new();
        let (f, params) = b.declare_method("f", &["a"]);
        let cond = b.var(params[0]);
        let one = b.int(1);
        let early = b.ret(Some(one));
        let branch = b.if_else(cond, vec![early], None);
        let zero = b.int(0);
        let late = b.ret(Some(zero));
        b.define_method(f, vec![branch, late]);
        let program = b.finish(vec![]);

        let mut ctx = Context::default();
        let arg = ctx.fresh_unknown_value(2).unwrap();
        let result = run_method(&mut ctx, &program, &mut BasicHandler, f, &[arg.clone()]).unwrap();
        assert_eq!(ctx.arena().value(result.bit(1)), B::U);
        assert!(ctx.arena().reachable([result.bit(1)], |_| false).contains(arg.bit(1)));
        assert_eq!(ctx.arena().value(result.bit(2)), B::Zero);
    }

    #[test]
    fn test_constant_phi_skips_untaken_version() {
        let mut b = ProgramBuilder::new();
        let h = b.declare("h");
        let taken = b.declare("taken");
        let skipped = b.declare("skipped");
        let o = b.declare("o");
        let input = b.input(h, Sec::H, "0b0u").unwrap();
        let cond = b.int(1);
        let read = b.var(h);
        let then_assign = b.assign(taken, read);
        let zero = b.int(0);
        let else_assign = b.assign(skipped, zero);
        let branch = b.if_else(cond, vec![then_assign], Some(vec![else_assign]));
        let guard = b.int(1);
        let first = b.var(taken);
        let second = b.var(skipped);
        let phi = b.phi(guard, vec![first, second]);
        let out = b.output(o, Sec::L, phi);
        let program = b.finish(vec![input, branch, out]);

        let mut ctx = Context::default();
        run_program(&mut ctx, &program, &mut BasicHandler).unwrap();
        let value = ctx.node_value(phi).unwrap();
        assert_eq!(ctx.arena().value(value.bit(1)), B::U);
        assert!(ctx.node_value(second).is_none());
    }

    #[test]
    fn test_phi_with_single_version_rejected() {
        let mut b = ProgramBuilder::new();
        let x = b.declare("x");
        let guard = b.int(1);
        let one = b.int(1);
        let phi = b.phi(guard, vec![one]);
        let assign = b.assign(x, phi);
        let program = b.finish(vec![assign]);

        let mut ctx = Context::default();
        let err = run_program(&mut ctx, &program, &mut BasicHandler).unwrap_err();
        assert!(matches!(err.root_cause(), Error::WrongArgumentNumber { operator: "phi", actual: 2, .. }));
    }

    /// `f(a) { if (a) return 1; }` falls through with 0 when `a` is false.
    #[test]
    fn test_conditional_return_joins_fall_through() {
        let mut b = ProgramBuilder::new();
        let (f, params) = b.declare_method("f", &["a"]);
        let cond = b.var(params[0]);
        let one = b.int(1);
        let early = b.ret(Some(one));
        let branch = b.if_else(cond, vec![early], None);
        b.define_method(f, vec![branch]);
        let program = b.finish(vec![]);

        let mut ctx = Context::default();
        let arg = ctx.fresh_unknown_value(2).unwrap();
        let result = run_method(&mut ctx, &program, &mut BasicHandler, f, &[arg.clone()]).unwrap();
        assert_eq!(ctx.arena().value(result.bit(1)), B::U);
        assert!(ctx.arena().reachable([result.bit(1)], |_| false).contains(arg.bit(1)));
        assert_eq!(ctx.arena().value(result.bit(2)), B::Zero);
    }

    /// `f(a) { if (a) {} else return 1; }`
    #[test]
    fn test_else_only_return_joins_fall_through() {
        let mut b = ProgramBuilder::new();
        let (f, params) = b.declare_method("f", &["a"]);
        let cond = b.var(params[0]);
        let one = b.int(1);
        let late = b.ret(Some(one));
        let branch = b.if_else(cond, vec![], Some(vec![late]));
        b.define_method(f, vec![branch]);
        let program = b.finish(vec![]);

        let mut ctx = Context::default();
        let arg = ctx.fresh_unknown_value(2).unwrap();
        let result = run_method(&mut ctx, &program, &mut BasicHandler, f, &[arg.clone()]).unwrap();
        assert_eq!(ctx.arena().value(result.bit(1)), B::U);
        assert!(ctx.arena().reachable([result.bit(1)], |_| false).contains(arg.bit(1)));
    }

    #[test]
    fn test_constant_conditional_return_is_exact() {
        let mut b = ProgramBuilder::new();
        let (f, _) = b.declare_method("f", &[]);
        let cond = b.int(1);
        let one = b.int(1);
        let early = b.ret(Some(one));
        let branch = b.if_else(cond, vec![early], None);
        b.define_method(f, vec![branch]);
        let program = b.finish(vec![]);

        let mut ctx = Context::default();
        let result = run_method(&mut ctx, &program, &mut BasicHandler, f, &[]).unwrap();
        assert_eq!(result.as_constant(ctx.arena()), Some(1.into()));
    }

    #[test]
    fn test_argument_count_checked() {
        let mut b = ProgramBuilder::new();
        let (f, params) = b.declare_method("f", &["a", "b"]);
        let a = b.var(params[0]);
        let ret = b.ret(Some(a));
        b.define_method(f, vec![ret]);
        let program = b.finish(vec![]);

        let mut ctx = Context::default();
        let arg = ctx.fresh_unknown_value(2).unwrap();
        let err = run_method(&mut ctx, &program, &mut BasicHandler, f, &[arg]).unwrap_err();
        assert!(matches!(
            err,
            Error::WrongArgumentNumber { operator: "call", ref expected, actual: 1 } if expected == "2"
        ));
        assert_eq!(ctx.activation_depth(), 1);
    }
}
