//! Per-run evaluation state.
//!
//! The [`Context`] is the single source of truth of one analysis run. It owns every bit
//! created during the run, the write-once fact maps (security labels, origins, node values),
//! the stack of activations (one per active call, each with its variable environment and
//! node-value memo), the stack of active control-flow guards, and the registered inputs and
//! outputs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace};

use crate::ast::{MethodId, NodeId, VarId};
use crate::bit::{Bit, BitArena, DependencySet};
use crate::bitset::{ArenaIndex, IndexSet};
use crate::error::{invariant_error, Error, Result};
use crate::lattice::{Lattice, Sec, SecurityLattice, B};
use crate::operator::Operator;
use crate::value::{Value, ValueId};
use crate::write_once::WriteOnceMap;

/// Default width of abstract parameter values.
pub const DEFAULT_BIT_WIDTH: usize = 32;

/// Cooperative cancellation flag shared between a run and its controller.
///
/// Clones share the flag, so a run can be cancelled from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Values declared as inputs and outputs, grouped by security level.
#[derive(Debug, Default, Clone)]
pub struct IoValues {
    inputs: BTreeMap<Sec, Vec<Value>>,
    outputs: BTreeMap<Sec, Vec<Value>>,
}

impl IoValues {
    pub fn inputs(&self) -> &BTreeMap<Sec, Vec<Value>> {
        &self.inputs
    }

    pub fn outputs(&self) -> &BTreeMap<Sec, Vec<Value>> {
        &self.outputs
    }

    fn add(map: &mut BTreeMap<Sec, Vec<Value>>, kind: &str, level: Sec, value: Value) -> Result<()> {
        for (&other, values) in map.iter() {
            if values.contains(&value) {
                if other == level {
                    return Ok(());
                }
                return Err(invariant_error!(
                    "{} value {:?} is already registered at level {}, cannot register it at {}",
                    kind,
                    value.bits(),
                    other,
                    level
                ));
            }
        }
        map.entry(level).or_default().push(value);
        Ok(())
    }

    /// Input bits at the given level.
    pub fn input_bits(&self, level: Sec) -> impl Iterator<Item = Bit> + '_ {
        self.inputs.get(&level).into_iter().flatten().flat_map(|v| v.bits().iter().copied())
    }

    /// Output bits at the given level.
    pub fn output_bits(&self, level: Sec) -> impl Iterator<Item = Bit> + '_ {
        self.outputs.get(&level).into_iter().flatten().flat_map(|v| v.bits().iter().copied())
    }

    /// All unknown bits occurring in any input or output value.
    pub fn unknown_bits(&self, arena: &BitArena) -> IndexSet<Bit> {
        self.inputs
            .values()
            .chain(self.outputs.values())
            .flatten()
            .flat_map(|v| v.bits().iter().copied())
            .filter(|&b| arena.value(b).is_unknown())
            .collect()
    }
}

/// State of one method activation (or of the top-level code).
#[derive(Debug)]
struct Activation {
    method: Option<MethodId>,
    variables: HashMap<VarId, Value>,
    node_values: WriteOnceMap<NodeId, Value>,
    return_value: Option<Value>,
}

impl Activation {
    fn new(method: Option<MethodId>) -> Self {
        Self {
            method,
            variables: HashMap::new(),
            node_values: WriteOnceMap::new("node value"),
            return_value: None,
        }
    }
}

#[derive(Debug)]
pub struct Context {
    lattice: SecurityLattice,
    bit_width: usize,
    arena: BitArena,
    sec: WriteOnceMap<Bit, Sec>,
    origin: WriteOnceMap<Bit, Bit>,
    values: Vec<Value>,
    activations: Vec<Activation>,
    input_variables: IndexSet<VarId>,
    cc: Vec<Bit>,
    io: IoValues,
    token: CancellationToken,
}

impl Default for Context {
    fn default() -> Self {
        Context::new(SecurityLattice::default(), DEFAULT_BIT_WIDTH)
    }
}

impl Context {
    /// Creates an empty context.
    ///
    /// Widths below 2 are raised to 2, the smallest width with a sign bit and a value bit.
    pub fn new(lattice: SecurityLattice, bit_width: usize) -> Self {
        Self {
            lattice,
            bit_width: bit_width.max(2),
            arena: BitArena::new(),
            sec: WriteOnceMap::new("security level"),
            origin: WriteOnceMap::new("origin"),
            values: Vec::new(),
            activations: vec![Activation::new(None)],
            input_variables: IndexSet::new(),
            cc: Vec::new(),
            io: IoValues::default(),
            token: CancellationToken::new(),
        }
    }

    pub fn lattice(&self) -> SecurityLattice {
        self.lattice
    }

    pub fn bit_width(&self) -> usize {
        self.bit_width
    }

    pub fn arena(&self) -> &BitArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut BitArena {
        &mut self.arena
    }

    pub fn io(&self) -> &IoValues {
        &self.io
    }

    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.token = token;
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    // Bits

    /// Creates a bit whose control dependencies are those of its data dependencies.
    pub fn create_bit(&mut self, value: B, data: DependencySet) -> Result<Bit> {
        let control = self.arena.control_of(data.iter());
        self.arena.create(value, data, control)
    }

    pub fn constant(&mut self, value: bool) -> Bit {
        self.arena.constant(value)
    }

    /// A value of `width` fresh unknown bits without dependencies.
    pub fn fresh_unknown_value(&mut self, width: usize) -> Result<Value> {
        let bits = (0..width.max(2))
            .map(|_| self.arena.create(B::U, DependencySet::empty(), DependencySet::empty()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::new(bits))
    }

    /// Security label of a bit (bottom unless labelled).
    pub fn sec(&self, bit: Bit) -> Sec {
        self.sec.get(bit).copied().unwrap_or_else(|| self.lattice.bot())
    }

    pub fn set_sec(&mut self, bit: Bit, level: Sec) -> Result<()> {
        self.sec.insert(bit, level)
    }

    /// The bit this bit was derived from by condition application (itself by default).
    pub fn origin(&self, bit: Bit) -> Bit {
        self.origin.get(bit).copied().unwrap_or(bit)
    }

    pub fn set_origin(&mut self, bit: Bit, origin: Bit) -> Result<()> {
        self.origin.insert(bit, origin)
    }

    /// Checks the labelling invariant of a bit.
    ///
    /// A bit with a non-bottom label must be a fresh unknown input bit; a constant bit must
    /// have no data dependencies and the bottom label.
    pub fn check_invariants(&self, bit: Bit) -> Result<()> {
        let data = self.arena.get(bit);
        let sec = self.sec(bit);
        let bot = self.lattice.bot();
        if data.value.is_constant() {
            if !data.data.is_empty() || sec != bot {
                return Err(invariant_error!(
                    "constant bit {} has dependencies {} or label {}",
                    bit,
                    data.data,
                    sec
                ));
            }
        } else if sec != bot && !(data.value.is_unknown() && data.data.is_empty() && data.control.is_empty()) {
            return Err(invariant_error!(
                "bit {} labelled {} is not a fresh input bit",
                self.arena.describe(bit),
                sec
            ));
        }
        Ok(())
    }

    // Values

    /// Registers a value so its bits point back to it. Returns the value's id.
    pub fn register_value(&mut self, value: &Value) -> ValueId {
        let id = ValueId::from_index(self.values.len());
        for (i, &bit) in value.bits().iter().enumerate() {
            self.arena.set_owner(bit, id, i + 1);
        }
        self.values.push(value.clone());
        id
    }

    pub fn registered_value(&self, id: ValueId) -> &Value {
        &self.values[id.index()]
    }

    /// Registers an input value.
    ///
    /// Every bit must be fresh (no dependencies); unknown bits are labelled with `level`.
    pub fn add_input_value(&mut self, level: Sec, value: Value) -> Result<()> {
        for &bit in value.bits() {
            let data = self.arena.get(bit);
            if !data.data.is_empty() || !data.control.is_empty() {
                return Err(Error::NotAnInputBit {
                    bit: self.arena.describe(bit),
                    reason: format!("it depends on {} and {}", data.data, data.control),
                });
            }
            if data.value.is_unknown() {
                self.set_sec(bit, level)?;
            }
            self.check_invariants(bit)?;
        }
        debug!("input at {}: {}", level, value.display(&self.arena));
        self.register_value(&value);
        IoValues::add(&mut self.io.inputs, "input", level, value)
    }

    pub fn add_output_value(&mut self, level: Sec, value: Value) -> Result<()> {
        debug!("output at {}: {}", level, value.display(&self.arena));
        self.register_value(&value);
        IoValues::add(&mut self.io.outputs, "output", level, value)
    }

    // Control conditions

    pub fn push_cc(&mut self, guard: Bit) {
        trace!("push guard {}", self.arena.describe(guard));
        self.cc.push(guard);
    }

    pub fn pop_cc(&mut self) -> Option<Bit> {
        self.cc.pop()
    }

    /// The innermost active guard.
    pub fn current_cc(&self) -> Option<Bit> {
        self.cc.last().copied()
    }

    /// Makes an unknown bit depend on the innermost active guard.
    ///
    /// Returns the bit itself when there is no guard, the bit is not unknown, or it already
    /// depends on the guard; otherwise a new bit depending on the original and the guard.
    pub fn apply_condition(&mut self, bit: Bit) -> Result<Bit> {
        let Some(guard) = self.current_cc() else {
            return Ok(bit);
        };
        let data = self.arena.get(bit);
        if !data.value.is_unknown() || bit == guard || data.control.contains(guard) || data.data.contains(guard) {
            return Ok(bit);
        }
        let control: DependencySet = data.control.iter().chain(std::iter::once(guard)).collect();
        let conditioned = self.arena.create(B::U, [bit].into_iter().collect(), control)?;
        self.set_origin(conditioned, self.origin(bit))?;
        Ok(conditioned)
    }

    /// Applies the current condition to every bit, keeping the value if nothing changes.
    pub fn apply_condition_value(&mut self, value: Value) -> Result<Value> {
        if self.cc.is_empty() {
            return Ok(value);
        }
        let bits = value
            .bits()
            .iter()
            .map(|&b| self.apply_condition(b))
            .collect::<Result<Vec<_>>>()?;
        if bits == value.bits() {
            Ok(value)
        } else {
            Ok(Value::new(bits))
        }
    }

    // Node values

    /// Computes the value of `node` from its operand values and memoizes it.
    pub fn evaluate(&mut self, node: NodeId, operator: &Operator, args: &[Value]) -> Result<Value> {
        let value = operator.compute(self, args)?;
        self.memoize(node, value)
    }

    /// Applies the current condition to `value` and records it as the value of `node`.
    ///
    /// Fails if the node already has a different value in the current activation.
    pub fn memoize(&mut self, node: NodeId, value: Value) -> Result<Value> {
        let mut value = self.apply_condition_value(value)?;
        if let Some(existing) = self.activation().node_values.get(node) {
            if *existing == value {
                return Ok(existing.clone());
            }
        }
        value.set_node(node);
        trace!("node {} = {}", node, value.display(&self.arena));
        self.register_value(&value);
        self.activation_mut().node_values.insert(node, value.clone())?;
        Ok(value)
    }

    pub fn node_value(&self, node: NodeId) -> Option<&Value> {
        self.activation().node_values.get(node)
    }

    // Variables and activations

    fn activation(&self) -> &Activation {
        self.activations.last().expect("the top-level activation is never popped")
    }

    fn activation_mut(&mut self) -> &mut Activation {
        self.activations.last_mut().expect("the top-level activation is never popped")
    }

    /// Depth of the activation stack (1 for top-level code).
    pub fn activation_depth(&self) -> usize {
        self.activations.len()
    }

    /// The method of the current activation (`None` for top-level code).
    pub fn current_method(&self) -> Option<MethodId> {
        self.activation().method
    }

    pub fn set_variable_value(&mut self, var: VarId, value: Value) -> Result<()> {
        if self.activations.len() == 1 && self.input_variables.contains(var) {
            return Err(Error::InputRedeclared(format!("{:?}", var)));
        }
        self.activation_mut().variables.insert(var, value);
        Ok(())
    }

    /// Binds a top-level input variable; binding it twice is rejected.
    pub fn bind_input_variable(&mut self, var: VarId, value: Value) -> Result<()> {
        self.set_variable_value(var, value)?;
        self.input_variables.insert(var);
        Ok(())
    }

    pub fn get_variable_value(&self, var: VarId) -> Option<&Value> {
        self.activation().variables.get(&var)
    }

    /// Enters a method activation with the given parameter bindings.
    pub fn push_activation(&mut self, method: Option<MethodId>, bindings: Vec<(VarId, Value)>) {
        let mut activation = Activation::new(method);
        activation.variables.extend(bindings);
        self.activations.push(activation);
    }

    /// Leaves the current activation, returning its return value.
    ///
    /// # Panics
    ///
    /// Panics when called for the top-level activation.
    pub fn pop_activation(&mut self) -> Option<Value> {
        assert!(self.activations.len() > 1, "Cannot pop the top-level activation");
        self.activations.pop().and_then(|a| a.return_value)
    }

    pub fn return_value(&self) -> Option<&Value> {
        self.activation().return_value.as_ref()
    }

    pub fn set_return_value(&mut self, value: Value) {
        self.activation_mut().return_value = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Lit;

    use test_log::test;

    fn value(ctx: &mut Context, s: &str) -> Value {
        let lit: Lit = s.parse().unwrap();
        Value::from_lit(ctx.arena_mut(), &lit).unwrap()
    }

    #[test]
    fn test_narrow_bit_width_is_raised() {
        assert_eq!(Context::new(SecurityLattice::Basic, 0).bit_width(), 2);
        assert_eq!(Context::new(SecurityLattice::Basic, 1).bit_width(), 2);
        assert_eq!(Context::new(SecurityLattice::Basic, 5).bit_width(), 5);
    }

    #[test]
    fn test_input_labels_unknown_bits() {
        let mut ctx = Context::default();
        let v = value(&mut ctx, "0b1u");
        ctx.add_input_value(Sec::H, v.clone()).unwrap();
        assert_eq!(ctx.sec(v.bit(1)), Sec::H);
        assert_eq!(ctx.sec(v.bit(2)), Sec::L);
        assert_eq!(ctx.io().unknown_bits(ctx.arena()).len(), 1);
        ctx.check_invariants(v.bit(1)).unwrap();
        ctx.check_invariants(v.bit(2)).unwrap();
    }

    #[test]
    fn test_input_with_dependencies_rejected() {
        let mut ctx = Context::default();
        let v = value(&mut ctx, "0bu1");
        let derived = ctx.create_bit(B::U, [v.bit(1)].into_iter().collect()).unwrap();
        let other = ctx.constant(false);
        let err = ctx.add_input_value(Sec::H, Value::new(vec![derived, other])).unwrap_err();
        assert!(matches!(err, Error::NotAnInputBit { .. }));
    }

    #[test]
    fn test_value_registered_at_one_level() {
        let mut ctx = Context::default();
        let v = value(&mut ctx, "0b01");
        ctx.add_output_value(Sec::L, v.clone()).unwrap();
        ctx.add_output_value(Sec::L, v.clone()).unwrap();
        assert!(ctx.add_output_value(Sec::H, v).is_err());
    }

    #[test]
    fn test_apply_condition() {
        let mut ctx = Context::default();
        let v = value(&mut ctx, "0b1u");
        let guard = value(&mut ctx, "0b0u").bit(1);

        assert_eq!(ctx.apply_condition(v.bit(1)).unwrap(), v.bit(1));

        ctx.push_cc(guard);
        let conditioned = ctx.apply_condition(v.bit(1)).unwrap();
        assert_ne!(conditioned, v.bit(1));
        assert!(ctx.arena().data(conditioned).contains(v.bit(1)));
        assert!(ctx.arena().control(conditioned).contains(guard));
        assert_eq!(ctx.origin(conditioned), v.bit(1));

        // Constants and already conditioned bits are kept.
        assert_eq!(ctx.apply_condition(v.bit(2)).unwrap(), v.bit(2));
        assert_eq!(ctx.apply_condition(conditioned).unwrap(), conditioned);
        assert_eq!(ctx.pop_cc(), Some(guard));
    }

    #[test]
    fn test_monotonic_maps() {
        let mut ctx = Context::default();
        let v = value(&mut ctx, "0buu");
        ctx.set_sec(v.bit(1), Sec::H).unwrap();
        ctx.set_sec(v.bit(1), Sec::H).unwrap();
        assert!(ctx.set_sec(v.bit(1), Sec::L).is_err());
        ctx.set_origin(v.bit(2), v.bit(1)).unwrap();
        assert!(ctx.set_origin(v.bit(2), v.bit(2)).is_err());
    }

    #[test]
    fn test_memo_rejects_conflicting_value() {
        let mut ctx = Context::default();
        let a = value(&mut ctx, "1");
        let b = value(&mut ctx, "1");
        let node = NodeId::new(0);
        ctx.memoize(node, a.clone()).unwrap();
        ctx.memoize(node, a.clone()).unwrap();
        assert!(ctx.memoize(node, b).is_err());
        assert_eq!(ctx.node_value(node), Some(&a));
    }

    #[test]
    fn test_input_variable_rebinding_rejected() {
        let mut ctx = Context::default();
        let v = value(&mut ctx, "0bu0");
        let var = VarId::from_index(0);
        ctx.bind_input_variable(var, v.clone()).unwrap();
        assert!(matches!(ctx.set_variable_value(var, v), Err(Error::InputRedeclared(_))));
    }

    #[test]
    fn test_activation_frames() {
        let mut ctx = Context::default();
        let v = value(&mut ctx, "3");
        let var = VarId::from_index(1);
        ctx.push_activation(Some(MethodId::from_index(0)), vec![(var, v.clone())]);
        assert_eq!(ctx.get_variable_value(var), Some(&v));
        ctx.memoize(NodeId::new(4), v.clone()).unwrap();
        ctx.set_return_value(v.clone());
        assert_eq!(ctx.pop_activation(), Some(v));
        assert_eq!(ctx.get_variable_value(var), None);
        assert_eq!(ctx.node_value(NodeId::new(4)), None);
    }

    #[test]
    fn test_owner_back_pointer() {
        let mut ctx = Context::default();
        let v = value(&mut ctx, "0b1u");
        let id = ctx.register_value(&v);
        assert_eq!(ctx.arena().get(v.bit(2)).owner(), Some((id, 2)));
        assert_eq!(ctx.registered_value(id), &v);
    }
}
