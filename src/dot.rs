//! DOT (Graphviz) output for diagnostics.
//!
//! Two kinds of graphs can be rendered:
//!
//! - method summaries ([`BitGraph::to_dot`]): parameter bits at the bottom, return bits at
//!   the top and cut anchors in between;
//! - leakage rule graphs ([`LeakageCalculation::to_dot`]): the bits between the output anchor
//!   and the input anchor of an attacker level, with the witness cut highlighted.
//!
//! Rendering is lazy: analysis code hands a closure to a [`GraphSink`], and only sinks that
//! actually store graphs call it.
//!
//! # Examples
//!
//! ```no_run
//! use qif_rs::dot::{DotDirSink, GraphSink};
//!
//! let mut sink = DotDirSink::new("graphs").unwrap();
//! sink.emit("hello", &|| Ok("digraph { a -> b; }\n".to_string())).unwrap();
//! // Render with: dot -Tsvg graphs/hello.dot -o hello.svg
//! ```

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::bit::Bit;
use crate::error::{self, Error};
use crate::handler::{BitGraph, SummaryNode};
use crate::leakage::{LeakageCalculation, RuleNode};

/// Configuration options for DOT output generation.
///
/// ```
/// use qif_rs::dot::DotConfig;
///
/// let config = DotConfig {
///     cut_color: "blue",
///     ..DotConfig::default()
/// };
/// assert_eq!(config.bit_shape, "circle");
/// ```
#[derive(Debug, Clone)]
pub struct DotConfig {
    /// Shape for ordinary bits and summary anchors (default: "circle")
    pub bit_shape: &'static str,
    /// Shape for parameter and secret input bits (default: "square")
    pub input_shape: &'static str,
    /// Shape for return bits and the anchors of rule graphs (default: "rect")
    pub anchor_shape: &'static str,
    /// Style for control dependency edges (default: "dashed")
    pub control_edge_style: &'static str,
    /// Fill color of cut bits (default: "salmon")
    pub cut_color: &'static str,
}

impl Default for DotConfig {
    fn default() -> Self {
        Self {
            bit_shape: "circle",
            input_shape: "square",
            anchor_shape: "rect",
            control_edge_style: "dashed",
            cut_color: "salmon",
        }
    }
}

impl BitGraph {
    /// Converts the summary to DOT format.
    pub fn to_dot(&self) -> Result<String, std::fmt::Error> {
        self.to_dot_with_config(&DotConfig::default())
    }

    pub fn to_dot_with_config(&self, config: &DotConfig) -> Result<String, std::fmt::Error> {
        let mut dot = String::new();
        writeln!(dot, "digraph \"{}\" {{", self.name())?;
        writeln!(dot, "node [shape={}];", config.bit_shape)?;

        writeln!(dot, "{{ rank=sink")?;
        for (i, node) in self.nodes().iter().enumerate() {
            if let SummaryNode::Param(p) = node {
                writeln!(dot, "n{} [shape={}, label=\"{}\"];", i, config.input_shape, p)?;
            }
        }
        writeln!(dot, "}}")?;

        for (i, node) in self.nodes().iter().enumerate() {
            if let SummaryNode::Anchor(_) = node {
                writeln!(dot, "n{} [label=\"c{}\"];", i, i)?;
            }
        }

        writeln!(dot, "{{ rank=source")?;
        for (k, &i) in self.returns().iter().enumerate() {
            if let SummaryNode::Return { tag, .. } = &self.nodes()[i] {
                writeln!(dot, "n{} [shape={}, label=\"r[{}] {}\"];", i, config.anchor_shape, k + 1, tag)?;
            }
        }
        writeln!(dot, "}}")?;

        for (i, node) in self.nodes().iter().enumerate() {
            match node {
                SummaryNode::Param(_) => {}
                SummaryNode::Anchor(deps) | SummaryNode::Return { deps, .. } => {
                    for d in deps {
                        writeln!(dot, "n{} -> n{};", i, d)?;
                    }
                }
            }
        }

        writeln!(dot, "}}")?;
        Ok(dot)
    }
}

impl LeakageCalculation<'_> {
    /// Converts the rule graph to DOT format, filling the `witness` bits.
    pub fn to_dot(&self, witness: &[Bit]) -> Result<String, std::fmt::Error> {
        self.to_dot_with_config(witness, &DotConfig::default())
    }

    pub fn to_dot_with_config(&self, witness: &[Bit], config: &DotConfig) -> Result<String, std::fmt::Error> {
        let witness: BTreeSet<Bit> = witness.iter().copied().collect();
        let nodes = self.nodes();
        let id = |n: RuleNode| match n {
            RuleNode::Bit(bit) => format!("b{}", bit.id()),
            RuleNode::InputAnchor(_) => "input".to_string(),
            RuleNode::OutputAnchor(_) => "output".to_string(),
        };

        let mut dot = String::new();
        writeln!(dot, "digraph \"leakage_{}\" {{", self.level())?;
        writeln!(dot, "node [shape={}];", config.bit_shape)?;

        writeln!(dot, "{{ rank=source")?;
        writeln!(dot, "{} [shape={}, label=\"{}\"];", id(self.source()), config.anchor_shape, self.source())?;
        writeln!(dot, "}}")?;
        writeln!(dot, "{{ rank=sink")?;
        writeln!(dot, "{} [shape={}, label=\"{}\"];", id(self.sink()), config.anchor_shape, self.sink())?;
        writeln!(dot, "}}")?;

        for &node in &nodes {
            let RuleNode::Bit(bit) = node else {
                continue;
            };
            let is_input = self.dependencies(node).contains(&self.sink());
            let shape = if is_input { config.input_shape } else { config.bit_shape };
            if witness.contains(&bit) {
                writeln!(
                    dot,
                    "{} [shape={}, label=\"{}\", style=filled, fillcolor={}];",
                    id(node),
                    shape,
                    bit,
                    config.cut_color
                )?;
            } else {
                writeln!(dot, "{} [shape={}, label=\"{}\"];", id(node), shape, bit)?;
            }
        }

        for &node in &nodes {
            let data: BTreeSet<RuleNode> = match node {
                RuleNode::Bit(bit) => self.data_dependencies(bit).map(RuleNode::Bit).collect(),
                _ => BTreeSet::new(),
            };
            for dep in self.dependencies(node) {
                let is_control = matches!(node, RuleNode::Bit(_)) && dep != self.sink() && !data.contains(&dep);
                if is_control {
                    writeln!(dot, "{} -> {} [style={}];", id(node), id(dep), config.control_edge_style)?;
                } else {
                    writeln!(dot, "{} -> {};", id(node), id(dep))?;
                }
            }
        }

        writeln!(dot, "}}")?;
        Ok(dot)
    }
}

/// Receiver of named diagnostic graphs.
pub trait GraphSink {
    /// Offers the graph `name`; `render` produces its DOT text.
    fn emit(&mut self, name: &str, render: &dyn Fn() -> Result<String, std::fmt::Error>) -> error::Result<()>;
}

/// Discards every graph without rendering it.
#[derive(Debug, Default, Copy, Clone)]
pub struct NullSink;

impl GraphSink for NullSink {
    fn emit(&mut self, _name: &str, _render: &dyn Fn() -> Result<String, std::fmt::Error>) -> error::Result<()> {
        Ok(())
    }
}

/// Writes every graph to `<dir>/<name>.dot`.
#[derive(Debug, Clone)]
pub struct DotDirSink {
    dir: PathBuf,
}

impl DotDirSink {
    /// Creates the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> error::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.dot", file))
    }
}

impl GraphSink for DotDirSink {
    fn emit(&mut self, name: &str, render: &dyn Fn() -> Result<String, std::fmt::Error>) -> error::Result<()> {
        let dot = render().map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let path = self.path(name);
        debug!("writing {}", path.display());
        fs::write(&path, dot)?;
        Ok(())
    }
}
