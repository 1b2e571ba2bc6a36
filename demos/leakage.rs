//! Leakage of a few small programs.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example leakage -- password
//! cargo run --example leakage -- sum --handler "handler=summary;mode=auto;reduction=mincut;bot=basic"
//! cargo run --example leakage -- branch --dot dot_output
//! ```

use clap::{Parser, ValueEnum};

use qif_rs::analysis::{analyze, Options};
use qif_rs::ast::{BinaryOp, Program, ProgramBuilder};
use qif_rs::dot::{DotDirSink, GraphSink, NullSink};
use qif_rs::lattice::{Sec, SecurityLattice};

#[derive(Debug, Copy, Clone, ValueEnum)]
enum Sample {
    /// `o = (h == l)` for a secret `h` and a public guess `l`.
    Password,
    /// `o = h` for a 3-bit secret.
    Copy,
    /// `if (h) o = 1 else o = 0`.
    Branch,
    /// `o = add(h, l) & 1` through a helper method.
    Sum,
    /// `o = f(h)` where `f` recurses once per call.
    Recursive,
}

#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Program to analyze.
    #[arg(value_enum, default_value = "password")]
    sample: Sample,

    /// Method invocation handler configuration.
    #[clap(long, value_name = "CONFIG", default_value = "handler=call_string;maxrec=2;bot=basic")]
    handler: String,

    /// Security lattice (basic or diamond).
    #[clap(long, value_name = "LATTICE", default_value = "basic")]
    lattice: SecurityLattice,

    /// Bit width of method parameters.
    #[clap(long, value_name = "INT", default_value = "8")]
    bit_width: usize,

    /// Directory for DOT files of the leakage graphs.
    #[clap(long, value_name = "DIR")]
    dot: Option<String>,
}

fn build(sample: Sample) -> color_eyre::Result<Program> {
    let mut b = ProgramBuilder::new();
    let h = b.declare("h");
    let o = b.declare("o");
    let program = match sample {
        Sample::Password => {
            let l = b.declare("l");
            let secret = b.input(h, Sec::H, "0buuuu")?;
            let guess = b.input(l, Sec::L, "0buuuu")?;
            let x = b.var(h);
            let y = b.var(l);
            let eq = b.binary(BinaryOp::Equals, x, y);
            let out = b.output(o, Sec::L, eq);
            b.finish(vec![secret, guess, out])
        }
        Sample::Copy => {
            let secret = b.input(h, Sec::H, "0buuu")?;
            let x = b.var(h);
            let out = b.output(o, Sec::L, x);
            b.finish(vec![secret, out])
        }
        Sample::Branch => {
            let (o1, o2) = (b.declare("o1"), b.declare("o2"));
            let secret = b.input(h, Sec::H, "0b0u")?;
            let cond = b.var(h);
            let one = b.int(1);
            let zero = b.int(0);
            let then_branch = b.assign(o1, one);
            let else_branch = b.assign(o2, zero);
            let branch = b.if_else(cond, vec![then_branch], Some(vec![else_branch]));
            let guard = b.var(h);
            let (r1, r2) = (b.var(o1), b.var(o2));
            let joined = b.phi(guard, vec![r1, r2]);
            let out = b.output(o, Sec::L, joined);
            b.finish(vec![secret, branch, out])
        }
        Sample::Sum => {
            let (add, params) = b.declare_method("add", &["a", "b"]);
            let a = b.var(params[0]);
            let c = b.var(params[1]);
            let sum = b.binary(BinaryOp::Add, a, c);
            let ret = b.ret(Some(sum));
            b.define_method(add, vec![ret]);

            let l = b.declare("l");
            let secret = b.input(h, Sec::H, "0buuuu")?;
            let public = b.input(l, Sec::L, "0buuuu")?;
            let x = b.var(h);
            let y = b.var(l);
            let call = b.call(add, vec![x, y]);
            let one = b.int(1);
            let masked = b.binary(BinaryOp::And, call, one);
            let out = b.output(o, Sec::L, masked);
            b.finish(vec![secret, public, out])
        }
        Sample::Recursive => {
            let (f, params) = b.declare_method("f", &["a"]);
            let a = b.var(params[0]);
            let rec = b.call(f, vec![a]);
            let a2 = b.var(params[0]);
            let mixed = b.binary(BinaryOp::Xor, rec, a2);
            let ret = b.ret(Some(mixed));
            b.define_method(f, vec![ret]);

            let secret = b.input(h, Sec::H, "0buu")?;
            let x = b.var(h);
            let call = b.call(f, vec![x]);
            let out = b.output(o, Sec::L, call);
            b.finish(vec![secret, out])
        }
    };
    Ok(program)
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let time_total = std::time::Instant::now();

    let args = Cli::parse();
    println!("args = {:?}", args);

    let program = build(args.sample)?;
    let options = Options::default()
        .with_lattice(args.lattice)
        .with_bit_width(args.bit_width)
        .with_handler(args.handler);
    let result = analyze(&program, &options)?;

    let mut sink: Box<dyn GraphSink> = match &args.dot {
        Some(dir) => Box::new(DotDirSink::new(dir)?),
        None => Box::new(NullSink),
    };
    for &level in args.lattice.elements() {
        let leakage = result.leakage_with_graph(level, sink.as_mut())?;
        let witness: Vec<String> = leakage.witness.iter().map(ToString::to_string).collect();
        println!("{}: {} bit(s), witness [{}]", level, leakage.bits, witness.join(", "));
    }

    println!("\nAll done in {:.3} s", time_total.elapsed().as_secs_f64());
    Ok(())
}
