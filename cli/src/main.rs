#![deny(clippy::all)]

use anyhow::{bail, Context};
use scriptvm::{
    insight::{RuntimeInsight, SnapshotInsight},
    jit::{translate_module, JitCompiler, JitModule, TranslateSettings},
    portable::CompiledModule,
    CallParams, Environment, Name, StubType,
};
use std::{path::PathBuf, process};
use structopt::StructOpt;

/// The sub-command to execute.
#[derive(Debug, StructOpt)]
enum Command {
    /// Print the contents of a compiled module: declarations and,
    /// optionally, the portable code of every function.
    #[structopt(name = "inspect")]
    Inspect {
        /// Path to the compiled module file
        #[structopt(parse(from_os_str))]
        module: PathBuf,
        /// Also dump the portable opcodes of every function
        #[structopt(long = "code")]
        code: bool,
    },

    /// Link a set of modules against a fresh registry and report what
    /// would be created.
    #[structopt(name = "link")]
    Link {
        /// Paths to the compiled module files, dependencies first
        #[structopt(parse(from_os_str))]
        modules: Vec<PathBuf>,
        /// Write a type-insight snapshot of the linked registry, for
        /// cross-platform translation runs
        #[structopt(parse(from_os_str), long = "snapshot")]
        snapshot: Option<PathBuf>,
    },

    /// Link modules and call a global function with integer arguments.
    #[structopt(name = "run")]
    Run {
        /// Paths to the compiled module files, dependencies first
        #[structopt(parse(from_os_str))]
        modules: Vec<PathBuf>,
        /// Fully qualified function name, e.g. `demo.add`
        #[structopt(long = "function", short = "f")]
        function: String,
        /// Integer arguments passed by value
        #[structopt(long = "args")]
        args: Vec<i64>,
    },

    /// Translate a module to C, optionally compiling and loading it.
    #[structopt(name = "jit")]
    Jit {
        /// Paths to the compiled module files; the last one is translated
        #[structopt(parse(from_os_str))]
        modules: Vec<PathBuf>,
        /// Where to write the generated C source
        #[structopt(parse(from_os_str), long = "out", short = "o")]
        out: PathBuf,
        /// Also invoke the native compiler and bind the result
        #[structopt(long = "compile")]
        compile: bool,
        /// Emit runtime null checks reporting through the exception hook
        #[structopt(long = "exceptions")]
        exceptions: bool,
    },
}

/// Compiled-module tooling for the scripting runtime
#[derive(Debug, StructOpt)]
#[structopt(name = "scriptvm")]
struct Opt {
    #[structopt(subcommand)]
    cmd: Command,
}

fn load_module(path: &PathBuf) -> anyhow::Result<CompiledModule> {
    CompiledModule::load(path).with_context(|| format!("Failed to load module {:?}", path))
}

fn link_all(env: &mut Environment, modules: &[CompiledModule]) -> anyhow::Result<()> {
    let data: Vec<_> = modules.iter().map(|m| &m.data).collect();
    match env.load_modules(&data) {
        Ok(report) => {
            println!(
                "Linked {} module(s): {} classes, {} structs, {} enums, {} functions, {} properties",
                modules.len(),
                report.classes,
                report.structs,
                report.enums,
                report.functions,
                report.properties,
            );
            Ok(())
        }
        Err(diags) => bail!("link failed:\n{}", diags),
    }
}

fn inspect(module: &CompiledModule, code: bool) {
    let slab = module.data.slab();
    println!("module '{}', {} stubs", module.name, slab.len());

    for (id, stub) in slab.iter() {
        match stub.stub_type() {
            StubType::Class => {
                let kind = if stub.flags.contains(scriptvm::StubFlags::STRUCT) {
                    "struct"
                } else {
                    "class"
                };
                println!("  {} {}", kind, slab.full_name(id));
            }
            StubType::Enum => println!("  enum {}", slab.full_name(id)),
            StubType::Function => {
                let func = stub.as_function().unwrap();
                println!(
                    "  fn {} ({} args, {} opcodes, hash {:016x})",
                    slab.full_name(id),
                    func.args.len(),
                    func.opcodes.len(),
                    func.code_hash,
                );
                if code {
                    for &op_id in &func.opcodes {
                        let op = slab.get(op_id).as_opcode().unwrap();
                        print!("    {}", op.op.name());
                        match &op.value {
                            scriptvm::Immediate::None => {}
                            value => print!(" {}", value),
                        }
                        println!();
                    }
                }
            }
            _ => {}
        }
    }
}

fn run(opt: Opt) -> anyhow::Result<()> {
    match opt.cmd {
        Command::Inspect { module, code } => {
            let module = load_module(&module)?;
            inspect(&module, code);
        }

        Command::Link { modules, snapshot } => {
            let loaded: Vec<_> = modules
                .iter()
                .map(load_module)
                .collect::<anyhow::Result<_>>()?;
            let mut env = Environment::new();
            link_all(&mut env, &loaded)?;
            if let Some(path) = snapshot {
                SnapshotInsight::capture(env.registry())
                    .save(&path)
                    .with_context(|| format!("Failed to write snapshot {:?}", path))?;
                println!("Snapshot written to {:?}", path);
            }
        }

        Command::Run {
            modules,
            function,
            args,
        } => {
            let loaded: Vec<_> = modules
                .iter()
                .map(load_module)
                .collect::<anyhow::Result<_>>()?;
            let mut env = Environment::new();
            link_all(&mut env, &loaded)?;

            if args.len() > scriptvm::MAX_CALL_ARGS {
                bail!("at most {} arguments are supported", scriptvm::MAX_CALL_ARGS);
            }
            // Arguments and result travel as 8-byte slots; the function's
            // narrower widths read the low bytes on little-endian hosts
            let mut arg_values = args.clone();
            let mut result = 0i64;
            let mut params = CallParams::new(&mut result as *mut i64 as *mut u8);
            for (i, value) in arg_values.iter_mut().enumerate() {
                params.args[i] = value as *mut i64 as *mut u8;
            }

            if !env.call_global(Name::new(&function), &params) {
                bail!("no global function named '{}'", function);
            }
            println!("{} -> {}", function, result);
        }

        Command::Jit {
            modules,
            out,
            compile,
            exceptions,
        } => {
            let loaded: Vec<_> = modules
                .iter()
                .map(load_module)
                .collect::<anyhow::Result<_>>()?;
            let mut env = Environment::new();
            link_all(&mut env, &loaded)?;

            let target = loaded.last().context("no module to translate")?;
            let settings = TranslateSettings {
                emit_exceptions: exceptions,
                ..Default::default()
            };
            let insight = RuntimeInsight::new(env.registry());
            let source = translate_module(&target.data, &insight, &settings)?;
            source
                .write(&out)
                .with_context(|| format!("Failed to write {:?}", out))?;
            println!(
                "Translated {} function(s) to {:?} ({} kept on the interpreter)",
                source.exports().len(),
                out,
                source.skipped().len(),
            );
            for (name, reason) in source.skipped() {
                println!("  skipped {}: {}", name, reason);
            }

            if compile {
                let compiler = JitCompiler::detect()?;
                let object = out.with_extension("so");
                compiler.compile(&out, &object, &settings)?;
                let module =
                    JitModule::load(&object, env.registry_mut(), Box::new(scriptvm::DefaultHost))?;
                println!(
                    "Compiled with {} and bound {} function(s)",
                    compiler.name(),
                    module.bound_functions(),
                );
            }
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let exit_code = match run(Opt::from_args()) {
        Ok(_) => 0,
        Err(err) => {
            eprintln!("{:#}", err);
            1
        }
    };
    process::exit(exit_code);
}
