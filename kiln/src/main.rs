use std::{process, sync::Arc};

use clap::{Parser as ClapParser, ValueEnum};

use kiln::{
    ArenaCreateInfo, ClassCreateInfo, ClassFlags, ClassInfo, ClassRef, CodeBuilder, Completion,
    Context, ContextCreateInfo, JitConfig, Kind, MethodCreateInfo, MethodFlags, MethodInfo,
    MethodLowering, MethodRef, Opcode, PoolEntry, StaticConstantPool, Thread, ThreadCreateInfo,
    Value, VmResult,
    backend::{BinaryOperator, Block, Control, End, StructuredMethod, ValueGraph},
    disassemble,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Demo {
    /// Recursive fibonacci, one interpreter frame per call
    Fib,
    /// Fill an int array with 0..n and sum it
    Sum,
    /// Integer addition that becomes hot and is compiled
    Add,
}

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(value_enum, default_value = "fib")]
    demo: Demo,

    /// Argument passed to the demo
    #[arg(short, long, default_value_t = 20)]
    input: i32,

    /// How many times the demo method is invoked
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Invocations before a method is compiled
    #[arg(long, default_value_t = 1000)]
    hot_threshold: u32,

    /// Print generated source of compiled methods
    #[arg(long)]
    dump_source: bool,

    /// Print the bytecode instead of running it
    #[arg(long)]
    disassemble: bool,

    /// Log every call and return
    #[arg(long)]
    trace: bool,
}

/// Lowers methods named `add` to a single truncated addition.
struct AddLowering;

impl MethodLowering for AddLowering {
    fn lower(&self, method: &MethodInfo) -> Option<StructuredMethod> {
        if method.name != "add" {
            return None;
        }
        let mut graph = ValueGraph::new();
        let a = graph.parameter(0, "a");
        let b = graph.parameter(1, "b");
        let sum = graph.binary(BinaryOperator::IAdd, a, b);
        Some(StructuredMethod {
            graph,
            root: Control::Block(Block {
                nodes: Vec::new(),
                end: End::Stop { argument: sum },
            }),
        })
    }
}

fn demo_class(context: &Context) -> (ClassRef, Arc<StaticConstantPool>) {
    let pool = StaticConstantPool::new();
    let class = ClassInfo::new(ClassCreateInfo {
        name: "Demo".into(),
        super_class: Some(context.object_class()),
        flags: ClassFlags::PUBLIC,
        ..Default::default()
    });
    class.set_constant_pool(pool.clone());
    (class, pool)
}

fn static_method(
    class: &ClassRef,
    name: &str,
    max_locals: usize,
    code: Vec<u8>,
) -> VmResult<MethodRef> {
    let signature = if name == "add" { "(II)I" } else { "(I)I" };
    MethodInfo::new(
        class,
        MethodCreateInfo {
            name: name.into(),
            signature: signature.into(),
            flags: MethodFlags::PUBLIC | MethodFlags::STATIC,
            code,
            max_locals,
            max_stack: 8,
            ..Default::default()
        },
    )
}

fn fib(class: &ClassRef, pool: &StaticConstantPool) -> VmResult<MethodRef> {
    let fib_ref = pool.reserve();
    let mut b = CodeBuilder::new();
    b.load(Kind::Int, 0).iconst(2);
    let recurse = b.jump(Opcode::IfIcmpge);
    b.load(Kind::Int, 0).op(Opcode::Ireturn);
    b.bind(recurse)?;
    b.load(Kind::Int, 0)
        .iconst(1)
        .op(Opcode::Isub)
        .invoke(Opcode::Invokestatic, fib_ref)
        .load(Kind::Int, 0)
        .iconst(2)
        .op(Opcode::Isub)
        .invoke(Opcode::Invokestatic, fib_ref)
        .op(Opcode::Iadd)
        .op(Opcode::Ireturn);
    let method = static_method(class, "fib", 1, b.into_bytes())?;
    pool.set(fib_ref, PoolEntry::Method(method.clone()));
    Ok(method)
}

fn sum(class: &ClassRef) -> VmResult<MethodRef> {
    // locals: 0 n, 1 array, 2 i, 3 total
    let mut b = CodeBuilder::new();
    b.load(Kind::Int, 0)
        .op_u8(Opcode::Newarray, 10)
        .store(Kind::Reference, 1)
        .iconst(0)
        .store(Kind::Int, 2);
    let fill = b.current_offset();
    b.load(Kind::Int, 2).load(Kind::Int, 0);
    let filled = b.jump(Opcode::IfIcmpge);
    b.load(Kind::Reference, 1)
        .load(Kind::Int, 2)
        .load(Kind::Int, 2)
        .op(Opcode::Iastore)
        .iinc(2, 1);
    b.jump_back(Opcode::Goto, fill)?;
    b.bind(filled)?;
    b.iconst(0)
        .store(Kind::Int, 3)
        .iconst(0)
        .store(Kind::Int, 2);
    let add = b.current_offset();
    b.load(Kind::Int, 2)
        .load(Kind::Reference, 1)
        .op(Opcode::Arraylength);
    let done = b.jump(Opcode::IfIcmpge);
    b.load(Kind::Int, 3)
        .load(Kind::Reference, 1)
        .load(Kind::Int, 2)
        .op(Opcode::Iaload)
        .op(Opcode::Iadd)
        .store(Kind::Int, 3)
        .iinc(2, 1);
    b.jump_back(Opcode::Goto, add)?;
    b.bind(done)?;
    b.load(Kind::Int, 3).op(Opcode::Ireturn);
    static_method(class, "sum", 4, b.into_bytes())
}

fn add(class: &ClassRef) -> VmResult<MethodRef> {
    let mut b = CodeBuilder::new();
    b.load(Kind::Int, 0)
        .load(Kind::Int, 1)
        .op(Opcode::Iadd)
        .op(Opcode::Ireturn);
    static_method(class, "add", 2, b.into_bytes())
}

fn run(cli: &Cli) -> VmResult<()> {
    let context = Context::new(&ContextCreateInfo {
        arena: ArenaCreateInfo::default(),
        jit: JitConfig {
            enabled: true,
            hot_method_threshold: cli.hot_threshold,
        },
    });
    context.set_lowering(Arc::new(AddLowering));
    let (class, pool) = demo_class(&context);

    let (method, args) = match cli.demo {
        Demo::Fib => (fib(&class, &pool)?, vec![Value::Int(cli.input)]),
        Demo::Sum => (sum(&class)?, vec![Value::Int(cli.input)]),
        Demo::Add => (add(&class)?, vec![Value::Int(cli.input), Value::Int(1)]),
    };

    if cli.disassemble {
        println!("{method:?}");
        for (pc, op) in disassemble(&method.code)? {
            println!("{pc:>5}: {op:?}");
        }
        return Ok(());
    }

    let mut thread = Thread::new(&context, &ThreadCreateInfo::default());
    for _ in 0..cli.repeat.max(1) {
        match thread.invoke(&method, &args)? {
            Completion::Returned(Some(value)) => println!("{value:?}"),
            Completion::Returned(None) => println!("(void)"),
            Completion::Suspended => {
                log::warn!("{method:?} suspended");
                break;
            }
        }
    }

    log::info!(
        "{method:?} invoked {} times, {} compiled units",
        method.invocation_count(),
        context.compiled().len()
    );
    if cli.dump_source {
        match context.compiled().lookup(&method) {
            Some(unit) => {
                println!("function {}({}) {{", unit.global_name(), unit.parameters().join(", "));
                println!("{}", unit.source());
                println!("}}");
            }
            None => println!("{method:?} was not compiled"),
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.trace {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    if let Err(err) = run(&cli) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}
