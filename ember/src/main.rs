use clap::Parser;

use ember::{
    Asm, ClassDef, MethodId, NativeOp, Opcode, ServiceRecord, Vm, VmCreateInfo,
};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "ember managed-code runtime", long_about = None)]
struct Cli {
    /// Heap size in bytes
    #[arg(long, default_value_t = 256 * 1024)]
    heap_size: u32,

    /// Bump-allocation window in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    heap_window: u32,

    /// Initial per-thread stack size in words
    #[arg(long, default_value_t = 256)]
    stack_words: u32,

    /// Backward branches between voluntary yields
    #[arg(long, default_value_t = 1000)]
    yield_quota: i32,

    /// Demo argument
    #[arg(long, default_value_t = 20)]
    fib: i32,

    /// Print interpreter statistics after the run
    #[arg(long)]
    stats: bool,
}

/// Demo channel: reports how long the VM has been up, in millis.
struct UptimeChannel {
    started: std::time::Instant,
}

impl ember::ChannelHandler for UptimeChannel {
    fn handle(&self, _request: &ServiceRecord) -> i64 {
        self.started.elapsed().as_millis() as i64
    }
}

const UPTIME_CHANNEL: u32 = 1;

/// fib(n) the slow way: recursion across activation frames, backward
/// branches, and one channel request at the end.
fn build_demo(vm: &mut Vm, n: i32) -> MethodId {
    let main = vm.classes.add_class(ClassDef::plain("Main", 0));

    let mut fib = Asm::new(true);
    let base = fib.label();
    fib.op_u8(Opcode::LoadParm, 0);
    fib.const_int(2);
    fib.jump(Opcode::IfICmpLt, base);
    fib.op_u8(Opcode::LoadParm, 0);
    fib.const_int(1);
    fib.op(Opcode::SubI);
    fib.invoke_static(main, 0);
    fib.op_u8(Opcode::LoadParm, 0);
    fib.const_int(2);
    fib.op(Opcode::SubI);
    fib.invoke_static(main, 0);
    fib.op(Opcode::AddI);
    fib.op(Opcode::ReturnI);
    fib.bind(base);
    fib.op_u8(Opcode::LoadParm, 0);
    fib.op(Opcode::ReturnI);
    let fib = vm.classes.add_method(fib.build(main, 1, 0, 8));
    vm.classes.class_mut(main).static_methods.push(fib);

    let mut entry = Asm::new(true);
    entry.op(Opcode::ConstNull);
    entry.const_int(0);
    entry.const_int(0);
    entry.const_int(UPTIME_CHANNEL as i32);
    entry.native(NativeOp::ChannelRequest);
    entry.op(Opcode::Pop2); // uptime checked only for liveness
    entry.const_int(n);
    entry.invoke_static(main, 0);
    entry.op(Opcode::ReturnI);
    vm.classes.add_method(entry.build(main, 0, 0, 8))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut vm = Vm::new(VmCreateInfo {
        heap_bytes: cli.heap_size,
        heap_window: cli.heap_window,
        stack_words: cli.stack_words,
        yield_quota: cli.yield_quota,
        ..VmCreateInfo::default()
    });
    vm.register_channel(
        UPTIME_CHANNEL,
        Arc::new(UptimeChannel {
            started: std::time::Instant::now(),
        }),
    );

    let entry = build_demo(&mut vm, cli.fib);
    let tid = vm.start(entry);
    vm.run();

    println!("fib({}) = {}", cli.fib, vm.exit_value(tid));
    if cli.stats {
        println!("{:#?}", vm.stats);
    }
}
