//! Sums a pyramid of adders, layer by layer.
//!
//! Usage: `pyramid [WORKER_ADDRESS...]`. Without arguments the tasks run on
//! local threads. With addresses of running `remote_worker`s, every task is
//! sent to them instead.

use std::sync::Arc;
use std::time::Instant;

use taskflow::*;

const PLUS: FuncId = 1;
const LAYERS: usize = 4;

fn build() -> Result<(TaskGraph, Vec<TaskId>, TaskId), ConfigError> {
    let mut builder = TaskGraphBuilder::new();
    let mut below: Vec<TaskId> = (0..LAYERS).map(|_| builder.add_task(2, 1, PLUS, 0)).collect();
    let base = below.clone();

    while below.len() > 1 {
        let mut layer = Vec::with_capacity(below.len() - 1);
        for pair in below.windows(2) {
            let task = builder.add_task(2, 1, PLUS, 0);
            builder.connect(pair[0], 0, task, 0).connect(pair[1], 0, task, 1);
            layer.push(task);
        }
        below = layer;
    }

    Ok((builder.build()?, base, below[0]))
}

fn main() -> Result<(), EngineError> {
    #[cfg(feature = "logging")]
    init_logging();

    let mut funcs = TaskFuncRegistry::new();
    funcs.register(PLUS, TaskFunc::typed(|a: i32, b: i32| a + b));

    let mut codecs = CodecRegistry::new();
    codecs.register(PLUS, Codec::display_parse::<i32>());
    let codecs = Arc::new(codecs);

    let mut executor = TaskGraphExecutor::new();
    let workers: Vec<String> = std::env::args().skip(1).collect();
    if workers.is_empty() {
        for _ in 0..LAYERS {
            executor.add_task_executor(ThreadedTaskExecutor::new(0));
        }
    } else {
        for address in workers {
            executor.add_task_executor(RemoteTaskExecutor::new(0, RemoteConfig::new(address), codecs.clone()));
        }
    }

    let (mut graph, base, top) = build()?;
    for (i, &task) in base.iter().enumerate() {
        graph.set_input(task, 0, 2 * i as i32 + 1)?;
        graph.set_input(task, 1, 2 * i as i32 + 2)?;
    }

    let funcs = Arc::new(funcs);
    let mut cache = executor.make_cache();
    let start = Instant::now();
    executor.run(&mut graph, &mut cache, funcs)?;

    let sum = *graph
        .output(top, 0)?
        .ok_or(ConfigError::NoSuchPort(top, 0))?
        .downcast_ref::<i32>()?;
    println!("sum = {sum} ({:?})", start.elapsed());

    Ok(())
}
