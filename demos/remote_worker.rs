//! Serves task functions to remote executors.
//!
//! Usage: `remote_worker [ADDRESS...]`, one service per address, defaulting
//! to the address in `ServiceConfig::default()`.

use std::sync::Arc;
use std::time::Duration;

use taskflow::*;

const PLUS: FuncId = 1;
const COMPUTE: FuncId = 2;

fn registries() -> (Arc<TaskFuncRegistry>, Arc<CodecRegistry>) {
    let mut funcs = TaskFuncRegistry::new();
    funcs
        .register(
            PLUS,
            TaskFunc::typed(|a: i32, b: i32| {
                std::thread::sleep(Duration::from_millis(500));
                a + b
            }),
        )
        .register(
            COMPUTE,
            // Twice the local value plus all inputs, after 300 ms of work.
            TaskFunc::cancellable(|state, out, inputs, cancel| {
                for _ in 0..30 {
                    std::thread::sleep(Duration::from_millis(10));
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                }

                let local = *state.local::<i32>()?;
                let mut result = local + local;
                for input in inputs {
                    result += *input.downcast_ref::<i32>()?;
                }
                out[0] = Some(Dynamic::new(result));
                Ok(())
            }),
        );

    let mut codecs = CodecRegistry::new();
    codecs
        .register(PLUS, Codec::display_parse::<i32>())
        .register(COMPUTE, Codec::display_parse::<i32>());

    (Arc::new(funcs), Arc::new(codecs))
}

fn main() -> Result<(), EngineError> {
    init_logging();

    let mut addresses: Vec<String> = std::env::args().skip(1).collect();
    if addresses.is_empty() {
        addresses.push(ServiceConfig::default().address);
    }

    let (funcs, codecs) = registries();
    let mut handles = Vec::new();
    for address in addresses {
        let config = ServiceConfig { address };
        let service = RemoteExecutorService::new(funcs.clone(), codecs.clone()).with_local(1i32);
        handles.push(service.listen(&config)?);
    }

    for handle in handles {
        handle.join()?;
    }

    Ok(())
}
