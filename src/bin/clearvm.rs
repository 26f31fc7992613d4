//! CLI driver, per spec §6's "CLI surface (collaborator)": read the file
//! named by the one positional argument, hand it to the core, exit non-zero
//! on error. Grounded on the teacher's three-line `main.rs` driving
//! `JSVirtualMachine`, generalized into a real file-driven CLI.

use clearvm::{Options, Vm};
use structopt::StructOpt;

fn main() {
    let options = Options::from_args();
    if options.trace {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace")).init();
    } else {
        env_logger::init();
    }

    let bytes = match std::fs::read(&options.path) {
        Ok(bytes) => bytes,
        Err(err) => {
            log::error!("failed to read {}: {}", options.path.display(), err);
            std::process::exit(1);
        }
    };

    let mut vm = Vm::with_limits(options.limits());
    let result = vm.execute(&bytes);
    vm.teardown();

    if let Err(err) = result {
        log::error!("clearvm: {}", err);
        std::process::exit(1);
    }
}
