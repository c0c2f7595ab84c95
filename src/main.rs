use std::process;

fn main() {
    if let Err(err) = ddl_replicator::app::run() {
        eprintln!("fatal: {err}");
        process::exit(1);
    }
}
