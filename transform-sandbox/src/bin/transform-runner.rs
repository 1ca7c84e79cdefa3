//! Isolated sandbox runner. Spawned by the executor with a cleared
//! environment and a private working directory; speaks the envelope
//! protocol over stdin/stdout and nothing else.

use std::io;

fn main() {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let code = transform_sandbox::runner::run(stdin.lock(), stdout.lock());
    std::process::exit(code);
}
